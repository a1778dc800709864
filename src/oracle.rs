//! The branch-instruction oracle boundary and its cache (spec.md §4.D).
//!
//! This crate ships no disassembler backend: classifying the next
//! instruction at an offset is explicitly out of scope (spec.md §1),
//! left to an embedder's own ISA decoder behind the [`BranchOracle`]
//! trait.

use std::collections::HashMap;

use crate::error::OracleError;
use crate::location::{Location, MemoryImage};

/// The kind of branch-family instruction found at [`BranchInsn::offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// `B`, `B.cond`, `BL`, `CBZ`/`CBNZ`, `TBZ`/`TBNZ` — both successors
    /// are known statically from the instruction's own operand.
    Direct,
    /// `BR`, `BLR`, `RET` — the target arrives only via the next
    /// address packet.
    Indirect,
    /// `ISB` — terminates a basic block without branching; falls
    /// through unconditionally.
    Isb,
}

/// The next branch-family instruction found scanning forward from some
/// starting offset, as classified by a [`BranchOracle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInsn {
    pub kind: BranchKind,
    /// Offset of the branch instruction itself.
    pub offset: u64,
    /// Successor offset taken when the atom bit is E. For
    /// [`BranchKind::Indirect`] this has no meaning; the real target
    /// comes from the next address packet instead.
    pub taken_offset: u64,
    /// Successor offset taken when the atom bit is N (fall-through).
    pub not_taken_offset: u64,
    /// Which image the offsets above are relative to.
    pub image_id: usize,
}

/// Finds the next branch-family instruction forward from an offset in
/// a memory image. The concrete ISA decoder is supplied by the
/// embedder; this crate never disassembles anything itself.
pub trait BranchOracle {
    /// Scan `image` forward from `from_offset` for the next
    /// branch-family instruction. A miss (no branch instruction found
    /// before the end of the image) is treated as fatal by the engine:
    /// either the memory image is corrupt or the trace does not
    /// correspond to the supplied binaries.
    fn next_branch(&self, image: &MemoryImage, from_offset: u64) -> Result<BranchInsn, OracleError>;
}

/// Memoizes [`BranchOracle::next_branch`] results, keyed by the
/// *starting* offset (not the branch's own offset). Entries are never
/// invalidated: images are immutable for the life of a session, so a
/// hit is always still correct.
#[derive(Debug, Default)]
pub struct BranchInsnCache {
    entries: HashMap<Location, BranchInsn>,
}

impl BranchInsnCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        BranchInsnCache::default()
    }

    /// Drop all memoized entries. Called by the engine's `reset`, not
    /// automatically between sessions with the same binaries (the
    /// fuzzing common case is to keep them warm).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Return the cached branch at `location`, computing and caching
    /// it via `oracle` on a miss.
    pub fn get_or_compute(
        &mut self,
        oracle: &dyn BranchOracle,
        image: &MemoryImage,
        location: Location,
    ) -> Result<BranchInsn, OracleError> {
        if let Some(insn) = self.entries.get(&location) {
            log::trace!("branch cache hit at {:?}", location);
            return Ok(*insn);
        }
        log::trace!("branch cache miss at {:?}, disassembling", location);
        let insn = oracle.next_branch(image, location.offset)?;
        self.entries.insert(location, insn);
        Ok(insn)
    }
}
