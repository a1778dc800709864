//! Error types returned by this crate's fallible surfaces.
//!
//! Packet decoding itself (spec.md §4.C) is infallible: a header that
//! doesn't match any known encoding becomes [`crate::packet::Packet::Unknown`]
//! rather than an error, and truncation becomes
//! [`crate::packet::Packet::Incomplete`]. Nothing below the engine layer
//! needs a `DecodeError` type as a result.

use thiserror::Error;

use crate::location::Location;

/// Errors surfaced by the branch-instruction oracle boundary (spec.md
/// §4.D). The core treats a failure to find a branch instruction as
/// fatal to the session: either the memory image is corrupt, or the
/// trace does not correspond to the supplied binaries.
#[derive(Debug, Error)]
pub enum OracleError {
    /// No branch-family instruction was found scanning forward from
    /// `location` before the end of its image.
    #[error("no branch instruction found from {location:?}")]
    NoBranchFound {
        /// The offset the scan started from.
        location: Location,
    },
}

/// The error taxonomy from spec.md §7, surfaced by [`crate::engine`]'s
/// `run`/`finish` entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The hardware trace buffer overflowed; the session cannot be
    /// trusted and must be `reset` before further use.
    #[error("trace buffer overflow; session must be reset")]
    OverflowPacket,

    /// An atom packet arrived in `START`, before the session's first
    /// address packet. The ETMv4 standard forbids this; the original
    /// treats it as an unrecoverable abort rather than a resumable
    /// state.
    #[error("atom packet seen before the session's first address packet")]
    AtomBeforeAddress,

    /// `finish` was reached with an atom-walker indirect branch still
    /// awaiting its target address packet (edge variant only).
    #[error("trace data incomplete: unresolved indirect branch at finish")]
    TraceDataIncomplete,

    /// An address packet pointed outside every installed memory map.
    #[error("address outside traced memory map")]
    PageFault,

    /// A caller-argument violation: an empty memory map, a bitmap size
    /// that is not a power of two, or a null handle at the FFI
    /// boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An invariant documented in spec.md §3 was violated. Any
    /// occurrence is a bug in this crate, not a malformed trace.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// The branch-instruction oracle failed to classify the next
    /// instruction.
    #[error(transparent)]
    Oracle(#[from] OracleError),
}
