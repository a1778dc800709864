//! Process engine: drives the packet decoder and branch oracle through
//! the session state machine, writing bitmap mutations (spec.md §4.E).

pub mod edge;
pub mod path;

use crate::location::{Location, MemoryMaps};

/// Sentinel `image_id` used for [`ProcessState::prev_location`] while
/// [`ProcessState::out_of_range`] is set: the address packet that
/// produced it resolved to no installed memory map, so there is no
/// real `Location` to record. Kept only so the "has a value whenever
/// we have seen an address packet" invariant (spec.md §3) holds
/// structurally; it is never looked up as an oracle image, because
/// atoms are dropped whenever `out_of_range` is true.
pub(crate) const OUT_OF_RANGE_IMAGE_ID: usize = usize::MAX;

/// Engine-level session state (spec.md §3), shared by the edge and
/// path variants.
#[derive(Debug, Clone)]
pub(crate) struct ProcessState {
    pub prev_location: Option<Location>,
    pub has_pending_address_packet: bool,
    /// True from the moment an address packet resolves outside every
    /// installed memory map until the next address packet brings the
    /// session back into traced territory. Atoms are dropped while
    /// this is set (spec.md §4.E.1).
    pub out_of_range: bool,
    pub memory_maps: MemoryMaps,
}

impl ProcessState {
    pub fn new() -> Self {
        ProcessState {
            prev_location: None,
            has_pending_address_packet: false,
            out_of_range: false,
            memory_maps: MemoryMaps::new(Vec::new()),
        }
    }

    /// Resolve `addr` against the installed memory maps and record it
    /// as the new `prev_location`, setting or clearing `out_of_range`
    /// as appropriate. Used for every address packet that is *not* the
    /// resolution of a pending indirect branch (spec.md §4.E.1's START
    /// / RESTART / resync cases).
    pub fn resolve_address(&mut self, addr: u64) {
        match self.memory_maps.location_for(addr) {
            Some(location) => {
                self.prev_location = Some(location);
                self.out_of_range = false;
            }
            None => {
                self.prev_location = Some(Location::new(addr, OUT_OF_RANGE_IMAGE_ID));
                self.out_of_range = true;
            }
        }
    }
}
