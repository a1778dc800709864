//! Memory model: locations, memory images, and the memory map that
//! binds virtual addresses found in the trace to offsets inside them.
//! (spec.md §3, §4.A)

/// A byte inside a loaded memory image, identified by an offset from
/// the image's base and the image's id. Used throughout the core as a
/// cache key and as the vertex type of the reconstructed control-flow
/// graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Byte offset from the start of the image.
    pub offset: u64,
    /// Which [`MemoryImage`] this offset is relative to.
    pub image_id: usize,
}

impl Location {
    /// Construct a `Location`.
    pub fn new(offset: u64, image_id: usize) -> Self {
        Location { offset, image_id }
    }
}

/// An owned, immutable byte buffer plus the id other structures use to
/// refer to it. Created at init and lives for the decoder's lifetime.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    data: Vec<u8>,
    image_id: usize,
}

impl MemoryImage {
    /// Wrap `data` as the image identified by `image_id`.
    pub fn new(data: Vec<u8>, image_id: usize) -> Self {
        MemoryImage { data, image_id }
    }

    /// This image's id.
    pub fn image_id(&self) -> usize {
        self.image_id
    }

    /// The full backing buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The backing buffer starting at `offset`, as handed to the
    /// branch-instruction oracle to disassemble forward from.
    pub fn bytes_from(&self, offset: u64) -> &[u8] {
        &self.data[offset as usize..]
    }
}

/// A half-open virtual-address range `[start, end)` mapped to an
/// image. Overlapping ranges across a `MemoryMaps` are disallowed;
/// first match wins if that invariant is violated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    /// Inclusive start of the mapped virtual-address range.
    pub start: u64,
    /// Exclusive end of the mapped virtual-address range.
    pub end: u64,
    /// The image this range maps into.
    pub image_id: usize,
}

impl MemoryMap {
    /// Construct a `MemoryMap` entry.
    pub fn new(start: u64, end: u64, image_id: usize) -> Self {
        MemoryMap { start, end, image_id }
    }

    fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }
}

/// An ordered sequence of [`MemoryMap`] entries, searched linearly.
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps(Vec<MemoryMap>);

impl MemoryMaps {
    /// Wrap an already-built list of memory map entries.
    pub fn new(maps: Vec<MemoryMap>) -> Self {
        MemoryMaps(maps)
    }

    /// True if no memory map entries are installed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The id of the first map whose range contains `address`, else
    /// `None`. A miss is a normal signal: the address is outside the
    /// traced area.
    pub fn image_id_for(&self, address: u64) -> Option<usize> {
        self.0
            .iter()
            .find(|map| map.contains(address))
            .map(|map| map.image_id)
    }

    /// Combines [`MemoryMaps::image_id_for`] with an offset
    /// computation relative to the matching map's start address.
    pub fn location_for(&self, address: u64) -> Option<Location> {
        self.0.iter().find(|map| map.contains(address)).map(|map| {
            Location::new(address - map.start, map.image_id)
        })
    }
}
