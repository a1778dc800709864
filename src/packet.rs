//! Typed ETMv4 packets and the decoder's persistent state (spec.md §3,
//! §4.C).

/// A decoded (or partially decoded) ETMv4 packet, tagged by kind.
///
/// Fields used downstream are flattened onto the variants that carry
/// them, following the same "flatten the spec's nested packet
/// taxonomy" approach the teacher crate takes for its own
/// [`TracePacket`](https://docs.rs/itm)-equivalent enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// Asynchronous alignment packet (11 zero bytes + `0x80`).
    Async { size: usize },
    /// The hardware trace buffer overflowed.
    Overflow { size: usize },
    /// Implementation-defined trace configuration metadata. Only its
    /// size is tracked, per spec.md §9's Open Question: the reference
    /// decoder's continuation loop `break`s unconditionally after the
    /// first iteration, so only 2 bytes are ever consumed in practice.
    TraceInfo { size: usize },
    /// A timestamp delta or absolute value. Not interpreted, per
    /// spec.md's Non-goals; only skipped.
    Timestamp { size: usize },
    /// Indicates a discontinuity in the trace stream; an address
    /// packet follows before the next atom/exception packet.
    TraceOn { size: usize },
    /// Context-id / virtual-context-id metadata. Not interpreted;
    /// only skipped.
    Context { size: usize },
    /// Marks entry to the kernel (or another exception handler); the
    /// two address packets that follow bracket a region this core
    /// deliberately does not trace.
    Exception { size: usize },
    /// A short (9- or 17-bit) IS0 address packet; unset bits inherit
    /// from the last long-form address packet via `address_reg`.
    AddressShortIs0 { size: usize, addr: u64 },
    /// A full 64-bit IS0 address packet.
    AddressLong64Is0 { size: usize, addr: u64 },
    /// A full 64-bit IS0 address packet with trailing context-id
    /// metadata (not interpreted beyond its size).
    AddressContextLong64Is0 { size: usize, addr: u64 },
    /// A taken/not-taken atom bitstring, decoded from any of the six
    /// ETMv4 atom packet formats (F1-F6). `en_bits`' bit *i* is `1` if
    /// the *i*-th atom was taken (E), `0` if not taken (N); only the
    /// low `en_bits_len` bits are meaningful.
    Atom { en_bits: u32, en_bits_len: usize },
    /// A header byte not recognized by any arm of the dispatch table.
    /// Always one byte; never fatal, to tolerate forward-compatible
    /// packets.
    Unknown { size: usize },
    /// Not enough bytes are buffered yet to materialize this packet.
    /// `size` is the number of bytes *remaining*, not consumed; the
    /// caller should suspend and resume once more data arrives.
    Incomplete { size: usize },
}

impl Packet {
    /// Number of input bytes this packet occupies. For
    /// [`Packet::Incomplete`] this is the count of bytes that were
    /// available but insufficient, not a consumable size.
    pub fn size(&self) -> usize {
        match *self {
            Packet::Async { size }
            | Packet::Overflow { size }
            | Packet::TraceInfo { size }
            | Packet::Timestamp { size }
            | Packet::TraceOn { size }
            | Packet::Context { size }
            | Packet::Exception { size }
            | Packet::AddressShortIs0 { size, .. }
            | Packet::AddressLong64Is0 { size, .. }
            | Packet::AddressContextLong64Is0 { size, .. }
            | Packet::Unknown { size }
            | Packet::Incomplete { size } => size,
            Packet::Atom { .. } => 1,
        }
    }

    /// True for any of the three address-packet variants.
    pub fn is_address(&self) -> bool {
        matches!(
            self,
            Packet::AddressShortIs0 { .. }
                | Packet::AddressLong64Is0 { .. }
                | Packet::AddressContextLong64Is0 { .. }
        )
    }

    /// The decoded virtual address, for address-packet variants.
    pub fn address(&self) -> Option<u64> {
        match *self {
            Packet::AddressShortIs0 { addr, .. }
            | Packet::AddressLong64Is0 { addr, .. }
            | Packet::AddressContextLong64Is0 { addr, .. } => Some(addr),
            _ => None,
        }
    }
}

/// The packet decoder's state machine (spec.md §3).
///
/// Default state is `Start`; sessions move to `Trace` once the first
/// address packet has been seen, and cycle through the exception pair
/// or the trace-on resync state as the stream dictates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Awaiting the first address packet of the session.
    Start,
    /// A trace-on packet was seen; awaiting the resync address packet.
    Restart,
    /// Steady-state tracing.
    Trace,
    /// First of the two post-exception address packets (the return
    /// address) is pending.
    ExceptionAddr1,
    /// Second post-exception address packet (the actual resume
    /// address) is pending.
    ExceptionAddr2,
    /// Used by the path-coverage engine only: a trace-on packet was
    /// seen and any address-packet variant resynchronizes directly
    /// back to `Trace` (no separate `Restart` distinction is needed
    /// because the path engine does not special-case the pending vs.
    /// resync meaning of an address packet).
    WaitAddrAfterTraceOn,
}

impl Default for DecoderState {
    fn default() -> Self {
        DecoderState::Start
    }
}
