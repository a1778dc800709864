//! Edge-coverage process engine (spec.md §4.E.1, §4.E.3, §4.E.5).

use crate::bitmap::{edge_bitmap_key, Bitmap};
use crate::cache::Cache;
use crate::deformatter::Deformatter;
use crate::decoder::PacketDecoder;
use crate::engine::ProcessState;
use crate::error::EngineError;
use crate::location::{Location, MemoryImage, MemoryMaps};
use crate::oracle::{BranchInsnCache, BranchKind, BranchOracle};
use crate::packet::{DecoderState, Packet};

const FRAME_SIZE: usize = 16;

/// The atom walker's transcript for one `(location, en_bits,
/// en_bits_len)` input, memoized by [`TraceCache`] so identical inputs
/// replay without a single disassembly call (spec.md §4.E.3).
#[derive(Debug, Clone)]
pub struct AtomTrace {
    pub locations: Vec<Location>,
    pub bitmap_keys: Vec<usize>,
    pub has_pending_address_packet: bool,
}

/// `(starting location, en_bits, en_bits_len) -> AtomTrace`, per
/// spec.md §3.
pub type TraceCache = Cache<(Location, u32, usize), AtomTrace>;

/// Reconstructs executed control-flow edges and increments their
/// bitmap slot for each one, per spec.md §4.E.1-§4.E.3.
pub struct EdgeEngine<'a> {
    bitmap: Bitmap<'a>,
    images: Vec<MemoryImage>,
    oracle: Box<dyn BranchOracle>,
    branch_cache: BranchInsnCache,
    trace_cache: TraceCache,
    deformatter: Deformatter,
    decoder: PacketDecoder,
    frame_buffer: Vec<u8>,
    deformatted: Vec<u8>,
    state: DecoderState,
    process: ProcessState,
}

impl<'a> EdgeEngine<'a> {
    /// Construct an engine. No decoding starts until [`EdgeEngine::reset`]
    /// installs a target trace id and memory maps (spec.md §4.E.5).
    pub fn new(
        bitmap: Bitmap<'a>,
        images: Vec<MemoryImage>,
        oracle: Box<dyn BranchOracle>,
        cache_enabled: bool,
    ) -> Result<Self, EngineError> {
        if images.is_empty() {
            return Err(EngineError::InvalidArgument("at least one memory image is required"));
        }
        Ok(EdgeEngine {
            bitmap,
            images,
            oracle,
            branch_cache: BranchInsnCache::new(),
            trace_cache: if cache_enabled { Cache::enabled() } else { Cache::disabled() },
            deformatter: Deformatter::new(),
            decoder: PacketDecoder::new(),
            frame_buffer: Vec::new(),
            deformatted: Vec::new(),
            state: DecoderState::Start,
            process: ProcessState::new(),
        })
    }

    /// Zero the bitmap, reset the deformatter/decoder/session state,
    /// and install new memory maps. Safe to call between fuzz
    /// iterations. Branch/trace caches are deliberately *not* cleared:
    /// they amortize across sessions reusing the same binaries, the
    /// fuzzing common case (spec.md §5).
    pub fn reset(&mut self, target_trace_id: u8, memory_maps: MemoryMaps) -> Result<(), EngineError> {
        log::debug!("edge engine reset: target_trace_id={:#04x}", target_trace_id);
        self.bitmap.clear();
        self.deformatter.reset(target_trace_id);
        self.decoder.reset();
        self.frame_buffer.clear();
        self.deformatted.clear();
        self.state = DecoderState::Start;
        self.process = ProcessState::new();
        self.process.memory_maps = memory_maps;
        Ok(())
    }

    /// Feed `bytes` (raw, still-formatted trace data, any length) into
    /// the session, draining as many complete packets as possible.
    pub fn run(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.frame_buffer.extend_from_slice(bytes);
        let aligned_len = self.frame_buffer.len() - (self.frame_buffer.len() % FRAME_SIZE);

        self.deformatted.clear();
        self.deformatter.deformat(&self.frame_buffer[..aligned_len], &mut self.deformatted);
        self.frame_buffer.drain(..aligned_len);

        let deformatted = std::mem::take(&mut self.deformatted);
        self.decoder.push(&deformatted);
        self.deformatted = deformatted;

        loop {
            if self.decoder.remaining() == 0 {
                return Ok(());
            }
            let packet = self.decoder.decode_next();
            if matches!(packet, Packet::Incomplete { .. }) {
                return Ok(());
            }
            let size = packet.size();
            self.handle_packet(packet)?;
            self.decoder.advance(size);
        }
    }

    /// `SUCCESS` unless the session ends with an unresolved indirect
    /// branch still awaiting its target address packet.
    pub fn finish(&mut self) -> Result<(), EngineError> {
        if self.process.has_pending_address_packet {
            log::warn!("finish with an unresolved indirect branch pending");
            return Err(EngineError::TraceDataIncomplete);
        }
        Ok(())
    }

    fn image(&self, image_id: usize) -> Result<&MemoryImage, EngineError> {
        self.images
            .get(image_id)
            .ok_or(EngineError::InvariantViolation("location refers to an unknown image id"))
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), EngineError> {
        match self.state {
            DecoderState::Start => match packet {
                Packet::Atom { .. } => {
                    log::warn!("atom packet before the first address in Start state");
                    Err(EngineError::AtomBeforeAddress)
                }
                _ if packet.is_address() => {
                    self.process.resolve_address(packet.address().unwrap());
                    self.state = DecoderState::Trace;
                    log::debug!("Start -> Trace");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::Restart => match packet {
                // Still resynchronizing: atoms are dropped silently.
                Packet::Atom { .. } => Ok(()),
                _ if packet.is_address() => {
                    self.process.resolve_address(packet.address().unwrap());
                    self.state = DecoderState::Trace;
                    log::debug!("Restart -> Trace");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::Trace => match packet {
                Packet::Atom { en_bits, en_bits_len } => {
                    if self.process.out_of_range {
                        return Ok(());
                    }
                    if self.process.has_pending_address_packet {
                        return Err(EngineError::InvariantViolation(
                            "atom packet arrived with an unresolved indirect branch pending",
                        ));
                    }
                    self.walk_atoms(en_bits, en_bits_len)
                }
                Packet::Overflow { .. } => Err(EngineError::OverflowPacket),
                Packet::Exception { .. } => {
                    self.state = DecoderState::ExceptionAddr1;
                    log::debug!("Trace -> ExceptionAddr1");
                    Ok(())
                }
                Packet::TraceOn { .. } => {
                    self.state = DecoderState::Restart;
                    log::debug!("Trace -> Restart (TraceOn)");
                    Ok(())
                }
                _ if packet.is_address() => {
                    let addr = packet.address().unwrap();
                    if self.process.has_pending_address_packet {
                        let target = self.process.memory_maps.location_for(addr).ok_or_else(|| {
                            log::warn!("indirect branch target {:#x} outside every memory map", addr);
                            EngineError::PageFault
                        })?;
                        if let Some(from) = self.process.prev_location {
                            let key = edge_bitmap_key(from, target, self.bitmap.size());
                            self.bitmap.increment(key);
                        }
                        self.process.prev_location = Some(target);
                        self.process.has_pending_address_packet = false;
                        self.process.out_of_range = false;
                    } else {
                        // Resynchronization address (source comments'
                        // case 3.1): dropped, but still observed.
                        self.process.resolve_address(addr);
                    }
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::ExceptionAddr1 => match packet {
                _ if packet.is_address() => {
                    self.state = DecoderState::ExceptionAddr2;
                    log::debug!("ExceptionAddr1 -> ExceptionAddr2");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::ExceptionAddr2 => match packet {
                _ if packet.is_address() => {
                    self.state = DecoderState::Trace;
                    log::debug!("ExceptionAddr2 -> Trace");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::WaitAddrAfterTraceOn => {
                unreachable!("the edge engine never enters the path-only trace-on wait state")
            }
        }
    }

    /// Walk one atom packet's E/N bits, converting each into a
    /// control-flow edge and writing its bitmap key (spec.md §4.E.3).
    fn walk_atoms(&mut self, en_bits: u32, en_bits_len: usize) -> Result<(), EngineError> {
        debug_assert!((1..=24).contains(&en_bits_len));

        let start = self
            .process
            .prev_location
            .ok_or(EngineError::InvariantViolation("atom walker entered without a prev_location"))?;
        let cache_key = (start, en_bits, en_bits_len);

        if let Some(cached) = self.trace_cache.get(&cache_key) {
            for &key in &cached.bitmap_keys {
                self.bitmap.increment(key);
            }
            self.process.prev_location = Some(cached.locations.last().copied().unwrap_or(start));
            self.process.has_pending_address_packet = cached.has_pending_address_packet;
            return Ok(());
        }

        let mut locations = Vec::new();
        let mut bitmap_keys = Vec::new();
        let mut prev = start;
        let mut pending = false;

        for i in 0..en_bits_len {
            let is_taken = (en_bits >> i) & 1 != 0;
            let image = self.image(prev.image_id)?;
            let insn = self.branch_cache.get_or_compute(self.oracle.as_ref(), image, prev)?;

            if insn.kind == BranchKind::Indirect {
                if !is_taken || i != en_bits_len - 1 {
                    return Err(EngineError::InvariantViolation(
                        "indirect branch atom must be taken and close its packet",
                    ));
                }
                pending = true;
                break;
            }

            let next_offset = if is_taken { insn.taken_offset } else { insn.not_taken_offset };
            let next = Location::new(next_offset, prev.image_id);
            bitmap_keys.push(edge_bitmap_key(prev, next, self.bitmap.size()));
            locations.push(next);
            prev = next;
        }

        for &key in &bitmap_keys {
            self.bitmap.increment(key);
        }

        self.trace_cache.insert(
            cache_key,
            AtomTrace { locations, bitmap_keys, has_pending_address_packet: pending },
        );
        self.process.prev_location = Some(prev);
        self.process.has_pending_address_packet = pending;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::MemoryMap;
    use crate::oracle::test_support::TableOracle;
    use crate::oracle::BranchInsn;

    fn insn(kind: BranchKind, offset: u64, taken: u64, not_taken: u64) -> BranchInsn {
        BranchInsn { kind, offset, taken_offset: taken, not_taken_offset: not_taken, image_id: 0 }
    }

    fn address_packet(addr: u64) -> Vec<u8> {
        // AddressLong64Is0, header 0x9D, 8 payload bytes little-endian bit
        // concatenation as in decode_long64_address.
        vec![
            0x9D,
            ((addr >> 2) & 0x7F) as u8,
            ((addr >> 9) & 0x7F) as u8,
            ((addr >> 16) & 0xFF) as u8,
            ((addr >> 24) & 0xFF) as u8,
            ((addr >> 32) & 0xFF) as u8,
            ((addr >> 40) & 0xFF) as u8,
            ((addr >> 48) & 0xFF) as u8,
            ((addr >> 56) & 0xFF) as u8,
        ]
    }

    fn atom_f1(taken: bool) -> u8 {
        0b1111_0110 | (taken as u8)
    }

    const TEST_TRACE_ID: u8 = 0x10;

    /// Pack `payload` (already-deformatted packet bytes) into 16-byte
    /// ETMv4 formatter frames tagged with `trace_id`, padding the tail
    /// with state-neutral no-payload Context bytes (`0x80`) so every
    /// frame carries a full 14 data bytes. Even-position data bytes
    /// are laundered (LSB cleared, true LSB moved into the auxiliary
    /// byte) per spec.md §4.B; odd-position bytes pass through as-is.
    fn frame_wrap(trace_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut padded = payload.to_vec();
        while padded.len() % 14 != 0 {
            padded.push(0x80);
        }

        let mut out = Vec::new();
        for chunk in padded.chunks(14) {
            let mut frame = [0u8; 16];
            frame[0] = (trace_id << 1) | 1;
            let mut aux = 0u8;
            for (i, &byte) in chunk.iter().enumerate() {
                let idx = 1 + i;
                if idx % 2 == 0 {
                    frame[idx] = byte & 0xFE;
                    aux |= (byte & 1) << (idx / 2);
                } else {
                    frame[idx] = byte;
                }
            }
            frame[15] = aux;
            out.extend_from_slice(&frame);
        }
        out
    }

    fn new_engine(bitmap: &mut [u8], oracle: TableOracle) -> EdgeEngine<'_> {
        let image = MemoryImage::new(vec![0u8; 4096], 0);
        let mut engine =
            EdgeEngine::new(Bitmap::new(bitmap).unwrap(), vec![image], Box::new(oracle), true).unwrap();
        let maps = MemoryMaps::new(vec![MemoryMap::new(0x1000, 0x3000, 0)]);
        engine.reset(TEST_TRACE_ID, maps).unwrap();
        engine
    }

    fn send(engine: &mut EdgeEngine<'_>, payload: &[u8]) -> Result<(), EngineError> {
        engine.run(&frame_wrap(TEST_TRACE_ID, payload))
    }

    #[test]
    fn direct_branch_atom_writes_one_edge() {
        let mut oracle = TableOracle::new();
        oracle.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, oracle);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        engine.finish().unwrap();

        let key = edge_bitmap_key(Location::new(0, 0), Location::new(0x10, 0), 256);
        assert_eq!(bitmap[key], 1);
        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 1);
    }

    #[test]
    fn indirect_branch_defers_edge_to_next_address() {
        let mut oracle = TableOracle::new();
        oracle.insert(Location::new(0, 0), insn(BranchKind::Indirect, 0, 0, 0));

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, oracle);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        assert!(engine.finish().is_err());

        send(&mut engine, &address_packet(0x2000)).unwrap();
        engine.finish().unwrap();

        let key = edge_bitmap_key(Location::new(0, 0), Location::new(0x1000, 0), 256);
        assert_eq!(bitmap[key], 1);
        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 1);
    }

    #[test]
    fn atom_before_first_address_is_fatal() {
        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, TableOracle::new());
        let err = send(&mut engine, &[atom_f1(true)]).unwrap_err();
        assert!(matches!(err, EngineError::AtomBeforeAddress));
    }

    #[test]
    fn overflow_is_fatal_only_in_trace_state() {
        // spec.md §4.E.1 assigns fatal Overflow handling only to the
        // TRACE bullet; every other state ignores it (source comments'
        // process.cpp only special-cases it inside the TRACE switch).
        let overflow_packet = [0x00, 0x05];

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, TableOracle::new());
        send(&mut engine, &overflow_packet).unwrap(); // Start: ignored

        let mut oracle = TableOracle::new();
        oracle.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));
        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, oracle);
        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        send(&mut engine, &[0b0000_0110]).unwrap(); // Exception -> ExceptionAddr1
        send(&mut engine, &overflow_packet).unwrap(); // ExceptionAddr1: ignored
        send(&mut engine, &address_packet(0x1800)).unwrap(); // -> ExceptionAddr2
        send(&mut engine, &overflow_packet).unwrap(); // ExceptionAddr2: ignored
        send(&mut engine, &address_packet(0x1000)).unwrap(); // -> Trace
        let err = send(&mut engine, &overflow_packet).unwrap_err(); // Trace: fatal
        assert!(matches!(err, EngineError::OverflowPacket));
    }

    #[test]
    fn exception_brackets_are_discarded() {
        // Exception handling discards both bracketing address packets
        // without updating prev_location, so the atom after the
        // bracket resumes the walk from wherever it left off before
        // the exception (here, offset 0x10).
        let mut oracle = TableOracle::new();
        oracle.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));
        oracle.insert(Location::new(0x10, 0), insn(BranchKind::Direct, 0x10, 0x30, 0x40));

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, oracle);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        send(&mut engine, &[0b0000_0110]).unwrap(); // Exception
        send(&mut engine, &address_packet(0x1800)).unwrap(); // return address, discarded
        send(&mut engine, &address_packet(0x1000)).unwrap(); // resume address, discarded
        send(&mut engine, &[atom_f1(true)]).unwrap();
        engine.finish().unwrap();

        let first_key = edge_bitmap_key(Location::new(0, 0), Location::new(0x10, 0), 256);
        let second_key = edge_bitmap_key(Location::new(0x10, 0), Location::new(0x30, 0), 256);
        assert_eq!(bitmap[first_key], 1);
        assert_eq!(bitmap[second_key], 1);
        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 2);
    }

    #[test]
    fn out_of_range_address_drops_atoms_until_back_in_range() {
        let mut oracle = TableOracle::new();
        oracle.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap, oracle);

        send(&mut engine, &address_packet(0x9000)).unwrap(); // outside the installed map
        send(&mut engine, &[atom_f1(true)]).unwrap(); // dropped: out of range
        send(&mut engine, &address_packet(0x1000)).unwrap(); // back in range
        send(&mut engine, &[atom_f1(true)]).unwrap();
        engine.finish().unwrap();

        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 1);
    }

    #[test]
    fn truncation_across_run_calls_matches_single_call() {
        let mut payload = address_packet(0x1000);
        payload.push(atom_f1(true));
        let wrapped = frame_wrap(TEST_TRACE_ID, &payload);

        let mut oracle_one = TableOracle::new();
        oracle_one.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));
        let mut bitmap_one = [0u8; 256];
        let mut engine_one = new_engine(&mut bitmap_one, oracle_one);
        engine_one.run(&wrapped).unwrap();
        engine_one.finish().unwrap();

        // Split the formatted stream at every byte boundary; each
        // split exercises both mid-frame and mid-packet truncation.
        for split in 1..wrapped.len() {
            let mut oracle_two = TableOracle::new();
            oracle_two.insert(Location::new(0, 0), insn(BranchKind::Direct, 0, 0x10, 0x20));
            let mut bitmap_two = [0u8; 256];
            let mut engine_two = new_engine(&mut bitmap_two, oracle_two);

            engine_two.run(&wrapped[..split]).unwrap();
            engine_two.run(&wrapped[split..]).unwrap();
            engine_two.finish().unwrap();

            assert_eq!(bitmap_one, bitmap_two, "mismatch splitting formatted stream at byte {}", split);
        }
    }
}
