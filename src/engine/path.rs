//! Path-coverage (context-sensitive) process engine (spec.md §4.E.4).
//!
//! Unlike the edge variant this needs no branch-instruction oracle:
//! atoms fold directly into a rolling hash rather than driving a walk
//! across disassembled instructions.

use crate::bitmap::Bitmap;
use crate::decoder::PacketDecoder;
use crate::deformatter::Deformatter;
use crate::engine::ProcessState;
use crate::error::EngineError;
use crate::location::{Location, MemoryMaps};
use crate::packet::{DecoderState, Packet};

const FRAME_SIZE: usize = 16;

/// Longest atom bit-string folded into the rolling hash per
/// inter-address segment. Not present in the retrieved
/// `original_source` excerpt as a named constant; chosen here and
/// recorded as an explicit implementation decision (see DESIGN.md).
const MAX_ATOM_LEN: usize = 224;

fn sdbm_fold(h: u64, byte: u8) -> u64 {
    (byte as u64).wrapping_add(h << 6).wrapping_add(h << 16).wrapping_sub(h)
}

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn fold_location(mut h: u64, location: Location) -> u64 {
    for byte in location.offset.to_le_bytes() {
        h = sdbm_fold(h, byte);
    }
    for byte in (location.image_id as u64).to_le_bytes() {
        h = sdbm_fold(h, byte);
    }
    h
}

/// Reconstructs a context-sensitive path hash and increments its
/// bitmap slot on every address packet, per spec.md §4.E.4.
pub struct PathEngine<'a> {
    bitmap: Bitmap<'a>,
    deformatter: Deformatter,
    decoder: PacketDecoder,
    frame_buffer: Vec<u8>,
    deformatted: Vec<u8>,
    state: DecoderState,
    process: ProcessState,
    rolling_hash: u64,
    atom_bits_folded: usize,
}

impl<'a> PathEngine<'a> {
    /// Construct an engine. No decoding starts until [`PathEngine::reset`]
    /// installs a target trace id and memory maps.
    pub fn new(bitmap: Bitmap<'a>) -> Self {
        PathEngine {
            bitmap,
            deformatter: Deformatter::new(),
            decoder: PacketDecoder::new(),
            frame_buffer: Vec::new(),
            deformatted: Vec::new(),
            state: DecoderState::Start,
            process: ProcessState::new(),
            rolling_hash: 0,
            atom_bits_folded: 0,
        }
    }

    /// Zero the bitmap, reset decoding state, and install new memory
    /// maps. Safe to call between fuzz iterations.
    pub fn reset(&mut self, target_trace_id: u8, memory_maps: MemoryMaps) -> Result<(), EngineError> {
        log::debug!("path engine reset: target_trace_id={:#04x}", target_trace_id);
        self.bitmap.clear();
        self.deformatter.reset(target_trace_id);
        self.decoder.reset();
        self.frame_buffer.clear();
        self.deformatted.clear();
        self.state = DecoderState::Start;
        self.process = ProcessState::new();
        self.process.memory_maps = memory_maps;
        self.rolling_hash = 0;
        self.atom_bits_folded = 0;
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

    /// The path variant needs no oracle, so there is no notion of an
    /// unresolved indirect branch; `finish` always succeeds once the
    /// session has not hit an overflow.
    pub fn finish(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn begin_segment(&mut self, location: Location) {
        self.process.prev_location = Some(location);
        self.rolling_hash = 0;
        self.atom_bits_folded = 0;
    }

    fn close_segment(&mut self, target: Location) {
        self.rolling_hash = fold_location(self.rolling_hash, target);
        let index = xorshift64(self.rolling_hash) as usize & (self.bitmap.size() - 1);
        self.bitmap.increment(index);
        self.begin_segment(target);
    }

    fn fold_atoms(&mut self, en_bits: u32, en_bits_len: usize) {
        for i in 0..en_bits_len {
            if self.atom_bits_folded >= MAX_ATOM_LEN {
                break;
            }
            let bit = ((en_bits >> i) & 1) as u8;
            self.rolling_hash = sdbm_fold(self.rolling_hash, bit);
            self.atom_bits_folded += 1;
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), EngineError> {
        match self.state {
            DecoderState::Start => match packet {
                Packet::Atom { .. } => {
                    log::warn!("atom packet before the first address in Start state");
                    Err(EngineError::AtomBeforeAddress)
                }
                _ if packet.is_address() => {
                    let addr = packet.address().unwrap();
                    self.process.resolve_address(addr);
                    let location = self.process.prev_location.unwrap();
                    self.begin_segment(location);
                    self.state = DecoderState::Trace;
                    log::debug!("Start -> Trace");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::WaitAddrAfterTraceOn => match packet {
                Packet::Atom { .. } => Ok(()),
                _ if packet.is_address() => {
                    let addr = packet.address().unwrap();
                    self.process.resolve_address(addr);
                    let location = self.process.prev_location.unwrap();
                    self.begin_segment(location);
                    self.state = DecoderState::Trace;
                    log::debug!("WaitAddrAfterTraceOn -> Trace");
                    Ok(())
                }
                _ => Ok(()),
            },

            DecoderState::Trace => match packet {
                Packet::Atom { en_bits, en_bits_len } => {
                    if self.process.out_of_range {
                        return Ok(());
                    }
                    self.fold_atoms(en_bits, en_bits_len);
                    Ok(())
                }
                Packet::Overflow { .. } => Err(EngineError::OverflowPacket),
                Packet::Exception { .. } => {
                    self.state = DecoderState::ExceptionAddr1;
                    log::debug!("Trace -> ExceptionAddr1");
                    Ok(())
                }
                Packet::TraceOn { .. } => {
                    self.state = DecoderState::WaitAddrAfterTraceOn;
                    log::debug!("Trace -> WaitAddrAfterTraceOn (TraceOn)");
                    Ok(())
                }
                _ if packet.is_address() => {
                    let addr = packet.address().unwrap();
                    match self.process.memory_maps.location_for(addr) {
                        Some(target) => {
                            if self.process.out_of_range {
                                self.process.out_of_range = false;
                                self.begin_segment(target);
                            } else {
                                self.close_segment(target);
                            }
                        }
                        None => {
                            self.process.out_of_range = true;
                            self.process.prev_location =
                                Some(Location::new(addr, crate::engine::OUT_OF_RANGE_IMAGE_ID));
                        }
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

            DecoderState::Restart => {
                unreachable!("the path engine never enters the edge-only restart state")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::MemoryMap;

    const TEST_TRACE_ID: u8 = 0x10;

    fn atom_f1(taken: bool) -> u8 {
        0b1111_0110 | (taken as u8)
    }

    fn address_packet(addr: u64) -> Vec<u8> {
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

    /// See the identically named helper in `engine::edge`'s tests;
    /// duplicated rather than shared because each engine's test module
    /// is independently colocated, matching the teacher's per-module
    /// `#[cfg(test)]` layout.
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

    fn new_engine(bitmap: &mut [u8]) -> PathEngine<'_> {
        let mut engine = PathEngine::new(Bitmap::new(bitmap).unwrap());
        let maps = MemoryMaps::new(vec![MemoryMap::new(0x1000, 0x3000, 0)]);
        engine.reset(TEST_TRACE_ID, maps).unwrap();
        engine
    }

    fn send(engine: &mut PathEngine<'_>, payload: &[u8]) -> Result<(), EngineError> {
        engine.run(&frame_wrap(TEST_TRACE_ID, payload))
    }

    #[test]
    fn first_address_is_setup_only() {
        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        engine.finish().unwrap();

        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 0);
    }

    #[test]
    fn each_closing_address_writes_one_key() {
        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        send(&mut engine, &address_packet(0x1100)).unwrap();
        send(&mut engine, &[atom_f1(false)]).unwrap();
        send(&mut engine, &address_packet(0x1200)).unwrap();
        engine.finish().unwrap();

        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 2);
    }

    #[test]
    fn identical_segments_hash_to_the_same_key() {
        let mut bitmap_one = [0u8; 1024];
        let mut engine_one = new_engine(&mut bitmap_one);
        send(&mut engine_one, &address_packet(0x1000)).unwrap();
        send(&mut engine_one, &[atom_f1(true)]).unwrap();
        send(&mut engine_one, &address_packet(0x1100)).unwrap();
        engine_one.finish().unwrap();

        let mut bitmap_two = [0u8; 1024];
        let mut engine_two = new_engine(&mut bitmap_two);
        send(&mut engine_two, &address_packet(0x1000)).unwrap();
        send(&mut engine_two, &[atom_f1(true)]).unwrap();
        send(&mut engine_two, &address_packet(0x1100)).unwrap();
        engine_two.finish().unwrap();

        assert_eq!(bitmap_one, bitmap_two);
    }

    #[test]
    fn exception_bracket_does_not_reset_the_rolling_hash() {
        let mut bitmap = [0u8; 1024];
        let mut engine = new_engine(&mut bitmap);

        send(&mut engine, &address_packet(0x1000)).unwrap();
        send(&mut engine, &[atom_f1(true)]).unwrap();
        send(&mut engine, &[0b0000_0110]).unwrap(); // Exception
        send(&mut engine, &address_packet(0x1800)).unwrap(); // discarded
        send(&mut engine, &address_packet(0x1000)).unwrap(); // discarded
        send(&mut engine, &[atom_f1(true)]).unwrap();
        send(&mut engine, &address_packet(0x1100)).unwrap();
        engine.finish().unwrap();

        // Two atoms folded into one segment closed by one address: a
        // single key is written, not two.
        assert_eq!(bitmap.iter().map(|&b| b as u32).sum::<u32>(), 1);
    }

    #[test]
    fn atom_before_first_address_is_fatal() {
        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap);
        let err = send(&mut engine, &[atom_f1(true)]).unwrap_err();
        assert!(matches!(err, EngineError::AtomBeforeAddress));
    }

    #[test]
    fn overflow_is_fatal_only_in_trace_state() {
        let overflow_packet = [0x00, 0x05];

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap);
        send(&mut engine, &overflow_packet).unwrap(); // Start: ignored

        let mut bitmap = [0u8; 256];
        let mut engine = new_engine(&mut bitmap);
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
    fn truncation_across_run_calls_matches_single_call() {
        let mut payload = address_packet(0x1000);
        payload.push(atom_f1(true));
        payload.extend(address_packet(0x1100));
        let wrapped = frame_wrap(TEST_TRACE_ID, &payload);

        let mut bitmap_one = [0u8; 256];
        let mut engine_one = new_engine(&mut bitmap_one);
        engine_one.run(&wrapped).unwrap();
        engine_one.finish().unwrap();

        for split in 1..wrapped.len() {
            let mut bitmap_two = [0u8; 256];
            let mut engine_two = new_engine(&mut bitmap_two);
            engine_two.run(&wrapped[..split]).unwrap();
            engine_two.run(&wrapped[split..]).unwrap();
            engine_two.finish().unwrap();
            assert_eq!(bitmap_one, bitmap_two, "mismatch splitting formatted stream at byte {}", split);
        }
    }
}
