//! A [sans-I/O](https://sans-io.readthedocs.io/how-to-sans-io.html)
//! decoder for the Arm CoreSight ETMv4 instruction trace protocol, as
//! specified in the
//! [ARM CoreSight Architecture Specification](https://developer.arm.com/documentation/ihi0029/latest/),
//! paired with two coverage-bitmap process engines (edge and path) fit
//! for driving a fuzzer's feedback signal from hardware trace instead
//! of compiler instrumentation.
//!
//! The crate is organized bottom-up:
//!
//! - [`location`]: the memory model (`Location`, `MemoryImage`, `MemoryMaps`)
//!   every other module is keyed on.
//! - [`deformatter`]: splits a multiplexed ETMv4 byte stream into the
//!   single trace-id's data the rest of the pipeline decodes.
//! - [`packet`]: the `Packet` enum and `DecoderState` produced by decoding.
//! - [`decoder`]: turns deformatted bytes into a stream of `Packet`s.
//! - [`oracle`]: the `BranchOracle` trait this crate asks to classify
//!   the next instruction from a `Location`, plus its cache.
//! - [`bitmap`]: the coverage bitmap and its key-derivation functions.
//! - [`cache`]: a generic memoization cache with a disabled variant.
//! - [`engine`]: the edge- and path-coverage process engines that tie
//!   the above together into a session.
//!
//! Common abbreviations:
//!
//! - ETM: embedded trace macrocell;
//! - IS0/IS1: instruction-set state 0/1 (A64/A32 vs. T32);
//! - PC: program counter;
//! - MSB: most significant bit.

pub mod bitmap;
pub mod cache;
pub mod decoder;
pub mod deformatter;
pub mod engine;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod location;
pub mod oracle;
pub mod packet;

pub use bitmap::Bitmap;
pub use engine::edge::EdgeEngine;
pub use engine::path::PathEngine;
pub use error::{EngineError, OracleError};
pub use location::{Location, MemoryImage, MemoryMap, MemoryMaps};
pub use oracle::{BranchInsn, BranchKind, BranchOracle};
pub use packet::{DecoderState, Packet};
