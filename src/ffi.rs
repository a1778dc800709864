//! C ABI entry points (spec.md §6), gated behind the default-on `ffi`
//! Cargo feature so the crate remains usable as a pure-Rust library
//! without committing callers to a C ABI.
//!
//! Handles are owning raw pointers to a boxed [`EdgeEngine`] /
//! [`PathEngine`]; every `init_*` has a matching `free_*` to release
//! it, since a C caller has no destructor to rely on.
//!
//! spec.md §6 describes `init_{edge,path}(bitmap_ptr, bitmap_size,
//! images[]) -> handle` without an oracle parameter, but `EdgeEngine`
//! needs a [`BranchOracle`] to walk atoms. This crate ships no
//! concrete disassembler (out of scope, spec.md §1), so `init_edge`
//! takes a C callback in its place; see DESIGN.md for this addition.

use std::os::raw::c_int;
use std::slice;

use crate::bitmap::Bitmap;
use crate::engine::edge::EdgeEngine;
use crate::engine::path::PathEngine;
use crate::error::{EngineError, OracleError};
use crate::location::{Location, MemoryImage, MemoryMap, MemoryMaps};
use crate::oracle::{BranchInsn, BranchKind, BranchOracle};

/// One entry of the `images[]` array passed to [`init_edge`]/[`init_path`].
#[repr(C)]
pub struct CImage {
    pub data: *const u8,
    pub size: usize,
}

/// One entry of the `memory_maps[]` array passed to
/// [`reset_edge`]/[`reset_path`].
#[repr(C)]
pub struct CMemoryMap {
    pub start: u64,
    pub end: u64,
    pub image_id: usize,
}

/// The `BranchInsn` shape a [`CBranchOracleFn`] callback fills in.
#[repr(C)]
pub struct CBranchInsn {
    pub kind: c_int, // 0 = direct, 1 = indirect, 2 = isb
    pub offset: u64,
    pub taken_offset: u64,
    pub not_taken_offset: u64,
}

/// Caller-supplied disassembler callback: given an image's bytes and a
/// starting offset, fill `out_insn` with the next branch-family
/// instruction and return 0, or return nonzero if none was found
/// before the end of the image.
pub type CBranchOracleFn =
    extern "C" fn(image_data: *const u8, image_size: usize, from_offset: u64, out_insn: *mut CBranchInsn) -> c_int;

struct CallbackOracle {
    callback: CBranchOracleFn,
}

impl BranchOracle for CallbackOracle {
    fn next_branch(&self, image: &MemoryImage, from_offset: u64) -> Result<BranchInsn, OracleError> {
        let mut out = CBranchInsn { kind: 0, offset: 0, taken_offset: 0, not_taken_offset: 0 };
        let data = image.data();
        let status = (self.callback)(data.as_ptr(), data.len(), from_offset, &mut out);
        if status != 0 {
            return Err(OracleError::NoBranchFound { location: Location::new(from_offset, image.image_id()) });
        }
        let kind = match out.kind {
            0 => BranchKind::Direct,
            1 => BranchKind::Indirect,
            _ => BranchKind::Isb,
        };
        Ok(BranchInsn {
            kind,
            offset: out.offset,
            taken_offset: out.taken_offset,
            not_taken_offset: out.not_taken_offset,
            image_id: image.image_id(),
        })
    }
}

/// Return code set from spec.md §4.E.5, shared by both engine families.
#[repr(C)]
pub enum CResult {
    Success = 0,
    Error = 1,
    ErrorOverflowPacket = 2,
    ErrorTraceDataIncomplete = 3,
    ErrorPageFault = 4,
}

fn to_cresult(result: Result<(), EngineError>) -> CResult {
    match result {
        Ok(()) => CResult::Success,
        Err(EngineError::OverflowPacket) => CResult::ErrorOverflowPacket,
        Err(EngineError::TraceDataIncomplete) => CResult::ErrorTraceDataIncomplete,
        Err(EngineError::PageFault) => CResult::ErrorPageFault,
        Err(_) => CResult::Error,
    }
}

unsafe fn collect_images(images: *const CImage, image_count: usize) -> Vec<MemoryImage> {
    slice::from_raw_parts(images, image_count)
        .iter()
        .enumerate()
        .map(|(id, img)| {
            let bytes = slice::from_raw_parts(img.data, img.size).to_vec();
            MemoryImage::new(bytes, id)
        })
        .collect()
}

unsafe fn collect_memory_maps(maps: *const CMemoryMap, map_count: usize) -> MemoryMaps {
    let entries = slice::from_raw_parts(maps, map_count)
        .iter()
        .map(|m| MemoryMap::new(m.start, m.end, m.image_id))
        .collect();
    MemoryMaps::new(entries)
}

/// Construct an edge-coverage engine. `bitmap_ptr`/`bitmap_size` must
/// outlive every call made through the returned handle; ownership of
/// the bitmap memory itself stays with the caller.
///
/// # Safety
/// All pointer/length pairs must describe valid, readable memory for
/// the lifetime of the handle.
#[no_mangle]
pub unsafe extern "C" fn init_edge(
    bitmap_ptr: *mut u8,
    bitmap_size: usize,
    images: *const CImage,
    image_count: usize,
    branch_oracle: CBranchOracleFn,
) -> *mut EdgeEngine<'static> {
    let bitmap_slice = slice::from_raw_parts_mut(bitmap_ptr, bitmap_size);
    let bitmap = match Bitmap::new(bitmap_slice) {
        Ok(b) => b,
        Err(_) => return std::ptr::null_mut(),
    };
    let images = collect_images(images, image_count);
    let oracle = Box::new(CallbackOracle { callback: branch_oracle });
    match EdgeEngine::new(bitmap, images, oracle, true) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `handle` must be a live pointer returned by [`init_edge`], not yet
/// passed to [`free_edge`]. `maps`/`map_count` must describe valid
/// memory.
#[no_mangle]
pub unsafe extern "C" fn reset_edge(
    handle: *mut EdgeEngine<'static>,
    target_trace_id: u8,
    maps: *const CMemoryMap,
    map_count: usize,
) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    let engine = &mut *handle;
    let memory_maps = collect_memory_maps(maps, map_count);
    to_cresult(engine.reset(target_trace_id, memory_maps))
}

/// # Safety
/// `handle` must be live; `bytes`/`size` must describe valid memory.
#[no_mangle]
pub unsafe extern "C" fn run_edge(handle: *mut EdgeEngine<'static>, bytes: *const u8, size: usize) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    let engine = &mut *handle;
    let data = slice::from_raw_parts(bytes, size);
    to_cresult(engine.run(data))
}

/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn finish_edge(handle: *mut EdgeEngine<'static>) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    to_cresult((&mut *handle).finish())
}

/// # Safety
/// `handle` must have been returned by [`init_edge`] and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn free_edge(handle: *mut EdgeEngine<'static>) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Construct a path-coverage engine. See [`init_edge`] for the bitmap
/// memory contract; the path variant needs no oracle.
///
/// # Safety
/// All pointer/length pairs must describe valid, readable memory for
/// the lifetime of the handle.
#[no_mangle]
pub unsafe extern "C" fn init_path(bitmap_ptr: *mut u8, bitmap_size: usize) -> *mut PathEngine<'static> {
    let bitmap_slice = slice::from_raw_parts_mut(bitmap_ptr, bitmap_size);
    match Bitmap::new(bitmap_slice) {
        Ok(bitmap) => Box::into_raw(Box::new(PathEngine::new(bitmap))),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `handle` must be a live pointer returned by [`init_path`].
#[no_mangle]
pub unsafe extern "C" fn reset_path(
    handle: *mut PathEngine<'static>,
    target_trace_id: u8,
    maps: *const CMemoryMap,
    map_count: usize,
) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    let engine = &mut *handle;
    let memory_maps = collect_memory_maps(maps, map_count);
    to_cresult(engine.reset(target_trace_id, memory_maps))
}

/// # Safety
/// `handle` must be live; `bytes`/`size` must describe valid memory.
#[no_mangle]
pub unsafe extern "C" fn run_path(handle: *mut PathEngine<'static>, bytes: *const u8, size: usize) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    let engine = &mut *handle;
    let data = slice::from_raw_parts(bytes, size);
    to_cresult(engine.run(data))
}

/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn finish_path(handle: *mut PathEngine<'static>) -> CResult {
    if handle.is_null() {
        return CResult::Error;
    }
    to_cresult((&mut *handle).finish())
}

/// # Safety
/// `handle` must have been returned by [`init_path`] and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn free_path(handle: *mut PathEngine<'static>) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}
