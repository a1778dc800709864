use anyhow::{bail, Context, Result};
use coresight_decode::engine::edge::EdgeEngine;
use coresight_decode::engine::path::PathEngine;
use coresight_decode::{Bitmap, BranchInsn, BranchOracle, MemoryImage, MemoryMap, MemoryMaps, OracleError};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitmapType {
    Edge,
    Path,
}

impl FromStr for BitmapType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "edge" => Ok(BitmapType::Edge),
            "path" => Ok(BitmapType::Path),
            _ => bail!("unknown bitmap type {:?}, expected \"edge\" or \"path\"", s),
        }
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).with_context(|| format!("invalid hex value {:?}", s))
}

#[derive(StructOpt, Debug)]
#[structopt(
    about = "An offline decoder for ARM CoreSight ETMv4 trace streams that reconstructs control-flow edges into AFL-style coverage bitmaps."
)]
struct Opt {
    #[structopt(long, parse(try_from_str = parse_hex), default_value = "0x10000")]
    bitmap_size: u64,

    #[structopt(long, parse(from_os_str), default_value = "edge_coverage_bitmap.out")]
    bitmap_filename: PathBuf,

    #[structopt(long, default_value = "edge")]
    bitmap_type: BitmapType,

    #[structopt(name = "TRACE-DATA-FILE", parse(from_os_str))]
    trace_data_file: PathBuf,

    #[structopt(name = "TRACE-ID", parse(try_from_str = parse_hex))]
    trace_id: u64,

    #[structopt(
        name = "ARGS",
        help = "N, followed by N triples of (binary-path, start-hex, end-hex)"
    )]
    rest: Vec<String>,
}

struct BoundImage {
    map: MemoryMap,
    image: MemoryImage,
}

fn parse_images(rest: &[String]) -> Result<Vec<BoundImage>> {
    let n: usize = rest
        .get(0)
        .context("missing N (image count)")?
        .parse()
        .context("N must be a decimal integer")?;

    let triples = &rest[1..];
    if triples.len() != n * 3 {
        bail!("expected {} positional args after N ({} triples), got {}", n * 3, n, triples.len());
    }

    let mut images = Vec::with_capacity(n);
    for (image_id, chunk) in triples.chunks(3).enumerate() {
        let path = &chunk[0];
        let start = parse_hex(&chunk[1])?;
        let end = parse_hex(&chunk[2])?;

        let mut file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).with_context(|| format!("failed to read {:?}", path))?;

        images.push(BoundImage {
            map: MemoryMap::new(start, end, image_id),
            image: MemoryImage::new(data, image_id),
        });
    }
    Ok(images)
}

/// This reference CLI embeds no disassembler backend (spec.md §1
/// explicitly scopes the instruction-set decoder out of the core); the
/// `edge` bitmap type therefore cannot run standalone from the
/// command line. Embedders of the library supply their own
/// [`BranchOracle`] instead of calling this binary.
struct NoDisassemblerOracle;

impl BranchOracle for NoDisassemblerOracle {
    fn next_branch(&self, image: &MemoryImage, from_offset: u64) -> Result<BranchInsn, OracleError> {
        Err(OracleError::NoBranchFound {
            location: coresight_decode::Location::new(from_offset, image.image_id()),
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    if !opt.bitmap_size.is_power_of_two() {
        bail!("--bitmap-size must be a power of two, got {:#x}", opt.bitmap_size);
    }
    let trace_id: u8 = opt.trace_id.try_into().context("--trace-id must fit in 7 bits")?;

    let bound_images = parse_images(&opt.rest)?;
    let maps = MemoryMaps::new(bound_images.iter().map(|b| b.map).collect());
    let images: Vec<MemoryImage> = bound_images.into_iter().map(|b| b.image).collect();

    let mut trace_data = Vec::new();
    File::open(&opt.trace_data_file)
        .with_context(|| format!("failed to open {:?}", opt.trace_data_file))?
        .read_to_end(&mut trace_data)
        .with_context(|| format!("failed to read {:?}", opt.trace_data_file))?;

    let mut bitmap_data = vec![0u8; opt.bitmap_size as usize];
    let bitmap = Bitmap::new(&mut bitmap_data)?;

    match opt.bitmap_type {
        BitmapType::Edge => {
            let mut engine = EdgeEngine::new(bitmap, images, Box::new(NoDisassemblerOracle), true)?;
            engine.reset(trace_id, maps)?;
            engine.run(&trace_data)?;
            engine.finish()?;
        }
        BitmapType::Path => {
            let mut engine = PathEngine::new(bitmap);
            engine.reset(trace_id, maps)?;
            engine.run(&trace_data)?;
            engine.finish()?;
        }
    }

    File::create(&opt.bitmap_filename)
        .with_context(|| format!("failed to create {:?}", opt.bitmap_filename))?
        .write_all(&bitmap_data)
        .with_context(|| format!("failed to write {:?}", opt.bitmap_filename))?;

    log::info!("wrote {} bytes to {:?}", bitmap_data.len(), opt.bitmap_filename);
    Ok(())
}
