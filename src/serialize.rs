//! Little-endian stream primitives for the binary layer format.
//!
//! Writers propagate `io::Error`; readers return `None` on truncation or
//! malformed values so layer deserializers can report "not recognized"
//! without aborting the caller.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::tensor::TensorInfo;

pub(crate) fn write_u8(w: &mut dyn Write, v: u8) -> io::Result<()> {
    w.write_u8(v)
}

pub(crate) fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(v)
}

pub(crate) fn write_f32s(w: &mut dyn Write, values: &[f32]) -> io::Result<()> {
    for &v in values {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

pub(crate) fn read_u8(r: &mut dyn Read) -> Option<u8> {
    r.read_u8().ok()
}

pub(crate) fn read_u32(r: &mut dyn Read) -> Option<u32> {
    r.read_u32::<LittleEndian>().ok()
}

/// Reads `len` consecutive values. Grows the buffer as data actually
/// arrives, so a corrupt length field on a truncated stream fails fast
/// instead of over-allocating.
pub(crate) fn read_f32s(r: &mut dyn Read, len: usize) -> Option<Vec<f32>> {
    let mut out = Vec::new();
    for _ in 0..len {
        out.push(r.read_f32::<LittleEndian>().ok()?);
    }
    Some(out)
}

pub(crate) fn write_info(w: &mut dyn Write, info: TensorInfo) -> io::Result<()> {
    write_u32(w, info.channels as u32)?;
    write_u32(w, info.height as u32)?;
    write_u32(w, info.width as u32)
}

pub(crate) fn read_info(r: &mut dyn Read) -> Option<TensorInfo> {
    let channels = read_u32(r)? as usize;
    let height = read_u32(r)? as usize;
    let width = read_u32(r)? as usize;
    TensorInfo::new(channels, height, width).ok()
}
