// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Varint and fixed-width integer encoding helpers shared by the WAL,
//! write batch, block, and manifest formats.
//!
//! Varints are delegated to `varint-rs`, which decodes directly into a
//! `u64` accumulator, so a 64-bit varint is never silently truncated
//! through a 32-bit intermediate.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Writes a `u32` as a LEB128 varint.
pub fn put_varint32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_u32_varint(value)
        .map_err(|e| Error::Encode(e.to_string()))
}

/// Reads a LEB128-encoded `u32` varint.
pub fn get_varint32<R: Read>(r: &mut R) -> Result<u32> {
    r.read_u32_varint()
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Writes a `u64` as a LEB128 varint.
pub fn put_varint64<W: Write>(w: &mut W, value: u64) -> Result<()> {
    w.write_u64_varint(value)
        .map_err(|e| Error::Encode(e.to_string()))
}

/// Reads a LEB128-encoded `u64` varint.
pub fn get_varint64<R: Read>(r: &mut R) -> Result<u64> {
    r.read_u64_varint()
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Writes a length-delimited byte string as `varint32(len) ‖ bytes`.
pub fn put_length_prefixed_slice<W: Write>(w: &mut W, value: &[u8]) -> Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    put_varint32(w, value.len() as u32)?;
    w.write_all(value).map_err(Error::Io)
}

/// Reads a `varint32(len) ‖ bytes` length-delimited byte string.
pub fn get_length_prefixed_slice<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = get_varint32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

/// Writes a little-endian `u32`.
pub fn put_fixed32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_u32::<LittleEndian>(value).map_err(Error::Io)
}

/// Reads a little-endian `u32`.
pub fn get_fixed32<R: Read>(r: &mut R) -> Result<u32> {
    r.read_u32::<LittleEndian>().map_err(Error::Io)
}

/// Writes a little-endian `u64`.
pub fn put_fixed64<W: Write>(w: &mut W, value: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(value).map_err(Error::Io)
}

/// Reads a little-endian `u64`.
pub fn get_fixed64<R: Read>(r: &mut R) -> Result<u64> {
    r.read_u64::<LittleEndian>().map_err(Error::Io)
}

/// Number of bytes needed to varint-encode `value`.
#[must_use]
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
