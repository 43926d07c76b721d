// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! SSTable file format: data blocks, an optional filter block, a
//! filter-index block, an index block, and a fixed-size footer.

pub mod block;
pub mod block_builder;
pub mod bloom;
pub mod builder;
pub mod filter_block;
pub mod reader;

use crate::coding::{get_varint64, put_varint64};
use crate::error::{Error, Result};
use std::io::Write;

/// 8-byte little-endian magic terminating every table file.
pub const TABLE_MAGIC: u64 = 0xaf41_de78;
/// Footer size: two 20-byte zero-padded handles plus the 8-byte magic.
pub const FOOTER_SIZE: usize = 48;
const HANDLE_ENCODED_SIZE: usize = 20;

/// One-byte compression tag stored after every block's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// The block is stored uncompressed.
    None = 0,
    /// The block is compressed with Snappy.
    Snappy = 1,
}

impl CompressionType {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            other => Err(Error::Corruption(format!("unknown block compression tag: {other}"))),
        }
    }
}

/// Locates a block within a table file: `(offset, size)`, excluding the
/// block's own trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_varint64(buf, self.offset)?;
        put_varint64(buf, self.size)
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(input)?;
        let size = get_varint64(input)?;
        Ok(Self { offset, size })
    }
}

/// The fixed-size trailer of a table file: handles to the index block and
/// the filter-index block, plus the format magic number.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub index_handle: BlockHandle,
    pub filter_index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Result<[u8; FOOTER_SIZE]> {
        let mut out = [0u8; FOOTER_SIZE];
        let mut buf = Vec::with_capacity(HANDLE_ENCODED_SIZE);
        self.index_handle.encode_to(&mut buf)?;
        buf.resize(HANDLE_ENCODED_SIZE, 0);
        out[0..HANDLE_ENCODED_SIZE].copy_from_slice(&buf);

        buf.clear();
        self.filter_index_handle.encode_to(&mut buf)?;
        buf.resize(HANDLE_ENCODED_SIZE, 0);
        out[HANDLE_ENCODED_SIZE..2 * HANDLE_ENCODED_SIZE].copy_from_slice(&buf);

        out[2 * HANDLE_ENCODED_SIZE..].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        Ok(out)
    }

    pub fn decode(data: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let magic = u64::from_le_bytes(data[2 * HANDLE_ENCODED_SIZE..].try_into().expect("8 bytes"));
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!("bad table footer magic: {magic:#x}")));
        }
        let mut index_buf = &data[0..HANDLE_ENCODED_SIZE];
        let index_handle = BlockHandle::decode_from(&mut index_buf)?;
        let mut filter_buf = &data[HANDLE_ENCODED_SIZE..2 * HANDLE_ENCODED_SIZE];
        let filter_index_handle = BlockHandle::decode_from(&mut filter_buf)?;
        Ok(Self { index_handle, filter_index_handle })
    }
}

/// Writes `contents` to `writer` at the caller's current file position with
/// the trailing `[compression tag][masked crc32]`, returning a handle to the
/// block's contents (not including the trailer).
pub fn write_block<W: Write>(
    writer: &mut W,
    offset: u64,
    contents: &[u8],
    compression: CompressionType,
) -> Result<BlockHandle> {
    let block_contents = match compression {
        CompressionType::None => contents.to_vec(),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(contents)
            .map_err(|e| Error::Encode(e.to_string()))?,
        #[cfg(not(feature = "snappy"))]
        CompressionType::Snappy => {
            return Err(Error::Encode("snappy compression feature not enabled".into()))
        }
    };

    writer.write_all(&block_contents)?;
    let mut trailer = [0u8; 5];
    trailer[0] = compression as u8;
    let mut crc_input = Vec::with_capacity(block_contents.len() + 1);
    crc_input.extend_from_slice(&block_contents);
    crc_input.push(compression as u8);
    let masked_crc = crate::checksum::masked_crc32(&crc_input);
    trailer[1..5].copy_from_slice(&masked_crc.to_le_bytes());
    writer.write_all(&trailer)?;

    Ok(BlockHandle::new(offset, block_contents.len() as u64))
}

/// Reads and verifies the block located by `handle` out of `data` (the
/// complete table file contents), decompressing it if necessary.
pub fn read_block(data: &[u8], handle: BlockHandle, check_crc: bool) -> Result<crate::slice::Slice> {
    let start = handle.offset as usize;
    let size = handle.size as usize;
    let end = start.checked_add(size).ok_or_else(|| Error::Corruption("block handle overflow".into()))?;
    let trailer_end = end + 5;
    if trailer_end > data.len() {
        return Err(Error::Corruption("block handle extends past end of file".into()));
    }

    let contents = &data[start..end];
    let compression = CompressionType::from_byte(data[end])?;

    if check_crc {
        let masked_crc = u32::from_le_bytes(data[end + 1..trailer_end].try_into().expect("4 bytes"));
        let expected = crate::checksum::unmask(masked_crc);
        let mut crc_input = Vec::with_capacity(contents.len() + 1);
        crc_input.extend_from_slice(contents);
        crc_input.push(compression as u8);
        if crate::checksum::crc32(&crc_input) != expected {
            return Err(Error::Corruption("block checksum mismatch".into()));
        }
    }

    match compression {
        CompressionType::None => Ok(crate::slice::Slice::from(contents)),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(contents)
                .map_err(|e| Error::Corruption(format!("snappy decompression failed: {e}")))?;
            Ok(crate::slice::Slice::from(decompressed))
        }
        #[cfg(not(feature = "snappy"))]
        CompressionType::Snappy => {
            Err(Error::Corruption("block is snappy-compressed but the snappy feature is disabled".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_handle_round_trips() {
        let handle = BlockHandle::new(123_456, 789);
        let mut buf = Vec::new();
        handle.encode_to(&mut buf).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(BlockHandle::decode_from(&mut cursor).unwrap(), handle);
    }

    #[test]
    fn footer_round_trips_and_checks_magic() {
        let footer =
            Footer { index_handle: BlockHandle::new(10, 20), filter_index_handle: BlockHandle::new(30, 40) };
        let encoded = footer.encode().unwrap();
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.index_handle, footer.index_handle);
        assert_eq!(decoded.filter_index_handle, footer.filter_index_handle);

        let mut bad = encoded;
        bad[47] ^= 0xff;
        assert!(Footer::decode(&bad).is_err());
    }

    #[test]
    fn write_then_read_block_round_trips_uncompressed() {
        let mut buf = Vec::new();
        let handle = write_block(&mut buf, 0, b"hello world", CompressionType::None).unwrap();
        let read_back = read_block(&buf, handle, true).unwrap();
        assert_eq!(&*read_back, b"hello world");
    }

    #[test]
    fn corrupted_block_fails_crc_check() {
        let mut buf = Vec::new();
        let handle = write_block(&mut buf, 0, b"hello world", CompressionType::None).unwrap();
        buf[0] ^= 0xff;
        assert!(read_block(&buf, handle, true).is_err());
    }
}
