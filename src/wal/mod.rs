// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write-ahead log: physical 32 KiB blocks carrying fragmented, checksummed
//! records.
//!
//! A logical record (one serialized [`crate::WriteBatch`]) is split into
//! one or more physical fragments so that a record never straddles a block
//! boundary invisibly; each fragment carries its own masked CRC32 so a
//! reader can detect and skip a torn write without losing every record
//! that follows it in the file.

use crate::checksum;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};

/// Size of one physical block. Records are fragmented so no fragment
/// crosses a block boundary.
pub const BLOCK_SIZE: usize = 32 * 1024;
/// `crc:u32 LE ‖ length:u16 LE ‖ type:u8`.
const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FragmentType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl FragmentType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}

/// Appends records to a WAL file, fragmenting them across 32 KiB blocks.
pub struct Writer {
    dest: File,
    block_offset: usize,
}

impl Writer {
    /// Wraps a freshly created, empty WAL file.
    #[must_use]
    pub fn new(dest: File) -> Self {
        Self { dest, block_offset: 0 }
    }

    /// Resumes appending to a WAL file that already contains
    /// `initial_length` bytes.
    #[must_use]
    pub fn resume(dest: File, initial_length: u64) -> Self {
        Self { dest, block_offset: (initial_length as usize) % BLOCK_SIZE }
    }

    /// Appends one logical record, fragmenting it as needed. Does not
    /// `fsync`; callers that need durability across a crash call
    /// [`Writer::sync`] explicitly (typically once per write group rather
    /// than once per fragment).
    pub fn add_record(&mut self, mut payload: &[u8]) -> Result<()> {
        let mut begin = true;
        loop {
            let block_left = BLOCK_SIZE - self.block_offset;
            if block_left < HEADER_SIZE {
                if block_left > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE][..block_left])?;
                }
                self.block_offset = 0;
            }

            let fragment_avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = payload.len().min(fragment_avail);
            let end = fragment_len == payload.len();

            let fragment_type = match (begin, end) {
                (true, true) => FragmentType::Full,
                (true, false) => FragmentType::First,
                (false, true) => FragmentType::Last,
                (false, false) => FragmentType::Middle,
            };

            self.write_physical_record(fragment_type, &payload[..fragment_len])?;
            payload = &payload[fragment_len..];
            begin = false;

            if payload.is_empty() {
                return Ok(());
            }
        }
    }

    fn write_physical_record(&mut self, fragment_type: FragmentType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= u16::MAX as usize);
        let mut crc_input = Vec::with_capacity(1 + data.len());
        crc_input.push(fragment_type as u8);
        crc_input.extend_from_slice(data);
        let masked_crc = checksum::masked_crc32(&crc_input);

        let mut header = [0u8; HEADER_SIZE];
        (&mut header[0..4]).write_u32::<LittleEndian>(masked_crc)?;
        (&mut header[4..6]).write_u16::<LittleEndian>(data.len() as u16)?;
        header[6] = fragment_type as u8;

        self.dest.write_all(&header)?;
        self.dest.write_all(data)?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    /// Flushes any OS-buffered writes to the file's backing storage.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.flush()?;
        self.dest.sync_data().map_err(Error::Io)
    }
}

/// Outcome of reading one physical fragment.
enum PhysicalRecord {
    Fragment { fragment_type: FragmentType, data: Vec<u8> },
    /// The fragment's CRC or framing was invalid; the reader should
    /// discard whatever logical record was in progress and keep reading.
    Bad,
    Eof,
}

/// Streams records back out of a WAL file, reassembling fragments and
/// verifying checksums.
pub struct LogReader<R> {
    src: BufReader<R>,
    eof: bool,
    /// Unconsumed bytes from the most recently read block.
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl LogReader<File> {
    /// Opens `file` for sequential record reading from the start.
    #[must_use]
    pub fn new(file: File) -> Self {
        Self { src: BufReader::with_capacity(BLOCK_SIZE, file), eof: false, buffer: Vec::new(), buffer_pos: 0 }
    }
}

impl<R: Read> LogReader<R> {
    /// Reads the next logical record, reassembling it from one or more
    /// fragments. Returns `Ok(None)` at a clean end of file. A fragment
    /// that fails its checksum is silently dropped along with whatever
    /// partial record it belonged to, per the write-ahead log's contract
    /// that a torn tail must not block recovery of the records before it.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut in_progress: Option<Vec<u8>> = None;
        loop {
            match self.read_physical_record()? {
                PhysicalRecord::Eof => return Ok(None),
                PhysicalRecord::Bad => {
                    log::warn!("dropping corrupt write-ahead log fragment");
                    in_progress = None;
                }
                PhysicalRecord::Fragment { fragment_type: FragmentType::Full, data } => {
                    return Ok(Some(data));
                }
                PhysicalRecord::Fragment { fragment_type: FragmentType::First, data } => {
                    in_progress = Some(data);
                }
                PhysicalRecord::Fragment { fragment_type: FragmentType::Middle, data } => {
                    if let Some(buf) = in_progress.as_mut() {
                        buf.extend_from_slice(&data);
                    }
                }
                PhysicalRecord::Fragment { fragment_type: FragmentType::Last, data } => {
                    if let Some(mut buf) = in_progress.take() {
                        buf.extend_from_slice(&data);
                        return Ok(Some(buf));
                    }
                }
            }
        }
    }

    fn fill_buffer(&mut self) -> io::Result<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut read = 0;
        while read < BLOCK_SIZE {
            match self.src.read(&mut block[read..])? {
                0 => break,
                n => read += n,
            }
        }
        block.truncate(read);
        if read < BLOCK_SIZE {
            self.eof = true;
        }
        self.buffer = block;
        self.buffer_pos = 0;
        Ok(())
    }

    fn read_physical_record(&mut self) -> Result<PhysicalRecord> {
        loop {
            let remaining = self.buffer.len() - self.buffer_pos;
            if remaining < HEADER_SIZE {
                if self.eof {
                    return Ok(PhysicalRecord::Eof);
                }
                self.fill_buffer()?;
                continue;
            }

            let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
            let masked_crc = (&header[0..4]).read_u32::<LittleEndian>()?;
            let length = (&header[4..6]).read_u16::<LittleEndian>()? as usize;
            let Some(fragment_type) = FragmentType::from_byte(header[6]) else {
                self.buffer_pos = self.buffer.len();
                return Ok(PhysicalRecord::Bad);
            };

            if HEADER_SIZE + length > remaining {
                self.buffer_pos = self.buffer.len();
                if self.eof {
                    return Ok(PhysicalRecord::Eof);
                }
                return Ok(PhysicalRecord::Bad);
            }

            let data_start = self.buffer_pos + HEADER_SIZE;
            let data = self.buffer[data_start..data_start + length].to_vec();
            self.buffer_pos = data_start + length;

            let expected_crc = checksum::unmask(masked_crc);
            let mut crc_input = Vec::with_capacity(1 + data.len());
            crc_input.push(fragment_type as u8);
            crc_input.extend_from_slice(&data);
            if checksum::crc32(&crc_input) != expected_crc {
                return Ok(PhysicalRecord::Bad);
            }

            return Ok(PhysicalRecord::Fragment { fragment_type, data });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn roundtrip(records: &[&[u8]]) -> Vec<Vec<u8>> {
        let file = tempfile::tempfile().unwrap();
        let mut writer = Writer::new(file.try_clone().unwrap());
        for r in records {
            writer.add_record(r).unwrap();
        }
        writer.sync().unwrap();

        let mut file = file;
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = LogReader::new(file);
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn small_record_round_trips_as_a_single_fragment() {
        let out = roundtrip(&[b"hello world"]);
        assert_eq!(out, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn multiple_small_records_round_trip_in_order() {
        let out = roundtrip(&[b"a", b"bb", b"ccc"]);
        assert_eq!(out, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn record_larger_than_a_block_is_fragmented_and_reassembled() {
        let big = vec![0x42u8; BLOCK_SIZE * 3 + 17];
        let out = roundtrip(&[&big]);
        assert_eq!(out, vec![big]);
    }

    #[test]
    fn corrupted_fragment_is_skipped_without_losing_later_records() {
        let file = tempfile::tempfile().unwrap();
        let mut writer = Writer::new(file.try_clone().unwrap());
        writer.add_record(b"first").unwrap();
        writer.add_record(b"second").unwrap();
        writer.sync().unwrap();

        let mut file = file;
        // Flip a byte inside the first record's payload, which must fail
        // its CRC check without disturbing the second record's framing.
        file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
        file.write_all(&[0xff]).unwrap();

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = LogReader::new(file);
        let mut out = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            out.push(record);
        }
        assert_eq!(out, vec![b"second".to_vec()]);
    }
}
