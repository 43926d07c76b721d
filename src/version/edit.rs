// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A `VersionEdit` is a single, atomic change to the set of live SSTables:
//! the unit of work the manifest log persists and replays.

use crate::coding::{get_varint32, get_varint64, put_varint32, put_varint64};
use crate::error::{Error, Result};
use crate::key::InternalKey;
use std::sync::atomic::AtomicI64;

/// Minimum number of seeks a freshly created file is allowed to absorb
/// before it becomes a compaction candidate on its own, independent of
/// size-driven compaction. Mirrors the assumption that one seek costs
/// about as much as reading 16 KiB of data.
const SEEK_COST_BYTES: u64 = 16 * 1024;
const MIN_ALLOWED_SEEKS: i64 = 100;

/// One SSTable's metadata as tracked by a [`crate::version::version::Version`].
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seeks this file has left before it is scheduled for compaction on
    /// its own, decremented by [`crate::version::version::Version::update_stats`].
    pub allow_seeks: AtomicI64,
}

impl FileMetaData {
    #[must_use]
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allow_seeks = (file_size / SEEK_COST_BYTES).max(MIN_ALLOWED_SEEKS as u64) as i64;
        Self { number, file_size, smallest, largest, allow_seeks: AtomicI64::new(allow_seeks) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum Tag {
    LogNumber = 1,
    LastSequence = 2,
    NextFileNumber = 3,
    ComparatorName = 4,
    NewFile = 5,
    DeleteFile = 6,
    CompactionPointer = 7,
}

impl Tag {
    fn from_u32(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::LogNumber),
            2 => Ok(Self::LastSequence),
            3 => Ok(Self::NextFileNumber),
            4 => Ok(Self::ComparatorName),
            5 => Ok(Self::NewFile),
            6 => Ok(Self::DeleteFile),
            7 => Ok(Self::CompactionPointer),
            other => Err(Error::Corruption(format!("unknown version edit tag: {other}"))),
        }
    }
}

/// A newly added file, as recorded in a [`VersionEdit`].
#[derive(Clone)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// An atomic batch of changes to apply to the current [`crate::version::version::Version`].
#[derive(Default)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compaction_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
    }

    pub fn set_compaction_pointer(&mut self, level: usize, key: InternalKey) {
        self.compaction_pointers.push((level, key));
    }

    pub fn add_file(&mut self, level: usize, number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) {
        self.new_files.push((level, NewFile { number, file_size, smallest, largest }));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        if let Some(name) = &self.comparator_name {
            put_varint32(buf, Tag::ComparatorName as u32)?;
            crate::coding::put_length_prefixed_slice(buf, name.as_bytes())?;
        }
        if let Some(number) = self.log_number {
            put_varint32(buf, Tag::LogNumber as u32)?;
            put_varint64(buf, number)?;
        }
        if let Some(number) = self.next_file_number {
            put_varint32(buf, Tag::NextFileNumber as u32)?;
            put_varint64(buf, number)?;
        }
        if let Some(sequence) = self.last_sequence {
            put_varint32(buf, Tag::LastSequence as u32)?;
            put_varint64(buf, sequence)?;
        }
        for (level, key) in &self.compaction_pointers {
            put_varint32(buf, Tag::CompactionPointer as u32)?;
            put_varint32(buf, *level as u32)?;
            crate::coding::put_length_prefixed_slice(buf, key.as_bytes())?;
        }
        for (level, number) in &self.deleted_files {
            put_varint32(buf, Tag::DeleteFile as u32)?;
            put_varint32(buf, *level as u32)?;
            put_varint64(buf, *number)?;
        }
        for (level, file) in &self.new_files {
            put_varint32(buf, Tag::NewFile as u32)?;
            put_varint32(buf, *level as u32)?;
            put_varint64(buf, file.number)?;
            put_varint64(buf, file.file_size)?;
            crate::coding::put_length_prefixed_slice(buf, file.smallest.as_bytes())?;
            crate::coding::put_length_prefixed_slice(buf, file.largest.as_bytes())?;
        }
        Ok(())
    }

    pub fn decode_from(mut input: &[u8]) -> Result<Self> {
        let mut edit = Self::new();
        while !input.is_empty() {
            let tag = Tag::from_u32(get_varint32(&mut input)?)?;
            match tag {
                Tag::ComparatorName => {
                    let name = crate::coding::get_length_prefixed_slice(&mut input)?;
                    edit.comparator_name = Some(String::from_utf8(name).map_err(|e| Error::Decode(e.to_string()))?);
                }
                Tag::LogNumber => edit.log_number = Some(get_varint64(&mut input)?),
                Tag::NextFileNumber => edit.next_file_number = Some(get_varint64(&mut input)?),
                Tag::LastSequence => edit.last_sequence = Some(get_varint64(&mut input)?),
                Tag::CompactionPointer => {
                    let level = get_varint32(&mut input)? as usize;
                    let key = crate::coding::get_length_prefixed_slice(&mut input)?;
                    edit.compaction_pointers.push((level, InternalKey::from_encoded(key.into())));
                }
                Tag::DeleteFile => {
                    let level = get_varint32(&mut input)? as usize;
                    let number = get_varint64(&mut input)?;
                    edit.deleted_files.push((level, number));
                }
                Tag::NewFile => {
                    let level = get_varint32(&mut input)? as usize;
                    let number = get_varint64(&mut input)?;
                    let file_size = get_varint64(&mut input)?;
                    let smallest = crate::coding::get_length_prefixed_slice(&mut input)?;
                    let largest = crate::coding::get_length_prefixed_slice(&mut input)?;
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            file_size,
                            smallest: InternalKey::from_encoded(smallest.into()),
                            largest: InternalKey::from_encoded(largest.into()),
                        },
                    ));
                }
            }
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueType;

    #[test]
    fn edit_round_trips_every_field() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("lsmkv.BytewiseComparator");
        edit.set_log_number(7);
        edit.set_next_file_number(42);
        edit.set_last_sequence(1000);
        edit.set_compaction_pointer(2, InternalKey::new(b"ptr", 5, ValueType::Insertion));
        edit.add_file(
            1,
            9,
            4096,
            InternalKey::new(b"a", 1, ValueType::Insertion),
            InternalKey::new(b"z", 2, ValueType::Insertion),
        );
        edit.delete_file(0, 3);

        let mut buf = Vec::new();
        edit.encode_to(&mut buf).unwrap();
        let decoded = VersionEdit::decode_from(&buf).unwrap();

        assert_eq!(decoded.comparator_name.as_deref(), Some("lsmkv.BytewiseComparator"));
        assert_eq!(decoded.log_number, Some(7));
        assert_eq!(decoded.next_file_number, Some(42));
        assert_eq!(decoded.last_sequence, Some(1000));
        assert_eq!(decoded.compaction_pointers.len(), 1);
        assert_eq!(decoded.new_files.len(), 1);
        assert_eq!(decoded.new_files[0].1.number, 9);
        assert_eq!(decoded.deleted_files, vec![(0, 3)]);
    }

    #[test]
    fn new_file_gets_a_floor_on_allowed_seeks() {
        let meta = FileMetaData::new(
            0,
            10,
            InternalKey::new(b"a", 1, ValueType::Insertion),
            InternalKey::new(b"a", 1, ValueType::Insertion),
        );
        assert_eq!(meta.allow_seeks.load(std::sync::atomic::Ordering::Relaxed), MIN_ALLOWED_SEEKS);
    }

    #[test]
    fn large_file_gets_seeks_proportional_to_size() {
        let meta = FileMetaData::new(
            0,
            16 * 1024 * 1024,
            InternalKey::new(b"a", 1, ValueType::Insertion),
            InternalKey::new(b"a", 1, ValueType::Insertion),
        );
        assert_eq!(meta.allow_seeks.load(std::sync::atomic::Ordering::Relaxed), 1024);
    }
}
