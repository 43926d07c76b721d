// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A self-describing, serialized group of `Put`/`Delete` operations.
//!
//! Wire format: `sequence: u64 LE ‖ count: u32 LE ‖ record*`, where each
//! record is `type: u8 ‖ varint32(key_len) ‖ key ‖ [varint32(value_len) ‖ value]`
//! (the value is only present for insertions). This is exactly the batch
//! the WAL writer appends as a single record and the exact byte range the
//! memtable insertion path iterates over.

use crate::coding::{get_length_prefixed_slice, get_varint32, put_length_prefixed_slice};
use crate::error::{Error, Result};
use crate::key::ValueType;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

const HEADER_LEN: usize = 8 + 4;

/// A batch of mutations to apply atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    /// `sequence (8 bytes) ‖ count (4 bytes) ‖ records...`
    rep: Vec<u8>,
}

/// One decoded operation from a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation<'a> {
    /// A key insertion.
    Put {
        /// The key being inserted.
        key: &'a [u8],
        /// The value being inserted.
        value: &'a [u8],
    },
    /// A key deletion.
    Delete {
        /// The key being deleted.
        key: &'a [u8],
    },
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self { rep: vec![0u8; HEADER_LEN] }
    }

    /// Appends a `Put(key, value)` operation.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(u8::from(ValueType::Insertion));
        put_length_prefixed_slice(&mut self.rep, key).expect("vec write cannot fail");
        put_length_prefixed_slice(&mut self.rep, value).expect("vec write cannot fail");
    }

    /// Appends a `Delete(key)` operation.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(u8::from(ValueType::Deletion));
        put_length_prefixed_slice(&mut self.rep, key).expect("vec write cannot fail");
    }

    /// Removes all operations, keeping the header.
    pub fn clear(&mut self) {
        self.rep.truncate(HEADER_LEN);
        self.rep.fill(0);
    }

    /// Number of operations currently in the batch.
    #[must_use]
    pub fn count(&self) -> u32 {
        (&self.rep[8..12]).read_u32::<LittleEndian>().expect("header is always present")
    }

    fn set_count(&mut self, count: u32) {
        (&mut self.rep[8..12])
            .write_u32::<LittleEndian>(count)
            .expect("header is always present");
    }

    /// The sequence number of the batch's first operation.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        (&self.rep[0..8]).read_u64::<LittleEndian>().expect("header is always present")
    }

    /// Sets the sequence number of the batch's first operation. Later
    /// operations in the batch implicitly get `sequence + i`.
    pub fn set_sequence(&mut self, sequence: u64) {
        (&mut self.rep[0..8])
            .write_u64::<LittleEndian>(sequence)
            .expect("header is always present");
    }

    /// The raw wire-format bytes, as appended to the WAL.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.rep
    }

    /// Approximate size in bytes this batch will occupy once applied to a
    /// memtable (used for write-group size limiting).
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Rebuilds a batch from previously serialized bytes (e.g. read back
    /// from the WAL).
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] if `bytes` is shorter than the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Corruption("write batch too short for header".into()));
        }
        Ok(Self { rep: bytes })
    }

    /// Appends every operation in `other` onto `self`, preserving order.
    /// `self`'s sequence/count header is updated; `other`'s is ignored.
    pub fn append(&mut self, other: &WriteBatch) {
        let new_count = self.count() + other.count();
        self.rep.extend_from_slice(&other.rep[HEADER_LEN..]);
        self.set_count(new_count);
    }

    /// Visits every operation in order, calling `f` for each.
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] if a record is truncated or carries an
    /// unrecognized type tag.
    pub fn iterate<F: FnMut(BatchOperation<'_>) -> Result<()>>(&self, mut f: F) -> Result<()> {
        let mut input = &self.rep[HEADER_LEN..];
        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            let value_type = ValueType::try_from(tag)?;
            match value_type {
                ValueType::Insertion => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    let value = get_length_prefixed_slice(&mut input)?;
                    f(BatchOperation::Put { key: &key, value: &value })?;
                }
                ValueType::Deletion => {
                    let key = get_length_prefixed_slice(&mut input)?;
                    f(BatchOperation::Delete { key: &key })?;
                }
            }
            found += 1;
        }
        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch header says {} records, found {found}",
                self.count()
            )));
        }
        Ok(())
    }

    /// Convenience: visits each op decoded straight from a `key` slice,
    /// without going through [`BatchOperation`]'s borrow — used by the
    /// memtable insertion path, which needs an owned copy anyway.
    pub fn for_each_owned<F: FnMut(ValueType, Vec<u8>, Vec<u8>) -> Result<()>>(
        &self,
        mut f: F,
    ) -> Result<()> {
        let mut input = &self.rep[HEADER_LEN..];
        let mut found = 0u32;
        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            let value_type = ValueType::try_from(tag)?;
            let key = get_length_prefixed_slice(&mut input)?;
            let value = match value_type {
                ValueType::Insertion => get_length_prefixed_slice(&mut input)?,
                ValueType::Deletion => Vec::new(),
            };
            f(value_type, key, value)?;
            found += 1;
        }
        if found != self.count() {
            return Err(Error::Corruption(format!(
                "write batch header says {} records, found {found}",
                self.count()
            )));
        }
        Ok(())
    }
}
