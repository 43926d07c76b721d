// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builds one prefix-compressed data or index block.
//!
//! Entries are encoded `varint32(shared) ‖ varint32(non_shared) ‖
//! varint32(value_len) ‖ non_shared_key_bytes ‖ value_bytes`, where
//! `shared` is the length of the common prefix with the previous key.
//! Every `restart_interval`-th entry restarts (`shared = 0`) so a reader
//! can binary-search restart points without decompressing the whole
//! block.

use crate::coding::put_varint32;

/// Accumulates entries for a single block.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    /// Creates a builder that restarts prefix compression every
    /// `restart_interval` entries.
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Appends one entry. Keys must be added in strictly increasing order
    /// per the block's comparator; this is enforced by the table builder,
    /// not here.
    ///
    /// # Panics
    /// Panics if called after [`BlockBuilder::finish`] without an
    /// intervening [`BlockBuilder::reset`].
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "block builder used after finish()");

        let shared = if self.counter < self.restart_interval {
            let min_len = key.len().min(self.last_key.len());
            let mut shared = 0;
            while shared < min_len && key[shared] == self.last_key[shared] {
                shared += 1;
            }
            shared
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let non_shared = key.len() - shared;
        put_varint32(&mut self.buffer, shared as u32).expect("vec write cannot fail");
        put_varint32(&mut self.buffer, non_shared as u32).expect("vec write cannot fail");
        put_varint32(&mut self.buffer, value.len() as u32).expect("vec write cannot fail");
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        self.counter += 1;
    }

    /// Finishes the block, appending the restart array and count, and
    /// returns the complete block contents.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            self.buffer.extend_from_slice(&restart.to_le_bytes());
        }
        self.buffer.extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        self.finished = true;
        &self.buffer
    }

    /// Current size estimate, including restart-array overhead not yet
    /// appended to `buffer`.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Returns `true` if no entries have been added since construction or
    /// the last [`BlockBuilder::reset`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clears the builder for reuse.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}
