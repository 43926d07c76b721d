// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filter block: one bloom filter per 2 KiB span of data-block byte offsets,
//! so a reader can reject a missing key without decoding the data block it
//! would otherwise have to binary-search into.

use crate::table::bloom::FilterPolicy;
use std::sync::Arc;

/// `2^11 = 2048` bytes of data-block offsets share one filter.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: usize = 1 << FILTER_BASE_LG;

/// Accumulates filters while a table's data blocks are being written.
///
/// Call [`FilterBlockBuilder::start_block`] with each data block's starting
/// offset as it is flushed, [`FilterBlockBuilder::add_key`] for every key
/// added to that block, then [`FilterBlockBuilder::finish`] once after the
/// last data block.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys for the filter currently being accumulated, concatenated.
    key_buffer: Vec<u8>,
    /// Start offset of each key within `key_buffer`.
    key_starts: Vec<usize>,
    /// Completed filters, one per data-block span.
    result: Vec<u8>,
    /// Starting offset of each filter within `result`.
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    #[must_use]
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self { policy, key_buffer: Vec::new(), key_starts: Vec::new(), result: Vec::new(), filter_offsets: Vec::new() }
    }

    /// Generates a filter for every 2 KiB span of data-block offsets up
    /// through `block_offset`.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset as usize / FILTER_BASE;
        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    /// Registers `key` as belonging to the data block currently being
    /// written.
    pub fn add_key(&mut self, key: &[u8]) {
        self.key_starts.push(self.key_buffer.len());
        self.key_buffer.extend_from_slice(key);
    }

    /// Finishes the filter block, returning its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.key_starts.is_empty() {
            self.generate_filter();
        }

        let filter_offsets_start = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            self.result.extend_from_slice(&offset.to_le_bytes());
        }
        self.result.extend_from_slice(&filter_offsets_start.to_le_bytes());
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);

        if self.key_starts.is_empty() {
            return;
        }

        self.key_starts.push(self.key_buffer.len());
        let keys: Vec<&[u8]> = self
            .key_starts
            .windows(2)
            .map(|w| &self.key_buffer[w[0]..w[1]])
            .collect();
        let filter = self.policy.create_filter(&keys);
        self.result.extend_from_slice(&filter);

        self.key_buffer.clear();
        self.key_starts.clear();
    }
}

/// Reads back a filter block built by [`FilterBlockBuilder`].
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: crate::slice::Slice,
    filter_offsets_start: usize,
    base_lg: u8,
    num_filters: usize,
}

impl FilterBlockReader {
    /// Parses the trailer of a filter block's raw bytes.
    #[must_use]
    pub fn new(policy: Arc<dyn FilterPolicy>, data: crate::slice::Slice) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let base_lg = data[data.len() - 1];
        let filter_offsets_start =
            u32::from_le_bytes(data[data.len() - 5..data.len() - 1].try_into().ok()?) as usize;
        if filter_offsets_start > data.len() - 5 {
            return None;
        }
        let num_filters = (data.len() - 5 - filter_offsets_start) / 4;
        Some(Self { policy, data, filter_offsets_start, base_lg, num_filters })
    }

    /// Returns `false` only if `key` is definitely absent from the data
    /// block starting at `block_offset`.
    #[must_use]
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }

        let entry = |i: usize| -> u32 {
            let at = self.filter_offsets_start + i * 4;
            u32::from_le_bytes(self.data[at..at + 4].try_into().expect("4 bytes"))
        };
        let start = entry(index) as usize;
        let limit = if index + 1 < self.num_filters { entry(index + 1) as usize } else { self.filter_offsets_start };
        if start > limit || limit > self.filter_offsets_start {
            // A malformed trailer should not turn into a missed key.
            return true;
        }

        self.policy.key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::bloom::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn keys_in_their_own_span_are_found() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"apple");
        builder.add_key(b"banana");
        builder.start_block(2048);
        builder.add_key(b"cherry");
        let bytes = builder.finish();

        let reader = FilterBlockReader::new(policy(), crate::slice::Slice::from(bytes)).unwrap();
        assert!(reader.key_may_match(0, b"apple"));
        assert!(reader.key_may_match(0, b"banana"));
        assert!(reader.key_may_match(2048, b"cherry"));
    }

    #[test]
    fn absent_key_is_usually_rejected() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        for i in 0..50 {
            builder.add_key(format!("key-{i}").as_bytes());
        }
        let bytes = builder.finish();

        let reader = FilterBlockReader::new(policy(), crate::slice::Slice::from(bytes)).unwrap();
        assert!(!reader.key_may_match(0, b"definitely-not-present"));
    }

    #[test]
    fn out_of_range_block_offset_defaults_to_may_match() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"only-key");
        let bytes = builder.finish();

        let reader = FilterBlockReader::new(policy(), crate::slice::Slice::from(bytes)).unwrap();
        assert!(reader.key_may_match(1 << 30, b"anything"));
    }

    #[test]
    fn empty_builder_produces_a_parseable_trailer() {
        let builder = FilterBlockBuilder::new(policy());
        let bytes = builder.finish();
        assert!(FilterBlockReader::new(policy(), crate::slice::Slice::from(bytes)).is_some());
    }
}
