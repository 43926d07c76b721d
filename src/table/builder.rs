// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builds one SSTable file: a run of prefix-compressed data blocks, an
//! optional filter block, a filter-index block, an index block, and a
//! fixed-size footer.

use crate::key::{Comparator, InternalKeyComparator, ValueType};
use crate::table::bloom::{FilterPolicy, InternalFilterPolicy};
use crate::table::block_builder::BlockBuilder;
use crate::table::filter_block::FilterBlockBuilder;
use crate::table::{BlockHandle, CompressionType, Footer};
use crate::error::Result;
use std::io::Write;
use std::sync::Arc;

/// Highest sequence number representable in a packed internal key.
const MAX_SEQUENCE: u64 = (1u64 << 56) - 1;

/// Tunables a [`TableBuilder`] needs; a subset of [`crate::Options`] that
/// does not pull in the rest of the `Db` configuration surface.
#[derive(Clone)]
pub struct TableBuilderOptions {
    pub comparator: InternalKeyComparator,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub compression: CompressionType,
}

/// Incrementally writes one SSTable file.
pub struct TableBuilder<W: Write> {
    writer: W,
    offset: u64,
    options: TableBuilderOptions,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    last_key: Vec<u8>,
    num_entries: usize,
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    finished: bool,
}

impl<W: Write> TableBuilder<W> {
    #[must_use]
    pub fn new(writer: W, options: TableBuilderOptions) -> Self {
        let filter_block = options
            .filter_policy
            .clone()
            .map(|policy| FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(policy))));
        Self {
            writer,
            offset: 0,
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_block: BlockBuilder::new(1),
            filter_block,
            options,
            last_key: Vec::new(),
            num_entries: 0,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            finished: false,
        }
    }

    /// Number of entries added so far.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Current estimate of the file size produced so far.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Appends one entry. `key` must be a full internal key (user key plus
    /// the 8-byte sequence/type trailer) and must be strictly greater than
    /// every previously added key under the table's comparator.
    ///
    /// # Panics
    /// Panics if called after [`TableBuilder::finish`].
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.finished, "table builder used after finish()");
        debug_assert!(
            self.num_entries == 0 || self.options.comparator.compare(&self.last_key, key) == std::cmp::Ordering::Less,
            "table builder keys must be added in strictly increasing order"
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            let separator = find_shortest_internal_separator(
                self.options.comparator.user_comparator().as_ref(),
                &self.last_key,
                key,
            );
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding)?;
            self.index_block.add(&separator, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the current data block, if non-empty.
    pub fn flush(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        assert!(!self.pending_index_entry);
        let data_block_contents = self.data_block.finish().to_vec();
        self.pending_handle = self.write_compressed_block(data_block_contents)?;
        self.data_block.reset();
        self.pending_index_entry = true;
        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    fn write_compressed_block(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let handle = crate::table::write_block(&mut self.writer, self.offset, &contents, self.options.compression)?;
        self.offset += handle.size + 5;
        Ok(handle)
    }

    /// Writes the remaining data block, filter block, filter-index block,
    /// index block and footer, returning the total file size.
    ///
    /// # Panics
    /// Panics if called twice.
    pub fn finish(mut self) -> Result<u64> {
        assert!(!self.finished, "table builder finished twice");
        self.flush()?;

        if self.pending_index_entry {
            let mut successor_user_key = user_key_of(&self.last_key).to_vec();
            self.options.comparator.user_comparator().find_short_successor(&mut successor_user_key);
            let successor =
                crate::key::InternalKey::new(&successor_user_key, MAX_SEQUENCE, ValueType::SEEK_TAG).as_bytes().to_vec();
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding)?;
            self.index_block.add(&successor, &handle_encoding);
            self.pending_index_entry = false;
        }

        let filter_index_handle = if let Some(filter_block) = self.filter_block.take() {
            let filter_bytes = filter_block.finish();
            let filter_handle = self.write_compressed_block_uncompressed(filter_bytes)?;

            let policy_name = self.options.filter_policy.as_ref().expect("filter_block implies filter_policy").name();
            let mut filter_index_block = BlockBuilder::new(1);
            let mut key = Vec::with_capacity(6 + policy_name.len());
            key.extend_from_slice(b"filter");
            key.extend_from_slice(policy_name.as_bytes());
            let mut handle_encoding = Vec::new();
            filter_handle.encode_to(&mut handle_encoding)?;
            filter_index_block.add(&key, &handle_encoding);
            self.write_compressed_block(filter_index_block.finish().to_vec())?
        } else {
            BlockHandle::default()
        };

        let index_block_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_compressed_block(index_block_contents)?;

        let footer = Footer { index_handle, filter_index_handle };
        self.writer.write_all(&footer.encode()?)?;
        self.offset += crate::table::FOOTER_SIZE as u64;
        self.finished = true;
        Ok(self.offset)
    }

    fn write_compressed_block_uncompressed(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        let handle = crate::table::write_block(&mut self.writer, self.offset, &contents, CompressionType::None)?;
        self.offset += handle.size + 5;
        Ok(handle)
    }
}

fn user_key_of(internal_key: &[u8]) -> &[u8] {
    &internal_key[..internal_key.len() - 8]
}

/// Finds a short internal key `s` with `start <= s < limit`, preferring a
/// shorter user key when the user comparator can produce one. The returned
/// key carries the maximal sequence/seek tag so it still sorts correctly
/// relative to any real entry sharing that user key.
fn find_shortest_internal_separator(user_cmp: &dyn Comparator, start: &[u8], limit: &[u8]) -> Vec<u8> {
    let start_user = user_key_of(start);
    let limit_user = user_key_of(limit);
    let mut separator = start_user.to_vec();
    user_cmp.find_shortest_separator(&mut separator, limit_user);
    if separator.len() < start_user.len() && user_cmp.compare(&separator, start_user) == std::cmp::Ordering::Greater {
        crate::key::InternalKey::new(&separator, MAX_SEQUENCE, ValueType::SEEK_TAG).as_bytes().to_vec()
    } else {
        start.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKey};
    use crate::table::bloom::BloomFilterPolicy;

    fn options(filter: bool) -> TableBuilderOptions {
        TableBuilderOptions {
            comparator: InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            filter_policy: filter.then(|| Arc::new(BloomFilterPolicy::new(10)) as Arc<dyn FilterPolicy>),
            block_size: 64,
            block_restart_interval: 16,
            compression: CompressionType::None,
        }
    }

    #[test]
    fn builds_a_table_with_multiple_data_blocks() {
        let mut buf = Vec::new();
        let mut builder = TableBuilder::new(&mut buf, options(true));
        for i in 0..200u32 {
            let key = InternalKey::new(format!("key-{i:04}").as_bytes(), u64::from(i) + 1, ValueType::Insertion);
            builder.add(key.as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        let size = builder.finish().unwrap();
        assert_eq!(size as usize, buf.len());
        assert!(buf.len() > 200 * 10); // many small blocks, not one giant blob
    }

    #[test]
    fn single_entry_table_still_produces_a_valid_footer() {
        let mut buf = Vec::new();
        let mut builder = TableBuilder::new(&mut buf, options(false));
        let key = InternalKey::new(b"only", 1, ValueType::Insertion);
        builder.add(key.as_bytes(), b"value").unwrap();
        builder.finish().unwrap();

        let footer_bytes: [u8; crate::table::FOOTER_SIZE] =
            buf[buf.len() - crate::table::FOOTER_SIZE..].try_into().unwrap();
        assert!(Footer::decode(&footer_bytes).is_ok());
    }
}
