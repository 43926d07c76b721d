// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Reads one SSTable file: footer, index block, optional filter block, and
//! the data blocks they point at.

use crate::cache::BlockCache;
use crate::error::Result;
use crate::key::{Comparator, InternalKeyComparator};
use crate::slice::Slice;
use crate::table::block::Block;
use crate::table::bloom::{FilterPolicy, InternalFilterPolicy};
use crate::table::filter_block::FilterBlockReader;
use crate::table::{read_block, BlockHandle, Footer, FOOTER_SIZE};
use std::sync::Arc;

/// Orders the byte strings stored as index/data block keys (full internal
/// keys) using the table's [`InternalKeyComparator`], adapted to the
/// single-method [`Comparator`] trait blocks are generic over.
#[derive(Clone)]
struct BlockKeyComparator(InternalKeyComparator);

impl std::fmt::Debug for BlockKeyComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockKeyComparator({})", self.0.name())
    }
}

impl Comparator for BlockKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        self.0.compare(a, b)
    }

    fn name(&self) -> &'static str {
        "lsmkv.BlockKeyComparator"
    }
}

/// One open SSTable. Holds the whole file's bytes in memory; the data
/// blocks it points at are decoded on demand by [`TableReader::get`] or
/// [`TableReader::iter`], not eagerly, and cached decoded in `block_cache`
/// so a repeat visit to the same block skips checksum verification and
/// decompression.
pub struct TableReader {
    data: Slice,
    file_number: u64,
    comparator: BlockKeyComparator,
    index_block: Block,
    filter: Option<FilterBlockReader>,
    check_crc: bool,
    block_cache: Option<BlockCache>,
}

impl TableReader {
    /// Parses the footer, index block, and (if present) filter block out of
    /// `data`, a complete table file's bytes. `file_number` identifies this
    /// table's blocks in `block_cache`, shared across every open table.
    pub fn open(
        data: Slice,
        file_number: u64,
        comparator: InternalKeyComparator,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        check_crc: bool,
        block_cache: Option<BlockCache>,
    ) -> Result<Self> {
        let footer_bytes: [u8; FOOTER_SIZE] = data[data.len() - FOOTER_SIZE..].try_into().map_err(|_| {
            crate::error::Error::Corruption("table file too small to contain a footer".into())
        })?;
        let footer = Footer::decode(&footer_bytes)?;

        let index_block = Block::new(read_block(&data, footer.index_handle, check_crc)?)?;

        let filter = if footer.filter_index_handle.size > 0 {
            filter_policy.and_then(|policy| {
                let internal_policy: Arc<dyn FilterPolicy> = Arc::new(InternalFilterPolicy::new(policy));
                let filter_index_bytes = read_block(&data, footer.filter_index_handle, check_crc).ok()?;
                let filter_index_block = Block::new(filter_index_bytes).ok()?;
                let bytewise = crate::key::BytewiseComparator;
                let mut it = filter_index_block.iter(&bytewise);

                let mut key = Vec::with_capacity(6 + internal_policy.name().len());
                key.extend_from_slice(b"filter");
                key.extend_from_slice(internal_policy.name().as_bytes());
                it.seek(&key);
                if !it.valid() || it.key() != key.as_slice() {
                    return None;
                }
                let mut handle_bytes = it.value();
                let handle = BlockHandle::decode_from(&mut handle_bytes).ok()?;
                let filter_bytes = read_block(&data, handle, check_crc).ok()?;
                FilterBlockReader::new(internal_policy, filter_bytes)
            })
        } else {
            None
        };

        Ok(Self { data, file_number, comparator: BlockKeyComparator(comparator), index_block, filter, check_crc, block_cache })
    }

    /// Decodes the data block at `handle`, serving it out of `block_cache`
    /// on a hit rather than re-verifying its checksum and decompressing it.
    fn data_block(&self, handle: BlockHandle) -> Result<Block> {
        let cache_key = (self.file_number, handle.offset);
        if let Some(cache) = &self.block_cache {
            if let Some(cached) = cache.lookup(&cache_key) {
                return Block::new((*cached).clone());
            }
        }

        let contents = read_block(&self.data, handle, self.check_crc)?;
        if let Some(cache) = &self.block_cache {
            cache.insert(cache_key, contents.clone(), contents.len());
        }
        Block::new(contents)
    }

    /// Looks up `internal_key` (a full internal key, including the
    /// sequence/type trailer) and returns the matching entry's internal key
    /// and value, if the index leads to a data block containing an entry
    /// `>= internal_key`.
    ///
    /// The caller (typically [`crate::version`]'s `Version::get`) is
    /// responsible for checking that the returned entry's user key actually
    /// equals the one being searched for; a table only guarantees the
    /// returned entry is the first one at or after the probe.
    pub fn get(&self, internal_key: &[u8]) -> Result<Option<(Vec<u8>, Slice)>> {
        let mut index_iter = self.index_block.iter(&self.comparator);
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            return Ok(None);
        }
        let mut handle_bytes = index_iter.value();
        let handle = BlockHandle::decode_from(&mut handle_bytes)?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, internal_key) {
                return Ok(None);
            }
        }

        let block = self.data_block(handle)?;
        let mut it = block.iter(&self.comparator);
        it.seek(internal_key);
        if !it.valid() {
            return Ok(None);
        }
        Ok(Some((it.key().to_vec(), Slice::from(it.value()))))
    }

    /// Total size in bytes of the file this reader was opened from.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Iterates every entry in the table in internal-key order.
    #[must_use]
    pub fn iter(&self) -> TableIter<'_> {
        let mut index_iter = self.index_block.iter(&self.comparator);
        index_iter.seek_to_first();
        let mut reader = TableIter { table: self, index_iter, data_block: None, data_iter_state: None };
        reader.init_data_block();
        reader
    }

    /// The smallest and largest internal keys stored in the table, read off
    /// the first and last data block without a full scan.
    pub fn bounds(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut it = self.iter();
        let smallest = it.key().ok_or_else(|| crate::error::Error::Corruption("table has no entries".into()))?.to_vec();
        let mut largest = smallest.clone();
        while let Some(key) = it.key() {
            largest = key.to_vec();
            it.advance();
        }
        Ok((smallest, largest))
    }
}

/// A two-level iterator: an index-block iterator selecting the current data
/// block, and a data-block iterator walking its entries.
pub struct TableIter<'a> {
    table: &'a TableReader,
    index_iter: crate::table::block::BlockIter<'a>,
    data_block: Option<Block>,
    data_iter_state: Option<DataIterState>,
}

/// Owned position within `data_block`, since `BlockIter` borrows from it and
/// Rust cannot express a self-referential struct directly; re-derived on
/// each `init_data_block` call instead of stored as a borrow.
struct DataIterState {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl<'a> TableIter<'a> {
    fn init_data_block(&mut self) {
        self.data_block = None;
        self.data_iter_state = None;
        while self.index_iter.valid() {
            let mut handle_bytes = self.index_iter.value();
            let Ok(handle) = BlockHandle::decode_from(&mut handle_bytes) else {
                self.index_iter.next();
                continue;
            };
            let Ok(block) = self.table.data_block(handle) else {
                self.index_iter.next();
                continue;
            };
            self.data_block = Some(block);
            if self.advance_within_current_block(true) {
                return;
            }
            self.index_iter.next();
        }
    }

    /// Positions the data iterator at the first (if `first`) or next entry
    /// of the current block, caching its key/value since the `BlockIter`
    /// itself cannot outlive this call (it borrows `self.data_block`).
    fn advance_within_current_block(&mut self, first: bool) -> bool {
        let Some(block) = &self.data_block else { return false };
        let mut it = block.iter(&self.table.comparator);
        if first {
            it.seek_to_first();
        } else if let Some(state) = &self.data_iter_state {
            it.seek(&state.key);
            if it.valid() && it.key() == state.key.as_slice() {
                it.next();
            }
        }
        if it.valid() {
            self.data_iter_state = Some(DataIterState { key: it.key().to_vec(), value: it.value().to_vec() });
            true
        } else {
            self.data_iter_state = None;
            false
        }
    }

    /// The current entry's internal key, or `None` at the end of the table.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.data_iter_state.as_ref().map(|s| s.key.as_slice())
    }

    /// The current entry's value, or `None` at the end of the table.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.data_iter_state.as_ref().map(|s| s.value.as_slice())
    }

    /// Advances to the next entry.
    pub fn advance(&mut self) {
        if self.data_block.is_some() && self.advance_within_current_block(false) {
            return;
        }
        self.index_iter.next();
        self.init_data_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKey, ValueType};
    use crate::table::bloom::BloomFilterPolicy;
    use crate::table::builder::{TableBuilder, TableBuilderOptions};

    fn build_table(entries: &[(&str, u64, &str)], use_filter: bool) -> (Vec<u8>, InternalKeyComparator) {
        let comparator = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let options = TableBuilderOptions {
            comparator: comparator.clone(),
            filter_policy: use_filter.then(|| Arc::new(BloomFilterPolicy::new(10)) as Arc<dyn FilterPolicy>),
            block_size: 64,
            block_restart_interval: 4,
            compression: crate::table::CompressionType::None,
        };
        let mut buf = Vec::new();
        let mut builder = TableBuilder::new(&mut buf, options);
        for (key, seq, value) in entries {
            let ik = InternalKey::new(key.as_bytes(), *seq, ValueType::Insertion);
            builder.add(ik.as_bytes(), value.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
        (buf, comparator)
    }

    #[test]
    fn get_finds_every_written_entry() {
        let entries: Vec<(&str, u64, &str)> =
            (0..150).map(|i| (Box::leak(format!("key-{i:04}", i = i).into_boxed_str()) as &str, i as u64 + 1, "value")).collect();
        let (buf, comparator) = build_table(&entries, true);
        let reader = TableReader::open(Slice::from(buf), 1, comparator, Some(Arc::new(BloomFilterPolicy::new(10))), true, None).unwrap();

        for (key, seq, value) in &entries {
            let lookup = InternalKey::new(key.as_bytes(), *seq, ValueType::Insertion);
            let (found_key, found_value) = reader.get(lookup.as_bytes()).unwrap().unwrap();
            let found_ik = InternalKey::from_encoded(Slice::from(found_key));
            assert_eq!(found_ik.user_key(), key.as_bytes());
            assert_eq!(&*found_value, value.as_bytes());
        }
    }

    #[test]
    fn get_of_absent_key_after_the_last_entry_finds_nothing() {
        let (buf, comparator) = build_table(&[("a", 1, "1"), ("b", 1, "2")], false);
        let reader = TableReader::open(Slice::from(buf), 1, comparator, None, true, None).unwrap();
        let lookup = InternalKey::new(b"zzz", 1, ValueType::SEEK_TAG);
        assert!(reader.get(lookup.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn iter_walks_every_entry_in_order() {
        let entries: Vec<(&str, u64, &str)> =
            vec![("a", 1, "1"), ("b", 1, "2"), ("c", 1, "3"), ("d", 1, "4")];
        let (buf, comparator) = build_table(&entries, false);
        let reader = TableReader::open(Slice::from(buf), 1, comparator, None, true, None).unwrap();

        let mut it = reader.iter();
        let mut seen = Vec::new();
        while let Some(key) = it.key() {
            let ik = InternalKey::from_encoded(Slice::from(key.to_vec()));
            seen.push(String::from_utf8(ik.user_key().to_vec()).unwrap());
            it.advance();
        }
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn bounds_reports_first_and_last_user_keys() {
        let (buf, comparator) = build_table(&[("a", 1, "1"), ("m", 1, "2"), ("z", 1, "3")], false);
        let reader = TableReader::open(Slice::from(buf), 1, comparator, None, true, None).unwrap();
        let (smallest, largest) = reader.bounds().unwrap();
        assert_eq!(InternalKey::from_encoded(Slice::from(smallest)).user_key(), b"a");
        assert_eq!(InternalKey::from_encoded(Slice::from(largest)).user_key(), b"z");
    }
}
