// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Keeps the hottest SSTables' readers open, so a read path does not pay
//! the cost of re-parsing a footer and index block on every lookup.

use crate::cache::lru::{CacheHandle, LruCache};
use crate::cache::BlockCache;
use crate::db::filename::table_file_name;
use crate::error::Result;
use crate::key::InternalKeyComparator;
use crate::table::bloom::FilterPolicy;
use crate::table::reader::TableReader;
use std::path::PathBuf;
use std::sync::Arc;

/// Opens and caches [`TableReader`]s by file number, keyed the way
/// `fjall-rs-lsm-tree`'s descriptor table keys open file handles. Every
/// reader it opens shares this cache's `block_cache`, so an index/footer
/// reparse is the only cost an evicted-then-reopened table ever pays again
/// for blocks another reader already decoded.
pub struct TableCache {
    dbname: PathBuf,
    comparator: InternalKeyComparator,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    check_crc: bool,
    cache: LruCache<u64, TableReader>,
    block_cache: BlockCache,
}

impl TableCache {
    #[must_use]
    pub fn new(
        dbname: PathBuf,
        comparator: InternalKeyComparator,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        check_crc: bool,
        max_open_files: usize,
        block_cache_size: usize,
    ) -> Self {
        Self {
            dbname,
            comparator,
            filter_policy,
            check_crc,
            cache: LruCache::new(max_open_files.max(1)),
            block_cache: BlockCache::new(block_cache_size.max(1)),
        }
    }

    /// Returns an open reader for table `file_number`, opening and parsing
    /// the file on a cache miss.
    pub fn get(&self, file_number: u64) -> Result<CacheHandle<u64, TableReader>> {
        if let Some(handle) = self.cache.lookup(&file_number) {
            return Ok(handle);
        }

        let path = table_file_name(&self.dbname, file_number);
        let bytes = crate::env::read_file_to_vec(&path)?;
        let reader = TableReader::open(
            crate::slice::Slice::from(bytes),
            file_number,
            self.comparator.clone(),
            self.filter_policy.clone(),
            self.check_crc,
            Some(self.block_cache.clone()),
        )?;
        Ok(self.cache.insert(file_number, reader, 1))
    }

    /// Looks up `internal_key` in table `file_number`.
    pub fn get_value(&self, file_number: u64, internal_key: &[u8]) -> Result<Option<(Vec<u8>, crate::slice::Slice)>> {
        self.get(file_number)?.get(internal_key)
    }

    /// Drops `file_number` from the cache, e.g. after a compaction deletes
    /// its underlying file. Any reader currently in use by another thread
    /// stays valid until its handle is dropped.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKey, ValueType};
    use crate::table::bloom::BloomFilterPolicy;
    use crate::table::builder::{TableBuilder, TableBuilderOptions};

    fn write_table(path: &std::path::Path) {
        let comparator = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let options = TableBuilderOptions {
            comparator,
            filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
            block_size: 4096,
            block_restart_interval: 16,
            compression: crate::table::CompressionType::None,
        };
        let mut buf = Vec::new();
        let mut builder = TableBuilder::new(&mut buf, options);
        let ik = InternalKey::new(b"hello", 1, ValueType::Insertion);
        builder.add(ik.as_bytes(), b"world").unwrap();
        builder.finish().unwrap();
        crate::env::write_file(path, &buf).unwrap();
    }

    #[test]
    fn get_opens_on_miss_and_reuses_on_hit() {
        let dir = tempfile::tempdir().unwrap();
        write_table(&table_file_name(dir.path(), 1));

        let cache = TableCache::new(
            dir.path().to_path_buf(),
            InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            Some(Arc::new(BloomFilterPolicy::new(10))),
            true,
            10,
            1024,
        );

        let lookup = InternalKey::new(b"hello", 1, ValueType::Insertion);
        let (_, value) = cache.get_value(1, lookup.as_bytes()).unwrap().unwrap();
        assert_eq!(&*value, b"world");

        // Second lookup should hit the cache rather than re-reading the file.
        let (_, value) = cache.get_value(1, lookup.as_bytes()).unwrap().unwrap();
        assert_eq!(&*value, b"world");
    }

    #[test]
    fn evict_forces_a_fresh_open() {
        let dir = tempfile::tempdir().unwrap();
        write_table(&table_file_name(dir.path(), 7));
        let cache = TableCache::new(
            dir.path().to_path_buf(),
            InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            None,
            false,
            10,
            1024,
        );
        let _ = cache.get(7).unwrap();
        cache.evict(7);
        assert!(cache.get(7).is_ok());
    }
}
