// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Configuration surface: [`Options`] for opening a database, plus the
//! per-call [`WriteOptions`] and [`ReadOptions`].

use crate::key::{BytewiseComparator, Comparator};
use crate::table::bloom::{BloomFilterPolicy, FilterPolicy};
use crate::table::CompressionType;
use std::sync::Arc;

/// Database-wide configuration, set once at [`crate::Db::open`].
#[derive(Clone)]
pub struct Options {
    /// Orders user keys. Must match the comparator a database was created
    /// with; `Db::open` rejects a mismatch.
    pub comparator: Arc<dyn Comparator>,
    /// Bloom filter (or other) policy used by new SSTables. `None` disables
    /// filters.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    /// Block compression for new SSTables.
    pub compression: CompressionType,
    /// Number of entries between restart points in a data block.
    pub block_restart_interval: usize,
    /// Target uncompressed size of a data block before it is flushed.
    pub block_size: usize,
    /// Memtable size (in approximate bytes) that triggers a flush.
    pub write_mem_size: u64,
    /// Target size of a compaction output SSTable.
    pub max_file_size: u64,
    /// Soft cap on the number of open SSTable file handles cached by the
    /// table cache.
    pub max_open_files: usize,
    /// Size, in bytes, of the shared block cache.
    pub block_cache_size: usize,
    /// Verify block/WAL/SSTable checksums by default.
    pub check_crc: bool,
    /// Create the database directory if it does not already exist.
    pub create_if_missing: bool,
    /// Fail `open` if the database directory already exists.
    pub error_if_exists: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
            compression: CompressionType::Snappy,
            block_restart_interval: 16,
            block_size: 4 * 1024,
            write_mem_size: 4 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_size: 8 * 1024 * 1024,
            check_crc: false,
            create_if_missing: true,
            error_if_exists: false,
        }
    }
}

impl Options {
    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    #[must_use]
    pub fn with_filter_policy(mut self, filter_policy: Option<Arc<dyn FilterPolicy>>) -> Self {
        self.filter_policy = filter_policy;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_write_mem_size(mut self, bytes: u64) -> Self {
        self.write_mem_size = bytes;
        self
    }

    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }
}

/// Per-call options for [`crate::Db::put`], [`crate::Db::delete`] and
/// [`crate::Db::write`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// `fsync` the WAL before returning.
    pub sync: bool,
}

/// Per-call options for [`crate::Db::get`].
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify block checksums while servicing this read.
    pub check_crc: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { check_crc: false }
    }
}
