// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Caches shared across the database: a generic sharded LRU cache, a table
//! cache built on top of it that keeps the hottest SSTables open, and a
//! block cache (the same `LruCache` machinery) that keeps their hottest
//! decoded data blocks around so a repeat read doesn't pay for
//! decompression twice.

pub mod lru;
pub mod table_cache;

/// Decoded, decompressed data blocks keyed by `(file_number, block_offset)`,
/// shared by every [`table_cache::TableCache`]'s readers.
pub type BlockCache = lru::LruCache<(u64, u64), crate::slice::Slice>;
