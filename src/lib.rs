// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `lsmkv` is an embeddable, ordered key-value storage engine built on a
//! log-structured merge tree.
//!
//! Keys and values are opaque byte strings. Writes go through a write-ahead
//! log before landing in an in-memory memtable; once a memtable grows past
//! [`Options::write_mem_size`] it is rotated and flushed to an immutable,
//! sorted on-disk file (an "SSTable"). A background thread periodically
//! compacts SSTables to bound read amplification and reclaim space used by
//! deleted or overwritten keys.
//!
//! ```
//! use lsmkv::{Db, Options, WriteOptions, ReadOptions};
//!
//! # let dir = tempfile::tempdir()?;
//! let db = Db::open(Options::default(), dir.path())?;
//!
//! db.put(&WriteOptions::default(), b"my_key", b"my_value")?;
//! assert_eq!(
//!     db.get(&ReadOptions::default(), b"my_key")?.as_deref(),
//!     Some(&b"my_value"[..]),
//! );
//!
//! db.delete(&WriteOptions::default(), b"my_key")?;
//! assert_eq!(db.get(&ReadOptions::default(), b"my_key")?, None);
//! # Ok::<(), lsmkv::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod cache;
pub mod checksum;
pub mod coding;
pub mod compaction;
mod db;
mod env;
pub mod error;
pub mod key;
pub mod memtable;
mod slice;
pub mod table;
mod version;
pub mod wal;
pub mod write_batch;

pub use db::options::{Options, ReadOptions, WriteOptions};
pub use db::{destroy_db, Db};
pub use error::{Error, Result};
pub use key::{Comparator, InternalKey, ValueType};
pub use slice::Slice;
pub use table::bloom::BloomFilterPolicy;
pub use write_batch::WriteBatch;
