// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Error kinds raised by the engine.
//!
//! `NotFound` is deliberately absent here: a missing key is a routine result,
//! not a failure, so lookups return `Result<Option<_>>` instead of failing
//! with an error variant.

/// Errors that can occur while operating the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred against the database directory or one of its files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data failed a structural or checksum check.
    ///
    /// Raised by a bad WAL fragment CRC, a bad SSTable block CRC or footer
    /// magic, a malformed internal key encountered during compaction, a
    /// malformed manifest record, or a comparator-name mismatch on recovery.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The configured [`crate::Comparator`] does not match the comparator
    /// name recorded in an existing manifest.
    #[error("comparator mismatch: database was created with `{existing}`, got `{requested}`")]
    ComparatorMismatch {
        /// Comparator name stored in the manifest.
        existing: String,
        /// Comparator name the caller opened with.
        requested: String,
    },

    /// A write or background operation was attempted after the database
    /// recorded a fatal background error or after `Db` was dropped.
    #[error("database is closed or has a fatal background error: {0}")]
    DbClosed(String),

    /// Failed to serialize an on-disk structure.
    #[error("encode error: {0}")]
    Encode(String),

    /// Failed to deserialize an on-disk structure.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
