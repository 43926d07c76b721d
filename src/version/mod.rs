// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The manifest: the durable record of which SSTables make up the
//! database, organized into the [`version::Version`] snapshot chain that
//! [`version_set::VersionSet`] maintains.

pub mod edit;
pub mod version;
pub mod version_set;

pub use edit::{FileMetaData, NewFile, VersionEdit};
pub use version::{GetStats, LookupOutcome, Version, L0_COMPACTION_THRESHOLD, L0_STOP_WRITE_THRESHOLD, NUM_LEVELS};
pub use version_set::VersionSet;
