// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A `Version` is one immutable snapshot of the set of live SSTables,
//! organized into levels. Reads walk a `Version`; compactions pick their
//! inputs from one; [`crate::version::version_set::VersionSet`] owns the
//! chain of versions produced as edits are applied over time.

use crate::cache::table_cache::TableCache;
use crate::key::{Comparator, InternalKey, ValueType};
use crate::slice::Slice;
use crate::version::edit::FileMetaData;
use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};

/// Number of levels in the tree, level 0 (unsorted, freshly flushed files)
/// through level 6.
pub const NUM_LEVELS: usize = 7;
/// Level-0 file count that makes a compaction eligible.
pub const L0_COMPACTION_THRESHOLD: usize = 4;
/// Level-0 file count past which writes stall waiting for compaction.
pub const L0_STOP_WRITE_THRESHOLD: usize = 12;

fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Target total size of `level`, growing ten-fold per level past level 1,
/// matching the sizing ratio LevelDB popularized for this design.
#[must_use]
pub fn level_max_size(level: usize) -> f64 {
    let mut result = 10.0 * 1024.0 * 1024.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

fn find_file(files: &[Arc<FileMetaData>], user_key: &[u8], user_comparator: &dyn Comparator) -> usize {
    let mut lo = 0;
    let mut hi = files.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if user_comparator.compare(user_key, files[mid].largest.user_key()) == Ordering::Greater {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Outcome of probing one file for a lookup key's user key.
pub enum LookupOutcome {
    Found(Slice),
    Deleted,
    NotFound,
}

/// Which file (if any) a `get` had to seek past before finding its answer,
/// fed into [`Version::update_stats`] to drive seek-triggered compaction.
#[derive(Default)]
pub struct GetStats {
    pub seek_file: Option<Arc<FileMetaData>>,
    pub seek_file_level: Option<usize>,
}

/// One immutable snapshot of the live file set, one `Vec` per level.
pub struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,
    compaction_level: Option<usize>,
    compaction_score: f64,
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    #[must_use]
    pub fn new(files: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        debug_assert_eq!(files.len(), NUM_LEVELS);
        let mut version =
            Self { files, compaction_level: None, compaction_score: -1.0, file_to_compact: Mutex::new(None) };
        version.eval_compaction_score();
        version
    }

    fn eval_compaction_score(&mut self) {
        let mut best_level = None;
        let mut best_score = -1.0;
        for level in 0..NUM_LEVELS {
            let score = if level == 0 {
                self.files[level].len() as f64 / L0_COMPACTION_THRESHOLD as f64
            } else {
                total_file_size(&self.files[level]) as f64 / level_max_size(level)
            };
            if score > best_score {
                best_level = Some(level);
                best_score = score;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    #[must_use]
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    #[must_use]
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    #[must_use]
    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    #[must_use]
    pub fn compaction_level(&self) -> Option<usize> {
        self.compaction_level
    }

    /// `true` once this version needs a compaction, whether size- or
    /// seek-triggered.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().expect("not poisoned").is_some()
    }

    /// Looks up `user_key`/`internal_key` across every level, newest data
    /// first, stopping at the first matching entry of either type.
    pub fn get(
        &self,
        table_cache: &TableCache,
        user_comparator: &dyn Comparator,
        user_key: &[u8],
        internal_key: &[u8],
    ) -> crate::error::Result<(LookupOutcome, GetStats)> {
        let mut stats = GetStats::default();
        let mut last_seek: Option<(Arc<FileMetaData>, usize)> = None;

        let mut candidates: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|meta| {
                user_comparator.compare(user_key, meta.largest.user_key()) != Ordering::Greater
                    && user_comparator.compare(user_key, meta.smallest.user_key()) != Ordering::Less
            })
            .collect();
        candidates.sort_by(|a, b| b.number.cmp(&a.number));

        for meta in candidates {
            if let Some((seek_meta, seek_level)) = last_seek.take() {
                stats.seek_file.get_or_insert(seek_meta);
                stats.seek_file_level.get_or_insert(seek_level);
            }
            last_seek = Some((Arc::clone(meta), 0));
            if let Some(outcome) = self.probe(table_cache, meta, internal_key, user_key, user_comparator)? {
                return Ok((outcome, stats));
            }
        }

        for level in 1..NUM_LEVELS {
            if self.files[level].is_empty() {
                continue;
            }
            let idx = find_file(&self.files[level], user_key, user_comparator);
            if idx >= self.files[level].len() {
                continue;
            }
            let meta = &self.files[level][idx];
            if user_comparator.compare(user_key, meta.smallest.user_key()) == Ordering::Less {
                continue;
            }
            if let Some((seek_meta, seek_level)) = last_seek.take() {
                stats.seek_file.get_or_insert(seek_meta);
                stats.seek_file_level.get_or_insert(seek_level);
            }
            last_seek = Some((Arc::clone(meta), level));
            if let Some(outcome) = self.probe(table_cache, meta, internal_key, user_key, user_comparator)? {
                return Ok((outcome, stats));
            }
        }

        Ok((LookupOutcome::NotFound, stats))
    }

    fn probe(
        &self,
        table_cache: &TableCache,
        meta: &Arc<FileMetaData>,
        internal_key: &[u8],
        user_key: &[u8],
        user_comparator: &dyn Comparator,
    ) -> crate::error::Result<Option<LookupOutcome>> {
        let Some((found_key, value)) = table_cache.get_value(meta.number, internal_key)? else {
            return Ok(None);
        };
        let parsed = InternalKey::from_encoded(Slice::from(found_key));
        if user_comparator.compare(parsed.user_key(), user_key) != Ordering::Equal {
            return Ok(None);
        }
        Ok(Some(match parsed.value_type() {
            ValueType::Insertion => LookupOutcome::Found(value),
            ValueType::Deletion => LookupOutcome::Deleted,
        }))
    }

    /// Records that `stats.seek_file` absorbed a seek during a `get`,
    /// scheduling it for standalone compaction once its seek budget runs
    /// out. Returns `true` the moment a file first becomes schedulable,
    /// which is the caller's cue to wake the background compaction thread.
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        let Some(meta) = &stats.seek_file else { return false };
        let remaining = meta.allow_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
        if remaining > 0 {
            return false;
        }
        let mut slot = self.file_to_compact.lock().expect("not poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some((Arc::clone(meta), stats.seek_file_level.expect("seek_file implies a level")));
        true
    }

    #[must_use]
    pub fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().expect("not poisoned").clone()
    }

    /// Every file at `level` whose user-key range intersects
    /// `[smallest, largest]`. For level 0, the search restarts whenever an
    /// overlapping file widens the range, since level-0 files are not
    /// themselves non-overlapping.
    #[must_use]
    pub fn get_overlapping_files(
        &self,
        level: usize,
        smallest: &InternalKey,
        largest: &InternalKey,
        user_comparator: &dyn Comparator,
    ) -> Vec<Arc<FileMetaData>> {
        let mut result = Vec::new();
        let mut user_smallest = smallest.user_key().to_vec();
        let mut user_largest = largest.user_key().to_vec();
        let mut i = 0;
        while i < self.files[level].len() {
            let meta = &self.files[level][i];
            i += 1;
            let file_smallest = meta.smallest.user_key();
            let file_largest = meta.largest.user_key();
            if user_comparator.compare(file_smallest, &user_largest) == Ordering::Greater {
                continue;
            }
            if user_comparator.compare(file_largest, &user_smallest) == Ordering::Less {
                continue;
            }
            result.push(Arc::clone(meta));
            if level == 0 {
                if user_comparator.compare(file_smallest, &user_smallest) == Ordering::Less {
                    i = 0;
                    result.clear();
                    user_smallest = file_smallest.to_vec();
                } else if user_comparator.compare(file_largest, &user_largest) == Ordering::Greater {
                    i = 0;
                    result.clear();
                    user_largest = file_largest.to_vec();
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn meta(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            4096,
            InternalKey::new(smallest.as_bytes(), 1, ValueType::Insertion),
            InternalKey::new(largest.as_bytes(), 1, ValueType::Insertion),
        ))
    }

    fn empty_levels() -> Vec<Vec<Arc<FileMetaData>>> {
        vec![Vec::new(); NUM_LEVELS]
    }

    #[test]
    fn l0_score_scales_with_file_count() {
        let mut files = empty_levels();
        files[0] = vec![meta(1, "a", "b"), meta(2, "c", "d")];
        let version = Version::new(files);
        assert!((version.compaction_score() - 0.5).abs() < 1e-9);
        assert_eq!(version.compaction_level(), Some(0));
    }

    #[test]
    fn overlapping_files_restarts_on_level_zero_widening() {
        let mut files = empty_levels();
        files[0] = vec![meta(1, "d", "e"), meta(2, "a", "f")];
        let version = Version::new(files);
        let cmp = BytewiseComparator;
        let result = version.get_overlapping_files(
            0,
            &InternalKey::new(b"d", 1, ValueType::Insertion),
            &InternalKey::new(b"e", 1, ValueType::Insertion),
            &cmp,
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn find_file_locates_first_candidate_by_largest_key() {
        let files = vec![meta(1, "a", "c"), meta(2, "d", "f"), meta(3, "g", "i")];
        let cmp = BytewiseComparator;
        assert_eq!(find_file(&files, b"e", &cmp), 1);
        assert_eq!(find_file(&files, b"z", &cmp), 3);
    }

    #[test]
    fn needs_compaction_is_false_for_an_empty_version() {
        let version = Version::new(empty_levels());
        assert!(!version.needs_compaction());
    }
}
