// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Picks and runs compactions: merging a level's files with the files they
//! overlap in the next level, dropping shadowed and obsolete entries, and
//! writing the result out as new SSTables.

use crate::db::filename;
use crate::db::options::Options;
use crate::error::Result;
use crate::key::{Comparator, InternalKey, InternalKeyComparator, ValueType};
use crate::table::builder::{TableBuilder, TableBuilderOptions};
use crate::version::edit::{FileMetaData, VersionEdit};
use crate::version::version::{Version, NUM_LEVELS};
use crate::version::version_set::VersionSet;
use std::cmp::Ordering;
use std::sync::Arc;

/// A compaction may grow its first input up to 25x the target output file
/// size before giving up and keeping the narrower selection.
fn expand_compaction_limit(max_file_size: u64) -> u64 {
    25 * max_file_size
}

/// Past this much overlap with the level two steps down, a compaction
/// output file is cut short rather than grown further, bounding how much
/// rework a single future compaction of that file can cause.
fn grandparent_overlap_limit(max_file_size: u64) -> u64 {
    10 * max_file_size
}

fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

fn get_range(files: &[Arc<FileMetaData>], icmp: &InternalKeyComparator) -> (InternalKey, InternalKey) {
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for meta in &files[1..] {
        if icmp.compare(meta.smallest.as_bytes(), smallest.as_bytes()) == Ordering::Less {
            smallest = meta.smallest.clone();
        }
        if icmp.compare(meta.largest.as_bytes(), largest.as_bytes()) == Ordering::Greater {
            largest = meta.largest.clone();
        }
    }
    (smallest, largest)
}

fn get_combined_range(
    a: &[Arc<FileMetaData>],
    b: &[Arc<FileMetaData>],
    icmp: &InternalKeyComparator,
) -> (InternalKey, InternalKey) {
    let mut all = a.to_vec();
    all.extend(b.iter().cloned());
    get_range(&all, icmp)
}

/// The boundary file at `level_files` whose `smallest` key shares a user key
/// with `largest_key` but sorts just after it, if any — expanding a
/// selection to include it keeps every entry for that user key in the same
/// compaction.
fn find_smallest_boundary(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = icmp.user_comparator().as_ref();
    let mut smallest_boundary: Option<&Arc<FileMetaData>> = None;
    for meta in level_files {
        if icmp.compare(largest_key.as_bytes(), meta.smallest.as_bytes()) == Ordering::Less
            && ucmp.compare(largest_key.user_key(), meta.smallest.user_key()) == Ordering::Equal
            && smallest_boundary
                .map_or(true, |sb| icmp.compare(meta.smallest.as_bytes(), sb.smallest.as_bytes()) == Ordering::Less)
        {
            smallest_boundary = Some(meta);
        }
    }
    smallest_boundary.cloned()
}

fn add_boundary_inputs(icmp: &InternalKeyComparator, level_files: &[Arc<FileMetaData>], inputs: &mut Vec<Arc<FileMetaData>>) {
    let Some(mut largest_key) = inputs.iter().map(|f| f.largest.clone()).max_by(|a, b| icmp.compare(a.as_bytes(), b.as_bytes())) else {
        return;
    };
    loop {
        match find_smallest_boundary(icmp, level_files, &largest_key) {
            Some(meta) => {
                largest_key = meta.largest.clone();
                inputs.push(meta);
            }
            None => break,
        }
    }
}

/// One compaction: a set of input files at `level` and `level + 1` to merge
/// into new `level + 1` files, plus bookkeeping to bound how much that
/// output later overlaps with `level + 2`.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    inputs: [Vec<Arc<FileMetaData>>; 2],
    grandparents: Vec<Arc<FileMetaData>>,
    input_version: Arc<Version>,
    compaction_pointer: InternalKey,
    grandparents_index: usize,
    grandparents_overlap: u64,
    seen_key: bool,
}

impl Compaction {
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    /// `true` when this compaction is a pure metadata move: a single file at
    /// `level` that doesn't overlap anything at `level + 1` and won't create
    /// too much future overlap with `level + 2`, so it can just be
    /// relabeled one level down instead of rewritten.
    #[must_use]
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) < grandparent_overlap_limit(self.max_output_file_size)
    }

    /// Records the edit's deletions for every input file.
    pub fn add_input_deletions(&self, edit: &mut VersionEdit) {
        for (which, files) in self.inputs.iter().enumerate() {
            for meta in files {
                edit.delete_file(self.level + which, meta.number);
            }
        }
    }

    /// `true` if no file at `level + 2` or deeper could contain `user_key`,
    /// meaning a deletion tombstone for it is safe to drop entirely rather
    /// than carried forward into the output.
    #[must_use]
    pub fn is_base_level_for_key(&self, user_key: &[u8], user_comparator: &dyn Comparator) -> bool {
        for level in (self.level + 2)..NUM_LEVELS {
            for meta in self.input_version.files(level) {
                if user_comparator.compare(user_key, meta.smallest.user_key()) != Ordering::Less
                    && user_comparator.compare(user_key, meta.largest.user_key()) != Ordering::Greater
                {
                    return false;
                }
            }
        }
        true
    }

    /// `true` once accumulated overlap with `grandparents` (the level two
    /// steps down) has grown past the limit since the last call returned
    /// `true`, signaling the output loop to start a new file.
    pub fn should_stop_before(&mut self, internal_key: &[u8], icmp: &InternalKeyComparator) -> bool {
        while self.grandparents_index < self.grandparents.len()
            && icmp.compare(internal_key, self.grandparents[self.grandparents_index].largest.as_bytes()) == Ordering::Greater
        {
            if self.seen_key {
                self.grandparents_overlap += self.grandparents[self.grandparents_index].file_size;
            }
            self.grandparents_index += 1;
        }
        self.seen_key = true;
        if self.grandparents_overlap > grandparent_overlap_limit(self.max_output_file_size) {
            self.grandparents_overlap = 0;
            return true;
        }
        false
    }
}

/// Chooses the next compaction to run, if any: a size-triggered compaction
/// of the highest-scoring level takes priority, falling back to a
/// seek-triggered compaction of whatever single file has exhausted its seek
/// budget.
#[must_use]
pub fn pick_compaction(vset: &VersionSet) -> Option<Compaction> {
    let current = vset.current();
    let icmp = vset.comparator();
    let ucmp = icmp.user_comparator().as_ref();
    let max_output_file_size = vset.max_file_size();

    let (level, input0) = if current.compaction_score() >= 1.0 {
        let level = current.compaction_level()?;
        let pointer = vset.compaction_pointer(level);
        let mut chosen = None;
        if let Some(pointer) = &pointer {
            for meta in current.files(level) {
                if icmp.compare(meta.largest.as_bytes(), pointer.as_bytes()) == Ordering::Greater {
                    chosen = Some(Arc::clone(meta));
                    break;
                }
            }
        }
        let chosen = chosen.or_else(|| current.files(level).first().cloned())?;
        (level, vec![chosen])
    } else if let Some((meta, level)) = current.file_to_compact() {
        (level, vec![meta])
    } else {
        return None;
    };

    let mut compaction = Compaction {
        level,
        max_output_file_size,
        inputs: [input0, Vec::new()],
        grandparents: Vec::new(),
        input_version: Arc::clone(&current),
        compaction_pointer: InternalKey::default(),
        grandparents_index: 0,
        grandparents_overlap: 0,
        seen_key: false,
    };

    if level == 0 {
        let (smallest, largest) = get_range(&compaction.inputs[0], icmp);
        compaction.inputs[0] = current.get_overlapping_files(0, &smallest, &largest, ucmp);
        debug_assert!(!compaction.inputs[0].is_empty());
    }

    add_boundary_inputs(icmp, current.files(level), &mut compaction.inputs[0]);
    let (smallest, largest) = get_range(&compaction.inputs[0], icmp);
    compaction.inputs[1] = current.get_overlapping_files(level + 1, &smallest, &largest, ucmp);
    add_boundary_inputs(icmp, current.files(level + 1), &mut compaction.inputs[1]);

    let (mut all_smallest, mut all_largest) = get_combined_range(&compaction.inputs[0], &compaction.inputs[1], icmp);

    if !compaction.inputs[1].is_empty() {
        let mut expand0 = current.get_overlapping_files(level, &all_smallest, &all_largest, ucmp);
        add_boundary_inputs(icmp, current.files(level), &mut expand0);
        let expand0_size = total_file_size(&expand0);
        if expand0_size > total_file_size(&compaction.inputs[0]) && expand0_size < expand_compaction_limit(max_output_file_size) {
            let (new_smallest, new_largest) = get_range(&expand0, icmp);
            let mut expand1 = current.get_overlapping_files(level + 1, &new_smallest, &new_largest, ucmp);
            add_boundary_inputs(icmp, current.files(level + 1), &mut expand1);
            if expand1.len() == compaction.inputs[1].len() {
                all_smallest = new_smallest;
                all_largest = new_largest;
                compaction.inputs[0] = expand0;
                compaction.inputs[1] = expand1;
            }
        }
    }

    if level + 2 < NUM_LEVELS {
        compaction.grandparents = current.get_overlapping_files(level + 2, &all_smallest, &all_largest, ucmp);
    }

    compaction.compaction_pointer = all_largest;
    Some(compaction)
}

struct Cursor<'a> {
    iter: crate::table::reader::TableIter<'a>,
}

/// Picks the smallest current key across every cursor, under `icmp`.
fn select_min(cursors: &[Cursor<'_>], icmp: &InternalKeyComparator) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, cursor) in cursors.iter().enumerate() {
        let Some(key) = cursor.iter.key() else { continue };
        let better = match best {
            None => true,
            Some(j) => icmp.compare(key, cursors[j].iter.key().expect("has a key")) == Ordering::Less,
        };
        if better {
            best = Some(i);
        }
    }
    best
}

fn open_output(vset: &VersionSet, options: &Options, icmp: &InternalKeyComparator) -> Result<(u64, TableBuilder<std::fs::File>)> {
    let number = vset.new_file_number();
    let path = filename::table_file_name(vset.dbname(), number);
    let file = crate::env::create_file(&path)?;
    let table_options = TableBuilderOptions {
        comparator: icmp.clone(),
        filter_policy: options.filter_policy.clone(),
        block_size: options.block_size,
        block_restart_interval: options.block_restart_interval,
        compression: options.compression,
    };
    Ok((number, TableBuilder::new(file, table_options)))
}

/// Merges `compaction`'s input files into new `level + 1` files and returns
/// the edit recording the deletions and additions. A [`Compaction::is_trivial_move`]
/// is handled as a metadata-only file relabel, without reading or writing
/// any table data.
pub fn run_compaction(vset: &VersionSet, mut compaction: Compaction, options: &Options) -> Result<VersionEdit> {
    let mut edit = VersionEdit::new();
    edit.set_compaction_pointer(compaction.level, compaction.compaction_pointer.clone());

    if compaction.is_trivial_move() {
        let meta = &compaction.inputs[0][0];
        log::debug!("moving file {} from level {} to level {} without rewriting it", meta.number, compaction.level, compaction.level + 1);
        edit.delete_file(compaction.level, meta.number);
        edit.add_file(compaction.level + 1, meta.number, meta.file_size, meta.smallest.clone(), meta.largest.clone());
        return Ok(edit);
    }

    compaction.add_input_deletions(&mut edit);

    let icmp = vset.comparator().clone();
    let ucmp = Arc::clone(icmp.user_comparator());

    let mut handles = Vec::new();
    for which in 0..2 {
        for meta in &compaction.inputs[which] {
            handles.push(vset.table_cache().get(meta.number)?);
        }
    }
    let mut cursors: Vec<Cursor<'_>> = handles.iter().map(|h| Cursor { iter: h.iter() }).collect();

    let mut builder: Option<TableBuilder<std::fs::File>> = None;
    let mut current_file_number = 0u64;
    let mut current_smallest: Option<InternalKey> = None;
    let mut current_largest: Option<InternalKey> = None;
    let mut last_user_key: Option<Vec<u8>> = None;

    while let Some(i) = select_min(&cursors, &icmp) {
        let key = cursors[i].iter.key().expect("selected").to_vec();
        let value = cursors[i].iter.value().expect("selected").to_vec();
        cursors[i].iter.advance();

        let parsed = InternalKey::from_encoded(crate::slice::Slice::from(key.clone()));
        let user_key = parsed.user_key().to_vec();

        let drop_entry = if last_user_key.as_deref() == Some(user_key.as_slice()) {
            true
        } else {
            last_user_key = Some(user_key.clone());
            parsed.value_type() == ValueType::Deletion && compaction.is_base_level_for_key(&user_key, ucmp.as_ref())
        };

        let stop = compaction.should_stop_before(&key, &icmp);

        if drop_entry {
            continue;
        }

        if builder.is_none() || stop {
            if let Some(b) = builder.take() {
                finish_output_file(&mut edit, compaction.level, current_file_number, b, current_smallest.take(), current_largest.take())?;
            }
            let (number, new_builder) = open_output(vset, options, &icmp)?;
            current_file_number = number;
            current_smallest = Some(parsed.clone());
            builder = Some(new_builder);
        }

        current_largest = Some(parsed.clone());
        builder.as_mut().expect("just opened").add(&key, &value)?;

        if builder.as_ref().expect("just opened").file_size() >= options.max_file_size {
            let b = builder.take().unwrap();
            finish_output_file(&mut edit, compaction.level, current_file_number, b, current_smallest.take(), current_largest.take())?;
        }
    }

    if let Some(b) = builder.take() {
        finish_output_file(&mut edit, compaction.level, current_file_number, b, current_smallest.take(), current_largest.take())?;
    }

    Ok(edit)
}

fn finish_output_file(
    edit: &mut VersionEdit,
    level: usize,
    file_number: u64,
    builder: TableBuilder<std::fs::File>,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
) -> Result<()> {
    let file_size = builder.finish()?;
    if let (Some(smallest), Some(largest)) = (smallest, largest) {
        log::debug!("compaction produced level {} file {file_number} ({file_size} bytes)", level + 1);
        edit.add_file(level + 1, file_number, file_size, smallest, largest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::table_cache::TableCache;
    use crate::key::{BytewiseComparator, ValueType};
    use crate::table::bloom::BloomFilterPolicy;

    fn new_vset(dbname: std::path::PathBuf) -> VersionSet {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            icmp.clone(),
            Some(Arc::new(BloomFilterPolicy::new(10))),
            true,
            100,
            1024 * 1024,
        ));
        VersionSet::new(dbname, icmp, table_cache, 2 * 1024 * 1024)
    }

    fn write_table(vset: &VersionSet, options: &Options, entries: &[(&str, u64, ValueType, &str)]) -> u64 {
        let number = vset.new_file_number();
        let path = filename::table_file_name(vset.dbname(), number);
        let file = crate::env::create_file(&path).unwrap();
        let table_options = TableBuilderOptions {
            comparator: vset.comparator().clone(),
            filter_policy: options.filter_policy.clone(),
            block_size: options.block_size,
            block_restart_interval: options.block_restart_interval,
            compression: options.compression,
        };
        let mut builder = TableBuilder::new(file, table_options);
        for (key, seq, value_type, value) in entries {
            let ik = InternalKey::new(key.as_bytes(), *seq, *value_type);
            builder.add(ik.as_bytes(), value.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
        number
    }

    #[test]
    fn no_compaction_needed_on_an_empty_version() {
        let dir = tempfile::tempdir().unwrap();
        let vset = new_vset(dir.path().to_path_buf());
        assert!(pick_compaction(&vset).is_none());
    }

    #[test]
    fn a_lone_level_zero_file_is_picked_once_the_threshold_is_crossed() {
        let dir = tempfile::tempdir().unwrap();
        let vset = new_vset(dir.path().to_path_buf());
        let options = Options::default();

        let mut numbers = Vec::new();
        for i in 0..4u64 {
            let number = write_table(&vset, &options, &[("a", i + 1, ValueType::Insertion, "v")]);
            numbers.push(number);
            let mut edit = VersionEdit::new();
            edit.add_file(
                0,
                number,
                4096,
                InternalKey::new(b"a", i + 1, ValueType::Insertion),
                InternalKey::new(b"a", i + 1, ValueType::Insertion),
            );
            vset.log_and_apply(edit).unwrap();
        }

        let compaction = pick_compaction(&vset).expect("level 0 crossed its compaction threshold");
        assert_eq!(compaction.level(), 0);
        assert_eq!(compaction.inputs(0).len(), 4);
    }

    #[test]
    fn merging_compaction_drops_shadowed_entries_and_resolved_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let vset = new_vset(dir.path().to_path_buf());
        let options = Options::default();

        let old = write_table(&vset, &options, &[("a", 1, ValueType::Insertion, "old"), ("b", 1, ValueType::Insertion, "keep")]);
        let mut edit = VersionEdit::new();
        edit.add_file(1, old, 4096, InternalKey::new(b"a", 1, ValueType::Insertion), InternalKey::new(b"b", 1, ValueType::Insertion));
        vset.log_and_apply(edit).unwrap();

        let new_file = write_table(&vset, &options, &[("a", 2, ValueType::Deletion, "")]);
        let mut edit = VersionEdit::new();
        edit.add_file(0, new_file, 4096, InternalKey::new(b"a", 2, ValueType::Deletion), InternalKey::new(b"a", 2, ValueType::Deletion));
        vset.log_and_apply(edit).unwrap();

        let compaction = Compaction {
            level: 0,
            max_output_file_size: vset.max_file_size(),
            inputs: [vec![Arc::new(FileMetaData::new(
                new_file,
                4096,
                InternalKey::new(b"a", 2, ValueType::Deletion),
                InternalKey::new(b"a", 2, ValueType::Deletion),
            ))], vec![Arc::new(FileMetaData::new(
                old,
                4096,
                InternalKey::new(b"a", 1, ValueType::Insertion),
                InternalKey::new(b"b", 1, ValueType::Insertion),
            ))]],
            grandparents: Vec::new(),
            input_version: vset.current(),
            compaction_pointer: InternalKey::new(b"a", 2, ValueType::Deletion),
            grandparents_index: 0,
            grandparents_overlap: 0,
            seen_key: false,
        };

        let edit = run_compaction(&vset, compaction, &options).unwrap();
        assert_eq!(edit.deleted_files.len(), 2);
        assert_eq!(edit.new_files.len(), 1);
        let (level, output) = &edit.new_files[0];
        assert_eq!(*level, 1);
        assert_eq!(output.smallest.user_key(), b"b");
    }
}
