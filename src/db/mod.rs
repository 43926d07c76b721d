// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The embeddable database: write-ahead log, memtable rotation, background
//! compaction, and the public `get`/`put`/`delete`/`write` API.

pub mod filename;
pub mod options;

use crate::cache::table_cache::TableCache;
use crate::compaction;
use crate::db::filename::FileType;
use crate::env;
use crate::error::{Error, Result};
use crate::key::{InternalKey, InternalKeyComparator, LookupKey};
use crate::memtable::{LookupResult, MemTable};
use crate::table::builder::{TableBuilder, TableBuilderOptions};
use crate::version::{LookupOutcome, VersionEdit, VersionSet, L0_STOP_WRITE_THRESHOLD};
use crate::wal;
use crate::write_batch::WriteBatch;
use options::{Options, ReadOptions, WriteOptions};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// State mutated while holding [`Inner::state`]'s lock: the live memtable,
/// an immutable one awaiting flush, and the write-ahead log backing the
/// live memtable.
struct State {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    wal: wal::Writer,
    wal_number: u64,
    background_error: Option<String>,
    compaction_scheduled: bool,
}

/// The shared core of an open database. `Db` is a thin, cloneable handle
/// around one of these, the way `fjall-rs-lsm-tree`'s `Tree` wraps its
/// `TreeInner`.
struct Inner {
    options: Options,
    icmp: InternalKeyComparator,
    versions: Arc<VersionSet>,
    table_cache: Arc<TableCache>,
    _lock: env::FileLock,
    state: Mutex<State>,
    background_cv: Condvar,
}

/// An open, embeddable key-value database backed by a log-structured merge
/// tree. Cheaply cloneable; every clone shares the same memtable, log, and
/// background compaction work.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

impl Db {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the directory is locked by another `Db`, if
    /// `options.comparator` does not match the one the database was created
    /// with, if the database is missing and `options.create_if_missing` is
    /// `false`, or if it exists and `options.error_if_exists` is `true`.
    pub fn open(options: Options, path: &Path) -> Result<Self> {
        let dbname = path.to_path_buf();
        if !env::file_exists(&dbname) {
            if !options.create_if_missing {
                return Err(Error::DbClosed(format!("database directory {} does not exist", dbname.display())));
            }
            env::create_dir_if_missing(&dbname)?;
        }

        let lock = env::FileLock::acquire(&filename::lock_file_name(&dbname))?;

        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            icmp.clone(),
            options.filter_policy.clone(),
            options.check_crc,
            options.max_open_files,
            options.block_cache_size,
        ));
        let versions = Arc::new(VersionSet::new(dbname.clone(), icmp.clone(), Arc::clone(&table_cache), options.max_file_size));

        let existed = versions.recover()?;
        if existed && options.error_if_exists {
            return Err(Error::DbClosed(format!("database already exists at {}", dbname.display())));
        }
        if !existed {
            if !options.create_if_missing {
                return Err(Error::DbClosed(format!(
                    "database does not exist at {} and create_if_missing is false",
                    dbname.display()
                )));
            }
            log::info!("creating new database at {}", dbname.display());
            let mut edit = VersionEdit::new();
            edit.set_comparator_name(icmp.user_comparator().name());
            edit.set_log_number(0);
            edit.set_next_file_number(2);
            edit.set_last_sequence(0);
            versions.log_and_apply(edit)?;
        }

        let (recovered_mem, max_sequence) = recover_log(&versions, &icmp)?;
        if max_sequence > versions.last_sequence() {
            versions.set_last_sequence(max_sequence);
        }

        let new_log_number = versions.new_file_number();
        let log_file = env::create_file(&filename::log_file_name(versions.dbname(), new_log_number))?;
        let wal_writer = wal::Writer::new(log_file);

        let mut edit = VersionEdit::new();
        if !recovered_mem.is_empty() {
            log::info!("flushing {} entries recovered from the write-ahead log to level 0", recovered_mem.len());
            write_level0_table(&versions, &options, &icmp, &recovered_mem, &mut edit)?;
        }
        edit.set_log_number(new_log_number);
        versions.log_and_apply(edit)?;

        let state = State {
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            wal: wal_writer,
            wal_number: new_log_number,
            background_error: None,
            compaction_scheduled: false,
        };

        let inner = Arc::new(Inner {
            options,
            icmp,
            versions,
            table_cache,
            _lock: lock,
            state: Mutex::new(state),
            background_cv: Condvar::new(),
        });

        inner.delete_obsolete_files();
        inner.maybe_schedule_compaction();

        Ok(Self { inner })
    }

    /// Looks up `key`, returning its value if present.
    ///
    /// # Errors
    /// Returns an error on I/O failure or on-disk corruption.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Inserts or overwrites `key` with `value`.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the database has recorded a
    /// fatal background error.
    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.inner.write(options, &mut batch)
    }

    /// Removes `key`, if present.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the database has recorded a
    /// fatal background error.
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.inner.write(options, &mut batch)
    }

    /// Applies every operation in `batch` atomically.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the database has recorded a
    /// fatal background error.
    pub fn write(&self, options: &WriteOptions, mut batch: WriteBatch) -> Result<()> {
        self.inner.write(options, &mut batch)
    }

    /// Number of SSTables currently held at `level`. Exposed for monitoring
    /// and tests; not load-bearing for any on-disk guarantee.
    #[must_use]
    pub fn num_files(&self, level: usize) -> usize {
        self.inner.versions.current().num_files(level)
    }
}

impl Inner {
    fn get(self: &Arc<Self>, _options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot_sequence = self.versions.last_sequence();
        let lookup = LookupKey::new(key, snapshot_sequence);

        let (mem, imm) = {
            let state = self.state.lock().expect("not poisoned");
            (Arc::clone(&state.mem), state.imm.clone())
        };

        match mem.get(&lookup) {
            LookupResult::Found(value) => return Ok(Some(value.to_vec())),
            LookupResult::Deleted => return Ok(None),
            LookupResult::NotFound => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lookup) {
                LookupResult::Found(value) => return Ok(Some(value.to_vec())),
                LookupResult::Deleted => return Ok(None),
                LookupResult::NotFound => {}
            }
        }

        let current = self.versions.current();
        let ucmp = self.icmp.user_comparator().as_ref();
        let (outcome, stats) = current.get(&self.table_cache, ucmp, key, lookup.internal_key())?;
        if current.update_stats(&stats) {
            self.maybe_schedule_compaction();
        }
        Ok(match outcome {
            LookupOutcome::Found(value) => Some(value.to_vec()),
            LookupOutcome::Deleted | LookupOutcome::NotFound => None,
        })
    }

    /// Writes `batch` to the log and the memtable under a single critical
    /// section. The lock must stay held through the memtable insert itself,
    /// not just the log append: `SkipList::insert` requires its caller to be
    /// the only thread inserting at a time, and `state`'s mutex is the only
    /// thing providing that exclusion for a shared, `Clone`-able `Db`.
    fn write(self: &Arc<Self>, options: &WriteOptions, batch: &mut WriteBatch) -> Result<()> {
        let mut state = self.state.lock().expect("not poisoned");
        state = self.make_room_for_write(state, false)?;

        let sequence = self.versions.last_sequence() + 1;
        batch.set_sequence(sequence);
        self.versions.set_last_sequence(sequence + u64::from(batch.count()) - 1);

        state.wal.add_record(batch.as_bytes())?;
        if options.sync {
            state.wal.sync()?;
        }

        let mem = Arc::clone(&state.mem);
        let mut seq = sequence;
        batch.for_each_owned(|value_type, key, value| {
            mem.put(seq, value_type, &key, &value);
            seq += 1;
            Ok(())
        })?;
        drop(state);

        self.maybe_schedule_compaction();
        Ok(())
    }

    /// Rotates the memtable when it is full, stalling the caller on the
    /// condition variable first if there is already an unflushed immutable
    /// memtable or level 0 has too many files for a new one to be safe.
    fn make_room_for_write<'a>(self: &'a Arc<Self>, mut state: MutexGuard<'a, State>, force: bool) -> Result<MutexGuard<'a, State>> {
        let mut force = force;
        loop {
            if let Some(err) = state.background_error.clone() {
                return Err(Error::DbClosed(err));
            }
            if !force && state.mem.approximate_size() <= self.options.write_mem_size {
                return Ok(state);
            }
            if state.imm.is_some() {
                log::debug!("write stall: waiting for the immutable memtable to flush");
                state = self.background_cv.wait(state).expect("not poisoned");
                continue;
            }
            if self.versions.current().num_files(0) >= L0_STOP_WRITE_THRESHOLD {
                log::debug!("write stall: level 0 has too many files, waiting for compaction");
                state = self.background_cv.wait(state).expect("not poisoned");
                continue;
            }

            let new_log_number = self.versions.new_file_number();
            let log_file = env::create_file(&filename::log_file_name(self.versions.dbname(), new_log_number))?;
            state.wal = wal::Writer::new(log_file);
            state.wal_number = new_log_number;
            let old_mem = std::mem::replace(&mut state.mem, Arc::new(MemTable::new(self.icmp.clone())));
            state.imm = Some(old_mem);
            force = false;
            return Ok(state);
        }
    }

    fn maybe_schedule_compaction(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("not poisoned");
        if state.compaction_scheduled {
            return;
        }
        if state.imm.is_none() && !self.versions.current().needs_compaction() {
            return;
        }
        state.compaction_scheduled = true;
        drop(state);

        let this = Arc::clone(self);
        std::thread::spawn(move || this.background_work());
    }

    /// Runs pending background work (a memtable flush, then compactions)
    /// until there is none left, rescheduling itself by looping rather than
    /// recursing.
    fn background_work(self: Arc<Self>) {
        loop {
            let imm = self.state.lock().expect("not poisoned").imm.clone();
            let result = if let Some(imm) = imm {
                self.compact_memtable(&imm).map(|()| true)
            } else if self.versions.current().needs_compaction() {
                self.compact_once()
            } else {
                Ok(false)
            };

            match result {
                Ok(true) => {
                    self.background_cv.notify_all();
                    continue;
                }
                Ok(false) => break,
                Err(err) => {
                    log::warn!("background compaction error: {err}");
                    self.state.lock().expect("not poisoned").background_error = Some(err.to_string());
                    self.background_cv.notify_all();
                    break;
                }
            }
        }
        self.state.lock().expect("not poisoned").compaction_scheduled = false;
        self.background_cv.notify_all();
    }

    fn compact_memtable(self: &Arc<Self>, imm: &MemTable) -> Result<()> {
        let mut edit = VersionEdit::new();
        write_level0_table(&self.versions, &self.options, &self.icmp, imm, &mut edit)?;
        let wal_number = self.state.lock().expect("not poisoned").wal_number;
        edit.set_log_number(wal_number);
        self.versions.log_and_apply(edit)?;
        self.state.lock().expect("not poisoned").imm = None;
        self.delete_obsolete_files();
        Ok(())
    }

    fn compact_once(self: &Arc<Self>) -> Result<bool> {
        let Some(compaction) = compaction::pick_compaction(&self.versions) else {
            return Ok(false);
        };
        log::debug!(
            "compacting level {} ({} + {} input files)",
            compaction.level(),
            compaction.inputs(0).len(),
            compaction.inputs(1).len(),
        );
        let edit = compaction::run_compaction(&self.versions, compaction, &self.options)?;
        let deleted: Vec<u64> = edit.deleted_files.iter().map(|(_, number)| *number).collect();
        self.versions.log_and_apply(edit)?;
        for number in deleted {
            self.table_cache.evict(number);
        }
        self.delete_obsolete_files();
        Ok(true)
    }

    /// Removes any WAL, manifest, or SSTable file on disk that nothing live
    /// references any longer: an old log superseded by a later one, an old
    /// manifest, or a table no version still points to.
    fn delete_obsolete_files(&self) {
        let mut live = std::collections::HashSet::new();
        self.versions.add_live_files(&mut live);
        let wal_number = self.state.lock().expect("not poisoned").wal_number;
        let manifest_number = self.versions.meta_file_number();

        let Ok(names) = env::list_dir(self.versions.dbname()) else {
            return;
        };
        for name in names {
            let Some((file_type, number)) = filename::parse_filename(&name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log => number >= wal_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number),
                FileType::Temp | FileType::Current | FileType::Lock => true,
            };
            if !keep {
                log::debug!("removing obsolete file {name}");
                let _ = env::remove_file(&self.versions.dbname().join(name));
            }
        }
    }
}

/// Replays the write-ahead log named in `versions.log_number()`, if it is
/// still on disk, applying its records into a fresh memtable. Returns that
/// memtable along with the highest sequence number it observed.
fn recover_log(versions: &VersionSet, icmp: &InternalKeyComparator) -> Result<(MemTable, u64)> {
    let log_number = versions.log_number();
    let mem = MemTable::new(icmp.clone());
    let mut max_sequence = 0u64;
    if log_number == 0 {
        return Ok((mem, max_sequence));
    }

    let log_path = filename::log_file_name(versions.dbname(), log_number);
    if !env::file_exists(&log_path) {
        return Ok((mem, max_sequence));
    }

    log::info!("replaying write-ahead log {}", log_path.display());
    let file = env::open_readable(&log_path)?;
    let mut reader = wal::LogReader::new(file);
    while let Some(record) = reader.read_record()? {
        let batch = WriteBatch::from_bytes(record)?;
        let mut sequence = batch.sequence();
        batch.for_each_owned(|value_type, key, value| {
            mem.put(sequence, value_type, &key, &value);
            sequence += 1;
            Ok(())
        })?;
        max_sequence = max_sequence.max(sequence.saturating_sub(1));
    }
    Ok((mem, max_sequence))
}

/// Flushes every entry in `mem` into a new, sorted level 0 SSTable,
/// recording the new file in `edit`. A no-op if `mem` is empty.
fn write_level0_table(
    versions: &VersionSet,
    options: &Options,
    icmp: &InternalKeyComparator,
    mem: &MemTable,
    edit: &mut VersionEdit,
) -> Result<()> {
    if mem.is_empty() {
        return Ok(());
    }

    let number = versions.new_file_number();
    let path = filename::table_file_name(versions.dbname(), number);
    let file = env::create_file(&path)?;
    let table_options = TableBuilderOptions {
        comparator: icmp.clone(),
        filter_policy: options.filter_policy.clone(),
        block_size: options.block_size,
        block_restart_interval: options.block_restart_interval,
        compression: options.compression,
    };
    let mut builder = TableBuilder::new(file, table_options);

    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;
    let mut first_err: Option<Error> = None;
    mem.for_each(|key, value| {
        if first_err.is_some() {
            return;
        }
        if smallest.is_none() {
            smallest = Some(key.clone());
        }
        largest = Some(key.clone());
        if let Err(err) = builder.add(key.as_bytes(), value) {
            first_err = Some(err);
        }
    });
    if let Some(err) = first_err {
        return Err(err);
    }

    let file_size = builder.finish()?;
    log::debug!("flushed memtable to level 0 table {number} ({file_size} bytes)");
    edit.add_file(0, number, file_size, smallest.expect("checked non-empty above"), largest.expect("checked non-empty above"));
    Ok(())
}

/// Deletes every file belonging to the database at `path`.
///
/// # Errors
/// Returns an error if the directory is currently locked by an open `Db`,
/// or on I/O failure.
pub fn destroy_db(path: &Path) -> Result<()> {
    if !env::file_exists(path) {
        return Ok(());
    }

    let lock_path = filename::lock_file_name(path);
    let lock = env::FileLock::acquire(&lock_path)?;
    let names = env::list_dir(path)?;
    for name in names {
        if name == "LOCK" {
            continue;
        }
        if filename::parse_filename(&name).is_some() {
            env::remove_file(&path.join(name))?;
        }
    }
    drop(lock);
    env::remove_file(&lock_path)?;
    let _ = env::remove_dir(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_fails_on_a_missing_directory_without_create_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nested");
        let options = Options { create_if_missing: false, ..Options::default() };
        assert!(Db::open(options, &missing).is_err());
    }

    #[test]
    fn open_creates_the_directory_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Db::open(Options::default(), &path).unwrap();
        assert!(path.is_dir());
        drop(db);
    }

    #[test]
    fn reopening_an_existing_database_with_error_if_exists_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _db = Db::open(Options::default(), dir.path()).unwrap();
        let options = Options { error_if_exists: true, ..Options::default() };
        assert!(Db::open(options, dir.path()).is_err());
    }

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();

        db.put(&WriteOptions::default(), b"k", b"v1").unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().as_deref(), Some(&b"v1"[..]));

        db.put(&WriteOptions::default(), b"k", b"v2").unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap().as_deref(), Some(&b"v2"[..]));

        db.delete(&WriteOptions::default(), b"k").unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), None);

        assert_eq!(db.get(&ReadOptions::default(), b"missing").unwrap(), None);
    }

    #[test]
    fn write_batch_applies_every_operation_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(Options::default(), dir.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        db.write(&WriteOptions::default(), batch).unwrap();

        assert_eq!(db.get(&ReadOptions::default(), b"a").unwrap(), None);
        assert_eq!(db.get(&ReadOptions::default(), b"b").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn recovery_replays_writes_left_in_the_write_ahead_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Db::open(Options::default(), dir.path()).unwrap();
            db.put(&WriteOptions { sync: true }, b"durable", b"value").unwrap();
            // Skip the clean shutdown path, simulating a process that crashed
            // right after the WAL fsync but before any flush.
            std::mem::forget(db);
        }

        let db = Db::open(Options::default(), dir.path()).unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"durable").unwrap().as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn a_full_memtable_is_flushed_to_level_zero_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options::default().with_write_mem_size(256);
        let db = Db::open(options, dir.path()).unwrap();

        for i in 0..64u32 {
            db.put(&WriteOptions::default(), format!("key{i}").as_bytes(), b"some reasonably sized value").unwrap();
        }

        let mut flushed = false;
        for _ in 0..200 {
            if db.num_files(0) > 0 {
                flushed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(flushed, "expected at least one level-0 file after repeatedly exceeding write_mem_size");

        for i in 0..64u32 {
            assert_eq!(
                db.get(&ReadOptions::default(), format!("key{i}").as_bytes()).unwrap().as_deref(),
                Some(&b"some reasonably sized value"[..]),
            );
        }
    }

    #[test]
    fn destroy_db_removes_every_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = Db::open(Options::default(), &path).unwrap();
            db.put(&WriteOptions::default(), b"k", b"v").unwrap();
        }

        destroy_db(&path).unwrap();
        let remaining = env::list_dir(&path).unwrap_or_default();
        assert!(remaining.is_empty(), "expected no files left, found {remaining:?}");
    }

    #[test]
    fn destroy_db_on_a_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(destroy_db(&missing).is_ok());
    }
}
