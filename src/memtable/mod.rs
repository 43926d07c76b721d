// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory table backing the most recent writes: one arena and one skip
//! list, wrapped with the bookkeeping a flush decision needs.

mod arena;
mod skiplist;

use crate::key::{InternalKey, InternalKeyComparator, LookupKey, ValueType};
use crate::slice::Slice;
use arena::Arena;
use skiplist::SkipList;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a [`MemTable::get`] found for a probed user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The key is present with this value.
    Found(Slice),
    /// The key's most recent entry is a deletion tombstone.
    Deleted,
    /// No entry for this key exists in the memtable at all.
    NotFound,
}

/// One generation of in-memory writes.
///
/// Writers call [`MemTable::put`] under the write lock; readers may call
/// [`MemTable::get`] concurrently with at most one in-flight `put`, per the
/// skip list's single-writer / many-reader contract.
pub struct MemTable {
    table: SkipList<InternalKey, Slice, InternalKeyComparator>,
    approximate_size: AtomicU64,
}

impl MemTable {
    /// Creates an empty memtable ordered by `comparator`.
    #[must_use]
    pub fn new(comparator: InternalKeyComparator) -> Self {
        Self {
            table: SkipList::new(comparator, Arc::new(Arena::new())),
            approximate_size: AtomicU64::new(0),
        }
    }

    /// Records a single mutation at `sequence`.
    pub fn put(&self, sequence: u64, value_type: ValueType, key: &[u8], value: &[u8]) {
        let internal_key = InternalKey::new(key, sequence, value_type);
        let value = match value_type {
            ValueType::Insertion => Slice::from(value),
            ValueType::Deletion => Slice::default(),
        };
        let entry_size = internal_key.as_bytes().len() + value.len();
        self.table.insert(internal_key, value);
        self.approximate_size.fetch_add(entry_size as u64, Ordering::Relaxed);
    }

    /// Looks up the newest visible entry for `key.user_key()` at a
    /// sequence no greater than `key`'s.
    ///
    /// Because the internal-key comparator ties break on sequence
    /// descending, the first entry at or after `key` in iteration order is
    /// either the answer or proof there is none.
    #[must_use]
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let probe = InternalKey::from_encoded(Slice::from(key.internal_key()));
        let mut it = self.table.iter();
        it.seek(&probe);
        if !it.valid() {
            return LookupResult::NotFound;
        }
        if it.key().user_key() != key.user_key() {
            return LookupResult::NotFound;
        }
        match it.key().value_type() {
            ValueType::Insertion => LookupResult::Found(it.value().clone()),
            ValueType::Deletion => LookupResult::Deleted,
        }
    }

    /// Approximate number of bytes occupied by all entries inserted so
    /// far; drives the decision to flush this memtable to a level-0
    /// SSTable.
    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Number of entries in the memtable (includes tombstones; entries are
    /// never overwritten in place, so repeated writes to the same user key
    /// each count separately).
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if no entries have been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Iterates every entry in internal-key order, for flushing to an
    /// SSTable builder.
    pub fn for_each<F: FnMut(&InternalKey, &Slice)>(&self, mut f: F) {
        let mut it = self.table.iter();
        it.seek_to_first();
        while it.valid() {
            f(it.key(), it.value());
            it.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BytewiseComparator;

    fn comparator() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn put_then_get_returns_latest_value() {
        let mem = MemTable::new(comparator());
        mem.put(1, ValueType::Insertion, b"k", b"v1");
        mem.put(2, ValueType::Insertion, b"k", b"v2");

        let lookup = LookupKey::new(b"k", 10);
        assert_eq!(mem.get(&lookup), LookupResult::Found(Slice::from(&b"v2"[..])));
    }

    #[test]
    fn get_at_older_sequence_sees_older_value() {
        let mem = MemTable::new(comparator());
        mem.put(1, ValueType::Insertion, b"k", b"v1");
        mem.put(5, ValueType::Insertion, b"k", b"v2");

        let lookup = LookupKey::new(b"k", 1);
        assert_eq!(mem.get(&lookup), LookupResult::Found(Slice::from(&b"v1"[..])));
    }

    #[test]
    fn deletion_is_visible_as_deleted() {
        let mem = MemTable::new(comparator());
        mem.put(1, ValueType::Insertion, b"k", b"v1");
        mem.put(2, ValueType::Deletion, b"k", b"");

        let lookup = LookupKey::new(b"k", 10);
        assert_eq!(mem.get(&lookup), LookupResult::Deleted);
    }

    #[test]
    fn missing_key_is_not_found() {
        let mem = MemTable::new(comparator());
        mem.put(1, ValueType::Insertion, b"a", b"1");
        let lookup = LookupKey::new(b"zzz", 10);
        assert_eq!(mem.get(&lookup), LookupResult::NotFound);
    }

    #[test]
    fn approximate_size_grows_monotonically() {
        let mem = MemTable::new(comparator());
        let mut last = mem.approximate_size();
        for i in 0..50u64 {
            mem.put(i, ValueType::Insertion, format!("k{i}").as_bytes(), b"value");
            let now = mem.approximate_size();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn for_each_visits_entries_in_internal_key_order() {
        let mem = MemTable::new(comparator());
        mem.put(1, ValueType::Insertion, b"b", b"1");
        mem.put(1, ValueType::Insertion, b"a", b"2");
        mem.put(1, ValueType::Insertion, b"c", b"3");

        let mut order = Vec::new();
        mem.for_each(|k, _| order.push(k.user_key().to_vec()));
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
