// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A concurrent ordered map with single-writer / many-reader discipline.
//!
//! Exactly one thread may call [`SkipList::insert`] at a time (the caller
//! enforces this, typically by holding the write lock that also guards the
//! WAL append); any number of threads may read concurrently with that
//! writer. Level-0 next pointers are published with `Release` and read
//! with `Acquire`; higher levels use `Relaxed` ordering because every
//! lookup re-verifies its position at level 0 before returning, so a stale
//! higher-level link only costs an extra comparison, never a wrong answer.

#![allow(unsafe_code)]

use super::arena::Arena;
use crate::key::InternalKeyComparator;
use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Maximum tower height a node can have.
const MAX_HEIGHT: usize = 12;
/// Branching probability: each additional level is 1/4 as likely as the last.
const BRANCHING_FACTOR: u32 = 4;

/// Compares two keys for ordering within a [`SkipList`].
///
/// Kept separate from `std::cmp::Ord` so the same skip list type can be
/// reused with any pluggable comparator, not just a key's natural order.
pub trait KeyComparator<K>: Send + Sync {
    /// Compares `a` against `b`.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

impl KeyComparator<crate::key::InternalKey> for crate::key::InternalKeyComparator {
    fn compare(&self, a: &crate::key::InternalKey, b: &crate::key::InternalKey) -> Ordering {
        InternalKeyComparator::compare(self, a.as_bytes(), b.as_bytes())
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    height: usize,
    /// Points at an arena-allocated array of `height` atomics; never
    /// individually freed, since the arena owns the backing memory for
    /// as long as the skip list exists.
    tower: *mut AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn next(&self, level: usize) -> *mut Node<K, V> {
        debug_assert!(level < self.height);
        let ordering = if level == 0 { AtomicOrdering::Acquire } else { AtomicOrdering::Relaxed };
        // SAFETY: `tower` was allocated with `height` contiguous slots and
        // `level < height` was just asserted.
        unsafe { (*self.tower.add(level)).load(ordering) }
    }

    fn set_next(&self, level: usize, node: *mut Node<K, V>) {
        debug_assert!(level < self.height);
        let ordering = if level == 0 { AtomicOrdering::Release } else { AtomicOrdering::Relaxed };
        // SAFETY: see `next`.
        unsafe { (*self.tower.add(level)).store(node, ordering) };
    }
}

/// A concurrent ordered map keyed by `K`, ordered by a pluggable
/// [`KeyComparator`].
pub struct SkipList<K, V, C> {
    arena: Arc<Arena>,
    comparator: C,
    head: *mut Node<K, V>,
    max_height: AtomicUsize,
    len: AtomicUsize,
}

// SAFETY: every mutation of node contents happens-before it is linked into
// the tower (published via a `Release` store at level 0), and readers only
// ever dereference nodes reached by following those links with an
// `Acquire` load. `K`/`V`/`C` being `Send + Sync` makes sharing the
// contained data across threads sound.
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Send for SkipList<K, V, C> {}
unsafe impl<K: Send + Sync, V: Send + Sync, C: Send + Sync> Sync for SkipList<K, V, C> {}

impl<K, V, C: KeyComparator<K>> SkipList<K, V, C> {
    /// Creates an empty skip list. Node towers are allocated out of `arena`.
    pub fn new(comparator: C, arena: Arc<Arena>) -> Self
    where
        K: Default,
        V: Default,
    {
        let head = Self::new_node(&arena, K::default(), V::default(), MAX_HEIGHT);
        Self { arena, comparator, head, max_height: AtomicUsize::new(1), len: AtomicUsize::new(0) }
    }

    /// Number of entries currently in the skip list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    /// Returns `true` if the skip list has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_node(arena: &Arena, key: K, value: V, height: usize) -> *mut Node<K, V> {
        let tower_bytes = height * std::mem::size_of::<AtomicPtr<Node<K, V>>>();
        let tower = arena.allocate_aligned(tower_bytes).as_ptr().cast::<AtomicPtr<Node<K, V>>>();
        for i in 0..height {
            // SAFETY: `tower` has `height` valid, uninitialized slots.
            unsafe { tower.add(i).write(AtomicPtr::new(ptr::null_mut())) };
        }
        Box::into_raw(Box::new(Node { key, value, height, tower }))
    }

    fn random_height() -> usize {
        let mut height = 1;
        let mut rng = rand::rng();
        while height < MAX_HEIGHT && rand::Rng::random_ratio(&mut rng, 1, BRANCHING_FACTOR) {
            height += 1;
        }
        height
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    /// Finds, at `level`, the last node with a key strictly less than `key`
    /// reachable from `start`, returning it and the next node after it
    /// (which is either the first node `>= key` or null).
    fn find_greater_or_equal(&self, key: &K, mut prev: Option<&mut [*mut Node<K, V>]>) -> *mut Node<K, V> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            // SAFETY: `x` is always either `head` or a node reached via a
            // tower link, both of which remain valid for the skip list's
            // lifetime.
            let next = unsafe { (*x).next(level) };
            let keep_going = if next.is_null() {
                false
            } else {
                // SAFETY: `next` is non-null, so it points at a live node.
                self.comparator.compare(unsafe { &(*next).key }, key) == Ordering::Less
            };
            if keep_going {
                x = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    fn find_less_than(&self, key: &K) -> *mut Node<K, V> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            // SAFETY: see `find_greater_or_equal`.
            let next = unsafe { (*x).next(level) };
            let at_or_past_key =
                next.is_null() || self.comparator.compare(unsafe { &(*next).key }, key) != Ordering::Less;
            if at_or_past_key {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    fn find_last(&self) -> *mut Node<K, V> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            // SAFETY: see `find_greater_or_equal`.
            let next = unsafe { (*x).next(level) };
            if !next.is_null() {
                x = next;
                continue;
            }
            if level == 0 {
                return x;
            }
            level -= 1;
        }
    }

    /// Inserts `key` -> `value`. The caller must guarantee no other thread
    /// is concurrently calling `insert`; duplicate keys are rejected by
    /// callers upstream (the memtable never inserts the same packed
    /// internal key twice; sequence numbers make every insert unique).
    pub fn insert(&self, key: K, value: V) {
        let mut prev = [self.head; MAX_HEIGHT];
        self.find_greater_or_equal(&key, Some(&mut prev));

        let height = Self::random_height();
        if height > self.max_height() {
            for slot in prev.iter_mut().take(height).skip(self.max_height()) {
                *slot = self.head;
            }
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = Self::new_node(&self.arena, key, value, height);
        for (level, prev_node) in prev.iter().enumerate().take(height) {
            // SAFETY: `*prev_node` is always `head` or a previously linked,
            // still-live node.
            unsafe {
                (*node).set_next(level, (**prev_node).next(level));
                (**prev_node).set_next(level, node);
            }
        }
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        let found = self.find_greater_or_equal(key, None);
        // SAFETY: `found`, if non-null, points at a live node.
        !found.is_null() && self.comparator.compare(unsafe { &(*found).key }, key) == Ordering::Equal
    }

    /// Creates an iterator positioned before the first entry.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V, C> {
        Iter { list: self, node: ptr::null_mut() }
    }
}

impl<K, V, C> Drop for SkipList<K, V, C> {
    fn drop(&mut self) {
        // SAFETY: every node (including `head`) was allocated via
        // `Box::into_raw` in `new_node` and is reachable exactly once from
        // this chain; nothing else holds a `Box` to any of them.
        unsafe {
            let mut x = self.head;
            while !x.is_null() {
                let next = (*x).next(0);
                drop(Box::from_raw(x));
                x = next;
            }
        }
    }
}

/// A bidirectional cursor over a [`SkipList`]'s entries in key order.
pub struct Iter<'a, K, V, C> {
    list: &'a SkipList<K, V, C>,
    node: *mut Node<K, V>,
}

impl<'a, K, V, C: KeyComparator<K>> Iter<'a, K, V, C> {
    /// Returns `true` if the cursor is positioned at a valid entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The current entry's key. Panics if the cursor is not [`valid`](Self::valid).
    #[must_use]
    pub fn key(&self) -> &K {
        // SAFETY: caller checked (or must check) `valid()`; `self.node`
        // points at a node owned by `self.list` for its whole lifetime.
        unsafe { &(*self.node).key }
    }

    /// The current entry's value. Panics if the cursor is not [`valid`](Self::valid).
    #[must_use]
    pub fn value(&self) -> &V {
        // SAFETY: see `key`.
        unsafe { &(*self.node).value }
    }

    /// Advances to the next entry.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        // SAFETY: see `key`.
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Moves to the last entry with a key strictly less than the current
    /// one. Implemented as a fresh descent from the top level rather than
    /// a back-pointer, per the skip list's single-direction link design.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let key_ptr: *const K = self.key();
        // SAFETY: `key_ptr` is read before `self.node` is reassigned below.
        let node = self.list.find_less_than(unsafe { &*key_ptr });
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }

    /// Positions the cursor at the first entry with a key `>= target`.
    pub fn seek(&mut self, target: &K) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    /// Positions the cursor at the first entry.
    pub fn seek_to_first(&mut self) {
        // SAFETY: `head` is always valid.
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Positions the cursor at the last entry.
    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if last == self.list.head { ptr::null_mut() } else { last };
    }
}
