// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bump allocator backing the memtable's skip list.
//!
//! Memory is handed out from 4 KiB blocks and never returned to the
//! allocator individually; the whole arena is freed at once when the
//! owning memtable is dropped. This matches the skip list's access
//! pattern: many small, never-freed-individually node and key allocations
//! that all die together when the memtable is flushed.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const BLOCK_SIZE: usize = 4096;

/// A growable bump allocator.
///
/// `Arena` is `Send + Sync`: the single writer thread drives all
/// allocation, but the `memory_usage` counter is read concurrently by
/// readers sizing a flush decision, so it is tracked in a relaxed atomic
/// rather than behind the allocation mutex.
pub struct Arena {
    inner: Mutex<ArenaInner>,
    memory_usage: AtomicUsize,
}

struct ArenaInner {
    /// Raw pointer to the start of unallocated space in the current block.
    alloc_ptr: *mut u8,
    /// Bytes remaining in the current block.
    alloc_bytes_remaining: usize,
    /// Every block ever allocated, kept alive until the arena itself drops.
    blocks: Vec<Block>,
}

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: `Block` owns its allocation exclusively and is only ever touched
// while holding the arena's mutex (or during `Drop`, which has unique
// access by construction).
unsafe impl Send for Block {}

impl Arena {
    /// Creates an empty arena with no blocks allocated yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner { alloc_ptr: std::ptr::null_mut(), alloc_bytes_remaining: 0, blocks: Vec::new() }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `bytes` with no particular alignment guarantee.
    ///
    /// # Panics
    /// Panics if `bytes` is zero.
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0);
        let mut inner = self.inner.lock().expect("arena mutex poisoned");

        if bytes <= inner.alloc_bytes_remaining {
            // SAFETY: `alloc_ptr` was established by a previous
            // `new_block` call to have at least `alloc_bytes_remaining`
            // writable bytes ahead of it.
            let result = unsafe { NonNull::new_unchecked(inner.alloc_ptr) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_bytes_remaining -= bytes;
            self.bump_usage(bytes);
            return result;
        }

        self.allocate_fallback(&mut inner, bytes)
    }

    /// Allocates `bytes` aligned to `std::mem::size_of::<usize>()`.
    pub fn allocate_aligned(&self, bytes: usize) -> NonNull<u8> {
        let align = std::mem::size_of::<usize>().max(8);
        assert!(align & (align - 1) == 0, "alignment must be a power of two");

        let mut inner = self.inner.lock().expect("arena mutex poisoned");
        let current_mod = (inner.alloc_ptr as usize) & (align - 1);
        let slop = if current_mod == 0 { 0 } else { align - current_mod };
        let needed = bytes + slop;

        if needed <= inner.alloc_bytes_remaining {
            // SAFETY: see `allocate`; `needed <= alloc_bytes_remaining`
            // guarantees `result` and the following `bytes` are in-block.
            let result = unsafe { NonNull::new_unchecked(inner.alloc_ptr.add(slop)) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_bytes_remaining -= needed;
            debug_assert_eq!((result.as_ptr() as usize) & (align - 1), 0);
            self.bump_usage(needed);
            return result;
        }

        // The fallback path always allocates a fresh, suitably-aligned
        // block (or a dedicated block for oversized requests), so the
        // returned pointer is always aligned without extra slop.
        self.allocate_fallback(&mut inner, bytes)
    }

    /// Total bytes handed out so far, including per-block bookkeeping
    /// overhead. Used to decide when a memtable should be flushed.
    ///
    /// The result may be stale relative to the most recent `allocate`
    /// call on another thread, but it is monotonically non-decreasing.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn bump_usage(&self, bytes: usize) {
        self.memory_usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Slow path: the current block can't satisfy the request. Requests
    /// larger than a quarter of the block size get their own dedicated
    /// block so the rest of the current block isn't abandoned.
    fn allocate_fallback(&self, inner: &mut ArenaInner, bytes: usize) -> NonNull<u8> {
        if bytes > BLOCK_SIZE / 4 {
            return self.new_block(inner, bytes);
        }

        let ptr = self.new_block(inner, BLOCK_SIZE);
        inner.alloc_ptr = unsafe { ptr.as_ptr().add(bytes) };
        inner.alloc_bytes_remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn new_block(&self, inner: &mut ArenaInner, size: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(size, 8).expect("valid block layout");
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        inner.blocks.push(Block { ptr, layout });
        self.bump_usage(size + std::mem::size_of::<Block>());
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            // SAFETY: each `Block` was allocated with `alloc::alloc` using
            // exactly `block.layout`, and is dropped at most once here.
            unsafe { alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap() {
        let arena = Arena::new();
        let a = arena.allocate(16);
        let b = arena.allocate(16);
        assert_ne!(a, b);
        unsafe {
            a.as_ptr().write_bytes(0xAA, 16);
            b.as_ptr().write_bytes(0xBB, 16);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0xBB);
        }
    }

    #[test]
    fn aligned_allocations_are_pointer_aligned() {
        let arena = Arena::new();
        for size in [1, 3, 7, 8, 31, 129] {
            let ptr = arena.allocate_aligned(size);
            assert_eq!((ptr.as_ptr() as usize) % std::mem::size_of::<usize>(), 0);
        }
    }

    #[test]
    fn oversized_request_gets_a_dedicated_block() {
        let arena = Arena::new();
        let small = arena.allocate(8);
        let big = arena.allocate(BLOCK_SIZE);
        // The oversized allocation must not have consumed the current
        // block, so a subsequent small allocation is still contiguous
        // with `small`.
        let next_small = arena.allocate(8);
        assert_eq!(unsafe { small.as_ptr().add(8) }, next_small.as_ptr());
        let _ = big;
    }

    #[test]
    fn memory_usage_is_monotonic() {
        let arena = Arena::new();
        let mut last = arena.memory_usage();
        for _ in 0..100 {
            arena.allocate(37);
            let now = arena.memory_usage();
            assert!(now >= last);
            last = now;
        }
    }
}
