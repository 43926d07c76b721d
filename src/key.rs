// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Internal keys: the `user_key ‖ pack(sequence, type)` encoding used as the
//! sort key for the memtable and every SSTable data block.
//!
//! The trailing 8 bytes are a little-endian `u64` packing
//! `(sequence << 8) | type`. Ordering is by user key ascending, then by
//! sequence number *descending* — newer writes to the same key sort first,
//! which is what lets both the memtable and `Version::get` return on the
//! first match.

use crate::coding::{get_varint32, put_varint32};
use crate::error::{Error, Result};
use crate::slice::Slice;
use std::cmp::Ordering;
use std::io::Write;
use std::sync::Arc;

/// Kind of mutation an internal key records.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// A deletion tombstone.
    Deletion = 0,

    /// A value insertion (`Put`).
    Insertion = 1,
}

impl ValueType {
    /// Tag used when constructing a [`LookupKey`].
    ///
    /// This deliberately shares the same byte as [`ValueType::Insertion`]
    /// (`1`): a lookup key must sort *before* every real internal key sharing
    /// the same `(user_key, sequence)` pair, and since ties break on sequence
    /// descending, using the maximal type byte at the maximal visible
    /// sequence number is what makes the memtable and table seeks land on
    /// the newest entry with this key, of either type.
    pub const SEEK_TAG: ValueType = ValueType::Insertion;
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Insertion),
            other => Err(Error::Corruption(format!("invalid value type tag: {other}"))),
        }
    }
}

/// Packs `(sequence, type)` into the trailing 8 bytes of an internal key.
#[must_use]
pub fn pack_sequence_and_type(sequence: u64, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= (1u64 << 56) - 1, "sequence number must fit in 56 bits");
    (sequence << 8) | u64::from(u8::from(value_type))
}

/// Reverses [`pack_sequence_and_type`].
#[must_use]
pub fn unpack_sequence_and_type(packed: u64) -> (u64, u8) {
    (packed >> 8, (packed & 0xff) as u8)
}

/// A user-pluggable key comparator.
///
/// Only the *user key* portion of an internal key is ever handed to a
/// `Comparator` implementation; the sequence/type tie-break is always
/// applied afterwards by the engine and is not something a custom
/// comparator can override (see [`InternalKeyComparator`]).
pub trait Comparator: Send + Sync + std::fmt::Debug {
    /// Compares two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Stable name identifying this comparator, persisted in the manifest.
    /// Opening a database with a different comparator name is an error.
    fn name(&self) -> &'static str;

    /// Replaces `start` with a short key `s` such that
    /// `start <= s < limit`, used to keep SSTable index block separators
    /// small. The default (and this implementation's only) strategy is to
    /// leave `start` unchanged, which is always correct, just not minimal.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let _ = limit;
        let _ = start;
    }

    /// Replaces `key` with a short key `s >= key`, used for the last index
    /// entry in a table. Default: leave `key` unchanged.
    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let _ = key;
    }
}

/// Default comparator: plain byte-wise lexicographic order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "lsmkv.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let mut diff_index = 0;
        while diff_index < min_len && start[diff_index] == limit[diff_index] {
            diff_index += 1;
        }
        if diff_index >= min_len {
            return; // one is a prefix of the other; no shortening possible
        }
        let diff_byte = start[diff_index];
        if diff_byte < 0xff && diff_byte + 1 < limit[diff_index] {
            start.truncate(diff_index + 1);
            start[diff_index] += 1;
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        for i in 0..key.len() {
            let byte = key[i];
            if byte != 0xff {
                key.truncate(i + 1);
                key[i] += 1;
                return;
            }
        }
        // key is all 0xff bytes; leave unchanged.
    }
}

/// Wraps a user [`Comparator`] with the internal-key sequence/type tie-break.
///
/// This is the comparator every skip list, block, and table in the engine
/// actually orders by.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl std::fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InternalKeyComparator({})", self.user_comparator.name())
    }
}

impl InternalKeyComparator {
    /// Wraps `user_comparator` with the sequence/type tie-break.
    #[must_use]
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    /// Returns the wrapped user comparator.
    #[must_use]
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    /// Compares two full internal-key byte strings (`user_key ‖ packed_trailer`).
    #[must_use]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a_user, a_packed) = split_internal_key(a);
        let (b_user, b_packed) = split_internal_key(b);
        match self.user_comparator.compare(a_user, b_user) {
            Ordering::Equal => {
                // Higher sequence number sorts first (descending).
                let (a_seq, _) = unpack_sequence_and_type(a_packed);
                let (b_seq, _) = unpack_sequence_and_type(b_packed);
                b_seq.cmp(&a_seq)
            }
            other => other,
        }
    }

    /// Stable name, combining this comparator's identity with the user
    /// comparator's, persisted in the manifest so recovery can detect a
    /// mismatched comparator.
    #[must_use]
    pub fn name(&self) -> String {
        format!("lsmkv.InternalKeyComparator.{}", self.user_comparator.name())
    }
}

fn split_internal_key(key: &[u8]) -> (&[u8], u64) {
    debug_assert!(key.len() >= 8, "internal key too short: {} bytes", key.len());
    let (user_key, trailer) = key.split_at(key.len() - 8);
    let packed = u64::from_le_bytes(trailer.try_into().expect("8 bytes"));
    (user_key, packed)
}

/// An internal key: `user_key ‖ (sequence << 8 | type)` as a little-endian
/// 8-byte trailer.
#[derive(Clone, Eq)]
pub struct InternalKey {
    bytes: Slice,
}

impl InternalKey {
    /// Builds a new internal key from its parts.
    #[must_use]
    pub fn new(user_key: &[u8], sequence: u64, value_type: ValueType) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + 8);
        buf.extend_from_slice(user_key);
        buf.extend_from_slice(&pack_sequence_and_type(sequence, value_type).to_le_bytes());
        Self { bytes: Slice::from(buf) }
    }

    /// Wraps an already-encoded `user_key ‖ trailer` byte string.
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than the 8-byte trailer.
    #[must_use]
    pub fn from_encoded(bytes: Slice) -> Self {
        assert!(bytes.len() >= 8, "encoded internal key too short");
        Self { bytes }
    }

    /// The full encoded `user_key ‖ trailer` byte string.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The user key portion, excluding the trailer.
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        split_internal_key(&self.bytes).0
    }

    /// The sequence number this key was written at.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        unpack_sequence_and_type(split_internal_key(&self.bytes).1).0
    }

    /// The mutation kind this key records.
    ///
    /// # Panics
    /// Panics if the trailer's type byte is not a valid [`ValueType`] —
    /// this can only happen if the key bytes were corrupted, which callers
    /// reading from disk should have already rejected via a checksum.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        let (_, tag) = unpack_sequence_and_type(split_internal_key(&self.bytes).1);
        ValueType::try_from(tag).expect("internal key trailer has a valid type tag")
    }
}

impl Default for InternalKey {
    /// An empty user key at sequence 0, used only as a placeholder (e.g.
    /// the skip list's head sentinel) that is never read back as a real
    /// entry.
    fn default() -> Self {
        Self::new(&[], 0, ValueType::Deletion)
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{}:{:?}",
            String::from_utf8_lossy(self.user_key()),
            self.sequence(),
            self.value_type(),
        )
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key().cmp(other.user_key()) {
            Ordering::Equal => other.sequence().cmp(&self.sequence()),
            other => other,
        }
    }
}

/// A key used to probe the memtable: `varint32(internal_key_len) ‖ internal_key`.
///
/// The length prefix is redundant once the key is decoded back into an
/// [`InternalKey`], but is kept so a lookup key and a real internal key
/// share byte-for-byte identical trailing bytes, which is what lets
/// [`LookupKey::internal_key`] hand its bytes straight to
/// [`InternalKey::from_encoded`] without copying.
#[derive(Clone)]
pub struct LookupKey {
    /// Small lookups avoid a heap allocation; long ones spill to `Heap`.
    storage: LookupKeyStorage,
}

#[derive(Clone)]
enum LookupKeyStorage {
    Inline { buf: [u8; 48], len: usize },
    Heap(Vec<u8>),
}

const INLINE_CAPACITY: usize = 48;

impl LookupKey {
    /// Builds a lookup key for `user_key` at `sequence`, tagged with
    /// [`ValueType::SEEK_TAG`] so it sorts before any real entry with an
    /// equal or lower sequence number for the same user key.
    #[must_use]
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        let packed = pack_sequence_and_type(sequence, ValueType::SEEK_TAG);
        let internal_key_len = user_key.len() + 8;
        let mut header = Vec::with_capacity(5);
        put_varint32(&mut header, internal_key_len as u32).expect("vec write cannot fail");

        let total_len = header.len() + internal_key_len;
        if total_len <= INLINE_CAPACITY {
            let mut buf = [0u8; INLINE_CAPACITY];
            let mut cursor = &mut buf[..];
            cursor.write_all(&header).expect("fits");
            cursor.write_all(user_key).expect("fits");
            cursor
                .write_all(&packed.to_le_bytes())
                .expect("fits");
            Self {
                storage: LookupKeyStorage::Inline { buf, len: total_len },
            }
        } else {
            let mut buf = Vec::with_capacity(total_len);
            buf.extend_from_slice(&header);
            buf.extend_from_slice(user_key);
            buf.extend_from_slice(&packed.to_le_bytes());
            Self { storage: LookupKeyStorage::Heap(buf) }
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            LookupKeyStorage::Inline { buf, len } => &buf[..*len],
            LookupKeyStorage::Heap(v) => v,
        }
    }

    /// The full memtable-entry-prefix encoding: `varint32(len) ‖ internal_key`.
    #[must_use]
    pub fn memtable_key(&self) -> &[u8] {
        self.bytes()
    }

    /// The internal key alone, without the length prefix.
    #[must_use]
    pub fn internal_key(&self) -> &[u8] {
        let mut cursor = self.bytes();
        let len = get_varint32(&mut cursor).expect("freshly built prefix") as usize;
        &cursor[..len]
    }

    /// The user key alone, without the length prefix or trailer.
    #[must_use]
    pub fn user_key(&self) -> &[u8] {
        let ik = self.internal_key();
        &ik[..ik.len() - 8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let packed = pack_sequence_and_type(123_456, ValueType::Insertion);
        let (seq, tag) = unpack_sequence_and_type(packed);
        assert_eq!(seq, 123_456);
        assert_eq!(tag, 1);
    }

    #[test]
    fn ordering_is_user_key_then_sequence_descending() {
        let a = InternalKey::new(b"abc", 5, ValueType::Insertion);
        let b = InternalKey::new(b"abc", 7, ValueType::Insertion);
        let c = InternalKey::new(b"abd", 1, ValueType::Insertion);
        assert!(b < a); // higher sequence sorts first
        assert!(a < c); // user key dominates
    }

    #[test]
    fn lookup_key_matches_internal_key_bytes() {
        let ik = InternalKey::new(b"hello", 42, ValueType::SEEK_TAG);
        let lk = LookupKey::new(b"hello", 42);
        assert_eq!(lk.internal_key(), ik.as_bytes());
        assert_eq!(lk.user_key(), b"hello");
    }

    #[test]
    fn lookup_key_spills_to_heap_for_long_keys() {
        let long_key = vec![b'x'; 256];
        let lk = LookupKey::new(&long_key, 1);
        assert_eq!(lk.user_key(), long_key.as_slice());
        assert!(matches!(lk.storage, LookupKeyStorage::Heap(_)));
    }

    #[test]
    fn bytewise_shortest_separator() {
        let cmp = BytewiseComparator;
        let mut start = b"abc".to_vec();
        cmp.find_shortest_separator(&mut start, b"abd");
        assert!(start.as_slice() >= b"abc".as_slice());
        assert!(start.as_slice() < b"abd".as_slice());
    }
}
