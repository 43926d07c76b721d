// Copyright (c) 2024-present, lsmkv contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios driving the public `Db` API, scaled down to keep
//! a default `cargo test` run fast.

use lsmkv::{Db, Options, ReadOptions, WriteOptions};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

fn get(db: &Db, key: &str) -> Option<String> {
    db.get(&ReadOptions::default(), key.as_bytes()).unwrap().map(|v| String::from_utf8(v).unwrap())
}

fn put(db: &Db, key: &str, value: &str) {
    db.put(&WriteOptions::default(), key.as_bytes(), value.as_bytes()).unwrap();
}

#[test]
fn s1_repeated_puts_to_one_key_survive_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Db::open(Options::default(), dir.path()).unwrap();
        for v in 1..=6 {
            put(&db, "a", &v.to_string());
        }
        assert_eq!(get(&db, "a").as_deref(), Some("6"));
    }

    let db = Db::open(Options::default(), dir.path()).unwrap();
    assert_eq!(get(&db, "a").as_deref(), Some("6"));
}

#[test]
fn s2_last_write_wins_across_many_overwritten_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(Options::default(), dir.path()).unwrap();
    let mut rng = rand::rng();
    let mut expected: HashMap<u32, u32> = HashMap::new();

    for _round in 0..5 {
        for i in 0..200u32 {
            let value = rng.random_range(0..1000u32);
            put(&db, &i.to_string(), &value.to_string());
            expected.insert(i, value);
        }
        for (key, value) in &expected {
            assert_eq!(get(&db, &key.to_string()).as_deref(), Some(value.to_string().as_str()));
        }
    }
}

#[test]
fn s3_delete_then_reinsert() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(Options::default(), dir.path()).unwrap();

    put(&db, "k", "v1");
    db.delete(&WriteOptions::default(), b"k").unwrap();
    assert_eq!(get(&db, "k"), None);

    put(&db, "k", "v2");
    assert_eq!(get(&db, "k").as_deref(), Some("v2"));
}

/// Drives N writers and M readers over a small, shared key space (every
/// writer touches every key, not a private one) so a data race in the
/// memtable's insert path has a chance to actually manifest: a lost
/// insert can sever part of the skip list's linked structure, which
/// surfaces as a reader failing to find a key some writer already
/// confirmed, or reading back bytes that don't parse as any writer
/// ever wrote them. Validates SPEC_FULL's fixed-key-space concurrency
/// property: every observed value decodes as `"<key>.<thread_id>.<i>"`
/// with `i` no greater than what that thread had issued so far.
#[test]
fn s4_concurrent_writers_and_readers_share_a_fixed_key_space() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(Options::default(), dir.path()).unwrap();

    const KEY_COUNT: u32 = 8;
    const WRITER_COUNT: u32 = 4;
    const WRITES_PER_WRITER: u32 = 200;

    let keys: Vec<String> = (0..KEY_COUNT).map(|k| format!("k{k}")).collect();
    let last_issued: Arc<Vec<std::sync::atomic::AtomicI64>> =
        Arc::new((0..WRITER_COUNT).map(|_| std::sync::atomic::AtomicI64::new(-1)).collect());
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    fn check_value(value: &str, keys: &[String], writer_count: usize, last_issued: &[std::sync::atomic::AtomicI64]) {
        let parts: Vec<&str> = value.split('.').collect();
        assert_eq!(parts.len(), 3, "torn or corrupted value: {value:?}");
        assert!(keys.iter().any(|k| k == parts[0]), "value names an unknown key: {value:?}");
        let thread_id: usize = parts[1].parse().expect("torn or corrupted value");
        assert!(thread_id < writer_count, "value names an unknown writer thread: {value:?}");
        let i: i64 = parts[2].parse().expect("torn or corrupted value");
        let issued = last_issued[thread_id].load(std::sync::atomic::Ordering::Acquire);
        assert!(i <= issued, "observed i={i} but thread {thread_id} had only issued up to {issued}");
    }

    let mut writer_handles = Vec::new();
    for thread_id in 0..WRITER_COUNT {
        let db = db.clone();
        let keys = keys.clone();
        let last_issued = Arc::clone(&last_issued);
        writer_handles.push(std::thread::spawn(move || {
            for i in 0..WRITES_PER_WRITER {
                let key = &keys[(i % KEY_COUNT) as usize];
                let value = format!("{key}.{thread_id}.{i}");
                put(&db, key, &value);
                last_issued[thread_id as usize].store(i64::from(i), std::sync::atomic::Ordering::Release);
            }
        }));
    }

    let mut reader_handles = Vec::new();
    for _ in 0..2 {
        let db = db.clone();
        let keys = keys.clone();
        let last_issued = Arc::clone(&last_issued);
        let stop = Arc::clone(&stop);
        reader_handles.push(std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Acquire) {
                for key in &keys {
                    if let Some(value) = get(&db, key) {
                        check_value(&value, &keys, WRITER_COUNT as usize, &last_issued);
                    }
                }
            }
        }));
    }

    for handle in writer_handles {
        handle.join().unwrap();
    }
    stop.store(true, std::sync::atomic::Ordering::Release);
    for handle in reader_handles {
        handle.join().unwrap();
    }

    for key in &keys {
        let value = get(&db, key).expect("every key was written by every writer");
        check_value(&value, &keys, WRITER_COUNT as usize, &last_issued);
    }
}

#[test]
fn s5_an_sstable_iterates_in_order_and_seeks_to_mid_range_keys() {
    use lsmkv::key::{BytewiseComparator, InternalKey, InternalKeyComparator, ValueType};
    use lsmkv::table::builder::{TableBuilder, TableBuilderOptions};
    use lsmkv::table::reader::TableReader;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.sst");
    let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
    let options = TableBuilderOptions {
        comparator: icmp.clone(),
        filter_policy: None,
        block_size: 4096,
        block_restart_interval: 16,
        compression: lsmkv::table::CompressionType::None,
    };
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = TableBuilder::new(file, options);

    for i in 0..500u32 {
        let user_key = format!("{i:06}");
        let key = InternalKey::new(user_key.as_bytes(), i as u64, ValueType::Insertion);
        builder.add(key.as_bytes(), b"fixed-value").unwrap();
    }
    builder.finish().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let reader = TableReader::open(lsmkv::Slice::from(bytes), 1, icmp, None, true, None).unwrap();

    let mut iter = reader.iter();
    let mut count = 0;
    while iter.key().is_some() {
        count += 1;
        iter.advance();
    }
    assert_eq!(count, 500);

    let target = InternalKey::new(b"000250", u64::MAX, ValueType::Insertion);
    let (found_key, found_value) = reader.get(target.as_bytes()).unwrap().expect("entry exists");
    let found = InternalKey::from_encoded(lsmkv::Slice::from(found_key));
    assert_eq!(found.user_key(), b"000250");
    assert_eq!(&*found_value, b"fixed-value");
}

#[test]
fn s6_compaction_keeps_level_one_non_overlapping_and_every_key_retrievable() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options::default().with_write_mem_size(4096).with_max_file_size(16 * 1024);
    let db = Db::open(options, dir.path()).unwrap();

    for i in 0..2000u32 {
        put(&db, &format!("{i:06}"), "some moderately sized value used to force several flushes");
    }

    let mut compacted = false;
    for _ in 0..500 {
        if db.num_files(1) > 0 {
            compacted = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(compacted, "expected at least one level 0 to level 1 compaction");

    for i in 0..2000u32 {
        assert_eq!(
            get(&db, &format!("{i:06}")).as_deref(),
            Some("some moderately sized value used to force several flushes"),
        );
    }
}
