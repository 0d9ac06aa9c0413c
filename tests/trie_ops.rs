use cow_tree::{Config, Database};
use std::collections::BTreeMap;
use test_log::test;

fn open(folder: &std::path::Path) -> cow_tree::Result<Database> {
    Config::new(folder)
        .segment_size(1 << 20)
        .max_database_size(1 << 28)
        .max_objects(1 << 20)
        .open()
}

fn num_value(key: &str) -> Vec<u8> {
    let n: u64 = key.parse().expect("numeric key");
    (n * 1024).to_string().into_bytes()
}

#[test]
fn single_key_bounds() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    assert_eq!(-1, writer.upsert(&mut root, b"a", b"v1")?);
    writer.set_top_root(0, &mut root)?;
    drop(writer);

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let found = reader.get_greater_equal(&snapshot, b"a")?;
    assert_eq!(Some((b"a".to_vec(), b"v1".to_vec())), found);

    assert_eq!(None, reader.get_greater_equal(&snapshot, b"a\0")?);

    let found = reader.get_greater_equal(&snapshot, b" ")?;
    assert_eq!(Some((b"a".to_vec(), b"v1".to_vec())), found);

    Ok(())
}

#[test]
fn dense_even_keys() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    for n in (100..=898u64).step_by(2) {
        let key = n.to_string();
        assert_eq!(-1, writer.upsert(&mut root, key.as_bytes(), &num_value(&key))?);
    }
    writer.set_top_root(0, &mut root)?;
    drop(writer);

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let first = reader.get_greater_equal(&snapshot, b"")?;
    assert_eq!(
        Some((b"100".to_vec(), b"102400".to_vec())),
        first,
    );

    // odd probes land on the next even key
    for n in (101..898u64).step_by(2) {
        let probe = n.to_string();
        let hit = reader.get_greater_equal(&snapshot, probe.as_bytes())?;
        let expected = (n + 1).to_string();
        assert_eq!(
            Some((expected.clone().into_bytes(), num_value(&expected))),
            hit,
            "lower_bound({probe})",
        );
    }
    assert_eq!(None, reader.get_greater_equal(&snapshot, b"899")?);

    Ok(())
}

#[test]
fn two_keys_cursor_walk() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"a", b"v1")?;
    writer.upsert(&mut root, b"b", b"v2")?;
    writer.set_top_root(0, &mut root)?;
    drop(writer);

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let mut cursor = reader.lower_bound(&snapshot, b"")?;
    assert_eq!(Some((b"a".to_vec(), b"v1".to_vec())), cursor.pair()?);

    assert!(cursor.next()?);
    assert_eq!(Some((b"b".to_vec(), b"v2".to_vec())), cursor.pair()?);

    assert!(!cursor.next()?);
    assert!(!cursor.is_valid());
    assert_eq!(None, cursor.pair()?);

    Ok(())
}

#[test]
fn erase_range_collapses() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    for n in 100..500u64 {
        let key = n.to_string();
        writer.upsert(&mut root, key.as_bytes(), &num_value(&key))?;
    }
    assert_eq!(400, writer.count(&root)?);

    for n in 100..400u64 {
        let key = n.to_string();
        assert!(writer.remove(&mut root, key.as_bytes())? >= 0, "remove({key})");
    }
    assert_eq!(100, writer.count(&root)?);
    assert_eq!(100, writer.validate(&root)?);
    writer.set_top_root(0, &mut root)?;
    drop(writer);

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;
    assert_eq!(
        Some((b"400".to_vec(), b"409600".to_vec())),
        reader.get_greater_equal(&snapshot, b"")?,
    );

    Ok(())
}

#[test]
fn upsert_round_trip_and_idempotence() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;

    assert_eq!(-1, writer.upsert(&mut root, b"key", b"hello")?);
    assert_eq!(Some(b"hello".to_vec()), writer.get(&root, b"key")?);

    // re-upserting the same value reports the previous size
    assert_eq!(5, writer.upsert(&mut root, b"key", b"hello")?);
    assert_eq!(5, writer.upsert(&mut root, b"key", b"other")?);
    assert_eq!(Some(b"other".to_vec()), writer.get(&root, b"key")?);

    // removing a missing key reports not-found and leaves the root alone
    let before = root.node_id();
    assert_eq!(-1, writer.remove(&mut root, b"missing")?);
    assert_eq!(before, root.node_id());

    Ok(())
}

#[test]
fn empty_and_edge_keys() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;

    writer.upsert(&mut root, b"", b"empty")?;
    writer.upsert(&mut root, b"\x00", b"zero")?;
    writer.upsert(&mut root, &[0xff; 32], b"high")?;

    assert_eq!(Some(b"empty".to_vec()), writer.get(&root, b"")?);
    assert_eq!(Some(b"zero".to_vec()), writer.get(&root, b"\x00")?);
    assert_eq!(Some(b"high".to_vec()), writer.get(&root, &[0xff; 32])?);
    assert_eq!(3, writer.validate(&root)?);

    let too_long = vec![b'k'; 1025];
    assert!(matches!(
        writer.upsert(&mut root, &too_long, b"v"),
        Err(cow_tree::Error::KeyTooLong),
    ));

    Ok(())
}

#[test]
fn random_soak_against_btreemap() -> cow_tree::Result<()> {
    use rand::prelude::*;

    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for _ in 0..4_000 {
        let key_len = rng.random_range(1..=32);
        let key: Vec<u8> = (0..key_len).map(|_| rng.random_range(b'a'..=b'f')).collect();

        if rng.random_bool(0.25) && !model.is_empty() {
            let expected = model.remove(&key);
            let removed = writer.remove(&mut root, &key)?;
            match expected {
                Some(v) => assert_eq!(v.len() as i64, removed),
                None => assert_eq!(-1, removed),
            }
        } else {
            let value_len = rng.random_range(0..=128);
            let value: Vec<u8> = (0..value_len).map(|_| rng.random()).collect();
            let prev = writer.upsert(&mut root, &key, &value)?;
            match model.insert(key, value) {
                Some(old) => assert_eq!(old.len() as i64, prev),
                None => assert_eq!(-1, prev),
            }
        }
    }

    assert_eq!(model.len() as u64, writer.validate(&root)?);

    for (key, value) in &model {
        assert_eq!(Some(value.clone()), writer.get(&root, key)?, "key {key:?}");
    }

    writer.set_top_root(0, &mut root)?;
    drop(writer);

    // full iteration agrees with the model, in order, exactly once
    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;
    let mut cursor = reader.lower_bound(&snapshot, b"")?;
    let mut walked = Vec::new();
    while let Some((k, v)) = cursor.pair()? {
        walked.push((k, v));
        cursor.next()?;
    }
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(expected, walked);

    Ok(())
}

#[test]
fn abort_restores_everything() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"committed", b"v")?;
    writer.set_top_root(0, &mut root)?;

    let ids_before = db.count_ids_in_use();
    let root_before = root.node_id();

    let mut scratch = writer.get_top_root(0)?;
    for i in 0..100u32 {
        let key = format!("temp{i:04}");
        writer.upsert(&mut scratch, key.as_bytes(), b"scratch-value")?;
    }
    writer.remove(&mut scratch, b"committed")?;
    writer.abort();
    drop(scratch);

    // the committed state is untouched and no IDs leaked
    assert_eq!(root_before, root.node_id());
    assert_eq!(Some(b"v".to_vec()), writer.get(&root, b"committed")?);
    assert_eq!(1, writer.validate(&root)?);
    assert_eq!(ids_before, db.count_ids_in_use());

    Ok(())
}

#[test]
fn retain_release_is_a_noop_on_observable_state() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"k", b"v")?;
    writer.set_top_root(0, &mut root)?;

    writer.retain(0)?;
    writer.release(0)?;

    assert_eq!(Some(b"v".to_vec()), writer.get(&root, b"k")?);
    assert_eq!(1, writer.validate(&root)?);

    Ok(())
}
