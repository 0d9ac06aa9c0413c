use cow_tree::{Config, Database, Error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use test_log::test;

fn open(folder: &std::path::Path) -> cow_tree::Result<Database> {
    Config::new(folder)
        .segment_size(1 << 20)
        .max_database_size(1 << 28)
        .max_objects(1 << 20)
        .open()
}

#[test]
fn only_one_write_session() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let writer = db.start_write_session()?;
    assert!(matches!(
        db.start_write_session(),
        Err(Error::WriterActive),
    ));
    drop(writer);

    assert!(db.start_write_session().is_ok());
    Ok(())
}

#[test]
fn readers_are_isolated_from_later_commits() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"k", b"old")?;
    writer.set_top_root(0, &mut root)?;

    let reader = db.start_read_session()?;
    let before = reader.get_top_root(0)?;

    writer.upsert(&mut root, b"k", b"new")?;
    writer.upsert(&mut root, b"extra", b"x")?;
    writer.set_top_root(0, &mut root)?;

    // the pinned snapshot still shows the old world
    assert_eq!(Some(b"old".to_vec()), reader.get(&before, b"k")?);
    assert_eq!(None, reader.get(&before, b"extra")?);

    // a fresh load sees the new commit
    let after = reader.get_top_root(0)?;
    assert_eq!(Some(b"new".to_vec()), reader.get(&after, b"k")?);
    assert_eq!(Some(b"x".to_vec()), reader.get(&after, b"extra")?);

    Ok(())
}

#[test]
fn fork_preserves_the_forked_state() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"a", b"1")?;
    writer.set_top_root(0, &mut root)?;

    // freeze the current state, then keep editing the same handle
    let frozen = writer.get_top_root(0)?;
    writer.fork();
    writer.upsert(&mut root, b"a", b"2")?;
    writer.upsert(&mut root, b"b", b"3")?;

    assert_eq!(Some(b"1".to_vec()), writer.get(&frozen, b"a")?);
    assert_eq!(None, writer.get(&frozen, b"b")?);
    assert_eq!(Some(b"2".to_vec()), writer.get(&root, b"a")?);

    Ok(())
}

#[test]
fn concurrent_readers_see_consistent_prefixes() -> cow_tree::Result<()> {
    const KEY_COUNT: u64 = 150;

    let folder = tempfile::tempdir()?;
    let db = Arc::new(open(folder.path())?);
    let committed = Arc::new(AtomicU64::new(0));

    std::thread::scope(|scope| -> cow_tree::Result<()> {
        let writer_db = Arc::clone(&db);
        let writer_progress = Arc::clone(&committed);
        let writer = scope.spawn(move || -> cow_tree::Result<()> {
            let mut writer = writer_db.start_write_session()?;
            let mut root = writer.get_top_root(0)?;
            for n in 1..=KEY_COUNT {
                let key = format!("{n:06}");
                writer.upsert(&mut root, key.as_bytes(), key.as_bytes())?;
                writer.set_top_root(0, &mut root)?;
                writer_progress.store(n, Ordering::Release);
            }
            Ok(())
        });

        let mut readers = Vec::new();
        for _ in 0..3 {
            let reader_db = Arc::clone(&db);
            let progress = Arc::clone(&committed);
            readers.push(scope.spawn(move || -> cow_tree::Result<()> {
                let reader = reader_db.start_read_session()?;
                loop {
                    let low_water = progress.load(Ordering::Acquire);
                    let snapshot = reader.get_top_root(0)?;

                    // keys observed must be exactly 1..=k for some k that
                    // is at least what had been committed at pin time
                    let mut cursor = reader.lower_bound(&snapshot, b"")?;
                    let mut seen = 0u64;
                    while let Some((key, value)) = cursor.pair()? {
                        seen += 1;
                        let expected = format!("{seen:06}").into_bytes();
                        assert_eq!(expected, key, "phantom or vanished key");
                        assert_eq!(key, value);
                        cursor.next()?;
                    }
                    assert!(
                        seen >= low_water,
                        "snapshot lost committed keys: saw {seen}, expected >= {low_water}",
                    );

                    if seen == KEY_COUNT {
                        return Ok(());
                    }
                }
            }));
        }

        writer.join().map_err(|_| Error::Poisoned)??;
        for reader in readers {
            reader.join().map_err(|_| Error::Poisoned)??;
        }
        Ok(())
    })?;

    Ok(())
}

#[test]
fn session_revision_pins_a_snapshot() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"v", b"1")?;
    writer.set_top_root(0, &mut root)?;

    let mut reader = db.start_read_session()?;
    let pin = reader.get_top_root(0)?;
    reader.set_session_revision(pin);

    writer.upsert(&mut root, b"v", b"2")?;
    writer.set_top_root(0, &mut root)?;

    let pinned = reader.session_revision().expect("pinned");
    assert_eq!(Some(b"1".to_vec()), reader.get(pinned, b"v")?);

    Ok(())
}

#[test]
fn defunct_roots_after_abort_are_rejected() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"a", b"1")?;
    writer.abort();

    assert!(root.is_defunct());
    assert!(matches!(writer.get(&root, b"a"), Err(Error::Aborted)));
    assert!(matches!(
        writer.upsert(&mut root, b"a", b"1"),
        Err(Error::Aborted),
    ));

    // a fresh handle works again
    let root = writer.get_top_root(0)?;
    assert!(!root.is_defunct());
    assert_eq!(None, writer.get(&root, b"a")?);

    Ok(())
}

#[test]
fn abort_signal_aborts_the_next_operation() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"live", b"x")?;

    writer.abort_signal().store(true, Ordering::Release);

    assert!(matches!(
        writer.upsert(&mut root, b"more", b"y"),
        Err(Error::Aborted),
    ));

    // the session is usable again after the rollback
    let mut root = writer.get_top_root(0)?;
    assert_eq!(-1, writer.upsert(&mut root, b"fresh", b"z")?);
    writer.set_top_root(0, &mut root)?;

    Ok(())
}
