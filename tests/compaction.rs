use cow_tree::{Config, Database, SyncKind};
use test_log::test;

fn open(folder: &std::path::Path) -> cow_tree::Result<Database> {
    Config::new(folder)
        .segment_size(1 << 20)
        .max_database_size(1 << 28)
        .max_objects(1 << 20)
        .open()
}

/// Fills several segments, deletes most keys, and drives compaction by
/// hand until the engine reports no more candidates. The surviving data
/// must be intact and auditable afterwards.
#[test]
fn manual_compaction_reclaims_space() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let payload = vec![0xabu8; 2_048];
    {
        let mut writer = db.start_write_session()?;
        let mut root = writer.get_top_root(0)?;
        for n in 0..2_000u32 {
            let key = format!("bulk/{n:06}");
            writer.upsert(&mut root, key.as_bytes(), &payload)?;
        }
        writer.set_top_root(0, &mut root)?;

        // delete 95%, leaving the segments mostly dead
        for n in 0..2_000u32 {
            if n % 20 != 0 {
                let key = format!("bulk/{n:06}");
                assert!(writer.remove(&mut root, key.as_bytes())? >= 0);
            }
        }
        writer.set_top_root(0, &mut root)?;
        assert_eq!(100, writer.validate(&root)?);
    } // dropping the session seals its active segment

    // give the gc thread a moment to pay out the retired roots, then
    // drive the compactor until it runs dry
    std::thread::sleep(std::time::Duration::from_millis(200));
    let mut passes = 0;
    while db.compact_next_segment()? {
        passes += 1;
        assert!(passes < 1_024, "compaction never converged");
    }

    std::thread::sleep(std::time::Duration::from_millis(200));

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;
    for n in (0..2_000u32).step_by(20) {
        let key = format!("bulk/{n:06}");
        assert_eq!(
            Some(payload.clone()),
            reader.get(&snapshot, key.as_bytes())?,
            "{key} lost during compaction",
        );
    }
    drop(snapshot);
    drop(reader);

    let writer = db.start_write_session()?;
    let root = writer.get_top_root(0)?;
    assert_eq!(100, writer.validate(&root)?);

    Ok(())
}

/// Readers traversing a snapshot while the compactor relocates nodes
/// underneath must never notice: the ID indirection hides the move.
#[test]
fn reads_survive_concurrent_compaction() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = std::sync::Arc::new(open(folder.path())?);

    let payload = vec![0x5au8; 1_024];
    {
        let mut writer = db.start_write_session()?;
        let mut root = writer.get_top_root(0)?;
        for n in 0..3_000u32 {
            let key = format!("{n:06}");
            writer.upsert(&mut root, key.as_bytes(), &payload)?;
        }
        writer.set_top_root(0, &mut root)?;
        for n in 0..3_000u32 {
            if n % 10 != 0 {
                writer.remove(&mut root, format!("{n:06}").as_bytes())?;
            }
        }
        writer.set_top_root(0, &mut root)?;
    }

    std::thread::scope(|scope| -> cow_tree::Result<()> {
        let compact_db = std::sync::Arc::clone(&db);
        let compactor = scope.spawn(move || -> cow_tree::Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(100));
            while compact_db.compact_next_segment()? {}
            Ok(())
        });

        let reader = db.start_read_session()?;
        for _ in 0..50 {
            let snapshot = reader.get_top_root(0)?;
            let mut cursor = reader.lower_bound(&snapshot, b"")?;
            let mut count = 0;
            while let Some((_, value)) = cursor.pair()? {
                assert_eq!(payload, value);
                count += 1;
                cursor.next()?;
            }
            assert_eq!(300, count);
        }

        compactor.join().map_err(|_| cow_tree::Error::Poisoned)??;
        Ok(())
    })?;

    Ok(())
}

#[test]
fn stats_render() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    writer.upsert(&mut root, b"k", b"v")?;
    writer.set_top_root(0, &mut root)?;
    drop(root);
    drop(writer);
    db.flush(SyncKind::Sync)?;

    let mut out = Vec::new();
    db.print_stats(&mut out, true)?;
    let text = String::from_utf8(out).expect("utf8 stats");

    assert!(text.contains("segments:"));
    assert!(text.contains("top roots: 1 of 256 occupied"));
    assert!(text.contains("segment      0"));

    Ok(())
}
