use cow_tree::{ChecksumPolicy, Config, Error, RecoverArgs, SyncKind};
use test_log::test;

fn config(folder: &std::path::Path) -> Config {
    Config::new(folder)
        .segment_size(1 << 20)
        .max_database_size(1 << 28)
        .max_objects(1 << 20)
}

#[test]
fn reload_smoke_test() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = config(folder.path()).open()?;
        let mut writer = db.start_write_session()?;
        let mut root = writer.get_top_root(0)?;
        writer.upsert(&mut root, b"a", b"a")?;
        writer.set_top_root(0, &mut root)?;
        drop(writer);
        db.flush(SyncKind::Sync)?;
    }

    {
        let db = config(folder.path()).open()?;
        let reader = db.start_read_session()?;
        let snapshot = reader.get_top_root(0)?;
        assert_eq!(Some(b"a".to_vec()), reader.get(&snapshot, b"a")?);
    }

    Ok(())
}

#[test]
fn reload_many_keys_and_roots() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = config(folder.path()).open()?;
        let mut writer = db.start_write_session()?;

        let mut main = writer.get_top_root(0)?;
        for n in 0..1_000u32 {
            let key = format!("key/{n:06}");
            writer.upsert(&mut main, key.as_bytes(), &n.to_le_bytes())?;
        }
        writer.set_top_root(0, &mut main)?;

        let mut side = writer.get_top_root(9)?;
        writer.upsert(&mut side, b"side", b"table")?;
        writer.set_top_root(9, &mut side)?;
    }

    {
        let db = config(folder.path()).open()?;
        let reader = db.start_read_session()?;

        let main = reader.get_top_root(0)?;
        for n in (0..1_000u32).step_by(37) {
            let key = format!("key/{n:06}");
            assert_eq!(
                Some(n.to_le_bytes().to_vec()),
                reader.get(&main, key.as_bytes())?,
            );
        }

        let side = reader.get_top_root(9)?;
        assert_eq!(Some(b"table".to_vec()), reader.get(&side, b"side")?);

        // the durable state still passes a structural audit
        drop(reader);
        let writer = db.start_write_session()?;
        let main = writer.get_top_root(0)?;
        assert_eq!(1_000, writer.validate(&main)?);
    }

    Ok(())
}

#[test]
fn reopen_with_checksum_validation() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = config(folder.path()).open()?;
        let mut writer = db.start_write_session()?;
        let mut root = writer.get_top_root(0)?;
        for n in 0..500u32 {
            writer.upsert(&mut root, format!("{n:04}").as_bytes(), b"payload")?;
        }
        writer.set_top_root(0, &mut root)?;
        drop(writer);
        // the OnMsync policy stamps checksums while flushing
        db.flush(SyncKind::Sync)?;
    }

    {
        let db = config(folder.path())
            .recover_args(RecoverArgs {
                validate_checksum: true,
                recover_unsync: false,
            })
            .open()?;
        let reader = db.start_read_session()?;
        let root = reader.get_top_root(0)?;
        assert_eq!(Some(b"payload".to_vec()), reader.get(&root, b"0123")?);
    }

    Ok(())
}

#[test]
fn reopen_accepts_unsynced_tail_when_asked() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = config(folder.path()).open()?;
        let mut writer = db.start_write_session()?;
        let mut root = writer.get_top_root(0)?;
        writer.upsert(&mut root, b"k", b"v")?;
        writer.set_top_root(0, &mut root)?;
    }

    {
        let db = config(folder.path())
            .recover_args(RecoverArgs {
                validate_checksum: false,
                recover_unsync: true,
            })
            .open()?;
        let reader = db.start_read_session()?;
        let root = reader.get_top_root(0)?;
        assert_eq!(Some(b"v".to_vec()), reader.get(&root, b"k")?);
    }

    Ok(())
}

#[test]
fn incompatible_layout_is_rejected() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = config(folder.path()).open()?;
        drop(db);
    }

    let result = config(folder.path()).segment_size(2 << 20).open();
    assert!(matches!(result, Err(Error::ConfigMismatch)));

    Ok(())
}

#[test]
fn verify_on_read_needs_eager_checksums() {
    // the deferred policies blank checksums between modify and restore
    let result = Config::new("unused")
        .checksum_policy(ChecksumPolicy::OnCompact)
        .verify_checksums_on_read(true)
        .open();
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn two_processes_cannot_share_read_write() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;

    let first = config(folder.path()).open()?;
    let second = config(folder.path()).open();
    assert!(second.is_err(), "the folder lock must exclude a second writer");
    drop(first);

    assert!(config(folder.path()).open().is_ok());
    Ok(())
}
