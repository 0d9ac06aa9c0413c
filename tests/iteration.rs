use cow_tree::{Config, Database};
use test_log::test;

fn open(folder: &std::path::Path) -> cow_tree::Result<Database> {
    Config::new(folder)
        .segment_size(1 << 20)
        .max_database_size(1 << 28)
        .max_objects(1 << 20)
        .open()
}

fn keys() -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"a".to_vec(),
        b"aa".to_vec(),
        b"ab".to_vec(),
        b"abc".to_vec(),
        b"abd".to_vec(),
        b"b".to_vec(),
        b"ba\xff".to_vec(),
        b"z".repeat(100),
    ];
    for i in 0..300u32 {
        keys.push(format!("seq/{i:05}").into_bytes());
    }
    keys.sort();
    keys
}

fn populate(db: &Database) -> cow_tree::Result<()> {
    let mut writer = db.start_write_session()?;
    let mut root = writer.get_top_root(0)?;
    for key in keys() {
        writer.upsert(&mut root, &key, &key)?;
    }
    writer.set_top_root(0, &mut root)?;
    Ok(())
}

#[test]
fn forward_iteration_is_sorted_and_complete() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;
    populate(&db)?;

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let mut cursor = reader.lower_bound(&snapshot, b"")?;
    let mut walked = Vec::new();
    while let Some((key, value)) = cursor.pair()? {
        assert_eq!(key, value);
        walked.push(key);
        cursor.next()?;
    }

    assert_eq!(keys(), walked);
    Ok(())
}

#[test]
fn backward_iteration_mirrors_forward() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;
    populate(&db)?;

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let mut cursor = reader.lower_bound(&snapshot, b"")?;
    cursor.seek_last()?;

    let mut walked = Vec::new();
    while let Some((key, _)) = cursor.pair()? {
        walked.push(key);
        cursor.previous()?;
    }

    let mut expected = keys();
    expected.reverse();
    assert_eq!(expected, walked);
    Ok(())
}

#[test]
fn seek_lands_on_lower_bound() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;
    populate(&db)?;

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;
    let mut cursor = reader.lower_bound(&snapshot, b"")?;

    cursor.seek(b"ab")?;
    assert_eq!(Some(b"ab".as_slice()), cursor.key());

    cursor.seek(b"abb")?;
    assert_eq!(Some(b"abc".as_slice()), cursor.key());

    cursor.seek(b"seq/00123")?;
    assert_eq!(Some(b"seq/00123".as_slice()), cursor.key());

    cursor.seek(b"seq/09999")?;
    assert_eq!(Some(b"z".repeat(100).as_slice()), cursor.key());

    cursor.seek(b"zzzz")?;
    assert!(!cursor.is_valid());

    Ok(())
}

#[test]
fn one_shot_wrappers() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;
    populate(&db)?;

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(0)?;

    let (key, _) = reader.get_greater_equal(&snapshot, b"ab")?.expect("hit");
    assert_eq!(b"ab".to_vec(), key);

    let (key, _) = reader.get_less_than(&snapshot, b"ab")?.expect("hit");
    assert_eq!(b"aa".to_vec(), key);

    // strictly less: an exact match does not count
    let (key, _) = reader.get_less_than(&snapshot, b"a")?.expect("hit");
    assert_eq!(b"".to_vec(), key);

    let (key, _) = reader.get_max(&snapshot)?.expect("hit");
    assert_eq!(b"z".repeat(100), key);

    assert_eq!(None, reader.get_less_than(&snapshot, b"")?);

    Ok(())
}

#[test]
fn iteration_over_empty_root() -> cow_tree::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = open(folder.path())?;

    let reader = db.start_read_session()?;
    let snapshot = reader.get_top_root(7)?;
    assert!(snapshot.is_null());

    let mut cursor = reader.lower_bound(&snapshot, b"")?;
    assert!(!cursor.is_valid());
    assert_eq!(None, cursor.pair()?);
    assert!(!cursor.next()?);

    assert_eq!(None, reader.get_max(&snapshot)?);
    assert_eq!(None, reader.get_greater_equal(&snapshot, b"")?);

    Ok(())
}
