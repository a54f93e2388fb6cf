use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tidesdb::{
    now_secs, ColumnFamily, ColumnFamilyConfig, Config, Database, IsolationLevel, Result,
    StorageError, SyncMode,
};

fn open_db(path: &Path) -> Result<Database> {
    Database::open(Config {
        num_flush_threads: 1,
        num_compaction_threads: 1,
        ..Config::new(path)
    })
}

fn cf_config() -> ColumnFamilyConfig {
    ColumnFamilyConfig {
        min_disk_space: 0,
        sync_mode: SyncMode::None,
        ..Default::default()
    }
}

fn put(db: &Database, cf: &Arc<ColumnFamily>, key: &[u8], value: &[u8]) -> Result<()> {
    let mut txn = db.begin()?;
    txn.put(cf, key, value)?;
    txn.commit()
}

#[test]
fn test_basic_put_and_get() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.put(&cf, b"key1", b"value1")?;
    txn.put(&cf, b"key2", b"value2")?;
    txn.put(&cf, b"key3", b"value3")?;
    txn.commit()?;

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"key1")?[..], b"value1");
    assert_eq!(&txn.get(&cf, b"key2")?[..], b"value2");
    assert_eq!(&txn.get(&cf, b"key3")?[..], b"value3");
    assert!(matches!(
        txn.get(&cf, b"nonexistent"),
        Err(StorageError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn test_overwrite_and_delete() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    put(&db, &cf, b"key", b"value1")?;
    put(&db, &cf, b"key", b"value2")?;
    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"key")?[..], b"value2");

    let mut del = db.begin()?;
    del.delete(&cf, b"key")?;
    del.commit()?;

    let mut txn = db.begin()?;
    assert!(txn.get(&cf, b"key").is_err());
    Ok(())
}

#[test]
fn test_deleted_key_stays_deleted_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    put(&db, &cf, b"gone", b"v")?;
    cf.flush_memtable()?;
    let mut del = db.begin()?;
    del.delete(&cf, b"gone")?;
    del.commit()?;
    cf.flush_memtable()?;

    let mut txn = db.begin()?;
    assert!(matches!(txn.get(&cf, b"gone"), Err(StorageError::NotFound(_))));
    Ok(())
}

#[test]
fn test_ttl_expiry() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.put_with_ttl(&cf, b"temp", b"soon gone", Some(now_secs() + 2))?;
    txn.put_with_ttl(&cf, b"forever", b"stays", None)?;
    txn.commit()?;

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"temp")?[..], b"soon gone");

    thread::sleep(Duration::from_secs(3));

    let mut txn = db.begin()?;
    assert!(matches!(txn.get(&cf, b"temp"), Err(StorageError::NotFound(_))));
    assert_eq!(&txn.get(&cf, b"forever")?[..], b"stays");

    let mut it = txn.new_iterator(&cf)?;
    it.seek_to_first()?;
    assert_eq!(it.key()?, b"forever");
    it.next()?;
    assert!(!it.valid());
    Ok(())
}

#[test]
fn test_savepoints() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.put(&cf, b"key1", b"value1")?;
    txn.savepoint("sp1")?;
    txn.put(&cf, b"key2", b"value2")?;
    txn.rollback_to_savepoint("sp1")?;
    txn.put(&cf, b"key3", b"value3")?;
    assert!(matches!(
        txn.rollback_to_savepoint("missing"),
        Err(StorageError::NotFound(_))
    ));
    txn.commit()?;

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"key1")?[..], b"value1");
    assert!(matches!(txn.get(&cf, b"key2"), Err(StorageError::NotFound(_))));
    assert_eq!(&txn.get(&cf, b"key3")?[..], b"value3");
    Ok(())
}

#[test]
fn test_release_savepoint_keeps_writes() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.savepoint("outer")?;
    txn.put(&cf, b"a", b"1")?;
    txn.savepoint("inner")?;
    txn.put(&cf, b"b", b"2")?;
    txn.release_savepoint("inner")?;
    assert!(txn.rollback_to_savepoint("inner").is_err());
    txn.commit()?;

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"a")?[..], b"1");
    assert_eq!(&txn.get(&cf, b"b")?[..], b"2");
    Ok(())
}

fn check_iteration(use_btree: bool) -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family(
        "iter",
        ColumnFamilyConfig {
            use_btree,
            ..cf_config()
        },
    )?;

    let mut txn = db.begin()?;
    for i in (0..10).rev() {
        txn.put(&cf, format!("key{:02}", i).as_bytes(), format!("value{}", i).as_bytes())?;
    }
    txn.commit()?;

    let txn = db.begin()?;
    let mut it = txn.new_iterator(&cf)?;
    it.seek_to_first()?;
    let mut forward = Vec::new();
    while it.valid() {
        forward.push(String::from_utf8_lossy(it.key()?).into_owned());
        it.next()?;
    }
    let expected: Vec<String> = (0..10).map(|i| format!("key{:02}", i)).collect();
    assert_eq!(forward, expected);

    it.seek_to_last()?;
    let mut backward = Vec::new();
    while it.valid() {
        backward.push(String::from_utf8_lossy(it.key()?).into_owned());
        it.prev()?;
    }
    let reversed: Vec<String> = expected.iter().rev().cloned().collect();
    assert_eq!(backward, reversed);

    it.seek(b"key05")?;
    assert_eq!(it.value()?, b"value5");
    it.seek_for_prev(b"key055")?;
    assert_eq!(it.key()?, b"key05");
    Ok(())
}

#[test]
fn test_iteration_skip_list() -> Result<()> {
    check_iteration(false)
}

#[test]
fn test_iteration_btree() -> Result<()> {
    check_iteration(true)
}

#[test]
fn test_key_validation() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    assert!(matches!(txn.put(&cf, b"", b"v"), Err(StorageError::InvalidArgs(_))));
    assert!(matches!(txn.get(&cf, b""), Err(StorageError::InvalidArgs(_))));
    let huge = vec![b'k'; tidesdb::MAX_KEY_SIZE + 1];
    assert!(matches!(txn.put(&cf, &huge, b"v"), Err(StorageError::TooLarge(_))));
    Ok(())
}

#[test]
fn test_large_values_round_trip_through_vlog() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("blobs", cf_config())?;

    let big = vec![7u8; 64 * 1024];
    put(&db, &cf, b"big", &big)?;
    put(&db, &cf, b"small", b"tiny")?;
    cf.flush_memtable()?;

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"big")?[..], &big[..]);
    assert_eq!(&txn.get(&cf, b"small")?[..], b"tiny");
    Ok(())
}

#[test]
fn test_range_cost() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    for i in 0..1000 {
        txn.put(&cf, format!("key{:04}", i).as_bytes(), &[0u8; 100])?;
    }
    txn.commit()?;
    cf.flush_memtable()?;

    let narrow = cf.range_cost(b"key0100", b"key0110")?;
    let wide = cf.range_cost(b"key0000", b"key0999")?;
    assert!(wide > 0.0);
    assert!(wide >= narrow);
    assert_eq!(cf.range_cost(b"key0999", b"key0000")?, wide);
    Ok(())
}

#[test]
fn test_isolation_level_transactions() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    for isolation in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        let mut txn = db.begin_with_isolation(isolation)?;
        assert_eq!(txn.isolation(), isolation);
        txn.put(&cf, b"k", format!("{:?}", isolation).as_bytes())?;
        txn.commit()?;
    }
    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"k")?[..], b"Serializable");
    Ok(())
}
