use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use tidesdb::{
    ColumnFamilyConfig, CommitOp, Config, Database, IsolationLevel, Result, SeqNo,
    StorageError, SyncMode,
};
use tidesdb::txn::TxnState;

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

#[test]
fn test_read_committed_sees_new_commits() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut reader = db.begin_with_isolation(IsolationLevel::ReadCommitted)?;
    assert!(reader.get(&cf, b"k").is_err());

    let mut writer = db.begin()?;
    writer.put(&cf, b"k", b"v1")?;
    writer.commit()?;

    assert_eq!(&reader.get(&cf, b"k")?[..], b"v1");
    Ok(())
}

#[test]
fn test_repeatable_read_keeps_snapshot() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut setup = db.begin()?;
    setup.put(&cf, b"k", b"old")?;
    setup.commit()?;

    let mut reader = db.begin_with_isolation(IsolationLevel::RepeatableRead)?;
    assert_eq!(&reader.get(&cf, b"k")?[..], b"old");

    let mut writer = db.begin()?;
    writer.put(&cf, b"k", b"new")?;
    writer.put(&cf, b"other", b"x")?;
    writer.commit()?;
    cf.flush_memtable()?;

    assert_eq!(&reader.get(&cf, b"k")?[..], b"old");
    assert!(matches!(reader.get(&cf, b"other"), Err(StorageError::NotFound(_))));
    reader.commit()?;

    let mut fresh = db.begin_with_isolation(IsolationLevel::RepeatableRead)?;
    assert_eq!(&fresh.get(&cf, b"k")?[..], b"new");
    Ok(())
}

#[test]
fn test_serializable_conflict() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut setup = db.begin()?;
    setup.put(&cf, b"balance", b"100")?;
    setup.commit()?;

    let mut t1 = db.begin_with_isolation(IsolationLevel::Serializable)?;
    let mut t2 = db.begin_with_isolation(IsolationLevel::Serializable)?;
    assert_eq!(&t1.get(&cf, b"balance")?[..], b"100");
    assert_eq!(&t2.get(&cf, b"balance")?[..], b"100");

    t1.put(&cf, b"balance", b"50")?;
    t2.put(&cf, b"balance", b"70")?;
    t1.commit()?;

    let err = t2.commit().err();
    assert!(matches!(err, Some(StorageError::Conflict(_))));
    assert_eq!(t2.state(), TxnState::Active);
    t2.rollback()?;

    let mut check = db.begin()?;
    assert_eq!(&check.get(&cf, b"balance")?[..], b"50");
    Ok(())
}

#[test]
fn test_serializable_without_overlap_commits() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut t1 = db.begin_with_isolation(IsolationLevel::Serializable)?;
    let mut t2 = db.begin_with_isolation(IsolationLevel::Serializable)?;
    let _ = t1.get(&cf, b"a");
    let _ = t2.get(&cf, b"b");
    t1.put(&cf, b"a", b"1")?;
    t2.put(&cf, b"b", b"2")?;
    t1.commit()?;
    t2.commit()?;
    Ok(())
}

#[test]
fn test_reset_and_free() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.put(&cf, b"k1", b"v1")?;
    assert!(matches!(
        txn.reset(IsolationLevel::ReadCommitted),
        Err(StorageError::InvalidState(_))
    ));
    txn.commit()?;
    assert_eq!(txn.state(), TxnState::Committed);
    assert!(txn.put(&cf, b"k2", b"v2").is_err());

    txn.reset(IsolationLevel::RepeatableRead)?;
    assert_eq!(txn.state(), TxnState::Active);
    assert_eq!(txn.isolation(), IsolationLevel::RepeatableRead);
    txn.put(&cf, b"k2", b"v2")?;
    txn.commit()?;

    txn.free();
    assert_eq!(txn.state(), TxnState::Freed);
    assert!(txn.reset(IsolationLevel::ReadCommitted).is_err());

    let mut check = db.begin()?;
    assert_eq!(&check.get(&cf, b"k1")?[..], b"v1");
    assert_eq!(&check.get(&cf, b"k2")?[..], b"v2");
    Ok(())
}

#[test]
fn test_rollback_discards_writes() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let mut txn = db.begin()?;
    txn.put(&cf, b"k", b"v")?;
    assert_eq!(&txn.get(&cf, b"k")?[..], b"v");
    txn.rollback()?;
    assert!(txn.commit().is_err());

    let mut check = db.begin()?;
    assert!(matches!(check.get(&cf, b"k"), Err(StorageError::NotFound(_))));
    Ok(())
}

#[test]
fn test_multi_column_family_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let users = db.create_column_family("users", cf_config())?;
    let index = db.create_column_family("index", cf_config())?;

    let before = db.latest_sequence();
    let mut txn = db.begin()?;
    txn.put(&users, b"u1", b"alice")?;
    txn.put(&index, b"alice", b"u1")?;
    txn.commit()?;
    assert_eq!(db.latest_sequence(), before + 1);

    let mut check = db.begin()?;
    assert_eq!(&check.get(&users, b"u1")?[..], b"alice");
    assert_eq!(&check.get(&index, b"alice")?[..], b"u1");
    assert!(check.get(&users, b"alice").is_err());
    Ok(())
}

#[test]
fn test_commit_hook_receives_batch() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    let seen: Arc<Mutex<Vec<(Vec<CommitOp>, SeqNo)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cf.set_commit_hook(move |ops: &[CommitOp], seq: SeqNo| -> i32 {
        sink.lock().push((ops.to_vec(), seq));
        0
    });
    assert!(cf.has_commit_hook());

    let mut txn = db.begin()?;
    txn.put(&cf, b"a", b"1")?;
    txn.put(&cf, b"b", b"2")?;
    txn.delete(&cf, b"c")?;
    txn.commit()?;

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (ops, seq) = &seen[0];
        assert_eq!(*seq, db.latest_sequence());
        assert_eq!(ops.len(), 3);
        assert_eq!(&ops[0].key[..], b"a");
        assert!(!ops[0].delete);
        assert_eq!(&ops[2].key[..], b"c");
        assert!(ops[2].delete);
    }

    cf.clear_commit_hook();
    let mut txn = db.begin()?;
    txn.put(&cf, b"d", b"4")?;
    txn.commit()?;
    assert_eq!(seen.lock().len(), 1);
    Ok(())
}

#[test]
fn test_failing_hook_does_not_abort_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;

    cf.set_commit_hook(|_: &[CommitOp], _: SeqNo| -> i32 { -1 });
    let mut txn = db.begin()?;
    txn.put(&cf, b"k", b"v")?;
    txn.commit()?;

    cf.set_commit_hook(|_: &[CommitOp], _: SeqNo| -> i32 { panic!("hook exploded") });
    let mut txn = db.begin()?;
    txn.put(&cf, b"k2", b"v2")?;
    txn.commit()?;

    let mut check = db.begin()?;
    assert_eq!(&check.get(&cf, b"k")?[..], b"v");
    assert_eq!(&check.get(&cf, b"k2")?[..], b"v2");
    assert_eq!(cf.metrics().hook_failures.get(), 2);
    Ok(())
}

#[test]
fn test_concurrent_writers_get_distinct_sequences() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("default", cf_config())?;
    let commits = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..4 {
            let (db, cf, commits) = (&db, &cf, &commits);
            s.spawn(move || -> Result<()> {
                for i in 0..50 {
                    let mut txn = db.begin()?;
                    txn.put(cf, format!("t{}-{}", t, i).as_bytes(), b"v")?;
                    txn.commit()?;
                    commits.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            });
        }
    });

    assert_eq!(commits.load(Ordering::SeqCst), 200);
    assert_eq!(db.latest_sequence(), 200);

    let txn = db.begin()?;
    let mut it = txn.new_iterator(&cf)?;
    it.seek_to_first()?;
    let mut count = 0;
    while it.valid() {
        count += 1;
        it.next()?;
    }
    assert_eq!(count, 200);
    Ok(())
}

#[test]
fn test_dropped_column_family_rejects_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family("doomed", cf_config())?;

    let mut txn = db.begin()?;
    txn.put(&cf, b"k", b"v")?;
    db.drop_column_family("doomed")?;
    assert!(matches!(txn.commit(), Err(StorageError::NotFound(_))));
    Ok(())
}
