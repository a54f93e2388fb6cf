// WAL segment lifecycle: one segment per memtable, deleted once flushed.

use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tidesdb::{ColumnFamilyConfig, Config, Database, Result, SyncMode};

fn count_wal_segments(cf_dir: &Path) -> usize {
    fs::read_dir(cf_dir.join("wal"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("wal"))
                .count()
        })
        .unwrap_or(0)
}

fn open_db(path: &Path) -> Result<Database> {
    Database::open(Config {
        num_flush_threads: 1,
        num_compaction_threads: 1,
        ..Config::new(path)
    })
}

#[test]
fn test_wal_cleanup() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family(
        "wal",
        ColumnFamilyConfig {
            min_disk_space: 0,
            sync_mode: SyncMode::None,
            ..Default::default()
        },
    )?;
    assert_eq!(count_wal_segments(cf.dir()), 1);

    for round in 0..3 {
        let mut txn = db.begin()?;
        for i in 0..100 {
            txn.put(&cf, format!("r{}-{:03}", round, i).as_bytes(), &[0u8; 200])?;
        }
        txn.commit()?;
        cf.flush_memtable()?;
        assert_eq!(count_wal_segments(cf.dir()), 1, "flushed segments must be removed");
    }
    assert_eq!(cf.stats().level_num_sstables[0], 3);
    Ok(())
}

#[test]
fn test_wal_recovery_after_cleanup() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open_db(dir.path())?;
        let cf = db.create_column_family(
            "wal",
            ColumnFamilyConfig {
                min_disk_space: 0,
                ..Default::default()
            },
        )?;
        let mut txn = db.begin()?;
        txn.put(&cf, b"flushed", b"1")?;
        txn.commit()?;
        cf.flush_memtable()?;

        let mut txn = db.begin()?;
        txn.put(&cf, b"pending", b"2")?;
        txn.commit()?;
        db.close()?;
    }

    let db = open_db(dir.path())?;
    let cf = db.get_column_family("wal")?;
    // replayed memtable is flushed on open, leaving only the fresh segment
    assert_eq!(count_wal_segments(cf.dir()), 1);
    assert_eq!(cf.stats().level_num_sstables[0], 2);

    let mut txn = db.begin()?;
    assert_eq!(&txn.get(&cf, b"flushed")?[..], b"1");
    assert_eq!(&txn.get(&cf, b"pending")?[..], b"2");
    Ok(())
}

#[test]
fn test_wal_segment_rotation() -> Result<()> {
    let dir = tempdir()?;
    let db = open_db(dir.path())?;
    let cf = db.create_column_family(
        "rotating",
        ColumnFamilyConfig {
            min_disk_space: 0,
            sync_mode: SyncMode::None,
            write_buffer_size: 8 * 1024,
            l1_file_count_trigger: 64,
            l0_queue_stall_threshold: 64,
            ..Default::default()
        },
    )?;

    for i in 0..500 {
        let mut txn = db.begin()?;
        txn.put(&cf, format!("key{:04}", i).as_bytes(), &[1u8; 100])?;
        txn.commit()?;
    }
    cf.flush_memtable()?;

    assert_eq!(count_wal_segments(cf.dir()), 1);
    assert!(cf.stats().level_num_sstables[0] > 1);
    assert!(cf.metrics().flushes_total.get() > 1);
    Ok(())
}
