//! Database handle: column families, shared caches, background workers and
//! the transaction manager.

use crate::cache::CacheStats;
use crate::column_family::{CfContext, ColumnFamily};
use crate::comparator::{Comparator, ComparatorRegistry};
use crate::config::{ColumnFamilyConfig, Config, IsolationLevel};
use crate::flock::DirLock;
use crate::flush::{self, BackgroundPool};
use crate::logging;
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::sstable::TableEnv;
use crate::txn::{Transaction, TxnManager};
use crate::{Result, SeqNo, StorageError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "LOG";
const CF_DIR_PREFIX: &str = "cf-";

pub struct Database {
    config: Config,
    env: Arc<TableEnv>,
    comparators: ComparatorRegistry,
    mvcc: Arc<TxnManager>,
    pool: BackgroundPool,
    cfs: RwLock<BTreeMap<String, Arc<ColumnFamily>>>,
    next_cf_id: AtomicU32,
    /// Serializes create, drop, rename, clone, backup and checkpoint.
    admin: Mutex<()>,
    lock: Mutex<Option<DirLock>>,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_comparators(config, ComparatorRegistry::new())
    }

    /// Open with user comparators registered up front, as column families
    /// created with them need their comparator to reopen.
    pub fn open_with_comparators(config: Config, comparators: ComparatorRegistry) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.db_path)?;
        let log_file = config.log_to_file.then(|| config.db_path.join(LOG_FILE));
        logging::init(config.log_level, log_file.as_deref())?;
        let lock = DirLock::acquire(config.db_path.join(LOCK_FILE))?;

        let env = Arc::new(TableEnv::new(config.block_cache_size, config.max_open_sstables));
        let mvcc = Arc::new(TxnManager::new(0));
        let pool = BackgroundPool::start(config.num_flush_threads, config.num_compaction_threads)?;
        let ctx = CfContext {
            env: Arc::clone(&env),
            mvcc: Arc::clone(&mvcc),
            scheduler: pool.scheduler(),
        };

        let mut cfs = BTreeMap::new();
        let mut max_id = 0u32;
        let mut max_seq: SeqNo = 0;
        for (id, dir) in list_cf_dirs(&config.db_path)? {
            max_id = max_id.max(id);
            if !dir.join(MANIFEST_FILE).exists() {
                warn!(dir = %dir.display(), "column family directory without manifest, removing");
                fs::remove_dir_all(&dir)?;
                continue;
            }
            let manifest = Manifest::load(&dir)?;
            let comparator = comparators.resolve(&manifest.config.comparator_name)?;
            let name = manifest.name.clone();
            let (cf, seq) = ColumnFamily::open(ctx.clone(), dir, manifest, comparator)?;
            max_seq = max_seq.max(seq);
            cfs.insert(name, cf);
        }
        mvcc.restore(max_seq);

        info!(
            path = %config.db_path.display(),
            column_families = cfs.len(),
            seq = max_seq,
            "database opened"
        );

        let db = Database {
            config,
            env,
            comparators,
            mvcc,
            pool,
            cfs: RwLock::new(cfs),
            next_cf_id: AtomicU32::new(max_id + 1),
            admin: Mutex::new(()),
            lock: Mutex::new(Some(lock)),
        };
        for cf in db.cfs.read().values() {
            cf.maybe_schedule_compaction();
        }
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.config.db_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_open(&self) -> Result<()> {
        if self.mvcc.is_closed() {
            return Err(StorageError::InvalidDb);
        }
        Ok(())
    }

    /// Stop background work, sync the WALs and release the directory lock.
    /// Memtables are not flushed; the WAL replays them on the next open.
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        self.mvcc.close();
        self.pool.shutdown();
        let cfs = std::mem::take(&mut *self.cfs.write());
        for cf in cfs.values() {
            if let Err(e) = cf.sync_wal() {
                warn!(cf = %cf.name(), error = %e, "failed to sync WAL on close");
            }
        }
        drop(cfs);
        self.lock.lock().take();
        info!(path = %self.config.db_path.display(), "database closed");
        Ok(())
    }

    pub fn create_column_family(&self, name: &str, config: ColumnFamilyConfig) -> Result<Arc<ColumnFamily>> {
        self.check_open()?;
        if name.is_empty() {
            return Err(StorageError::InvalidArgs("column family name is empty".into()));
        }
        config.validate()?;
        let comparator = self.comparators.resolve(&config.comparator_name)?;

        let _admin = self.admin.lock();
        if self.cfs.read().contains_key(name) {
            return Err(StorageError::Exists(format!("column family {}", name)));
        }
        let id = self.next_cf_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.cf_dir(id);
        let manifest = Manifest::new(id, name, config);
        manifest.save(&dir)?;
        let (cf, _) = ColumnFamily::open(self.context(), dir, manifest, comparator)?;
        self.cfs.write().insert(name.to_string(), Arc::clone(&cf));
        info!(cf = name, id, "created column family");
        Ok(cf)
    }

    /// Remove `name` and delete its files. Open transactions writing to it
    /// fail at commit.
    pub fn drop_column_family(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let _admin = self.admin.lock();
        let cf = self
            .cfs
            .write()
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(format!("column family {}", name)))?;
        {
            let _quiet = cf.quiesce();
            let _commit = self.mvcc.commit_lock.lock();
            cf.mark_dropped();
        }
        fs::remove_dir_all(cf.dir())?;
        info!(cf = name, id = cf.id(), "dropped column family");
        Ok(())
    }

    /// Rename in place. The directory is keyed by id, so only the manifest
    /// is rewritten.
    pub fn rename_column_family(&self, old: &str, new: &str) -> Result<()> {
        self.check_open()?;
        if new.is_empty() {
            return Err(StorageError::InvalidArgs("column family name is empty".into()));
        }
        let _admin = self.admin.lock();
        let cf = {
            let cfs = self.cfs.read();
            if cfs.contains_key(new) {
                return Err(StorageError::Exists(format!("column family {}", new)));
            }
            cfs.get(old)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("column family {}", old)))?
        };

        // wait out flush and compaction before taking the map lock
        let _quiet = cf.quiesce();
        let mut cfs = self.cfs.write();
        cf.set_name(new);
        if let Err(e) = cf.save_manifest() {
            cf.set_name(old);
            return Err(e);
        }
        cfs.remove(old);
        cfs.insert(new.to_string(), cf.clone());
        info!(from = old, to = new, "renamed column family");
        Ok(())
    }

    /// Copy the committed state of `src` into a new, independent column
    /// family `dst`. Tables are hard-linked where the filesystem allows.
    pub fn clone_column_family(&self, src: &str, dst: &str) -> Result<Arc<ColumnFamily>> {
        self.check_open()?;
        if dst.is_empty() {
            return Err(StorageError::InvalidArgs("column family name is empty".into()));
        }
        let _admin = self.admin.lock();
        if self.cfs.read().contains_key(dst) {
            return Err(StorageError::Exists(format!("column family {}", dst)));
        }
        let source = self.get_column_family(src)?;

        let id = self.next_cf_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.cf_dir(id);
        let manifest = {
            let _quiet = source.quiesce();
            flush_quiesced(&self.mvcc, &source)?;
            fs::create_dir_all(&dir)?;
            for table in source.super_version().version.files() {
                let (klog, vlog) = table.paths();
                link_or_copy(klog, &dir)?;
                link_or_copy(vlog, &dir)?;
            }
            let mut manifest = Manifest::load(source.dir())?;
            manifest.id = id;
            manifest.name = dst.to_string();
            manifest.config = source.config();
            manifest
        };
        manifest.save(&dir)?;

        let comparator = Arc::clone(source.comparator());
        let (cf, _) = ColumnFamily::open(self.context(), dir, manifest, comparator)?;
        self.cfs.write().insert(dst.to_string(), Arc::clone(&cf));
        info!(from = src, to = dst, id, "cloned column family");
        Ok(cf)
    }

    pub fn get_column_family(&self, name: &str) -> Result<Arc<ColumnFamily>> {
        self.check_open()?;
        self.cfs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("column family {}", name)))
    }

    pub fn list_column_families(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.cfs.read().keys().cloned().collect())
    }

    /// Start a read-committed transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with_isolation(IsolationLevel::ReadCommitted)
    }

    /// Start a transaction at `cf`'s configured default isolation level.
    pub fn begin_for(&self, cf: &ColumnFamily) -> Result<Transaction> {
        self.begin_with_isolation(cf.config().default_isolation)
    }

    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<Transaction> {
        self.check_open()?;
        Transaction::begin(Arc::clone(&self.mvcc), isolation)
    }

    /// Last published commit sequence.
    pub fn latest_sequence(&self) -> SeqNo {
        self.mvcc.published()
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.check_open()?;
        Ok(self.env.block_cache.stats())
    }

    /// Make `comparator` available to column families created afterwards
    /// under `name`.
    pub fn register_comparator(
        &self,
        name: &str,
        comparator: Arc<dyn Comparator>,
        context: Option<String>,
    ) -> Result<()> {
        self.check_open()?;
        self.comparators.register(name, comparator, context)
    }

    pub fn comparators(&self) -> &ComparatorRegistry {
        &self.comparators
    }

    /// Copy every column family (tables, manifests and WAL segments) into
    /// the empty or missing directory `target` without flushing. The copy
    /// opens as a database holding at least every commit that was durable
    /// when the backup started.
    pub fn backup(&self, target: impl AsRef<Path>) -> Result<()> {
        self.check_open()?;
        let target = target.as_ref();
        prepare_target(target)?;
        let _admin = self.admin.lock();
        let cfs: Vec<Arc<ColumnFamily>> = self.cfs.read().values().cloned().collect();
        for cf in &cfs {
            let _quiet = cf.quiesce();
            cf.sync_wal()?;
            let dest = target.join(dir_name_of(cf.dir()));
            copy_dir(cf.dir(), &dest)?;
        }
        info!(target = %target.display(), column_families = cfs.len(), "backup complete");
        Ok(())
    }

    /// Flush every column family and hard-link its tables and manifest into
    /// the empty or missing directory `target`.
    pub fn checkpoint(&self, target: impl AsRef<Path>) -> Result<()> {
        self.check_open()?;
        let target = target.as_ref();
        prepare_target(target)?;
        let _admin = self.admin.lock();
        let cfs: Vec<Arc<ColumnFamily>> = self.cfs.read().values().cloned().collect();
        for cf in &cfs {
            let _quiet = cf.quiesce();
            flush_quiesced(&self.mvcc, cf)?;
            let dest = target.join(dir_name_of(cf.dir()));
            fs::create_dir_all(&dest)?;
            for table in cf.super_version().version.files() {
                let (klog, vlog) = table.paths();
                link_or_copy(klog, &dest)?;
                link_or_copy(vlog, &dest)?;
            }
            let mut manifest = Manifest::load(cf.dir())?;
            manifest.config = cf.config();
            manifest.save(&dest)?;
        }
        info!(target = %target.display(), column_families = cfs.len(), "checkpoint complete");
        Ok(())
    }

    fn context(&self) -> CfContext {
        CfContext {
            env: Arc::clone(&self.env),
            mvcc: Arc::clone(&self.mvcc),
            scheduler: self.pool.scheduler(),
        }
    }

    fn cf_dir(&self, id: u32) -> PathBuf {
        self.config.db_path.join(Manifest::dir_name(id))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.mvcc.is_closed() {
            if let Err(e) = self.close() {
                warn!(error = %e, "close on drop failed");
            }
        }
    }
}

/// Seal and flush every memtable of a quiesced column family.
fn flush_quiesced(mvcc: &TxnManager, cf: &Arc<ColumnFamily>) -> Result<()> {
    {
        let _commit = mvcc.commit_lock.lock();
        cf.rotate_memtable()?;
    }
    flush::flush_immutables(cf)
}

fn list_cf_dirs(root: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix(CF_DIR_PREFIX))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(id) = id {
            dirs.push((id, entry.path()));
        }
    }
    dirs.sort_by_key(|(id, _)| *id);
    Ok(dirs)
}

fn dir_name_of(dir: &Path) -> PathBuf {
    dir.file_name().map(PathBuf::from).unwrap_or_default()
}

/// Backup and checkpoint targets must be missing or empty.
fn prepare_target(target: &Path) -> Result<()> {
    if target.exists() && fs::read_dir(target)?.next().is_some() {
        return Err(StorageError::Exists(format!(
            "{} is not empty",
            target.display()
        )));
    }
    fs::create_dir_all(target)?;
    Ok(())
}

fn link_or_copy(src: &Path, dest_dir: &Path) -> Result<()> {
    let Some(name) = src.file_name() else {
        return Ok(());
    };
    let dest = dest_dir.join(name);
    if fs::hard_link(src, &dest).is_err() {
        fs::copy(src, &dest)?;
        debug!(file = %src.display(), "hard link failed, copied instead");
    }
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            copy_dir(&path, &dest.join(entry.file_name()))?;
        } else if path.extension().map_or(true, |e| e != "tmp") {
            fs::copy(&path, dest.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(path: &Path) -> Config {
        Config {
            num_flush_threads: 1,
            num_compaction_threads: 1,
            ..Config::new(path)
        }
    }

    fn cf_config() -> ColumnFamilyConfig {
        ColumnFamilyConfig {
            min_disk_space: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_second_open_is_locked() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        assert!(matches!(
            Database::open(test_config(dir.path())),
            Err(StorageError::Locked(_))
        ));
        db.close()?;
        let again = Database::open(test_config(dir.path()))?;
        again.close()?;
        Ok(())
    }

    #[test]
    fn test_closed_database_rejects_operations() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        db.create_column_family("cf", cf_config())?;
        db.close()?;
        assert!(matches!(db.begin(), Err(StorageError::InvalidDb)));
        assert!(matches!(db.list_column_families(), Err(StorageError::InvalidDb)));
        assert!(matches!(db.close(), Err(StorageError::InvalidDb)));
        Ok(())
    }

    #[test]
    fn test_column_family_lifecycle() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        db.create_column_family("a", cf_config())?;
        assert!(matches!(
            db.create_column_family("a", cf_config()),
            Err(StorageError::Exists(_))
        ));
        assert!(matches!(
            db.create_column_family("", cf_config()),
            Err(StorageError::InvalidArgs(_))
        ));
        db.create_column_family("b", cf_config())?;
        assert_eq!(db.list_column_families()?, vec!["a", "b"]);

        let b_dir = db.get_column_family("b")?.dir().to_path_buf();
        db.drop_column_family("b")?;
        assert!(!b_dir.exists());
        assert!(matches!(
            db.get_column_family("b"),
            Err(StorageError::NotFound(_))
        ));

        db.rename_column_family("a", "c")?;
        assert_eq!(db.list_column_families()?, vec!["c"]);
        assert!(matches!(
            db.rename_column_family("a", "d"),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_failed_wal_append_aborts_whole_commit() -> Result<()> {
        let dir = tempdir()?;
        {
            let db = Database::open(test_config(dir.path()))?;
            let a = db.create_column_family("a", cf_config())?;
            let b = db.create_column_family("b", cf_config())?;
            let mut txn = db.begin()?;
            txn.put(&a, b"k", b"old")?;
            txn.put(&b, b"k", b"old")?;
            txn.commit()?;
            assert_eq!(db.latest_sequence(), 1);

            b.break_wal()?;
            let mut txn = db.begin()?;
            txn.put(&a, b"k", b"new")?;
            txn.put(&b, b"k", b"new")?;
            assert!(matches!(txn.commit(), Err(StorageError::Io(_))));
            assert_eq!(db.latest_sequence(), 1);

            let mut next = db.begin()?;
            assert_eq!(&next.get(&a, b"k")?[..], b"old");
            next.put(&a, b"z", b"1")?;
            next.commit()?;
            // the aborted commit's sequence is never reused
            assert_eq!(db.latest_sequence(), 3);
            let mut check = db.begin_with_isolation(IsolationLevel::RepeatableRead)?;
            assert_eq!(&check.get(&a, b"k")?[..], b"old");
        }

        let db = Database::open(test_config(dir.path()))?;
        assert_eq!(db.latest_sequence(), 3);
        let a = db.get_column_family("a")?;
        let b = db.get_column_family("b")?;
        let mut txn = db.begin()?;
        assert_eq!(&txn.get(&a, b"k")?[..], b"old");
        assert_eq!(&txn.get(&a, b"z")?[..], b"1");
        assert_eq!(&txn.get(&b, b"k")?[..], b"old");
        Ok(())
    }

    #[test]
    fn test_begin_for_uses_column_family_default() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        let cf = db.create_column_family(
            "strict",
            ColumnFamilyConfig {
                default_isolation: IsolationLevel::Serializable,
                ..cf_config()
            },
        )?;
        assert_eq!(db.begin_for(&cf)?.isolation(), IsolationLevel::Serializable);
        assert_eq!(db.begin()?.isolation(), IsolationLevel::ReadCommitted);
        Ok(())
    }

    #[test]
    fn test_commits_racing_drop_never_touch_dropped_family() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        let cf = db.create_column_family("doomed", cf_config())?;
        let cf_dir = cf.dir().to_path_buf();
        let dropped = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| -> Result<()> {
            let writer = s.spawn(|| -> Result<usize> {
                let mut after_drop = 0;
                for i in 0..500 {
                    let was_dropped = dropped.load(Ordering::SeqCst);
                    let mut txn = db.begin()?;
                    txn.put(&cf, format!("k{}", i).as_bytes(), b"v")?;
                    match txn.commit() {
                        Ok(()) if was_dropped => after_drop += 1,
                        Ok(()) => {}
                        Err(StorageError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(after_drop)
            });
            std::thread::sleep(std::time::Duration::from_millis(5));
            db.drop_column_family("doomed")?;
            dropped.store(true, Ordering::SeqCst);
            let after_drop = writer.join().map_err(|_| StorageError::Unknown("writer panicked".into()))??;
            assert_eq!(after_drop, 0);
            Ok(())
        })?;
        assert!(!cf_dir.exists());
        Ok(())
    }

    #[test]
    fn test_unknown_comparator_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::open(test_config(dir.path()))?;
        let config = ColumnFamilyConfig {
            comparator_name: "nope".into(),
            ..cf_config()
        };
        assert!(matches!(
            db.create_column_family("x", config),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }
}
