//! MVCC transactions.
//!
//! Every commit takes the next sequence number under the database commit
//! lock, logs its batch to the WAL of each touched column family, applies it
//! to the active memtables and only then publishes the sequence. Readers
//! never see a sequence above the published one, so a commit spanning
//! several column families becomes visible all at once.
//!
//! Snapshots of repeatable-read and serializable transactions are
//! registered with the [`TxnManager`]; the smallest live snapshot is the
//! watermark below which compaction may discard shadowed versions.

use crate::column_family::ColumnFamily;
use crate::config::IsolationLevel;
use crate::iterator::DbIterator;
use crate::metrics::Timer;
use crate::{now_secs, Entry, Result, SeqNo, StorageError, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Sequence numbers and live snapshots of one database.
pub(crate) struct TxnManager {
    /// Serializes commits, memtable rotation and sequence assignment.
    pub(crate) commit_lock: Mutex<()>,
    /// Highest sequence handed to a commit, published or not.
    allocated: AtomicU64,
    published: AtomicU64,
    snapshots: Mutex<BTreeMap<SeqNo, usize>>,
    closed: AtomicBool,
}

impl TxnManager {
    pub(crate) fn new(last_seq: SeqNo) -> Self {
        TxnManager {
            commit_lock: Mutex::new(()),
            allocated: AtomicU64::new(last_seq),
            published: AtomicU64::new(last_seq),
            snapshots: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn published(&self) -> SeqNo {
        self.published.load(AtomicOrdering::Acquire)
    }

    /// Next commit sequence. A failed commit never returns its number, so
    /// no two batches are ever logged under the same sequence. Caller holds
    /// the commit lock.
    fn allocate(&self) -> SeqNo {
        self.allocated.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    fn publish(&self, seq: SeqNo) {
        self.published.store(seq, AtomicOrdering::Release);
    }

    /// Raise the published sequence to `seq` found on disk at open.
    pub(crate) fn restore(&self, seq: SeqNo) {
        self.allocated.fetch_max(seq, AtomicOrdering::AcqRel);
        self.published.fetch_max(seq, AtomicOrdering::AcqRel);
    }

    /// Register a snapshot at the current published sequence. Reading the
    /// sequence under the registry lock keeps the watermark from passing
    /// a snapshot that is being taken.
    fn register_current(&self) -> SeqNo {
        let mut snapshots = self.snapshots.lock();
        let seq = self.published();
        *snapshots.entry(seq).or_insert(0) += 1;
        seq
    }

    fn unregister(&self, seq: SeqNo) {
        let mut snapshots = self.snapshots.lock();
        if let Some(n) = snapshots.get_mut(&seq) {
            *n -= 1;
            if *n == 0 {
                snapshots.remove(&seq);
            }
        }
    }

    /// Oldest sequence a live reader may still ask for.
    pub(crate) fn watermark(&self) -> SeqNo {
        let snapshots = self.snapshots.lock();
        match snapshots.keys().next() {
            Some(&oldest) => oldest,
            None => self.published(),
        }
    }

    pub(crate) fn live_snapshots(&self) -> usize {
        self.snapshots.lock().values().sum()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
    Freed,
}

struct CfWrites {
    cf: Arc<ColumnFamily>,
    /// Pending operations in call order; `seq` is assigned at commit.
    ops: Vec<Entry>,
}

struct Savepoint {
    name: String,
    writes: BTreeMap<u32, usize>,
    reads: usize,
}

pub struct Transaction {
    mgr: Arc<TxnManager>,
    isolation: IsolationLevel,
    start_seq: SeqNo,
    registered: bool,
    state: TxnState,
    writes: BTreeMap<u32, CfWrites>,
    reads: Vec<(Arc<ColumnFamily>, Bytes)>,
    savepoints: Vec<Savepoint>,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidArgs("key is empty".into()));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(StorageError::TooLarge(format!(
            "key of {} bytes exceeds {}",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(())
}

impl Transaction {
    pub(crate) fn begin(mgr: Arc<TxnManager>, isolation: IsolationLevel) -> Result<Self> {
        if mgr.is_closed() {
            return Err(StorageError::InvalidDb);
        }
        let mut txn = Transaction {
            mgr,
            isolation,
            start_seq: 0,
            registered: false,
            state: TxnState::Active,
            writes: BTreeMap::new(),
            reads: Vec::new(),
            savepoints: Vec::new(),
        };
        txn.take_snapshot();
        Ok(txn)
    }

    fn take_snapshot(&mut self) {
        self.release_snapshot();
        if self.isolation == IsolationLevel::ReadCommitted {
            self.start_seq = self.mgr.published();
        } else {
            self.start_seq = self.mgr.register_current();
            self.registered = true;
        }
        trace!(seq = self.start_seq, isolation = ?self.isolation, "transaction snapshot");
    }

    fn release_snapshot(&mut self) {
        if self.registered {
            self.mgr.unregister(self.start_seq);
            self.registered = false;
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn start_sequence(&self) -> SeqNo {
        self.start_seq
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn check_active(&self) -> Result<()> {
        if self.mgr.is_closed() {
            return Err(StorageError::InvalidDb);
        }
        match self.state {
            TxnState::Active => Ok(()),
            other => Err(StorageError::InvalidState(format!("transaction is {:?}", other))),
        }
    }

    /// Sequence bound for reads made now.
    fn read_bound(&self) -> SeqNo {
        match self.isolation {
            IsolationLevel::ReadCommitted => self.mgr.published(),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => self.start_seq,
        }
    }

    fn buffer(&mut self, cf: &Arc<ColumnFamily>, entry: Entry) {
        self.writes
            .entry(cf.id())
            .or_insert_with(|| CfWrites {
                cf: Arc::clone(cf),
                ops: Vec::new(),
            })
            .ops
            .push(entry);
    }

    pub fn put(&mut self, cf: &Arc<ColumnFamily>, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_ttl(cf, key, value, None)
    }

    /// `ttl` is an absolute expiration time in Unix seconds.
    pub fn put_with_ttl(
        &mut self,
        cf: &Arc<ColumnFamily>,
        key: &[u8],
        value: &[u8],
        ttl: Option<u64>,
    ) -> Result<()> {
        self.check_active()?;
        check_key(key)?;
        if value.len() as u64 > MAX_VALUE_SIZE {
            return Err(StorageError::TooLarge(format!("value of {} bytes", value.len())));
        }
        let entry = Entry::put(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
            0,
            ttl.unwrap_or(0),
        );
        self.buffer(cf, entry);
        Ok(())
    }

    pub fn delete(&mut self, cf: &Arc<ColumnFamily>, key: &[u8]) -> Result<()> {
        self.check_active()?;
        check_key(key)?;
        self.buffer(cf, Entry::delete(Bytes::copy_from_slice(key), 0));
        Ok(())
    }

    /// Current value of `key`, seeing this transaction's own writes first.
    pub fn get(&mut self, cf: &Arc<ColumnFamily>, key: &[u8]) -> Result<Bytes> {
        self.check_active()?;
        check_key(key)?;
        let not_found = || StorageError::NotFound(String::from_utf8_lossy(key).into_owned());

        if let Some(w) = self.writes.get(&cf.id()) {
            let cmp = cf.comparator();
            if let Some(e) = w
                .ops
                .iter()
                .rev()
                .find(|e| cmp.compare(&e.key, key) == Ordering::Equal)
            {
                return if e.is_dead(now_secs()) {
                    Err(not_found())
                } else {
                    Ok(e.value.clone())
                };
            }
        }

        if self.isolation == IsolationLevel::Serializable {
            self.reads.push((Arc::clone(cf), Bytes::copy_from_slice(key)));
        }
        cf.get_visible(key, self.read_bound())?
            .map(|e| e.value)
            .ok_or_else(not_found)
    }

    /// Iterator over `cf` under this transaction's read bound, pending
    /// writes included.
    pub fn new_iterator(&self, cf: &Arc<ColumnFamily>) -> Result<DbIterator> {
        self.check_active()?;
        let pending = self
            .writes
            .get(&cf.id())
            .map(|w| w.ops.clone())
            .unwrap_or_default();
        Ok(DbIterator::new(Arc::clone(cf), self.read_bound(), pending))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;
        if self.writes.values().all(|w| w.ops.is_empty()) {
            self.state = TxnState::Committed;
            self.release_snapshot();
            return Ok(());
        }

        for w in self.writes.values() {
            if w.cf.is_dropped() {
                return Err(StorageError::NotFound(format!("column family {}", w.cf.name())));
            }
            w.cf.wait_for_write_stall();
        }

        let mut rotated = Vec::new();
        let seq = {
            let _commit = self.mgr.commit_lock.lock();
            // drop_column_family marks under this lock
            if let Some(w) = self.writes.values().find(|w| w.cf.is_dropped()) {
                return Err(StorageError::NotFound(format!("column family {}", w.cf.name())));
            }
            if self.isolation == IsolationLevel::Serializable {
                self.validate()?;
            }
            let seq = self.mgr.allocate();

            let batches: Vec<(&Arc<ColumnFamily>, Vec<Entry>)> = self
                .writes
                .values()
                .filter(|w| !w.ops.is_empty())
                .map(|w| {
                    let ops = w.ops.iter().cloned().map(|mut e| {
                        e.seq = seq;
                        e
                    });
                    (&w.cf, ops.collect())
                })
                .collect();

            // Nothing reaches a memtable until every WAL accepted the batch.
            let mut logged: Vec<(&Arc<ColumnFamily>, u64)> = Vec::with_capacity(batches.len());
            for (cf, batch) in &batches {
                match cf.log_batch(seq, batch) {
                    Ok(offset) => logged.push((cf, offset)),
                    Err(e) => {
                        for (done, offset) in logged {
                            if let Err(undo) = done.unlog(offset) {
                                error!(cf = %done.name(), seq, error = %undo, "failed to remove aborted batch from WAL");
                            }
                        }
                        warn!(cf = %cf.name(), seq, error = %e, "commit aborted, WAL append failed");
                        return Err(e);
                    }
                }
            }
            for (cf, batch) in &batches {
                let _timer = Timer::new(&cf.metrics().commit_latency);
                cf.apply_batch(seq, batch);
            }
            self.mgr.publish(seq);

            for (cf, _) in &batches {
                match cf.rotate_if_full() {
                    Ok(true) => rotated.push(Arc::clone(cf)),
                    Ok(false) => {}
                    Err(e) => warn!(cf = %cf.name(), error = %e, "memtable rotation failed, retrying on next commit"),
                }
            }
            seq
        };

        for cf in rotated {
            cf.schedule_flush();
        }
        debug!(seq, cfs = self.writes.len(), "committed transaction");
        self.state = TxnState::Committed;
        self.release_snapshot();
        Ok(())
    }

    /// Fails with `Conflict` when a key this transaction read has a newer
    /// committed version than its snapshot.
    fn validate(&self) -> Result<()> {
        for (cf, key) in &self.reads {
            if let Some(seq) = cf.latest_seq(key)? {
                if seq > self.start_seq {
                    return Err(StorageError::Conflict(format!(
                        "{:?} in {} changed at seq {} after snapshot {}",
                        String::from_utf8_lossy(key),
                        cf.name(),
                        seq,
                        self.start_seq
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        self.writes.clear();
        self.reads.clear();
        self.savepoints.clear();
        self.state = TxnState::RolledBack;
        self.release_snapshot();
        Ok(())
    }

    /// Mark the current write position. Reusing a name replaces the older
    /// savepoint of that name.
    pub fn savepoint(&mut self, name: &str) -> Result<()> {
        self.check_active()?;
        if name.is_empty() {
            return Err(StorageError::InvalidArgs("savepoint name is empty".into()));
        }
        self.savepoints.retain(|s| s.name != name);
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            writes: self.writes.iter().map(|(id, w)| (*id, w.ops.len())).collect(),
            reads: self.reads.len(),
        });
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        if name.is_empty() {
            return Err(StorageError::InvalidArgs("savepoint name is empty".into()));
        }
        self.savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| StorageError::NotFound(format!("savepoint {}", name)))
    }

    /// Undo every write made after `name`. The savepoint itself survives,
    /// later ones are dropped.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.check_active()?;
        let idx = self.find_savepoint(name)?;
        self.savepoints.truncate(idx + 1);
        let sp = &self.savepoints[idx];
        self.writes.retain(|id, w| match sp.writes.get(id) {
            Some(&len) => {
                w.ops.truncate(len);
                true
            }
            None => false,
        });
        self.reads.truncate(sp.reads);
        Ok(())
    }

    /// Forget `name` and every later savepoint, keeping the writes.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.check_active()?;
        let idx = self.find_savepoint(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    /// Reuse a finished transaction with a fresh snapshot.
    pub fn reset(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.mgr.is_closed() {
            return Err(StorageError::InvalidDb);
        }
        match self.state {
            TxnState::Committed | TxnState::RolledBack => {}
            other => {
                return Err(StorageError::InvalidState(format!(
                    "cannot reset a transaction that is {:?}",
                    other
                )))
            }
        }
        self.writes.clear();
        self.reads.clear();
        self.savepoints.clear();
        self.isolation = isolation;
        self.state = TxnState::Active;
        self.take_snapshot();
        Ok(())
    }

    /// Release the snapshot. The handle is unusable afterwards.
    pub fn free(&mut self) {
        if self.state == TxnState::Active {
            debug!(seq = self.start_seq, "freeing active transaction, rolling back");
        }
        self.writes.clear();
        self.reads.clear();
        self.savepoints.clear();
        self.release_snapshot();
        self.state = TxnState::Freed;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Freed {
            self.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_tracks_oldest_snapshot() {
        let mgr = Arc::new(TxnManager::new(10));
        assert_eq!(mgr.watermark(), 10);

        let mut a = Transaction::begin(Arc::clone(&mgr), IsolationLevel::RepeatableRead).unwrap();
        mgr.publish(15);
        let b = Transaction::begin(Arc::clone(&mgr), IsolationLevel::Serializable).unwrap();
        let c = Transaction::begin(Arc::clone(&mgr), IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(mgr.live_snapshots(), 2);
        assert_eq!(mgr.watermark(), 10);

        a.free();
        assert_eq!(mgr.watermark(), 15);
        drop(b);
        drop(c);
        assert_eq!(mgr.live_snapshots(), 0);
    }

    #[test]
    fn test_watermark_never_passes_snapshot_being_taken() {
        let mgr = Arc::new(TxnManager::new(0));
        let floor = AtomicU64::new(0);
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for seq in 1..=20_000 {
                    mgr.publish(seq);
                }
                done.store(true, AtomicOrdering::Release);
            });
            s.spawn(|| {
                while !done.load(AtomicOrdering::Acquire) {
                    floor.fetch_max(mgr.watermark(), AtomicOrdering::AcqRel);
                }
            });
            while !done.load(AtomicOrdering::Acquire) {
                let txn =
                    Transaction::begin(Arc::clone(&mgr), IsolationLevel::RepeatableRead).unwrap();
                // every watermark computed so far either saw this snapshot
                // or an older published sequence
                assert!(floor.load(AtomicOrdering::Acquire) <= txn.start_sequence());
                drop(txn);
            }
        });
        assert_eq!(mgr.live_snapshots(), 0);
    }

    #[test]
    fn test_reset_requires_finished_transaction() {
        let mgr = Arc::new(TxnManager::new(0));
        let mut txn = Transaction::begin(Arc::clone(&mgr), IsolationLevel::ReadCommitted).unwrap();
        assert!(matches!(
            txn.reset(IsolationLevel::Serializable),
            Err(StorageError::InvalidState(_))
        ));
        txn.commit().unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        mgr.publish(4);
        txn.reset(IsolationLevel::Serializable).unwrap();
        assert_eq!(txn.start_sequence(), 4);
        assert_eq!(txn.isolation(), IsolationLevel::Serializable);

        txn.free();
        assert!(matches!(txn.commit(), Err(StorageError::InvalidState(_))));
        assert!(matches!(txn.savepoint("x"), Err(StorageError::InvalidState(_))));
    }

    #[test]
    fn test_closed_manager_rejects_begin() {
        let mgr = Arc::new(TxnManager::new(0));
        mgr.close();
        assert!(matches!(
            Transaction::begin(mgr, IsolationLevel::ReadCommitted),
            Err(StorageError::InvalidDb)
        ));
    }
}
