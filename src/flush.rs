//! Background flush and compaction workers.
//!
//! Two fixed pools of named threads pull jobs from crossbeam channels.
//! A job names a column family; the column family's own job flags make
//! sure at most one flush and one compaction run on it at a time.

use crate::column_family::{ColumnFamily, JobKind, SuperVersion};
use crate::compaction;
use crate::sstable::{SsTableReader, SsTableWriter, WriterOptions};
use crate::version::{Version, VersionEdit};
use crate::wal::Wal;
use crate::{Result, StorageError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use sysinfo::Disks;
use tracing::{debug, error, info, warn};

pub(crate) enum Job {
    Flush(Arc<ColumnFamily>),
    Compact(Arc<ColumnFamily>),
    Shutdown,
}

/// Sending side of the worker pools.
pub(crate) struct Scheduler {
    flush_tx: Sender<Job>,
    compact_tx: Sender<Job>,
    closed: AtomicBool,
}

impl Scheduler {
    /// A scheduler whose jobs go nowhere.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (flush_tx, _) = unbounded();
        let (compact_tx, _) = unbounded();
        Scheduler {
            flush_tx,
            compact_tx,
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, tx: &Sender<Job>, job: Job) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = tx.send(job) {
            debug!(error = %e, "background pool gone, job dropped");
        }
    }

    pub(crate) fn submit_flush(&self, cf: Arc<ColumnFamily>) {
        self.send(&self.flush_tx, Job::Flush(cf));
    }

    pub(crate) fn submit_compaction(&self, cf: Arc<ColumnFamily>) {
        self.send(&self.compact_tx, Job::Compact(cf));
    }
}

pub(crate) struct BackgroundPool {
    scheduler: Arc<Scheduler>,
    flush_workers: usize,
    compaction_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundPool {
    pub(crate) fn start(flush_workers: usize, compaction_workers: usize) -> Result<Self> {
        let (flush_tx, flush_rx) = unbounded();
        let (compact_tx, compact_rx) = unbounded();
        let mut handles = Vec::with_capacity(flush_workers + compaction_workers);

        for i in 0..flush_workers {
            handles.push(spawn_worker(format!("tidesdb-flush-{}", i), flush_rx.clone())?);
        }
        for i in 0..compaction_workers {
            handles.push(spawn_worker(format!("tidesdb-compact-{}", i), compact_rx.clone())?);
        }
        info!(flush_workers, compaction_workers, "started background workers");

        Ok(BackgroundPool {
            scheduler: Arc::new(Scheduler {
                flush_tx,
                compact_tx,
                closed: AtomicBool::new(false),
            }),
            flush_workers,
            compaction_workers,
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Stop accepting jobs, let the workers finish the current ones and
    /// join them. Jobs still queued are dropped.
    pub(crate) fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        self.scheduler.closed.store(true, Ordering::Release);
        for _ in 0..self.flush_workers {
            let _ = self.scheduler.flush_tx.send(Job::Shutdown);
        }
        for _ in 0..self.compaction_workers {
            let _ = self.scheduler.compact_tx.send(Job::Shutdown);
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("background worker panicked");
            }
        }
        debug!("background workers stopped");
    }
}

fn spawn_worker(name: String, rx: Receiver<Job>) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(rx))?;
    Ok(handle)
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Flush(cf) => run_flush_job(&cf),
            Job::Compact(cf) => run_compaction_job(&cf),
            Job::Shutdown => break,
        }
    }
}

fn run_flush_job(cf: &Arc<ColumnFamily>) {
    if cf.is_dropped() {
        return;
    }
    let Some(job) = cf.try_begin(JobKind::Flush) else {
        return;
    };
    let min_free = cf.config().min_disk_space;
    let result = check_disk_space(cf.dir(), min_free).and_then(|_| flush_immutables(cf));
    drop(job);
    match result {
        Ok(()) => cf.maybe_schedule_compaction(),
        Err(e) => error!(cf = %cf.name(), error = %e, "flush failed"),
    }
}

fn run_compaction_job(cf: &Arc<ColumnFamily>) {
    if cf.is_dropped() {
        return;
    }
    let Some(_job) = cf.try_begin(JobKind::Compaction) else {
        return;
    };
    let min_free = cf.config().min_disk_space;
    if let Err(e) = check_disk_space(cf.dir(), min_free) {
        error!(cf = %cf.name(), error = %e, "compaction skipped");
        return;
    }
    if let Err(e) = compaction::compact_triggered(cf) {
        error!(cf = %cf.name(), error = %e, "compaction failed");
    }
}

/// Fails with `MemoryLimit` when the volume holding `dir` has less than
/// `min_free` bytes available. Unknown volumes pass.
pub(crate) fn check_disk_space(dir: &Path, min_free: u64) -> Result<()> {
    if min_free == 0 {
        return Ok(());
    }
    let dir = dir.canonicalize()?;
    let disks = Disks::new_with_refreshed_list();
    let volume = disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());
    match volume {
        Some(disk) if disk.available_space() < min_free => Err(StorageError::MemoryLimit(format!(
            "{} bytes free on {}, need {}",
            disk.available_space(),
            disk.mount_point().display(),
            min_free
        ))),
        _ => Ok(()),
    }
}

/// Write every sealed memtable of `cf` to level 0, oldest first. The
/// caller owns the column family's flush slot.
pub(crate) fn flush_immutables(cf: &Arc<ColumnFamily>) -> Result<()> {
    while let Some(mt) = cf.super_version().immutables.last().cloned() {
        let start = Instant::now();
        let entries = mt.entries();
        let table = if entries.is_empty() {
            None
        } else {
            let file_id = cf.allocate_file_id();
            let opts = WriterOptions::from_config(&cf.config(), cf.comparator().is_bytewise());
            let mut writer = SsTableWriter::create(cf.dir(), file_id, opts)?;
            for e in &entries {
                if let Err(err) = writer.add(e) {
                    writer.abandon();
                    return Err(err);
                }
            }
            writer.finish()?;
            Some(Arc::new(SsTableReader::open(
                cf.dir(),
                file_id,
                Arc::clone(cf.env()),
                Arc::clone(cf.comparator()),
                Arc::clone(cf.metrics()),
            )?))
        };

        let bytes = table.as_ref().map_or(0, |t| t.size_bytes());
        cf.swap_state(|sv| {
            let mut edit = VersionEdit::default();
            if let Some(t) = &table {
                edit.added.push((0, Arc::clone(t)));
            }
            sv_without(sv, mt.id(), sv.version.apply(edit))
        });
        cf.advance_flushed_seq(mt.max_seq());
        cf.save_manifest()?;
        if let Err(e) = Wal::remove_segments_through(&cf.dir().join("wal"), mt.id()) {
            warn!(cf = %cf.name(), error = %e, "failed to remove flushed WAL segments");
        }

        cf.metrics().flushes_total.inc();
        cf.metrics().flush_duration.observe(start.elapsed());
        info!(
            cf = %cf.name(),
            memtable = mt.id(),
            entries = entries.len(),
            bytes,
            "flushed memtable to level 0"
        );
    }
    Ok(())
}

fn sv_without(sv: &SuperVersion, memtable_id: u64, version: Version) -> SuperVersion {
    SuperVersion {
        active: Arc::clone(&sv.active),
        immutables: sv
            .immutables
            .iter()
            .filter(|m| m.id() != memtable_id)
            .cloned()
            .collect(),
        version: Arc::new(version),
    }
}
