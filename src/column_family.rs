//! Column family: one memtable, one WAL, one set of levels.
//!
//! The read state (active memtable, sealed memtables, level layout) lives
//! in an immutable [`SuperVersion`] swapped under a short write lock.
//! Readers clone the `Arc` and never block flush or compaction.

use crate::compaction;
use crate::comparator::Comparator;
use crate::config::{ColumnFamilyConfig, RuntimeConfigUpdate};
use crate::flush::{self, Scheduler};
use crate::hook::{self, CommitHook};
use crate::manifest::Manifest;
use crate::memtable::{MemTable, MemTableShape};
use crate::metrics::{ColumnFamilyMetrics, MetricsSnapshot, Timer};
use crate::sstable::{SsTableReader, TableEnv, DEFAULT_BLOCK_SIZE};
use crate::txn::TxnManager;
use crate::version::{Version, VersionEdit};
use crate::wal::Wal;
use crate::{now_secs, Entry, Result, SeqNo, StorageError};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STALL_LIMIT: Duration = Duration::from_secs(5);
const STALL_SLICE: Duration = Duration::from_millis(100);

/// Everything a read needs, captured at one instant.
pub struct SuperVersion {
    pub active: Arc<MemTable>,
    /// Sealed memtables waiting for flush, newest first.
    pub immutables: Vec<Arc<MemTable>>,
    pub version: Arc<Version>,
}

impl SuperVersion {
    pub fn memtables(&self) -> impl Iterator<Item = &Arc<MemTable>> {
        std::iter::once(&self.active).chain(self.immutables.iter())
    }

    /// Newest version of `key` at `snapshot`, tombstones included.
    pub fn get(&self, key: &[u8], snapshot: SeqNo) -> Result<Option<Entry>> {
        for mt in self.memtables() {
            if let Some(e) = mt.get(key, snapshot) {
                return Ok(Some(e));
            }
        }
        self.version.get(key, snapshot)
    }
}

/// Handles shared by every column family of a database.
#[derive(Clone)]
pub(crate) struct CfContext {
    pub env: Arc<TableEnv>,
    pub mvcc: Arc<TxnManager>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Flush,
    Compaction,
}

#[derive(Default)]
struct BgState {
    flushing: bool,
    compacting: bool,
    flush_queued: bool,
    compaction_queued: bool,
    paused: usize,
}

impl BgState {
    fn running(&mut self, kind: JobKind) -> &mut bool {
        match kind {
            JobKind::Flush => &mut self.flushing,
            JobKind::Compaction => &mut self.compacting,
        }
    }

    fn queued(&mut self, kind: JobKind) -> &mut bool {
        match kind {
            JobKind::Flush => &mut self.flush_queued,
            JobKind::Compaction => &mut self.compaction_queued,
        }
    }
}

/// Exclusive right to run one job kind on a column family.
pub(crate) struct JobGuard<'a> {
    cf: &'a Arc<ColumnFamily>,
    kind: JobKind,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let requeue = {
            let mut bg = self.cf.bg.lock();
            *bg.running(self.kind) = false;
            let queued = bg.paused == 0 && std::mem::take(bg.queued(self.kind));
            self.cf.bg_cv.notify_all();
            queued
        };
        if requeue {
            self.cf.submit(self.kind);
        }
    }
}

/// Holds background work off a column family while alive.
pub(crate) struct QuiesceGuard<'a> {
    cf: &'a Arc<ColumnFamily>,
}

impl Drop for QuiesceGuard<'_> {
    fn drop(&mut self) {
        let (flush, compact) = {
            let mut bg = self.cf.bg.lock();
            bg.paused -= 1;
            self.cf.bg_cv.notify_all();
            if bg.paused > 0 {
                (false, false)
            } else {
                (
                    std::mem::take(&mut bg.flush_queued),
                    std::mem::take(&mut bg.compaction_queued),
                )
            }
        };
        if flush {
            self.cf.submit(JobKind::Flush);
        }
        if compact {
            self.cf.submit(JobKind::Compaction);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnFamilyStats {
    pub name: String,
    pub num_levels: usize,
    /// Bytes held by the active and sealed memtables.
    pub memtable_size: u64,
    pub memtable_entries: u64,
    pub immutable_memtables: usize,
    pub level_sizes: Vec<u64>,
    pub level_num_sstables: Vec<usize>,
    pub level_key_counts: Vec<u64>,
    pub total_keys: u64,
    pub total_data_size: u64,
    pub avg_key_size: f64,
    pub avg_value_size: f64,
    /// Sources a point lookup may read in the worst case.
    pub read_amp: f64,
    pub hit_rate: f64,
    pub use_btree: bool,
    pub btree_total_nodes: u64,
    pub btree_max_height: u32,
    pub btree_avg_height: f64,
    pub config: ColumnFamilyConfig,
    pub metrics: MetricsSnapshot,
}

pub struct ColumnFamily {
    id: u32,
    name: RwLock<String>,
    dir: PathBuf,
    config: RwLock<ColumnFamilyConfig>,
    comparator: Arc<dyn Comparator>,
    ctx: CfContext,
    metrics: Arc<ColumnFamilyMetrics>,
    state: RwLock<Arc<SuperVersion>>,
    wal: Mutex<Wal>,
    hook: RwLock<Option<Arc<dyn CommitHook>>>,
    next_file_id: AtomicU64,
    next_memtable_id: AtomicU64,
    flushed_seq: AtomicU64,
    manifest_lock: Mutex<()>,
    bg: Mutex<BgState>,
    bg_cv: Condvar,
    dropped: AtomicBool,
}

impl ColumnFamily {
    /// Open the column family stored in `dir`, replaying and flushing any
    /// WAL left by the previous run. Returns the highest sequence seen.
    pub(crate) fn open(
        ctx: CfContext,
        dir: PathBuf,
        manifest: Manifest,
        comparator: Arc<dyn Comparator>,
    ) -> Result<(Arc<Self>, SeqNo)> {
        let metrics = Arc::new(ColumnFamilyMetrics::new());
        let mut edit = VersionEdit::default();
        let mut max_seq = manifest.flushed_seq;
        for (level, ids) in manifest.levels.iter().enumerate() {
            for &file_id in ids {
                let table = SsTableReader::open(
                    &dir,
                    file_id,
                    Arc::clone(&ctx.env),
                    Arc::clone(&comparator),
                    Arc::clone(&metrics),
                )?;
                max_seq = max_seq.max(table.props().max_seq);
                edit.added.push((level, Arc::new(table)));
            }
        }
        let version = Version::new(manifest.levels.len(), Arc::clone(&comparator)).apply(edit);
        remove_orphans(&dir, &manifest)?;

        let wal_dir = dir.join("wal");
        let recovered = Wal::recover(&wal_dir)?;
        let last_segment = recovered.last().map(|(n, _)| *n).unwrap_or(0);
        let config = manifest.config.clone();
        let active_id = last_segment + 1;
        let wal = Wal::open(&wal_dir, active_id, config.sync_mode, config.sync_interval_us)?;
        let active = Arc::new(MemTable::new(active_id, shape_of(&config), Arc::clone(&comparator)));

        let cf = Arc::new(ColumnFamily {
            id: manifest.id,
            name: RwLock::new(manifest.name.clone()),
            dir,
            config: RwLock::new(config),
            comparator,
            ctx,
            metrics,
            state: RwLock::new(Arc::new(SuperVersion {
                active,
                immutables: Vec::new(),
                version: Arc::new(version),
            })),
            wal: Mutex::new(wal),
            hook: RwLock::new(None),
            next_file_id: AtomicU64::new(manifest.next_file_id.max(1)),
            next_memtable_id: AtomicU64::new(active_id + 1),
            flushed_seq: AtomicU64::new(manifest.flushed_seq),
            manifest_lock: Mutex::new(()),
            bg: Mutex::new(BgState::default()),
            bg_cv: Condvar::new(),
            dropped: AtomicBool::new(false),
        });

        let replay = Arc::new(MemTable::new(
            last_segment,
            shape_of(&cf.config()),
            Arc::clone(&cf.comparator),
        ));
        let mut replayed = 0usize;
        for (_, batches) in recovered {
            for batch in batches.into_iter().filter(|b| b.seq > manifest.flushed_seq) {
                max_seq = max_seq.max(batch.seq);
                for entry in batch.entries {
                    replay.insert(entry);
                    replayed += 1;
                }
            }
        }
        if replayed > 0 {
            cf.swap_state(|sv| SuperVersion {
                active: Arc::clone(&sv.active),
                immutables: vec![Arc::clone(&replay)],
                version: Arc::clone(&sv.version),
            });
            flush::flush_immutables(&cf)?;
            info!(cf = %manifest.name, entries = replayed, "replayed WAL into level 0");
        }
        if last_segment > 0 {
            Wal::remove_segments_through(&wal_dir, last_segment)?;
        }
        cf.record_state(&cf.super_version());
        cf.save_manifest()?;
        Ok((cf, max_seq))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn config(&self) -> ColumnFamilyConfig {
        self.config.read().clone()
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    pub fn metrics(&self) -> &Arc<ColumnFamilyMetrics> {
        &self.metrics
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn env(&self) -> &Arc<TableEnv> {
        &self.ctx.env
    }

    pub(crate) fn mvcc(&self) -> &Arc<TxnManager> {
        &self.ctx.mvcc
    }

    pub(crate) fn sync_wal(&self) -> Result<()> {
        self.wal.lock().sync()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, AtomicOrdering::Release);
    }

    pub fn super_version(&self) -> Arc<SuperVersion> {
        Arc::clone(&self.state.read())
    }

    pub(crate) fn swap_state(&self, f: impl FnOnce(&SuperVersion) -> SuperVersion) {
        let mut state = self.state.write();
        let next = f(&state);
        self.record_state(&next);
        *state = Arc::new(next);
    }

    fn record_state(&self, sv: &SuperVersion) {
        self.metrics.immutable_count.set(sv.immutables.len() as u64);
        self.metrics.sstable_count.set(sv.version.file_count() as u64);
        let disk: u64 = (0..sv.version.num_levels()).map(|l| sv.version.level_size(l)).sum();
        self.metrics.disk_usage_bytes.set(disk);
    }

    pub(crate) fn allocate_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub(crate) fn advance_flushed_seq(&self, seq: SeqNo) {
        self.flushed_seq.fetch_max(seq, AtomicOrdering::SeqCst);
    }

    /// Rewrite `cf-<id>/MANIFEST` from the current state.
    pub(crate) fn save_manifest(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock();
        let manifest = Manifest {
            id: self.id,
            name: self.name(),
            config: self.config(),
            levels: self.super_version().version.layout(),
            next_file_id: self.next_file_id.load(AtomicOrdering::SeqCst),
            flushed_seq: self.flushed_seq.load(AtomicOrdering::SeqCst),
        };
        manifest.save(&self.dir)
    }

    /// Newest version of `key` at `snapshot`, tombstones included.
    pub(crate) fn get_entry(&self, key: &[u8], snapshot: SeqNo) -> Result<Option<Entry>> {
        self.super_version().get(key, snapshot)
    }

    /// Live value of `key` at `snapshot`; tombstones and expired values
    /// read as absent.
    pub(crate) fn get_visible(&self, key: &[u8], snapshot: SeqNo) -> Result<Option<Entry>> {
        let _timer = Timer::new(&self.metrics.read_latency);
        self.metrics.reads_total.inc();
        let found = self.get_entry(key, snapshot)?.filter(|e| !e.is_dead(now_secs()));
        if found.is_some() {
            self.metrics.reads_hits.inc();
        } else {
            self.metrics.reads_misses.inc();
        }
        Ok(found)
    }

    /// Sequence of the newest committed version of `key`, if any.
    pub(crate) fn latest_seq(&self, key: &[u8]) -> Result<Option<SeqNo>> {
        Ok(self.get_entry(key, SeqNo::MAX)?.map(|e| e.seq))
    }

    /// Append a committed batch to the WAL, returning the offset it was
    /// written at. Caller holds the commit lock.
    pub(crate) fn log_batch(&self, seq: SeqNo, batch: &[Entry]) -> Result<u64> {
        self.wal.lock().append_batch(seq, batch)
    }

    /// Remove a batch logged at `offset` whose commit was abandoned.
    /// Caller holds the commit lock.
    pub(crate) fn unlog(&self, offset: u64) -> Result<()> {
        self.wal.lock().truncate(offset)
    }

    #[cfg(test)]
    pub(crate) fn break_wal(&self) -> Result<()> {
        self.wal.lock().make_read_only()
    }

    /// Insert a logged batch into the active memtable and notify the hook.
    /// Caller holds the commit lock.
    pub(crate) fn apply_batch(&self, seq: SeqNo, batch: &[Entry]) {
        let active = Arc::clone(&self.state.read().active);
        let mut bytes = 0u64;
        for e in batch {
            bytes += (e.key.len() + e.value.len()) as u64;
            active.insert(e.clone());
        }
        self.metrics.commits_total.inc();
        self.metrics.writes_total.add(batch.len() as u64);
        self.metrics.writes_bytes.add(bytes);
        self.metrics.memtable_size_bytes.set(active.size_bytes() as u64);
        self.metrics.memtable_entries.set(active.len() as u64);

        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            if !hook::dispatch(hook.as_ref(), &self.name(), batch, seq) {
                self.metrics.hook_failures.inc();
            }
        }
    }

    /// Seal the active memtable once it outgrows the write buffer. Caller
    /// holds the commit lock.
    pub(crate) fn rotate_if_full(&self) -> Result<bool> {
        let limit = self.config.read().write_buffer_size;
        if self.state.read().active.size_bytes() <= limit {
            return Ok(false);
        }
        self.rotate_memtable()
    }

    /// Seal the active memtable and start a new WAL segment for its
    /// successor. Caller holds the commit lock.
    pub(crate) fn rotate_memtable(&self) -> Result<bool> {
        if self.state.read().active.is_empty() {
            return Ok(false);
        }
        let next_id = self.next_memtable_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.wal.lock().rotate(next_id)?;
        let fresh = Arc::new(MemTable::new(
            next_id,
            shape_of(&self.config.read()),
            Arc::clone(&self.comparator),
        ));
        self.swap_state(|sv| {
            let mut immutables = Vec::with_capacity(sv.immutables.len() + 1);
            immutables.push(Arc::clone(&sv.active));
            immutables.extend(sv.immutables.iter().cloned());
            SuperVersion {
                active: fresh,
                immutables,
                version: Arc::clone(&sv.version),
            }
        });
        self.metrics.memtable_size_bytes.set(0);
        self.metrics.memtable_entries.set(0);
        debug!(cf = %self.name(), memtable = next_id, "sealed memtable");
        Ok(true)
    }

    /// Block a committer while level 0 is over the stall threshold, for at
    /// most five seconds.
    pub(crate) fn wait_for_write_stall(self: &Arc<Self>) {
        let threshold = self.config.read().l0_queue_stall_threshold;
        let l0 = || self.super_version().version.l0_count();
        if l0() < threshold {
            return;
        }
        self.metrics.write_stalls.inc();
        self.schedule_compaction();
        let deadline = Instant::now() + STALL_LIMIT;
        let mut bg = self.bg.lock();
        while l0() >= threshold {
            if Instant::now() >= deadline {
                warn!(cf = %self.name(), l0 = l0(), threshold, "write stall timed out, proceeding");
                return;
            }
            self.bg_cv.wait_for(&mut bg, STALL_SLICE);
        }
    }

    /// Wake stalled committers after level 0 shrank.
    pub(crate) fn notify_level_change(&self) {
        let _bg = self.bg.lock();
        self.bg_cv.notify_all();
    }

    fn submit(self: &Arc<Self>, kind: JobKind) {
        if self.is_dropped() {
            return;
        }
        match kind {
            JobKind::Flush => self.ctx.scheduler.submit_flush(Arc::clone(self)),
            JobKind::Compaction => self.ctx.scheduler.submit_compaction(Arc::clone(self)),
        }
    }

    pub(crate) fn schedule_flush(self: &Arc<Self>) {
        self.submit(JobKind::Flush);
    }

    pub(crate) fn schedule_compaction(self: &Arc<Self>) {
        self.submit(JobKind::Compaction);
    }

    /// Claim `kind` for the caller. A busy or paused column family remembers
    /// the request and runs it when freed.
    pub(crate) fn try_begin(self: &Arc<Self>, kind: JobKind) -> Option<JobGuard<'_>> {
        let mut bg = self.bg.lock();
        if *bg.running(kind) || bg.paused > 0 {
            *bg.queued(kind) = true;
            return None;
        }
        *bg.running(kind) = true;
        Some(JobGuard { cf: self, kind })
    }

    /// Claim `kind`, waiting for a running job of that kind to finish.
    pub(crate) fn begin(self: &Arc<Self>, kind: JobKind) -> JobGuard<'_> {
        let mut bg = self.bg.lock();
        while *bg.running(kind) || bg.paused > 0 {
            self.bg_cv.wait(&mut bg);
        }
        *bg.running(kind) = true;
        JobGuard { cf: self, kind }
    }

    /// Wait for running flush and compaction to finish and hold new ones
    /// off until the guard drops.
    pub(crate) fn quiesce(self: &Arc<Self>) -> QuiesceGuard<'_> {
        let mut bg = self.bg.lock();
        bg.paused += 1;
        while bg.flushing || bg.compacting {
            self.bg_cv.wait(&mut bg);
        }
        QuiesceGuard { cf: self }
    }

    pub fn is_flushing(&self) -> bool {
        self.bg.lock().flushing
    }

    pub fn is_compacting(&self) -> bool {
        self.bg.lock().compacting
    }

    /// Seal the active memtable and write every sealed memtable to level 0
    /// before returning.
    pub fn flush_memtable(self: &Arc<Self>) -> Result<()> {
        {
            let _commit = self.ctx.mvcc.commit_lock.lock();
            self.rotate_memtable()?;
        }
        let _job = self.begin(JobKind::Flush);
        flush::check_disk_space(&self.dir, self.config.read().min_disk_space)?;
        flush::flush_immutables(self)?;
        drop(_job);
        self.maybe_schedule_compaction();
        Ok(())
    }

    /// Merge every non-empty level into the one below it, top to bottom.
    pub fn compact(self: &Arc<Self>) -> Result<()> {
        let _job = self.begin(JobKind::Compaction);
        flush::check_disk_space(&self.dir, self.config.read().min_disk_space)?;
        compaction::compact_all(self)?;
        Ok(())
    }

    pub(crate) fn maybe_schedule_compaction(self: &Arc<Self>) {
        let version = Arc::clone(&self.super_version().version);
        if compaction::pick(&version, &self.config.read()).is_some() {
            self.schedule_compaction();
        }
    }

    /// Install `hook`, replacing any previous one.
    pub fn set_commit_hook(&self, hook: impl CommitHook + 'static) {
        *self.hook.write() = Some(Arc::new(hook));
    }

    pub fn clear_commit_hook(&self) {
        *self.hook.write() = None;
    }

    pub fn has_commit_hook(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Change the runtime-tunable settings. They apply to memtables and
    /// SSTables created afterwards; `persist` also rewrites the manifest.
    pub fn update_runtime_config(&self, update: &RuntimeConfigUpdate, persist: bool) -> Result<()> {
        let (sync_mode, interval) = {
            let mut config = self.config.write();
            config.apply(update)?;
            (config.sync_mode, config.sync_interval_us)
        };
        self.wal.lock().set_sync(sync_mode, interval);
        if persist {
            self.save_manifest()?;
        }
        info!(cf = %self.name(), persist, "updated runtime config");
        Ok(())
    }

    pub fn stats(&self) -> ColumnFamilyStats {
        let sv = self.super_version();
        let version = &sv.version;
        let num_levels = version.num_levels();

        let level_sizes: Vec<u64> = (0..num_levels).map(|l| version.level_size(l)).collect();
        let level_num_sstables: Vec<usize> = version.levels.iter().map(Vec::len).collect();
        let level_key_counts: Vec<u64> = (0..num_levels).map(|l| version.level_keys(l)).collect();

        let (mut keys, mut key_bytes, mut value_bytes) = (0u64, 0u64, 0u64);
        for t in version.files() {
            keys += t.props().entry_count;
            key_bytes += t.props().key_bytes;
            value_bytes += t.props().value_bytes;
        }
        let (mut mem_size, mut mem_entries) = (0u64, 0u64);
        let (mut btree_nodes, mut btree_max, mut btree_heights, mut btrees) = (0u64, 0u32, 0u64, 0u64);
        for mt in sv.memtables() {
            mem_size += mt.size_bytes() as u64;
            mem_entries += mt.len() as u64;
            let (k, v) = mt.payload_bytes();
            key_bytes += k as u64;
            value_bytes += v as u64;
            if let Some(b) = mt.btree_stats() {
                btree_nodes += b.nodes as u64;
                btree_max = btree_max.max(b.height as u32);
                btree_heights += b.height as u64;
                btrees += 1;
            }
        }
        let total_keys = keys + mem_entries;
        let avg = |bytes: u64| if total_keys == 0 { 0.0 } else { bytes as f64 / total_keys as f64 };
        let non_empty = level_num_sstables.iter().skip(1).filter(|&&n| n > 0).count();
        let config = self.config();

        ColumnFamilyStats {
            name: self.name(),
            num_levels,
            memtable_size: mem_size,
            memtable_entries: mem_entries,
            immutable_memtables: sv.immutables.len(),
            level_sizes: level_sizes.clone(),
            level_num_sstables: level_num_sstables.clone(),
            level_key_counts,
            total_keys,
            total_data_size: level_sizes.iter().sum::<u64>() + mem_size,
            avg_key_size: avg(key_bytes),
            avg_value_size: avg(value_bytes),
            read_amp: (level_num_sstables[0] + non_empty + 1) as f64,
            hit_rate: self.metrics.block_cache_hit_rate(),
            use_btree: config.use_btree,
            btree_total_nodes: btree_nodes,
            btree_max_height: btree_max,
            btree_avg_height: if btrees == 0 {
                0.0
            } else {
                btree_heights as f64 / btrees as f64
            },
            config,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Relative cost of scanning the keys between `a` and `b`, from
    /// resident metadata only. Larger means more I/O; 0.0 means nothing
    /// stored overlaps the range.
    pub fn range_cost(&self, a: &[u8], b: &[u8]) -> Result<f64> {
        if a.is_empty() || b.is_empty() {
            return Err(StorageError::InvalidArgs("range bounds must be non-empty".into()));
        }
        let (low, high) = match self.comparator.compare(a, b) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        };
        let sv = self.super_version();
        let mut cost = 0.0;
        for (level, files) in sv.version.levels.iter().enumerate() {
            for t in files {
                let c = t.estimate_range(low, high);
                // level 0 files overlap each other, every one is checked
                cost += if level == 0 { c * 2.0 } else { c };
            }
        }
        // memtable share in the same unit: blocks it would fill times its
        // average entry size
        for mt in sv.memtables() {
            let (entries, bytes) = mt.range_footprint(low, high);
            if entries > 0 {
                let avg_entry = bytes as f64 / entries as f64;
                cost += entries as f64 * avg_entry / DEFAULT_BLOCK_SIZE as f64 * avg_entry;
            }
        }
        Ok(cost)
    }
}

/// Delete table files the manifest does not reference, left behind by an
/// interrupted flush or compaction.
fn remove_orphans(dir: &Path, manifest: &Manifest) -> Result<()> {
    let live: std::collections::HashSet<u64> = manifest.file_ids().collect();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_table = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("klog") | Some("vlog")
        );
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let (true, Some(id)) = (is_table, id) {
            if !live.contains(&id) {
                std::fs::remove_file(&path)?;
                debug!(path = %path.display(), "removed orphaned table file");
            }
        }
    }
    Ok(())
}

pub(crate) fn shape_of(config: &ColumnFamilyConfig) -> MemTableShape {
    if config.use_btree {
        MemTableShape::BPlusTree
    } else {
        MemTableShape::SkipList {
            max_level: config.skip_list_max_level,
            probability: config.skip_list_probability,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::comparator::MemcmpComparator;
    use crate::config::IsolationLevel;
    use crate::txn::Transaction;
    use tempfile::tempdir;

    /// Column family backed by a scheduler with no workers; background
    /// jobs are queued and never run.
    pub(crate) fn open_cf(dir: &Path, config: ColumnFamilyConfig) -> Result<Arc<ColumnFamily>> {
        let ctx = CfContext {
            env: Arc::new(TableEnv::new(1 << 20, 16)),
            mvcc: Arc::new(TxnManager::new(0)),
            scheduler: Arc::new(Scheduler::detached()),
        };
        let cf_dir = dir.join(Manifest::dir_name(1));
        let config = ColumnFamilyConfig {
            min_disk_space: 0,
            ..config
        };
        let manifest = Manifest::new(1, "test", config);
        manifest.save(&cf_dir)?;
        let (cf, _) = ColumnFamily::open(ctx, cf_dir, manifest, Arc::new(MemcmpComparator))?;
        Ok(cf)
    }

    fn put(cf: &Arc<ColumnFamily>, key: &str, value: &str) -> Result<()> {
        let mut txn = Transaction::begin(Arc::clone(cf.mvcc()), IsolationLevel::ReadCommitted)?;
        txn.put(cf, key.as_bytes(), value.as_bytes())?;
        txn.commit()
    }

    #[test]
    fn test_flush_moves_memtable_to_level0() -> Result<()> {
        let dir = tempdir()?;
        let cf = open_cf(dir.path(), ColumnFamilyConfig::default())?;
        for i in 0..50 {
            put(&cf, &format!("key{:03}", i), "value")?;
        }
        assert_eq!(cf.stats().memtable_entries, 50);

        cf.flush_memtable()?;
        let stats = cf.stats();
        assert_eq!(stats.level_num_sstables[0], 1);
        assert_eq!(stats.level_key_counts[0], 50);
        assert_eq!(stats.memtable_entries, 0);
        assert_eq!(stats.total_keys, 50);
        assert!(stats.avg_key_size > 5.0);
        assert_eq!(
            cf.get_visible(b"key007", SeqNo::MAX)?.map(|e| e.value),
            Some(bytes::Bytes::from_static(b"value"))
        );
        assert!(Wal::list_segments(&cf.dir().join("wal"))?.len() == 1);

        let manifest = Manifest::load(cf.dir())?;
        assert_eq!(manifest.levels[0].len(), 1);
        assert_eq!(manifest.flushed_seq, 50);
        Ok(())
    }

    #[test]
    fn test_small_write_buffer_seals_memtable() -> Result<()> {
        let dir = tempdir()?;
        let cf = open_cf(
            dir.path(),
            ColumnFamilyConfig {
                write_buffer_size: 1024,
                ..Default::default()
            },
        )?;
        for i in 0..40 {
            put(&cf, &format!("k{:02}", i), &"x".repeat(64))?;
        }
        assert!(cf.stats().immutable_memtables >= 1);
        assert_eq!(cf.get_visible(b"k00", SeqNo::MAX)?.unwrap().value.len(), 64);
        Ok(())
    }

    #[test]
    fn test_range_cost() -> Result<()> {
        let dir = tempdir()?;
        let cf = open_cf(dir.path(), ColumnFamilyConfig::default())?;
        assert_eq!(cf.range_cost(b"a", b"z")?, 0.0);
        assert!(matches!(cf.range_cost(b"", b"z"), Err(StorageError::InvalidArgs(_))));

        for i in 0..2_000 {
            put(&cf, &format!("key{:05}", i), &"v".repeat(40))?;
        }
        cf.flush_memtable()?;
        let narrow = cf.range_cost(b"key00100", b"key00200")?;
        let wide = cf.range_cost(b"key00100", b"key01900")?;
        assert!(narrow > 0.0);
        assert!(wide >= narrow);
        assert_eq!(cf.range_cost(b"key01900", b"key00100")?, wide);
        assert_eq!(cf.range_cost(b"zzz", b"zzzz")?, 0.0);
        Ok(())
    }

    #[test]
    fn test_range_cost_same_scale_before_and_after_flush() -> Result<()> {
        let dir = tempdir()?;
        let cf = open_cf(dir.path(), ColumnFamilyConfig::default())?;
        for i in 0..2_000 {
            put(&cf, &format!("key{:05}", i), &"v".repeat(40))?;
        }
        let in_memory = cf.range_cost(b"key00000", b"key01999")?;
        cf.flush_memtable()?;
        let on_disk = cf.range_cost(b"key00000", b"key01999")?;
        assert!(in_memory > 0.0);
        // same data, one level-0 table counted twice
        let ratio = on_disk / in_memory;
        assert!(ratio > 0.5 && ratio < 8.0, "ratio {}", ratio);
        Ok(())
    }

    #[test]
    fn test_runtime_config_update() -> Result<()> {
        let dir = tempdir()?;
        let cf = open_cf(dir.path(), ColumnFamilyConfig::default())?;
        let update = RuntimeConfigUpdate {
            write_buffer_size: Some(4096),
            bloom_fpr: Some(0.05),
            ..Default::default()
        };
        cf.update_runtime_config(&update, true)?;
        assert_eq!(cf.config().write_buffer_size, 4096);
        assert_eq!(Manifest::load(cf.dir())?.config.bloom_fpr, 0.05);

        let bad = RuntimeConfigUpdate {
            bloom_fpr: Some(1.5),
            ..Default::default()
        };
        assert!(cf.update_runtime_config(&bad, false).is_err());
        assert_eq!(cf.config().bloom_fpr, 0.05);
        Ok(())
    }
}
