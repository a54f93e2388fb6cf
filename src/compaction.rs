//! Level compaction for a column family.
//!
//! Picks input files from one level plus the overlapping files of the next,
//! then runs a k-way merge through a min-heap ordered by (key asc,
//! seq desc):
//!
//! 1. Every version newer than the snapshot watermark survives.
//! 2. Of the versions at or below the watermark only the newest survives,
//!    and not even that one when it is a tombstone or expired and no deeper
//!    level can hold the key.
//! 3. Output is cut into files of at most `target_file_size`, never between
//!    two versions of one key.
//!
//! Levels below the dividing level are merged whole (size-tiered); from the
//! dividing level on one file moves down at a time (leveled).

use crate::column_family::{ColumnFamily, SuperVersion};
use crate::comparator::Comparator;
use crate::config::ColumnFamilyConfig;
use crate::sstable::writer::{klog_path, vlog_path};
use crate::sstable::{SsTableReader, SsTableWriter, TableIter, WriterOptions};
use crate::version::{Version, VersionEdit};
use crate::{now_secs, Entry, Result};
use bytes::Bytes;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on back-to-back triggered compactions per job.
const MAX_ROUNDS: usize = 64;

/// Entry from an input table with source tracking
struct CompactionEntry {
    entry: Entry,
    source: usize,
    comparator: Arc<dyn Comparator>,
}

/// Reverse ordering for a min-heap on key; within a key the newer
/// sequence pops first.
impl Ord for CompactionEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator
            .compare(&other.entry.key, &self.entry.key)
            .then(self.entry.seq.cmp(&other.entry.seq))
            .then(other.source.cmp(&self.source))
    }
}

impl PartialOrd for CompactionEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CompactionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CompactionEntry {}

/// Compaction statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionStats {
    pub source_level: usize,
    pub target_level: usize,
    pub input_sstables: usize,
    pub output_sstables: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub entries_merged: u64,
    pub duplicates_removed: u64,
    pub tombstones_dropped: u64,
    pub duration_ms: u64,
}

impl CompactionStats {
    fn absorb(&mut self, other: &CompactionStats) {
        self.input_sstables += other.input_sstables;
        self.output_sstables += other.output_sstables;
        self.input_bytes += other.input_bytes;
        self.output_bytes += other.output_bytes;
        self.entries_merged += other.entries_merged;
        self.duplicates_removed += other.duplicates_removed;
        self.tombstones_dropped += other.tombstones_dropped;
        self.duration_ms += other.duration_ms;
    }
}

/// Files chosen for one merge.
pub(crate) struct CompactionTask {
    pub source_level: usize,
    pub target_level: usize,
    pub inputs: Vec<(usize, Arc<SsTableReader>)>,
}

impl CompactionTask {
    /// `picked` from `source_level` plus every overlapping file of the
    /// target level.
    fn new(version: &Version, source_level: usize, picked: Vec<Arc<SsTableReader>>) -> Option<Self> {
        if picked.is_empty() {
            return None;
        }
        let target_level = source_level + 1;
        let (low, high) = version.key_range(&picked)?;
        let mut inputs: Vec<(usize, Arc<SsTableReader>)> =
            picked.into_iter().map(|t| (source_level, t)).collect();
        inputs.extend(
            version
                .overlapping(target_level, &low, &high)
                .into_iter()
                .map(|t| (target_level, t)),
        );
        Some(CompactionTask {
            source_level,
            target_level,
            inputs,
        })
    }
}

/// Next compaction the level shape calls for, if any.
pub(crate) fn pick(version: &Version, config: &ColumnFamilyConfig) -> Option<CompactionTask> {
    let l0 = &version.levels[0];
    if !l0.is_empty() && l0.len() >= config.l1_file_count_trigger {
        return CompactionTask::new(version, 0, l0.clone());
    }

    let dividing = config.dividing_level(version.num_levels());
    for level in 1..version.num_levels() - 1 {
        let files = &version.levels[level];
        if files.is_empty() || version.level_size(level) <= config.level_target_size(level) {
            continue;
        }
        let picked = if level < dividing {
            files.clone()
        } else {
            files
                .iter()
                .min_by_key(|t| t.file_id())
                .cloned()
                .into_iter()
                .collect()
        };
        return CompactionTask::new(version, level, picked);
    }
    None
}

/// Run compactions until the level shape is within its targets.
pub(crate) fn compact_triggered(cf: &Arc<ColumnFamily>) -> Result<()> {
    for _ in 0..MAX_ROUNDS {
        grow_if_full(cf)?;
        let version = Arc::clone(&cf.super_version().version);
        let Some(task) = pick(&version, &cf.config()) else {
            return Ok(());
        };
        run(cf, &version, task)?;
    }
    debug!(cf = %cf.name(), "compaction round limit reached, rescheduling");
    cf.schedule_compaction();
    Ok(())
}

/// Append an empty level once the deepest one outgrows its target, so it
/// has somewhere to compact into.
fn grow_if_full(cf: &Arc<ColumnFamily>) -> Result<()> {
    let version = Arc::clone(&cf.super_version().version);
    let last = version.num_levels() - 1;
    if version.level_size(last) <= cf.config().level_target_size(last) {
        return Ok(());
    }
    cf.swap_state(|sv| SuperVersion {
        active: Arc::clone(&sv.active),
        immutables: sv.immutables.clone(),
        version: Arc::new(sv.version.with_extra_level()),
    });
    cf.save_manifest()?;
    info!(cf = %cf.name(), levels = last + 2, "added level");
    Ok(())
}

/// Push every level down into the next one, top to bottom.
pub(crate) fn compact_all(cf: &Arc<ColumnFamily>) -> Result<CompactionStats> {
    let mut total = CompactionStats::default();
    let mut level = 0;
    loop {
        let version = Arc::clone(&cf.super_version().version);
        if level + 1 >= version.num_levels() {
            break;
        }
        let files = version.levels[level].clone();
        if let Some(task) = CompactionTask::new(&version, level, files) {
            let stats = run(cf, &version, task)?;
            total.absorb(&stats);
        }
        level += 1;
    }
    info!(
        cf = %cf.name(),
        inputs = total.input_sstables,
        outputs = total.output_sstables,
        dropped = total.duplicates_removed + total.tombstones_dropped,
        "manual compaction finished"
    );
    Ok(total)
}

/// Sink for merged entries, rolling over to a new file at the size limit.
struct OutputSet<'a> {
    cf: &'a Arc<ColumnFamily>,
    opts: WriterOptions,
    target_size: u64,
    current: Option<SsTableWriter>,
    finished: Vec<u64>,
}

impl OutputSet<'_> {
    fn add(&mut self, entry: &Entry, new_key: bool) -> Result<()> {
        if new_key {
            if let Some(w) = &self.current {
                if w.estimated_size() >= self.target_size {
                    self.finish_current()?;
                }
            }
        }
        if self.current.is_none() {
            let id = self.cf.allocate_file_id();
            self.current = Some(SsTableWriter::create(self.cf.dir(), id, self.opts.clone())?);
        }
        match &mut self.current {
            Some(w) => w.add(entry),
            None => Ok(()),
        }
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(w) = self.current.take() {
            let id = w.file_id();
            w.finish()?;
            self.finished.push(id);
        }
        Ok(())
    }

    fn discard(mut self) {
        if let Some(w) = self.current.take() {
            w.abandon();
        }
        for id in &self.finished {
            let _ = std::fs::remove_file(klog_path(self.cf.dir(), *id));
            let _ = std::fs::remove_file(vlog_path(self.cf.dir(), *id));
        }
    }
}

fn next_from(iters: &mut [TableIter], source: usize) -> Result<Option<Entry>> {
    iters[source].next().transpose()
}

/// Merge `task.inputs` into new files on the target level and install the
/// result.
pub(crate) fn run(cf: &Arc<ColumnFamily>, version: &Version, task: CompactionTask) -> Result<CompactionStats> {
    let start = Instant::now();
    let watermark = cf.mvcc().watermark();
    let now = now_secs();
    let comparator = Arc::clone(cf.comparator());
    let config = cf.config();

    let mut stats = CompactionStats {
        source_level: task.source_level,
        target_level: task.target_level,
        input_sstables: task.inputs.len(),
        input_bytes: task.inputs.iter().map(|(_, t)| t.size_bytes()).sum(),
        ..Default::default()
    };

    let mut iters: Vec<TableIter> = task.inputs.iter().map(|(_, t)| t.iter()).collect();
    let mut heap = BinaryHeap::new();
    for source in 0..iters.len() {
        if let Some(entry) = next_from(&mut iters, source)? {
            heap.push(CompactionEntry {
                entry,
                source,
                comparator: Arc::clone(&comparator),
            });
        }
    }

    let mut out = OutputSet {
        cf,
        opts: WriterOptions::from_config(&config, comparator.is_bytewise()),
        target_size: config.target_file_size(),
        current: None,
        finished: Vec::new(),
    };
    let mut last_key: Option<Bytes> = None;
    let mut emitted_key = false;
    let mut below_watermark_seen = false;

    let merged: Result<()> = (|| {
        while let Some(CompactionEntry { entry, source, .. }) = heap.pop() {
            let new_key = last_key
                .as_ref()
                .map_or(true, |k| comparator.compare(k, &entry.key) != Ordering::Equal);
            if new_key {
                last_key = Some(entry.key.clone());
                emitted_key = false;
                below_watermark_seen = false;
            }

            let keep = if entry.seq > watermark {
                true
            } else if below_watermark_seen {
                stats.duplicates_removed += 1;
                false
            } else {
                below_watermark_seen = true;
                if entry.is_dead(now) && !version.covered_below(task.target_level, &entry.key) {
                    stats.tombstones_dropped += 1;
                    false
                } else {
                    true
                }
            };

            if keep {
                out.add(&entry, !emitted_key)?;
                emitted_key = true;
                stats.entries_merged += 1;
            }

            if let Some(next) = next_from(&mut iters, source)? {
                heap.push(CompactionEntry {
                    entry: next,
                    source,
                    comparator: Arc::clone(&comparator),
                });
            }
        }
        out.finish_current()
    })();
    if let Err(e) = merged {
        warn!(cf = %cf.name(), error = %e, "compaction aborted, discarding outputs");
        out.discard();
        return Err(e);
    }

    let mut outputs = Vec::with_capacity(out.finished.len());
    for id in &out.finished {
        outputs.push(Arc::new(SsTableReader::open(
            cf.dir(),
            *id,
            Arc::clone(cf.env()),
            Arc::clone(&comparator),
            Arc::clone(cf.metrics()),
        )?));
    }
    stats.output_sstables = outputs.len();
    stats.output_bytes = outputs.iter().map(|t| t.size_bytes()).sum();

    let edit = VersionEdit {
        removed: task.inputs.iter().map(|(l, t)| (*l, t.file_id())).collect(),
        added: outputs.iter().map(|t| (task.target_level, Arc::clone(t))).collect(),
    };
    cf.swap_state(|sv| SuperVersion {
        active: Arc::clone(&sv.active),
        immutables: sv.immutables.clone(),
        version: Arc::new(sv.version.apply(edit)),
    });
    cf.save_manifest()?;
    for (_, t) in &task.inputs {
        t.mark_obsolete();
    }
    cf.notify_level_change();

    stats.duration_ms = start.elapsed().as_millis() as u64;
    let metrics = cf.metrics();
    metrics.compactions_total.inc();
    metrics.compaction_bytes_in.add(stats.input_bytes);
    metrics.compaction_bytes_out.add(stats.output_bytes);
    metrics.compaction_duration.observe(start.elapsed());

    info!(
        cf = %cf.name(),
        from = stats.source_level,
        to = stats.target_level,
        inputs = stats.input_sstables,
        outputs = stats.output_sstables,
        input_bytes = stats.input_bytes,
        output_bytes = stats.output_bytes,
        duplicates = stats.duplicates_removed,
        tombstones = stats.tombstones_dropped,
        duration_ms = stats.duration_ms,
        "compaction complete"
    );
    Ok(stats)
}
