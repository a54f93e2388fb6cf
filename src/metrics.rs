// src/metrics.rs
//
// Per-column-family operational metrics.
// Tracks operation counts, latencies, and storage state.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics container owned by one column family
#[derive(Debug)]
pub struct ColumnFamilyMetrics {
    // === Operation Counters ===
    pub commits_total: Counter,
    pub writes_total: Counter,
    pub writes_bytes: Counter,

    pub reads_total: Counter,
    pub reads_hits: Counter,
    pub reads_misses: Counter,

    pub flushes_total: Counter,
    pub flush_duration: Histogram,

    pub compactions_total: Counter,
    pub compaction_bytes_in: Counter,
    pub compaction_bytes_out: Counter,
    pub compaction_duration: Histogram,

    // Bloom filter effectiveness
    pub bloom_filter_hits: Counter,
    pub bloom_filter_misses: Counter,
    pub bloom_filter_false_positives: Counter,

    pub sstable_lookups: Counter,
    pub block_cache_hits: Counter,
    pub block_cache_misses: Counter,

    pub hook_failures: Counter,
    pub write_stalls: Counter,

    // === Performance Metrics ===
    pub commit_latency: Histogram,
    pub read_latency: Histogram,

    // === System State ===
    pub memtable_size_bytes: Gauge,
    pub memtable_entries: Gauge,
    pub immutable_count: Gauge,
    pub sstable_count: Gauge,
    pub disk_usage_bytes: Gauge,
}

impl ColumnFamilyMetrics {
    pub fn new() -> Self {
        Self {
            commits_total: Counter::new(),
            writes_total: Counter::new(),
            writes_bytes: Counter::new(),
            reads_total: Counter::new(),
            reads_hits: Counter::new(),
            reads_misses: Counter::new(),
            flushes_total: Counter::new(),
            flush_duration: Histogram::new(),
            compactions_total: Counter::new(),
            compaction_bytes_in: Counter::new(),
            compaction_bytes_out: Counter::new(),
            compaction_duration: Histogram::new(),

            bloom_filter_hits: Counter::new(),
            bloom_filter_misses: Counter::new(),
            bloom_filter_false_positives: Counter::new(),

            sstable_lookups: Counter::new(),
            block_cache_hits: Counter::new(),
            block_cache_misses: Counter::new(),

            hook_failures: Counter::new(),
            write_stalls: Counter::new(),

            commit_latency: Histogram::new(),
            read_latency: Histogram::new(),

            memtable_size_bytes: Gauge::new(),
            memtable_entries: Gauge::new(),
            immutable_count: Gauge::new(),
            sstable_count: Gauge::new(),
            disk_usage_bytes: Gauge::new(),
        }
    }

    // === Computed Metrics ===

    /// Read hit rate (0.0 to 1.0)
    pub fn read_hit_rate(&self) -> f64 {
        ratio(self.reads_hits.get(), self.reads_total.get())
    }

    /// Block cache hit rate seen by this column family (0.0 to 1.0)
    pub fn block_cache_hit_rate(&self) -> f64 {
        let hits = self.block_cache_hits.get();
        ratio(hits, hits + self.block_cache_misses.get())
    }

    /// Fraction of bloom checks that let the lookup through but found nothing
    pub fn bloom_filter_fp_rate(&self) -> f64 {
        let checks = self.bloom_filter_hits.get() + self.bloom_filter_misses.get();
        ratio(self.bloom_filter_false_positives.get(), checks)
    }

    /// Compaction space savings (0.0 to 1.0)
    pub fn compaction_space_savings(&self) -> f64 {
        let bytes_in = self.compaction_bytes_in.get();
        if bytes_in == 0 {
            return 0.0;
        }
        1.0 - (self.compaction_bytes_out.get() as f64 / bytes_in as f64)
    }

    /// Write amplification factor
    pub fn write_amplification(&self) -> f64 {
        let logical = self.writes_bytes.get();
        if logical == 0 {
            return 1.0;
        }
        (logical + self.compaction_bytes_out.get()) as f64 / logical as f64
    }

    /// Point-in-time copy of the counters and derived ratios, reported
    /// with the column family stats.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits_total.get(),
            writes: self.writes_total.get(),
            write_bytes: self.writes_bytes.get(),
            reads: self.reads_total.get(),
            read_hit_rate: self.read_hit_rate(),
            flushes: self.flushes_total.get(),
            compactions: self.compactions_total.get(),
            write_stalls: self.write_stalls.get(),
            hook_failures: self.hook_failures.get(),
            bloom_filter_fp_rate: self.bloom_filter_fp_rate(),
            compaction_space_savings: self.compaction_space_savings(),
            write_amplification: self.write_amplification(),
            commit_p99_us: self.commit_latency.percentile(0.99).as_micros() as u64,
            read_p99_us: self.read_latency.percentile(0.99).as_micros() as u64,
            disk_usage_bytes: self.disk_usage_bytes.get(),
        }
    }

    /// Format metrics for display
    pub fn summary(&self) -> String {
        format!(
            r#"Column Family Metrics
=====================

Operations:
  Commits:     {:>12}
  Writes:      {:>12}  ({} MB)
  Reads:       {:>12}  (hits: {}, misses: {})
  Flushes:     {:>12}
  Compactions: {:>12}
  Stalls:      {:>12}
  Hook fails:  {:>12}

Read Path:
  Hit Rate:    {:>11.2}%
  Cache Hits:  {:>11.2}%
  Bloom FP:    {:>11.2}%
  SST lookups: {:>12}

Compaction:
  Input:       {:>9} MB
  Output:      {:>9} MB
  Space Saved: {:>11.2}%
  Write Amp:   {:>12.2}x

Latency (μs):
  Commit p50:  {:>12.1}
  Commit p99:  {:>12.1}
  Read p50:    {:>12.1}
  Read p99:    {:>12.1}
  Flush p50:   {:>12.1}
  Flush p99:   {:>12.1}

State:
  MemTable:    {:>9} MB  ({} entries)
  Immutable:   {:>12}
  SSTables:    {:>12}
  Disk Usage:  {:>9} MB
"#,
            self.commits_total.get(),
            self.writes_total.get(),
            self.writes_bytes.get() / 1_048_576,
            self.reads_total.get(),
            self.reads_hits.get(),
            self.reads_misses.get(),
            self.flushes_total.get(),
            self.compactions_total.get(),
            self.write_stalls.get(),
            self.hook_failures.get(),
            self.read_hit_rate() * 100.0,
            self.block_cache_hit_rate() * 100.0,
            self.bloom_filter_fp_rate() * 100.0,
            self.sstable_lookups.get(),
            self.compaction_bytes_in.get() / 1_048_576,
            self.compaction_bytes_out.get() / 1_048_576,
            self.compaction_space_savings() * 100.0,
            self.write_amplification(),
            self.commit_latency.percentile(0.5).as_micros() as f64,
            self.commit_latency.percentile(0.99).as_micros() as f64,
            self.read_latency.percentile(0.5).as_micros() as f64,
            self.read_latency.percentile(0.99).as_micros() as f64,
            self.flush_duration.percentile(0.5).as_micros() as f64,
            self.flush_duration.percentile(0.99).as_micros() as f64,
            self.memtable_size_bytes.get() / 1_048_576,
            self.memtable_entries.get(),
            self.immutable_count.get(),
            self.sstable_count.get(),
            self.disk_usage_bytes.get() / 1_048_576,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub writes: u64,
    pub write_bytes: u64,
    pub reads: u64,
    pub read_hit_rate: f64,
    pub flushes: u64,
    pub compactions: u64,
    pub write_stalls: u64,
    pub hook_failures: u64,
    pub bloom_filter_fp_rate: f64,
    pub compaction_space_savings: f64,
    pub write_amplification: f64,
    pub commit_p99_us: u64,
    pub read_p99_us: u64,
    /// Bytes of live SSTables.
    pub disk_usage_bytes: u64,
}

impl Default for ColumnFamilyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    num as f64 / den as f64
}

/// Atomic counter (lock-free)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current state
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    samples: RwLock<Vec<Duration>>,
    max_samples: usize,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_capacity(4_096)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            max_samples,
        }
    }

    /// Record a latency sample
    pub fn observe(&self, duration: Duration) {
        let mut samples = self.samples.write();

        // Reservoir sampling to bound memory
        if samples.len() < self.max_samples {
            samples.push(duration);
        } else {
            let idx = fastrand::usize(..samples.len());
            samples[idx] = duration;
        }
    }

    /// Get percentile (0.0 to 1.0)
    pub fn percentile(&self, p: f64) -> Duration {
        let samples = self.samples.read();

        if samples.is_empty() {
            return Duration::ZERO;
        }

        let mut sorted: Vec<Duration> = samples.clone();
        sorted.sort();

        let idx = ((sorted.len() - 1) as f64 * p) as usize;
        sorted[idx]
    }

    pub fn count(&self) -> usize {
        self.samples.read().len()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the elapsed time into a histogram when dropped
pub struct Timer<'a> {
    start: Instant,
    histogram: &'a Histogram,
}

impl<'a> Timer<'a> {
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed());
    }
}
