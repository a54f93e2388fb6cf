use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Block compression applied to SSTable data blocks and vlog values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Lz4,
    Zstd,
    /// LZ4 with the fast profile. `lz4_flex` has a single speed setting,
    /// so this shares the LZ4 codec but is recorded separately on disk.
    Lz4Fast,
}

impl CompressionAlgorithm {
    pub fn as_u8(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
            CompressionAlgorithm::Lz4Fast => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            2 => Ok(CompressionAlgorithm::Zstd),
            3 => Ok(CompressionAlgorithm::Lz4Fast),
            other => Err(StorageError::Corruption(format!(
                "unknown compression type {}",
                other
            ))),
        }
    }
}

/// WAL durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Leave flushing to the OS.
    None,
    /// fsync after every commit.
    #[default]
    Full,
    /// fsync at most once per `sync_interval_us`.
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
            LogLevel::None => "off",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(StorageError::InvalidArgs(format!("unknown log level {}", other))),
        }
    }
}

/// Database-wide settings supplied to [`crate::Database::open`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub num_flush_threads: usize,
    pub num_compaction_threads: usize,
    pub log_level: LogLevel,
    /// Block cache capacity in bytes; 0 disables the cache.
    pub block_cache_size: usize,
    pub max_open_sstables: usize,
    /// Write logs to `<db>/LOG` instead of stderr.
    pub log_to_file: bool,
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Config {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(StorageError::InvalidArgs("db_path is empty".into()));
        }
        if self.num_flush_threads == 0 || self.num_compaction_threads == 0 {
            return Err(StorageError::InvalidArgs(
                "background thread counts must be at least 1".into(),
            ));
        }
        if self.max_open_sstables == 0 {
            return Err(StorageError::InvalidArgs("max_open_sstables must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::new(),
            num_flush_threads: 2,
            num_compaction_threads: 2,
            log_level: LogLevel::Info,
            block_cache_size: 64 * 1024 * 1024,
            max_open_sstables: 256,
            log_to_file: false,
        }
    }
}

/// Per-column-family settings, persisted in the column family's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnFamilyConfig {
    pub write_buffer_size: usize,
    pub level_size_ratio: usize,
    pub min_levels: usize,
    pub dividing_level_offset: usize,
    /// Values at least this large go to the vlog.
    pub klog_value_threshold: usize,
    pub compression: CompressionAlgorithm,
    pub enable_bloom_filter: bool,
    pub bloom_fpr: f64,
    pub enable_block_indexes: bool,
    pub index_sample_ratio: usize,
    pub block_index_prefix_len: usize,
    pub sync_mode: SyncMode,
    pub sync_interval_us: u64,
    /// Registered comparator; empty selects `memcmp`.
    pub comparator_name: String,
    pub skip_list_max_level: usize,
    pub skip_list_probability: f32,
    pub default_isolation: IsolationLevel,
    pub min_disk_space: u64,
    pub l1_file_count_trigger: usize,
    pub l0_queue_stall_threshold: usize,
    /// Use the B+tree memtable instead of the skip list.
    pub use_btree: bool,
}

impl Default for ColumnFamilyConfig {
    fn default() -> Self {
        ColumnFamilyConfig {
            write_buffer_size: 128 * 1024 * 1024,
            level_size_ratio: 10,
            min_levels: 5,
            dividing_level_offset: 2,
            klog_value_threshold: 512,
            compression: CompressionAlgorithm::Lz4,
            enable_bloom_filter: true,
            bloom_fpr: 0.01,
            enable_block_indexes: true,
            index_sample_ratio: 1,
            block_index_prefix_len: 16,
            sync_mode: SyncMode::Full,
            sync_interval_us: 1_000_000,
            comparator_name: String::new(),
            skip_list_max_level: 12,
            skip_list_probability: 0.25,
            default_isolation: IsolationLevel::ReadCommitted,
            min_disk_space: 100 * 1024 * 1024,
            l1_file_count_trigger: 4,
            l0_queue_stall_threshold: 20,
            use_btree: false,
        }
    }
}

impl ColumnFamilyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(StorageError::InvalidArgs("write_buffer_size must be > 0".into()));
        }
        if self.level_size_ratio < 2 {
            return Err(StorageError::InvalidArgs("level_size_ratio must be >= 2".into()));
        }
        if self.min_levels == 0 {
            return Err(StorageError::InvalidArgs("min_levels must be >= 1".into()));
        }
        if !(self.bloom_fpr > 0.0 && self.bloom_fpr < 1.0) {
            return Err(StorageError::InvalidArgs(format!(
                "bloom_fpr {} outside (0, 1)",
                self.bloom_fpr
            )));
        }
        if !(self.skip_list_probability > 0.0 && self.skip_list_probability < 1.0) {
            return Err(StorageError::InvalidArgs(format!(
                "skip_list_probability {} outside (0, 1)",
                self.skip_list_probability
            )));
        }
        if self.skip_list_max_level == 0 {
            return Err(StorageError::InvalidArgs("skip_list_max_level must be > 0".into()));
        }
        if self.index_sample_ratio == 0 {
            return Err(StorageError::InvalidArgs("index_sample_ratio must be > 0".into()));
        }
        if self.l1_file_count_trigger == 0 {
            return Err(StorageError::InvalidArgs("l1_file_count_trigger must be > 0".into()));
        }
        if self.l0_queue_stall_threshold < self.l1_file_count_trigger {
            return Err(StorageError::InvalidArgs(
                "l0_queue_stall_threshold must be >= l1_file_count_trigger".into(),
            ));
        }
        Ok(())
    }

    /// Target byte size of level `level` (L >= 1).
    pub fn level_target_size(&self, level: usize) -> u64 {
        let mut target = self.write_buffer_size as u64;
        for _ in 0..level {
            target = target.saturating_mul(self.level_size_ratio as u64);
        }
        target
    }

    /// Maximum size of one compaction output file.
    pub fn target_file_size(&self) -> u64 {
        (self.write_buffer_size as u64).clamp(1024 * 1024, 256 * 1024 * 1024)
    }

    /// First level compacted one file at a time instead of whole-level.
    pub fn dividing_level(&self, num_levels: usize) -> usize {
        num_levels.saturating_sub(self.dividing_level_offset).max(1)
    }

    pub fn apply(&mut self, update: &RuntimeConfigUpdate) -> Result<()> {
        let mut next = self.clone();
        if let Some(v) = update.write_buffer_size {
            next.write_buffer_size = v;
        }
        if let Some(v) = update.skip_list_max_level {
            next.skip_list_max_level = v;
        }
        if let Some(v) = update.skip_list_probability {
            next.skip_list_probability = v;
        }
        if let Some(v) = update.bloom_fpr {
            next.bloom_fpr = v;
        }
        if let Some(v) = update.index_sample_ratio {
            next.index_sample_ratio = v;
        }
        if let Some(v) = update.sync_mode {
            next.sync_mode = v;
        }
        if let Some(v) = update.sync_interval_us {
            next.sync_interval_us = v;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Runtime-mutable subset of [`ColumnFamilyConfig`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeConfigUpdate {
    pub write_buffer_size: Option<usize>,
    pub skip_list_max_level: Option<usize>,
    pub skip_list_probability: Option<f32>,
    pub bloom_fpr: Option<f64>,
    pub index_sample_ratio: Option<usize>,
    pub sync_mode: Option<SyncMode>,
    pub sync_interval_us: Option<u64>,
}
