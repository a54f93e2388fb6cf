pub mod cache;
pub mod column_family;
pub mod comparator;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod flush;
pub mod hook;
pub mod iterator;
pub mod logging;
pub mod manifest;
pub mod memtable;
pub mod metrics;
pub mod sstable;
pub mod txn;
pub mod version;
pub mod wal;

pub use cache::{BlockCache, CacheStats};
pub use column_family::{ColumnFamily, ColumnFamilyStats};
pub use comparator::{Comparator, ComparatorRegistry};
pub use compaction::CompactionStats;
pub use config::{
    ColumnFamilyConfig, CompressionAlgorithm, Config, IsolationLevel, LogLevel,
    RuntimeConfigUpdate, SyncMode,
};
pub use db::Database;
pub use error::{ErrorCode, Result, StorageError};
pub use hook::{CommitHook, CommitOp};
pub use iterator::DbIterator;
pub use memtable::MemTable;
pub use sstable::{SsTableReader, SsTableWriter};
pub use txn::Transaction;
pub use wal::Wal;

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// Commit sequence number. 0 means "nothing committed yet".
pub type SeqNo = u64;

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// One version of a key, as stored in memtables, WAL batches and SSTables.
///
/// `ttl` is an absolute expiration time in Unix seconds, 0 for none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
    pub seq: SeqNo,
    pub ttl: u64,
    pub op: OpType,
}

impl Entry {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, seq: SeqNo, ttl: u64) -> Self {
        Entry {
            key: key.into(),
            value: value.into(),
            seq,
            ttl,
            op: OpType::Put,
        }
    }

    pub fn delete(key: impl Into<Bytes>, seq: SeqNo) -> Self {
        Entry {
            key: key.into(),
            value: Bytes::new(),
            seq,
            ttl: 0,
            op: OpType::Delete,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.op == OpType::Delete
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && self.ttl <= now
    }

    /// Tombstoned or expired: reads treat the key as absent.
    pub fn is_dead(&self, now: u64) -> bool {
        self.is_tombstone() || self.is_expired(now)
    }

    /// Approximate in-memory footprint used for write-buffer accounting.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + 8 + 8 + 1
    }
}

/// Operation types for WAL records and SSTable entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Put = 1,
    Delete = 2,
}

impl OpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpType::Put),
            2 => Some(OpType::Delete),
            _ => None,
        }
    }
}

/// Current wall-clock time in Unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
