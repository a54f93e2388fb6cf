//! Bloom filter over the distinct keys of one SSTable.
//!
//! Keys are reduced to a 64-bit fingerprint (two CRC32 values) before they
//! reach the filter, so a table written by one process answers the same way
//! in another. The filter itself, hasher keys included, is persisted with
//! bincode.

use crate::{Result, StorageError};
use probabilistic_collections::bloom::BloomFilter as Bloom;

const SECOND_SEED: u32 = 0x9E37_79B9;

pub struct BloomFilter {
    inner: Bloom<u64>,
}

/// Two independent 32-bit hashes of `key`, packed low/high.
pub fn hash_key(key: &[u8]) -> u64 {
    let h1 = crc32fast::hash(key);
    let mut hasher = crc32fast::Hasher::new_with_initial(SECOND_SEED);
    hasher.update(key);
    let h2 = hasher.finalize();
    (h1 as u64) | ((h2 as u64) << 32)
}

impl BloomFilter {
    /// Size for `expected` keys at false-positive rate `fpr`.
    pub fn new(expected: usize, fpr: f64) -> Self {
        BloomFilter {
            inner: Bloom::new(expected.max(1), fpr),
        }
    }

    pub fn from_hashes(hashes: &[u64], fpr: f64) -> Self {
        let mut filter = Self::new(hashes.len(), fpr);
        for hash in hashes {
            filter.inner.insert(hash);
        }
        filter
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.inner.insert(&hash_key(key));
    }

    /// False means definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.inner.contains(&hash_key(key))
    }

    pub fn hasher_count(&self) -> usize {
        self.inner.hasher_count()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&self.inner)
            .map_err(|e| StorageError::Corruption(format!("bloom encode: {}", e)))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let inner: Bloom<u64> = bincode::deserialize(buf)
            .map_err(|e| StorageError::Corruption(format!("malformed bloom section: {}", e)))?;
        Ok(BloomFilter { inner })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.inner.len())
            .field("hashers", &self.inner.hasher_count())
            .finish()
    }
}
