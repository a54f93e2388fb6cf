//! Shared block cache and SSTable file-handle cache.
//!
//! Both are built on [`LruCache`], an arena-backed LRU list whose nodes link
//! to each other by slot index.

use crate::error::Result;
use crate::sstable::block::Block;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::hash::Hash;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NIL: usize = usize::MAX;
const DEFAULT_PARTITIONS: usize = 16;
const MIN_PARTITION_BYTES: usize = 256 * 1024;

struct Node<K, V> {
    key: K,
    value: V,
    charge: usize,
    prev: usize,
    next: usize,
}

/// Capacity-bounded LRU map. Each entry carries a caller-defined charge;
/// inserts evict from the cold end until the total charge fits.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// most recently used
    head: usize,
    /// least recently used
    tail: usize,
    capacity: usize,
    usage: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize) -> Self {
        LruCache {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            usage: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        match &self.slots[idx] {
            Some(node) => node,
            None => unreachable!("lru slot {} linked but empty", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        match &mut self.slots[idx] {
            Some(node) => node,
            None => unreachable!("lru slot {} linked but empty", idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(idx);
            n.prev = NIL;
            n.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
        Some(&self.node(idx).value)
    }

    /// Insert or replace. Returns the values evicted to make room.
    pub fn insert(&mut self, key: K, value: V, charge: usize) -> Vec<V> {
        let mut evicted = Vec::new();
        if let Some(old) = self.remove(&key) {
            evicted.push(old);
        }
        if charge > self.capacity {
            evicted.push(value);
            return evicted;
        }
        while self.usage + charge > self.capacity && self.tail != NIL {
            let victim = self.tail;
            let victim_key = self.node(victim).key.clone();
            if let Some(v) = self.remove(&victim_key) {
                evicted.push(v);
            }
        }

        let node = Node {
            key: key.clone(),
            value,
            charge,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key, idx);
        self.usage += charge;
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        self.usage -= node.charge;
        Some(node.value)
    }

    /// Remove every entry whose key matches `pred`.
    pub fn remove_if(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let doomed: Vec<K> = self.map.keys().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

/// (cache id of the SSTable, block offset in its klog)
pub type BlockKey = (u64, u64);

struct Partition {
    lru: Mutex<LruCache<BlockKey, Arc<Block>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Partitioned LRU cache of decompressed data blocks shared by every
/// column family of a database. Capacity 0 disables it.
pub struct BlockCache {
    partitions: Vec<Partition>,
    capacity: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartitionStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub num_partitions: usize,
    pub partitions: Vec<PartitionStats>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            return BlockCache {
                partitions: Vec::new(),
                capacity: 0,
            };
        }
        let mut count = DEFAULT_PARTITIONS;
        while count > 1 && capacity / count < MIN_PARTITION_BYTES {
            count /= 2;
        }
        let per_partition = capacity / count;
        let partitions = (0..count)
            .map(|_| Partition {
                lru: Mutex::new(LruCache::new(per_partition)),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            })
            .collect();
        BlockCache {
            partitions,
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn partition(&self, key: &BlockKey) -> &Partition {
        let h = key
            .0
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (key.1 >> 6).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        let idx = (h >> 32) as usize & (self.partitions.len() - 1);
        &self.partitions[idx]
    }

    pub fn get(&self, key: &BlockKey) -> Option<Arc<Block>> {
        if !self.is_enabled() {
            return None;
        }
        let part = self.partition(key);
        let found = part.lru.lock().get(key).cloned();
        match found {
            Some(_) => part.hits.fetch_add(1, Ordering::Relaxed),
            None => part.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: BlockKey, block: Arc<Block>) {
        if !self.is_enabled() {
            return;
        }
        let charge = block.charge();
        let part = self.partition(&key);
        // evicted blocks are dropped after the lock is released
        let _evicted = part.lru.lock().insert(key, block, charge);
    }

    /// Drop every cached block of one SSTable.
    pub fn purge_file(&self, cache_id: u64) {
        for part in &self.partitions {
            part.lru.lock().remove_if(|k| k.0 == cache_id);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            enabled: self.is_enabled(),
            num_partitions: self.partitions.len(),
            ..Default::default()
        };
        for part in &self.partitions {
            let (entries, bytes) = {
                let lru = part.lru.lock();
                (lru.len(), lru.usage())
            };
            let ps = PartitionStats {
                entries,
                bytes,
                hits: part.hits.load(Ordering::Relaxed),
                misses: part.misses.load(Ordering::Relaxed),
            };
            stats.total_entries += ps.entries;
            stats.total_bytes += ps.bytes;
            stats.hits += ps.hits;
            stats.misses += ps.misses;
            stats.partitions.push(ps);
        }
        let lookups = stats.hits + stats.misses;
        if lookups > 0 {
            stats.hit_rate = stats.hits as f64 / lookups as f64;
        }
        stats
    }
}

/// Open klog/vlog handles, bounded by `max_open_sstables`. Evicted handles
/// close once the last in-flight reader lets go of them.
pub struct FileCache {
    lru: Mutex<LruCache<(u64, bool), Arc<Mutex<File>>>>,
}

impl FileCache {
    pub fn new(max_open: usize) -> Self {
        FileCache {
            lru: Mutex::new(LruCache::new(max_open.max(2))),
        }
    }

    /// Handle for `(cache_id, is_vlog)`, opening `path` on a miss.
    pub fn get_or_open(&self, cache_id: u64, is_vlog: bool, path: &Path) -> Result<Arc<Mutex<File>>> {
        let key = (cache_id, is_vlog);
        if let Some(handle) = self.lru.lock().get(&key) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(Mutex::new(File::open(path)?));
        let _evicted = self.lru.lock().insert(key, Arc::clone(&handle), 1);
        Ok(handle)
    }

    pub fn evict(&self, cache_id: u64) {
        self.lru.lock().remove_if(|k| k.0 == cache_id);
    }

    pub fn open_count(&self) -> usize {
        self.lru.lock().len()
    }
}
