use super::block::{Block, BlockEntry, ValueRef};
use super::bloom::BloomFilter;
use super::format::{
    check_frame, check_section, decode_index, decompress, BlockIndex, Footer, Properties,
    FOOTER_LEN,
};
use super::writer::{klog_path, vlog_path};
use crate::cache::{BlockCache, FileCache};
use crate::comparator::Comparator;
use crate::config::CompressionAlgorithm;
use crate::metrics::ColumnFamilyMetrics;
use crate::{Entry, Result, SeqNo, StorageError};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resources shared by every open SSTable of a database.
pub struct TableEnv {
    pub block_cache: BlockCache,
    pub files: FileCache,
    next_cache_id: AtomicU64,
}

impl TableEnv {
    pub fn new(block_cache_bytes: usize, max_open_files: usize) -> Self {
        TableEnv {
            block_cache: BlockCache::new(block_cache_bytes),
            files: FileCache::new(max_open_files),
            next_cache_id: AtomicU64::new(1),
        }
    }

    /// Cache ids are unique per database, unlike file ids which are per
    /// column family.
    fn next_cache_id(&self) -> u64 {
        self.next_cache_id.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

pub struct SsTableReader {
    file_id: u64,
    cache_id: u64,
    klog_path: PathBuf,
    vlog_path: PathBuf,
    env: Arc<TableEnv>,
    metrics: Arc<ColumnFamilyMetrics>,
    comparator: Arc<dyn Comparator>,
    compression: CompressionAlgorithm,
    props: Properties,
    bloom: Option<BloomFilter>,
    index: BlockIndex,
    size_bytes: u64,
    obsolete: AtomicBool,
}

fn read_exact_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

impl SsTableReader {
    /// Open `<dir>/<file_id>.klog` (and its vlog), loading footer, bloom
    /// filter, index and properties. Data blocks load lazily.
    pub fn open(
        dir: &Path,
        file_id: u64,
        env: Arc<TableEnv>,
        comparator: Arc<dyn Comparator>,
        metrics: Arc<ColumnFamilyMetrics>,
    ) -> Result<Self> {
        let klog_path = klog_path(dir, file_id);
        let vlog_path = vlog_path(dir, file_id);
        let mut file = File::open(&klog_path)?;
        let klog_len = file.metadata()?.len();
        if klog_len < FOOTER_LEN as u64 {
            return Err(StorageError::Corruption(format!(
                "{} too short for a footer",
                klog_path.display()
            )));
        }
        let vlog_len = std::fs::metadata(&vlog_path).map(|m| m.len()).unwrap_or(0);

        let footer = Footer::decode(&read_exact_at(&mut file, klog_len - FOOTER_LEN as u64, FOOTER_LEN)?)?;
        let compression = CompressionAlgorithm::from_u8(footer.compression)?;

        let mut section = |offset: u64, len: u64| -> Result<Option<Bytes>> {
            if len == 0 {
                return Ok(None);
            }
            if offset + len > klog_len {
                return Err(StorageError::Corruption("section beyond end of file".into()));
            }
            let raw = read_exact_at(&mut file, offset, len as usize)?;
            Ok(Some(Bytes::copy_from_slice(check_section(&raw)?)))
        };

        let props = match section(footer.props_offset, footer.props_len)? {
            Some(b) => Properties::decode(b)?,
            None => return Err(StorageError::Corruption("missing properties".into())),
        };
        let bloom = section(footer.bloom_offset, footer.bloom_len)?
            .map(|b| BloomFilter::decode(&b))
            .transpose()?;
        let index = section(footer.index_offset, footer.index_len)?
            .map(decode_index)
            .transpose()?
            .unwrap_or_default();

        let cache_id = env.next_cache_id();
        Ok(SsTableReader {
            file_id,
            cache_id,
            klog_path,
            vlog_path,
            env,
            metrics,
            comparator,
            compression,
            props,
            bloom,
            index,
            size_bytes: klog_len + vlog_len,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn props(&self) -> &Properties {
        &self.props
    }

    pub fn smallest(&self) -> &Bytes {
        &self.props.smallest_key
    }

    pub fn largest(&self) -> &Bytes {
        &self.props.largest_key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn paths(&self) -> (&Path, &Path) {
        (&self.klog_path, &self.vlog_path)
    }

    pub fn index_samples(&self) -> usize {
        self.index.entries.len()
    }

    /// Delete the files once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, AtomicOrdering::Release);
    }

    /// Whether [low, high] intersects this table's key range.
    pub fn overlaps(&self, low: &[u8], high: &[u8]) -> bool {
        self.props.entry_count > 0
            && self.comparator.compare(high, &self.props.smallest_key) != Ordering::Less
            && self.comparator.compare(low, &self.props.largest_key) != Ordering::Greater
    }

    pub fn covers(&self, key: &[u8]) -> bool {
        self.overlaps(key, key)
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.as_ref().map_or(true, |b| b.may_contain(key))
    }

    fn load_block(&self, offset: u64, fill_cache: bool) -> Result<Arc<Block>> {
        let cache_key = (self.cache_id, offset);
        if let Some(block) = self.env.block_cache.get(&cache_key) {
            self.metrics.block_cache_hits.inc();
            return Ok(block);
        }
        if self.env.block_cache.is_enabled() {
            self.metrics.block_cache_misses.inc();
        }

        let handle = self.env.files.get_or_open(self.cache_id, false, &self.klog_path)?;
        let body = {
            let mut file = handle.lock();
            let header = read_exact_at(&mut file, offset, 4)?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            read_exact_at(&mut file, offset + 4, len + 4)?
        };
        let packed = check_frame(&body)?;
        let raw = decompress(packed, self.compression)?;
        let block = Arc::new(Block::decode(Bytes::from(raw), body.len() + 4)?);
        if fill_cache {
            self.env.block_cache.insert(cache_key, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Value bytes of `entry`, reading the vlog when needed.
    pub fn resolve(&self, entry: &BlockEntry) -> Result<Entry> {
        let value = match &entry.value {
            ValueRef::Inline(v) => v.clone(),
            ValueRef::Vlog { offset, len } => {
                let handle = self.env.files.get_or_open(self.cache_id, true, &self.vlog_path)?;
                let body = {
                    let mut file = handle.lock();
                    read_exact_at(&mut file, offset + 4, *len as usize + 4)?
                };
                Bytes::from(decompress(check_frame(&body)?, self.compression)?)
            }
        };
        Ok(entry.to_entry(value))
    }

    /// Offset of the last sampled block that starts strictly before `key`.
    fn start_offset(&self, key: &[u8]) -> u64 {
        let target = self.index.truncate(key);
        let pp = self
            .index
            .entries
            .partition_point(|e| self.comparator.compare(&e.prefix, target) == Ordering::Less);
        if pp == 0 {
            0
        } else {
            self.index.entries[pp - 1].offset
        }
    }

    /// Visit entries in order from the block that may hold `key` onward.
    fn walk<F>(&self, key: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&BlockEntry) -> ControlFlow<()>,
    {
        let mut offset = self.start_offset(key);
        while offset < self.props.data_end {
            let block = self.load_block(offset, true)?;
            for e in &block.entries {
                if f(e).is_break() {
                    return Ok(());
                }
            }
            offset += block.disk_len as u64;
        }
        Ok(())
    }

    /// Newest version of `key` with seq <= `snapshot`, tombstones included.
    pub fn get(&self, key: &[u8], snapshot: SeqNo) -> Result<Option<Entry>> {
        if !self.covers(key) {
            return Ok(None);
        }
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                self.metrics.bloom_filter_misses.inc();
                return Ok(None);
            }
            self.metrics.bloom_filter_hits.inc();
        }
        self.metrics.sstable_lookups.inc();

        let cmp = self.comparator.as_ref();
        let mut seen = false;
        let mut found = None;
        self.walk(key, |e| match cmp.compare(&e.key, key) {
            Ordering::Less => ControlFlow::Continue(()),
            Ordering::Greater => ControlFlow::Break(()),
            Ordering::Equal => {
                seen = true;
                if e.seq <= snapshot {
                    found = Some(e.clone());
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        })?;

        if !seen && self.bloom.is_some() {
            self.metrics.bloom_filter_false_positives.inc();
        }
        found.map(|e| self.resolve(&e)).transpose()
    }

    /// Relative cost of scanning [low, high] in this table, from resident
    /// metadata only: data blocks touched times the average entry size.
    pub fn estimate_range(&self, low: &[u8], high: &[u8]) -> f64 {
        if !self.overlaps(low, high) {
            return 0.0;
        }
        let data_blocks = self.props.data_blocks.max(1) as f64;
        let avg_entry = (self.props.key_bytes + self.props.value_bytes) as f64
            / self.props.entry_count.max(1) as f64;

        let blocks = if !self.index.entries.is_empty() {
            let lo = self.index.truncate(low);
            let hi = self.index.truncate(high);
            let inside = self
                .index
                .entries
                .iter()
                .filter(|e| {
                    self.comparator.compare(&e.prefix, lo) != Ordering::Less
                        && self.comparator.compare(&e.prefix, hi) != Ordering::Greater
                })
                .count();
            // the block straddling `low` precedes the first sample inside
            (((inside + 1) as u32 * self.index.sample_ratio.max(1)) as f64).min(data_blocks)
        } else {
            data_blocks * self.key_range_fraction(low, high)
        };
        blocks * avg_entry
    }

    /// Share of the key range covered by [low, high], by linear
    /// interpolation on the leading eight bytes. Only meaningful for byte
    /// order; other comparators count the whole table.
    fn key_range_fraction(&self, low: &[u8], high: &[u8]) -> f64 {
        if !self.comparator.is_bytewise() {
            return 1.0;
        }
        let pos = |k: &[u8]| {
            let mut b = [0u8; 8];
            let n = k.len().min(8);
            b[..n].copy_from_slice(&k[..n]);
            u64::from_be_bytes(b) as f64
        };
        let (lo_t, hi_t) = (pos(&self.props.smallest_key), pos(&self.props.largest_key));
        let span = hi_t - lo_t;
        if span <= 0.0 {
            return 1.0;
        }
        let lo = pos(low).max(lo_t);
        let hi = pos(high).min(hi_t);
        let min_share = 1.0 / self.props.data_blocks.max(1) as f64;
        ((hi - lo) / span).clamp(min_share, 1.0)
    }

    /// End of the block framed at `offset`, from its length header alone.
    fn block_end(&self, offset: u64) -> Result<u64> {
        let handle = self.env.files.get_or_open(self.cache_id, false, &self.klog_path)?;
        let header = read_exact_at(&mut handle.lock(), offset, 4)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        Ok(offset + 4 + len + 4)
    }

    /// Start of the block preceding the one at `offset`. Walks block
    /// headers forward from the nearest index sample.
    fn prev_block_offset(&self, offset: u64) -> Result<Option<u64>> {
        if offset == 0 {
            return Ok(None);
        }
        let mut cur = self
            .index
            .entries
            .iter()
            .rev()
            .map(|e| e.offset)
            .find(|&o| o < offset)
            .unwrap_or(0);
        loop {
            let end = self.block_end(cur)?;
            if end >= offset {
                return Ok(Some(cur));
            }
            cur = end;
        }
    }

    /// Bidirectional cursor over every entry, through the block cache.
    pub fn cursor(self: &Arc<Self>) -> TableCursor {
        TableCursor {
            reader: Arc::clone(self),
            offset: 0,
            block: None,
            pos: 0,
        }
    }

    /// Sequential scan of every entry, bypassing the block cache.
    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            reader: Arc::clone(self),
            offset: 0,
            block: None,
            pos: 0,
        }
    }
}

impl Drop for SsTableReader {
    fn drop(&mut self) {
        self.env.files.evict(self.cache_id);
        self.env.block_cache.purge_file(self.cache_id);
        if self.obsolete.load(AtomicOrdering::Acquire) {
            for path in [&self.klog_path, &self.vlog_path] {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "failed to delete obsolete SSTable");
                    }
                }
            }
            debug!(file_id = self.file_id, "deleted obsolete SSTable");
        }
    }
}

/// Position inside one table, in (key, newest seq first) order. Unpositioned
/// once it steps off either end.
#[derive(Clone)]
pub struct TableCursor {
    reader: Arc<SsTableReader>,
    offset: u64,
    block: Option<Arc<Block>>,
    pos: usize,
}

impl TableCursor {
    pub fn reader(&self) -> &Arc<SsTableReader> {
        &self.reader
    }

    pub fn entry(&self) -> Option<&BlockEntry> {
        self.block.as_ref().and_then(|b| b.entries.get(self.pos))
    }

    fn load(&mut self, offset: u64) -> Result<Option<Arc<Block>>> {
        if offset >= self.reader.props.data_end {
            self.block = None;
            return Ok(None);
        }
        let block = self.reader.load_block(offset, true)?;
        self.offset = offset;
        self.block = Some(Arc::clone(&block));
        Ok(Some(block))
    }

    /// First entry at or after block `offset` whose key is not `before`.
    fn scan_from(&mut self, mut offset: u64, before: impl Fn(&[u8]) -> bool) -> Result<()> {
        while let Some(block) = self.load(offset)? {
            let i = block.entries.partition_point(|e| before(&e.key[..]));
            if i < block.entries.len() {
                self.pos = i;
                return Ok(());
            }
            offset += block.disk_len as u64;
        }
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.scan_from(0, |_| false)
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        let Some(mut offset) = self.reader.prev_block_offset(self.reader.props.data_end)? else {
            self.block = None;
            return Ok(());
        };
        loop {
            match self.load(offset)? {
                Some(block) if !block.entries.is_empty() => {
                    self.pos = block.entries.len() - 1;
                    return Ok(());
                }
                Some(_) => match self.reader.prev_block_offset(offset)? {
                    Some(prev) => offset = prev,
                    None => {
                        self.block = None;
                        return Ok(());
                    }
                },
                None => return Ok(()),
            }
        }
    }

    /// First entry with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let cmp = Arc::clone(&self.reader.comparator);
        let start = self.reader.start_offset(key);
        self.scan_from(start, |k| cmp.compare(k, key) == Ordering::Less)
    }

    /// Last entry with key <= `key`.
    pub fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        let cmp = Arc::clone(&self.reader.comparator);
        let start = self.reader.start_offset(key);
        self.scan_from(start, |k| cmp.compare(k, key) != Ordering::Greater)?;
        if self.block.is_none() {
            self.seek_to_last()
        } else {
            self.prev()
        }
    }

    pub fn next(&mut self) -> Result<()> {
        let Some(block) = self.block.clone() else {
            return Ok(());
        };
        self.pos += 1;
        if self.pos < block.entries.len() {
            return Ok(());
        }
        self.scan_from(self.offset + block.disk_len as u64, |_| false)
    }

    pub fn prev(&mut self) -> Result<()> {
        if self.block.is_none() {
            return Ok(());
        }
        if self.pos > 0 {
            self.pos -= 1;
            return Ok(());
        }
        let mut offset = self.offset;
        loop {
            let Some(prev) = self.reader.prev_block_offset(offset)? else {
                self.block = None;
                return Ok(());
            };
            match self.load(prev)? {
                Some(block) if !block.entries.is_empty() => {
                    self.pos = block.entries.len() - 1;
                    return Ok(());
                }
                Some(_) => offset = prev,
                None => return Ok(()),
            }
        }
    }
}

pub struct TableIter {
    reader: Arc<SsTableReader>,
    offset: u64,
    block: Option<Arc<Block>>,
    pos: usize,
}

impl Iterator for TableIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(block) = &self.block {
                if let Some(e) = block.entries.get(self.pos) {
                    self.pos += 1;
                    return Some(self.reader.resolve(e));
                }
                self.offset += block.disk_len as u64;
                self.block = None;
            }
            if self.offset >= self.reader.props.data_end {
                return None;
            }
            match self.reader.load_block(self.offset, false) {
                Ok(block) => {
                    self.block = Some(block);
                    self.pos = 0;
                }
                Err(e) => {
                    self.offset = self.reader.props.data_end;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::MemcmpComparator;
    use crate::config::ColumnFamilyConfig;
    use crate::sstable::writer::{SsTableWriter, WriterOptions};
    use tempfile::tempdir;

    fn env() -> Arc<TableEnv> {
        Arc::new(TableEnv::new(4 * 1024 * 1024, 16))
    }

    fn build(dir: &Path, cfg: &ColumnFamilyConfig, entries: &[Entry]) -> Result<Properties> {
        let mut w = SsTableWriter::create(dir, 1, WriterOptions::from_config(cfg, true))?;
        for e in entries {
            w.add(e)?;
        }
        w.finish()
    }

    fn open(dir: &Path, env: Arc<TableEnv>) -> Result<Arc<SsTableReader>> {
        Ok(Arc::new(SsTableReader::open(
            dir,
            1,
            env,
            Arc::new(MemcmpComparator),
            Arc::new(ColumnFamilyMetrics::new()),
        )?))
    }

    fn dataset() -> Vec<Entry> {
        let mut out = Vec::new();
        for i in 0..2_000u32 {
            let key = format!("key{:06}", i * 2).into_bytes();
            if i % 10 == 0 {
                // two versions, newest first
                out.push(Entry::put(key.clone(), format!("new{}", i).into_bytes(), 20, 0));
                out.push(Entry::put(key, format!("old{}", i).into_bytes(), 10, 0));
            } else if i % 7 == 0 {
                out.push(Entry::delete(key, 15));
            } else {
                out.push(Entry::put(key, format!("v{}", i).into_bytes(), 5, 0));
            }
        }
        out
    }

    #[test]
    fn test_point_lookups_across_compressions() -> Result<()> {
        for compression in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
        ] {
            let dir = tempdir()?;
            let cfg = ColumnFamilyConfig {
                compression,
                ..Default::default()
            };
            let props = build(dir.path(), &cfg, &dataset())?;
            assert_eq!(props.distinct_keys, 2_000);
            assert!(props.data_blocks > 1);

            let reader = open(dir.path(), env())?;
            let hit = reader.get(b"key000020", SeqNo::MAX)?.unwrap();
            assert_eq!(hit.value, Bytes::from_static(b"new10"));
            let older = reader.get(b"key000020", 15)?.unwrap();
            assert_eq!(older.value, Bytes::from_static(b"old10"));
            assert!(reader.get(b"key000020", 5)?.is_none());
            assert!(reader.get(b"key000014", SeqNo::MAX)?.unwrap().is_tombstone());
            assert!(reader.get(b"key000003", SeqNo::MAX)?.is_none());
            assert!(reader.get(b"zzz", SeqNo::MAX)?.is_none());
        }
        Ok(())
    }

    #[test]
    fn test_large_values_go_to_vlog() -> Result<()> {
        let dir = tempdir()?;
        let cfg = ColumnFamilyConfig {
            klog_value_threshold: 64,
            ..Default::default()
        };
        let big = vec![7u8; 10_000];
        build(
            dir.path(),
            &cfg,
            &[
                Entry::put(&b"a"[..], big.clone(), 1, 0),
                Entry::put(&b"b"[..], &b"small"[..], 1, 0),
            ],
        )?;
        let reader = open(dir.path(), env())?;
        assert_eq!(reader.get(b"a", 1)?.unwrap().value, Bytes::from(big));
        assert_eq!(reader.get(b"b", 1)?.unwrap().value, Bytes::from_static(b"small"));
        assert!(std::fs::metadata(&reader.paths().1)?.len() > 0);
        Ok(())
    }

    #[test]
    fn test_seek_and_scan() -> Result<()> {
        let dir = tempdir()?;
        let cfg = ColumnFamilyConfig {
            index_sample_ratio: 3,
            block_index_prefix_len: 4,
            ..Default::default()
        };
        build(dir.path(), &cfg, &dataset())?;
        let reader = open(dir.path(), env())?;
        assert!(reader.index_samples() > 0);

        let at = |c: &TableCursor| c.entry().map(|e| (String::from_utf8_lossy(&e.key).into_owned(), e.seq));
        let mut cursor = reader.cursor();
        cursor.seek(b"key000101")?;
        assert_eq!(at(&cursor), Some(("key000102".to_string(), 5)));
        cursor.seek(b"key000100")?;
        assert_eq!(at(&cursor), Some(("key000100".to_string(), 20)));
        cursor.next()?;
        assert_eq!(at(&cursor), Some(("key000100".to_string(), 10)));
        cursor.next()?;
        assert_eq!(at(&cursor), Some(("key000102".to_string(), 5)));

        cursor.seek_for_prev(b"key000101")?;
        assert_eq!(at(&cursor), Some(("key000100".to_string(), 10)));
        cursor.prev()?;
        assert_eq!(at(&cursor), Some(("key000100".to_string(), 20)));
        cursor.prev()?;
        assert_eq!(at(&cursor), Some(("key000098".to_string(), 5)));

        cursor.seek_for_prev(b"a")?;
        assert!(cursor.entry().is_none());
        cursor.seek(b"key003999")?;
        assert!(cursor.entry().is_none());
        cursor.seek_to_first()?;
        assert_eq!(at(&cursor), Some(("key000000".to_string(), 20)));

        // crosses every block boundary in both directions
        let mut forward = 0;
        while cursor.entry().is_some() {
            forward += 1;
            cursor.next()?;
        }
        assert_eq!(forward, dataset().len());
        cursor.seek_to_last()?;
        let mut backward = Vec::new();
        while let Some(e) = cursor.entry() {
            backward.push(e.key.clone());
            cursor.prev()?;
        }
        let mut expected: Vec<Bytes> = dataset().into_iter().map(|e| e.key).collect();
        expected.reverse();
        assert_eq!(backward, expected);
        assert!(reader.props().data_blocks > 1);

        let all: Vec<Entry> = reader.iter().collect::<Result<_>>()?;
        assert_eq!(all, dataset());
        Ok(())
    }

    #[test]
    fn test_block_cache_reuse_and_range_estimate() -> Result<()> {
        let dir = tempdir()?;
        build(dir.path(), &ColumnFamilyConfig::default(), &dataset())?;
        let env = env();
        let reader = open(dir.path(), Arc::clone(&env))?;
        reader.get(b"key000500", SeqNo::MAX)?;
        reader.get(b"key000500", SeqNo::MAX)?;
        let stats = env.block_cache.stats();
        assert!(stats.hits >= 1);
        assert!(stats.total_entries >= 1);

        let narrow = reader.estimate_range(b"key000100", b"key000200");
        let wide = reader.estimate_range(b"key000100", b"key002000");
        assert!(narrow > 0.0);
        assert!(wide >= narrow);
        assert_eq!(reader.estimate_range(b"a", b"b"), 0.0);
        Ok(())
    }

    #[test]
    fn test_obsolete_table_deleted_on_drop() -> Result<()> {
        let dir = tempdir()?;
        build(dir.path(), &ColumnFamilyConfig::default(), &dataset())?;
        let reader = open(dir.path(), env())?;
        let (klog, vlog) = (reader.paths().0.to_path_buf(), reader.paths().1.to_path_buf());
        let held = Arc::clone(&reader);
        reader.mark_obsolete();
        drop(reader);
        assert!(klog.exists());
        drop(held);
        assert!(!klog.exists());
        assert!(!vlog.exists());
        Ok(())
    }

    #[test]
    fn test_corrupt_footer_rejected() -> Result<()> {
        let dir = tempdir()?;
        build(dir.path(), &ColumnFamilyConfig::default(), &dataset())?;
        let path = klog_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path)?;
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        std::fs::write(&path, bytes)?;
        assert!(matches!(open(dir.path(), env()), Err(StorageError::Corruption(_))));
        Ok(())
    }
}
