//! Copy-on-write level layout of a column family.
//!
//! A [`Version`] is never mutated once published: flush and compaction
//! build a new one from the old plus an edit and swap the `Arc`. Readers
//! holding the old `Arc` keep their files alive until they let go.

use crate::comparator::Comparator;
use crate::sstable::SsTableReader;
use crate::{Entry, Result, SeqNo};
use std::cmp::Ordering;
use std::sync::Arc;

pub type Level = Vec<Arc<SsTableReader>>;

/// Files removed from and added to a version by one flush or compaction.
#[derive(Default)]
pub struct VersionEdit {
    pub removed: Vec<(usize, u64)>,
    pub added: Vec<(usize, Arc<SsTableReader>)>,
}

#[derive(Clone)]
pub struct Version {
    /// `levels[0]` is L0, newest file first. Deeper levels are sorted by
    /// smallest key and never overlap.
    pub levels: Vec<Level>,
    comparator: Arc<dyn Comparator>,
}

impl Version {
    pub fn new(num_levels: usize, comparator: Arc<dyn Comparator>) -> Self {
        Version {
            levels: vec![Vec::new(); num_levels.max(2)],
            comparator,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn l0_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map(|l| l.iter().map(|t| t.size_bytes()).sum())
            .unwrap_or(0)
    }

    pub fn level_keys(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map(|l| l.iter().map(|t| t.props().entry_count).sum())
            .unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<SsTableReader>> {
        self.levels.iter().flatten()
    }

    /// File ids per level, for the manifest.
    pub fn layout(&self) -> Vec<Vec<u64>> {
        self.levels
            .iter()
            .map(|l| l.iter().map(|t| t.file_id()).collect())
            .collect()
    }

    /// The single file of a sorted level whose range may contain `key`.
    pub fn find_in_level(&self, level: usize, key: &[u8]) -> Option<&Arc<SsTableReader>> {
        let files = self.levels.get(level)?;
        let idx = files
            .partition_point(|t| self.comparator.compare(t.largest(), key) == Ordering::Less);
        files.get(idx).filter(|t| t.covers(key))
    }

    /// Newest version of `key` visible at `snapshot` across all levels.
    pub fn get(&self, key: &[u8], snapshot: SeqNo) -> Result<Option<Entry>> {
        for table in &self.levels[0] {
            if let Some(e) = table.get(key, snapshot)? {
                return Ok(Some(e));
            }
        }
        for level in 1..self.levels.len() {
            if let Some(table) = self.find_in_level(level, key) {
                if let Some(e) = table.get(key, snapshot)? {
                    return Ok(Some(e));
                }
            }
        }
        Ok(None)
    }

    pub fn overlapping(&self, level: usize, low: &[u8], high: &[u8]) -> Vec<Arc<SsTableReader>> {
        self.levels
            .get(level)
            .map(|l| l.iter().filter(|t| t.overlaps(low, high)).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any level deeper than `level` holds a file covering `key`.
    pub fn covered_below(&self, level: usize, key: &[u8]) -> bool {
        (level + 1..self.levels.len()).any(|l| {
            if l == 0 {
                self.levels[0].iter().any(|t| t.covers(key))
            } else {
                self.find_in_level(l, key).is_some()
            }
        })
    }

    /// Smallest and largest key over `tables`.
    pub fn key_range(&self, tables: &[Arc<SsTableReader>]) -> Option<(bytes::Bytes, bytes::Bytes)> {
        let mut range: Option<(bytes::Bytes, bytes::Bytes)> = None;
        for t in tables.iter().filter(|t| t.props().entry_count > 0) {
            range = Some(match range {
                None => (t.smallest().clone(), t.largest().clone()),
                Some((lo, hi)) => {
                    let lo = if self.comparator.compare(t.smallest(), &lo) == Ordering::Less {
                        t.smallest().clone()
                    } else {
                        lo
                    };
                    let hi = if self.comparator.compare(t.largest(), &hi) == Ordering::Greater {
                        t.largest().clone()
                    } else {
                        hi
                    };
                    (lo, hi)
                }
            });
        }
        range
    }

    /// New version with `edit` applied. `min_levels` empty levels are kept.
    pub fn apply(&self, edit: VersionEdit) -> Version {
        let mut next = self.clone();
        for (level, file_id) in &edit.removed {
            if let Some(files) = next.levels.get_mut(*level) {
                files.retain(|t| t.file_id() != *file_id);
            }
        }
        for (level, table) in edit.added {
            while next.levels.len() <= level {
                next.levels.push(Vec::new());
            }
            next.levels[level].push(table);
        }
        next.levels[0].sort_by(|a, b| b.file_id().cmp(&a.file_id()));
        let cmp = Arc::clone(&self.comparator);
        for level in next.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| cmp.compare(a.smallest(), b.smallest()));
        }
        next
    }

    /// Append an empty level at the bottom.
    pub fn with_extra_level(&self) -> Version {
        let mut next = self.clone();
        next.levels.push(Vec::new());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::MemcmpComparator;
    use crate::config::ColumnFamilyConfig;
    use crate::metrics::ColumnFamilyMetrics;
    use crate::sstable::{SsTableWriter, TableEnv, WriterOptions};
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::tempdir;

    fn table(dir: &Path, env: &Arc<TableEnv>, id: u64, entries: &[Entry]) -> Result<Arc<SsTableReader>> {
        let opts = WriterOptions::from_config(&ColumnFamilyConfig::default(), true);
        let mut w = SsTableWriter::create(dir, id, opts)?;
        for e in entries {
            w.add(e)?;
        }
        w.finish()?;
        Ok(Arc::new(SsTableReader::open(
            dir,
            id,
            Arc::clone(env),
            Arc::new(MemcmpComparator),
            Arc::new(ColumnFamilyMetrics::new()),
        )?))
    }

    #[test]
    fn test_lookup_prefers_newer_levels() -> Result<()> {
        let dir = tempdir()?;
        let env = Arc::new(TableEnv::new(1 << 20, 16));
        let l1a = table(dir.path(), &env, 1, &[Entry::put(&b"a"[..], &b"l1"[..], 1, 0)])?;
        let l1b = table(dir.path(), &env, 2, &[Entry::put(&b"m"[..], &b"l1"[..], 2, 0)])?;
        let l0_old = table(dir.path(), &env, 3, &[Entry::put(&b"m"[..], &b"l0-old"[..], 3, 0)])?;
        let l0_new = table(dir.path(), &env, 4, &[Entry::delete(&b"a"[..], 4)])?;

        let v = Version::new(3, Arc::new(MemcmpComparator)).apply(VersionEdit {
            removed: vec![],
            added: vec![(1, l1b), (1, l1a), (0, l0_old), (0, l0_new)],
        });
        assert_eq!(v.layout(), vec![vec![4, 3], vec![1, 2], vec![]]);

        assert!(v.get(b"a", SeqNo::MAX)?.unwrap().is_tombstone());
        assert_eq!(v.get(b"a", 3)?.unwrap().value, Bytes::from_static(b"l1"));
        assert_eq!(v.get(b"m", SeqNo::MAX)?.unwrap().value, Bytes::from_static(b"l0-old"));
        assert!(v.get(b"z", SeqNo::MAX)?.is_none());

        assert_eq!(v.find_in_level(1, b"m").map(|t| t.file_id()), Some(2));
        assert!(v.find_in_level(1, b"c").is_none());
        assert!(v.covered_below(0, b"m"));
        assert!(!v.covered_below(1, b"m"));
        assert_eq!(v.overlapping(1, b"b", b"z").len(), 1);
        Ok(())
    }

    #[test]
    fn test_apply_is_copy_on_write() -> Result<()> {
        let dir = tempdir()?;
        let env = Arc::new(TableEnv::new(1 << 20, 16));
        let t = table(dir.path(), &env, 1, &[Entry::put(&b"k"[..], &b"v"[..], 1, 0)])?;
        let v1 = Version::new(2, Arc::new(MemcmpComparator)).apply(VersionEdit {
            removed: vec![],
            added: vec![(0, t)],
        });
        let v2 = v1.apply(VersionEdit {
            removed: vec![(0, 1)],
            added: vec![],
        });
        assert_eq!(v1.file_count(), 1);
        assert_eq!(v2.file_count(), 0);
        assert!(v1.level_size(0) > 0);
        assert_eq!(v1.level_keys(0), 1);
        assert_eq!(v2.with_extra_level().num_levels(), 3);
        Ok(())
    }
}
