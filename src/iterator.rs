//! Bidirectional iterator over a column family.
//!
//! The iterator pins one [`SuperVersion`] and one read bound at creation.
//! Every source (pending transaction writes, each memtable, each SSTable)
//! keeps its own cursor, collapsed to the newest version each key has at
//! the read bound. A binary heap merges the cursors; each step only moves
//! the sources that sat on the key just returned. Keys whose winning
//! version is a tombstone or expired are stepped over.

use crate::column_family::{ColumnFamily, SuperVersion};
use crate::comparator::Comparator;
use crate::memtable::MemTable;
use crate::sstable::block::BlockEntry;
use crate::sstable::TableCursor;
use crate::{now_secs, Entry, Result, SeqNo, StorageError};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// One ordered input of the merge, positioned on a key.
trait Source: Send {
    fn seek_to_first(&mut self) -> Result<()>;
    fn seek_to_last(&mut self) -> Result<()>;
    /// First key >= `key`.
    fn seek(&mut self, key: &[u8]) -> Result<()>;
    /// Last key <= `key`.
    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn prev(&mut self) -> Result<()>;
    /// Current key and the seq of its newest visible version.
    fn head(&self) -> Option<(&Bytes, SeqNo)>;
    /// Newest visible version of the current key.
    fn entry(&self) -> Result<Entry>;
}

/// The owning transaction's writes, one per key, sorted. They shadow
/// every committed version.
struct PendingSource {
    entries: Vec<Entry>,
    cmp: Arc<dyn Comparator>,
    pos: Option<usize>,
}

impl Source for PendingSource {
    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = (!self.entries.is_empty()).then_some(0);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.pos = self.entries.len().checked_sub(1);
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let i = self
            .entries
            .partition_point(|e| self.cmp.compare(&e.key, key) == Ordering::Less);
        self.pos = (i < self.entries.len()).then_some(i);
        Ok(())
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        let i = self
            .entries
            .partition_point(|e| self.cmp.compare(&e.key, key) != Ordering::Greater);
        self.pos = i.checked_sub(1);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.pos = self.pos.map(|p| p + 1).filter(|&p| p < self.entries.len());
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
        Ok(())
    }

    fn head(&self) -> Option<(&Bytes, SeqNo)> {
        self.pos
            .and_then(|p| self.entries.get(p))
            .map(|e| (&e.key, SeqNo::MAX))
    }

    fn entry(&self) -> Result<Entry> {
        self.pos
            .and_then(|p| self.entries.get(p))
            .cloned()
            .ok_or_else(|| StorageError::InvalidState("source is not positioned".into()))
    }
}

struct MemSource {
    mt: Arc<MemTable>,
    snapshot: SeqNo,
    current: Option<Entry>,
}

impl MemSource {
    /// Land on `cand` or the nearest key past it in `dir` with a version
    /// at or below the read bound.
    fn settle(&mut self, mut cand: Option<Bytes>, dir: Direction) {
        self.current = None;
        while let Some(key) = cand {
            if let Some(e) = self.mt.get(&key, self.snapshot) {
                self.current = Some(e);
                return;
            }
            cand = match dir {
                Direction::Forward => self.mt.seek_gt(&key),
                Direction::Backward => self.mt.seek_lt(&key),
            };
        }
    }
}

impl Source for MemSource {
    fn seek_to_first(&mut self) -> Result<()> {
        self.settle(self.mt.first_key(), Direction::Forward);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.settle(self.mt.last_key(), Direction::Backward);
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.settle(self.mt.seek_ge(key), Direction::Forward);
        Ok(())
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        self.settle(self.mt.seek_le(key), Direction::Backward);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some(e) = self.current.take() {
            self.settle(self.mt.seek_gt(&e.key), Direction::Forward);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if let Some(e) = self.current.take() {
            self.settle(self.mt.seek_lt(&e.key), Direction::Backward);
        }
        Ok(())
    }

    fn head(&self) -> Option<(&Bytes, SeqNo)> {
        self.current.as_ref().map(|e| (&e.key, e.seq))
    }

    fn entry(&self) -> Result<Entry> {
        self.current
            .clone()
            .ok_or_else(|| StorageError::InvalidState("source is not positioned".into()))
    }
}

/// Table cursor kept on the first (newest) entry of the current key.
/// Values are only read from the vlog when the key wins the merge.
struct TableSource {
    cursor: TableCursor,
    cmp: Arc<dyn Comparator>,
    snapshot: SeqNo,
    visible: Option<BlockEntry>,
}

impl TableSource {
    fn same_key(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp.compare(a, b) == Ordering::Equal
    }

    /// From the start of a key group, find the first group with a version
    /// at or below the read bound.
    fn settle_forward(&mut self) -> Result<()> {
        self.visible = None;
        while let Some(first) = self.cursor.entry().cloned() {
            let start = self.cursor.clone();
            loop {
                match self.cursor.entry() {
                    Some(e) if self.same_key(&e.key, &first.key) => {
                        if e.seq <= self.snapshot {
                            self.visible = Some(e.clone());
                            self.cursor = start;
                            return Ok(());
                        }
                    }
                    _ => break,
                }
                self.cursor.next()?;
            }
        }
        Ok(())
    }

    /// From the end of a key group, walk back to its start and keep the
    /// newest version at or below the read bound; repeat on earlier groups
    /// until one has such a version.
    fn settle_backward(&mut self) -> Result<()> {
        self.visible = None;
        while let Some(last) = self.cursor.entry().cloned() {
            let mut start = self.cursor.clone();
            let mut found = None;
            loop {
                match self.cursor.entry() {
                    Some(e) if self.same_key(&e.key, &last.key) => {
                        if e.seq <= self.snapshot {
                            found = Some(e.clone());
                        }
                    }
                    _ => break,
                }
                start = self.cursor.clone();
                self.cursor.prev()?;
            }
            if found.is_some() {
                self.visible = found;
                self.cursor = start;
                return Ok(());
            }
        }
        Ok(())
    }

    fn skip_group(&mut self) -> Result<()> {
        let Some(key) = self.visible.take().map(|e| e.key) else {
            return Ok(());
        };
        while let Some(e) = self.cursor.entry() {
            if !self.same_key(&e.key, &key) {
                break;
            }
            self.cursor.next()?;
        }
        Ok(())
    }
}

impl Source for TableSource {
    fn seek_to_first(&mut self) -> Result<()> {
        self.cursor.seek_to_first()?;
        self.settle_forward()
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.cursor.seek_to_last()?;
        self.settle_backward()
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.seek(key)?;
        self.settle_forward()
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        self.cursor.seek_for_prev(key)?;
        self.settle_backward()
    }

    fn next(&mut self) -> Result<()> {
        if self.visible.is_none() {
            return Ok(());
        }
        self.skip_group()?;
        self.settle_forward()
    }

    fn prev(&mut self) -> Result<()> {
        if self.visible.take().is_none() {
            return Ok(());
        }
        self.cursor.prev()?;
        self.settle_backward()
    }

    fn head(&self) -> Option<(&Bytes, SeqNo)> {
        self.visible.as_ref().map(|e| (&e.key, e.seq))
    }

    fn entry(&self) -> Result<Entry> {
        match &self.visible {
            Some(e) => self.cursor.reader().resolve(e),
            None => Err(StorageError::InvalidState("source is not positioned".into())),
        }
    }
}

/// Heap slot for one source. The heap pops the nearest key in the current
/// direction; on a tie the newest version, then the earliest source.
struct HeapItem {
    key: Bytes,
    seq: SeqNo,
    source: usize,
    dir: Direction,
    comparator: Arc<dyn Comparator>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = self.comparator.compare(&self.key, &other.key);
        let by_key = match self.dir {
            Direction::Forward => by_key.reverse(),
            Direction::Backward => by_key,
        };
        by_key
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

pub struct DbIterator {
    cf: Arc<ColumnFamily>,
    sv: Option<Arc<SuperVersion>>,
    sources: Vec<Box<dyn Source>>,
    heap: BinaryHeap<HeapItem>,
    dir: Direction,
    current: Option<(Bytes, Bytes)>,
}

impl DbIterator {
    pub(crate) fn new(cf: Arc<ColumnFamily>, snapshot: SeqNo, pending: Vec<Entry>) -> Self {
        let cmp = Arc::clone(cf.comparator());
        let mut ops = pending;
        ops.sort_by(|a, b| cmp.compare(&a.key, &b.key));
        let mut latest: Vec<Entry> = Vec::with_capacity(ops.len());
        for e in ops {
            match latest.last_mut() {
                Some(last) if cmp.compare(&last.key, &e.key) == Ordering::Equal => *last = e,
                _ => latest.push(e),
            }
        }

        let sv = cf.super_version();
        let mut sources: Vec<Box<dyn Source>> = Vec::new();
        if !latest.is_empty() {
            sources.push(Box::new(PendingSource {
                entries: latest,
                cmp: Arc::clone(&cmp),
                pos: None,
            }));
        }
        for mt in sv.memtables() {
            sources.push(Box::new(MemSource {
                mt: Arc::clone(mt),
                snapshot,
                current: None,
            }));
        }
        for t in sv.version.files() {
            if t.props().entry_count == 0 {
                continue;
            }
            sources.push(Box::new(TableSource {
                cursor: t.cursor(),
                cmp: Arc::clone(&cmp),
                snapshot,
                visible: None,
            }));
        }

        DbIterator {
            cf,
            sv: Some(sv),
            sources,
            heap: BinaryHeap::new(),
            dir: Direction::Forward,
            current: None,
        }
    }

    fn pinned(&self) -> Result<&Arc<SuperVersion>> {
        self.sv
            .as_ref()
            .ok_or_else(|| StorageError::InvalidState("iterator was freed".into()))
    }

    fn push_head(&mut self, source: usize) {
        if let Some((key, seq)) = self.sources[source].head() {
            self.heap.push(HeapItem {
                key: key.clone(),
                seq,
                source,
                dir: self.dir,
                comparator: Arc::clone(self.cf.comparator()),
            });
        }
    }

    /// Position every source with `place`, then rebuild the heap.
    fn reposition(
        &mut self,
        dir: Direction,
        mut place: impl FnMut(&mut dyn Source) -> Result<()>,
    ) -> Result<()> {
        self.pinned()?;
        self.dir = dir;
        self.current = None;
        self.heap.clear();
        for i in 0..self.sources.len() {
            place(self.sources[i].as_mut())?;
            self.push_head(i);
        }
        Ok(())
    }

    /// Move every source sitting on `key` one key onward.
    fn advance_group(&mut self, key: &[u8]) -> Result<()> {
        let cmp = Arc::clone(self.cf.comparator());
        while let Some(top) = self.heap.peek() {
            if cmp.compare(&top.key, key) != Ordering::Equal {
                break;
            }
            let source = top.source;
            self.heap.pop();
            match self.dir {
                Direction::Forward => self.sources[source].next()?,
                Direction::Backward => self.sources[source].prev()?,
            }
            self.push_head(source);
        }
        Ok(())
    }

    /// Take the heap's winner; skip keys whose winning version is dead.
    fn settle(&mut self) -> Result<()> {
        self.current = None;
        let now = now_secs();
        while let Some(top) = self.heap.peek() {
            let key = top.key.clone();
            let winner = self.sources[top.source].entry()?;
            self.advance_group(&key)?;
            if !winner.is_dead(now) {
                self.current = Some((key, winner.value));
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.reposition(Direction::Forward, |s| s.seek_to_first())?;
        self.settle()
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        self.reposition(Direction::Backward, |s| s.seek_to_last())?;
        self.settle()
    }

    /// Position at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.reposition(Direction::Forward, |s| s.seek(key))?;
        self.settle()
    }

    /// Position at the last key <= `key`.
    pub fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        self.reposition(Direction::Backward, |s| s.seek_for_prev(key))?;
        self.settle()
    }

    pub fn valid(&self) -> bool {
        self.sv.is_some() && self.current.is_some()
    }

    pub fn next(&mut self) -> Result<()> {
        self.step(Direction::Forward)
    }

    pub fn prev(&mut self) -> Result<()> {
        self.step(Direction::Backward)
    }

    fn step(&mut self, dir: Direction) -> Result<()> {
        let key = self.current_key()?;
        if dir != self.dir {
            // sources sit past the current key in the old direction
            match dir {
                Direction::Forward => self.reposition(dir, |s| s.seek(&key))?,
                Direction::Backward => self.reposition(dir, |s| s.seek_for_prev(&key))?,
            }
            self.advance_group(&key)?;
        }
        self.settle()
    }

    fn current_key(&self) -> Result<Bytes> {
        self.pinned()?;
        self.current
            .as_ref()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| StorageError::InvalidState("iterator is not positioned".into()))
    }

    pub fn key(&self) -> Result<&[u8]> {
        self.pinned()?;
        match &self.current {
            Some((k, _)) => Ok(k),
            None => Err(StorageError::InvalidState("iterator is not positioned".into())),
        }
    }

    pub fn value(&self) -> Result<&[u8]> {
        self.pinned()?;
        match &self.current {
            Some((_, v)) => Ok(v),
            None => Err(StorageError::InvalidState("iterator is not positioned".into())),
        }
    }

    /// Release the pinned memtables and files.
    pub fn free(&mut self) {
        self.current = None;
        self.heap.clear();
        self.sources.clear();
        self.sv = None;
    }
}
