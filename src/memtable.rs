//! In-memory write buffer of a column family.
//!
//! Entries are ordered by (key asc under the column family comparator,
//! seq desc), so the newest version of a key is met first. Two index shapes
//! share that order: an arena skip list and an arena B+tree. Both sit behind
//! one `RwLock`: readers run concurrently, the committer inserts alone.

use crate::comparator::Comparator;
use crate::{Entry, SeqNo};
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

const NIL: usize = usize::MAX;
const HEAD: usize = 0;
const BTREE_FANOUT: usize = 32;
/// Rough per-entry overhead of the index nodes.
const NODE_OVERHEAD: usize = 32;

/// Shape of the memtable index, chosen at memtable creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemTableShape {
    SkipList { max_level: usize, probability: f32 },
    BPlusTree,
}

/// (key, seq) position of `e` relative to the target (key, seq).
fn cmp_internal(cmp: &dyn Comparator, e: &Entry, key: &[u8], seq: SeqNo) -> Ordering {
    cmp.compare(&e.key, key).then_with(|| seq.cmp(&e.seq))
}

// === Skip list ===

struct SkipNode {
    entry: Option<Entry>,
    next: Vec<usize>,
    prev: usize,
}

struct SkipList {
    nodes: Vec<SkipNode>,
    max_level: usize,
    probability: f32,
    level: usize,
    tail: usize,
}

impl SkipList {
    fn new(max_level: usize, probability: f32) -> Self {
        let max_level = max_level.max(1);
        SkipList {
            nodes: vec![SkipNode {
                entry: None,
                next: vec![NIL; max_level],
                prev: NIL,
            }],
            max_level,
            probability,
            level: 1,
            tail: HEAD,
        }
    }

    fn entry(&self, idx: usize) -> Option<&Entry> {
        self.nodes.get(idx).and_then(|n| n.entry.as_ref())
    }

    fn random_level(&self) -> usize {
        let mut lvl = 1;
        while lvl < self.max_level && fastrand::f32() < self.probability {
            lvl += 1;
        }
        lvl
    }

    /// Rightmost node per level whose entry sorts before (key, seq).
    fn predecessors(&self, cmp: &dyn Comparator, key: &[u8], seq: SeqNo) -> Vec<usize> {
        let mut update = vec![HEAD; self.max_level];
        let mut x = HEAD;
        for lvl in (0..self.level).rev() {
            loop {
                let nxt = self.nodes[x].next[lvl];
                match self.entry(nxt) {
                    Some(e) if cmp_internal(cmp, e, key, seq) == Ordering::Less => x = nxt,
                    _ => break,
                }
            }
            update[lvl] = x;
        }
        update
    }

    fn insert(&mut self, cmp: &dyn Comparator, entry: Entry) -> Option<Entry> {
        let update = self.predecessors(cmp, &entry.key, entry.seq);
        let candidate = self.nodes[update[0]].next[0];
        if let Some(node) = self.nodes.get_mut(candidate) {
            if let Some(existing) = node.entry.as_mut() {
                if cmp_internal(cmp, existing, &entry.key, entry.seq) == Ordering::Equal {
                    return Some(std::mem::replace(existing, entry));
                }
            }
        }

        let lvl = self.random_level();
        if lvl > self.level {
            self.level = lvl;
        }
        let idx = self.nodes.len();
        let mut next = vec![NIL; lvl];
        for (l, slot) in next.iter_mut().enumerate() {
            *slot = self.nodes[update[l]].next[l];
        }
        self.nodes.push(SkipNode {
            entry: Some(entry),
            next,
            prev: update[0],
        });
        for (l, pred) in update.iter().enumerate().take(lvl) {
            self.nodes[*pred].next[l] = idx;
        }
        let after = self.nodes[idx].next[0];
        if after == NIL {
            self.tail = idx;
        } else {
            self.nodes[after].prev = idx;
        }
        None
    }

    fn lower_bound(&self, cmp: &dyn Comparator, key: &[u8], seq: SeqNo) -> Option<usize> {
        let update = self.predecessors(cmp, key, seq);
        let idx = self.nodes[update[0]].next[0];
        (idx != NIL).then_some(idx)
    }

    fn first(&self) -> Option<usize> {
        let idx = self.nodes[HEAD].next[0];
        (idx != NIL).then_some(idx)
    }

    fn last(&self) -> Option<usize> {
        (self.tail != HEAD).then_some(self.tail)
    }

    fn next(&self, idx: usize) -> Option<usize> {
        let n = self.nodes[idx].next[0];
        (n != NIL).then_some(n)
    }

    fn prev(&self, idx: usize) -> Option<usize> {
        let p = self.nodes[idx].prev;
        (p != HEAD && p != NIL).then_some(p)
    }
}

// === B+tree ===

enum BNode {
    Leaf {
        entries: Vec<Entry>,
        next: usize,
        prev: usize,
    },
    Internal {
        /// `keys[i]` is the smallest (key, seq) reachable through `children[i + 1]`.
        keys: Vec<(Bytes, SeqNo)>,
        children: Vec<usize>,
    },
}

enum InsertOutcome {
    Done(Option<Entry>),
    Split((Bytes, SeqNo), usize),
}

struct BPlusTree {
    nodes: Vec<BNode>,
    root: usize,
    height: usize,
}

impl BPlusTree {
    fn new() -> Self {
        BPlusTree {
            nodes: vec![BNode::Leaf {
                entries: Vec::new(),
                next: NIL,
                prev: NIL,
            }],
            root: 0,
            height: 1,
        }
    }

    fn child_slot(cmp: &dyn Comparator, keys: &[(Bytes, SeqNo)], key: &[u8], seq: SeqNo) -> usize {
        keys.partition_point(|(k, s)| {
            cmp.compare(k, key).then_with(|| seq.cmp(s)) != Ordering::Greater
        })
    }

    fn insert(&mut self, cmp: &dyn Comparator, entry: Entry) -> Option<Entry> {
        match self.insert_at(self.root, cmp, entry) {
            InsertOutcome::Done(replaced) => replaced,
            InsertOutcome::Split(sep, right) => {
                let new_root = self.nodes.len();
                self.nodes.push(BNode::Internal {
                    keys: vec![sep],
                    children: vec![self.root, right],
                });
                self.root = new_root;
                self.height += 1;
                None
            }
        }
    }

    fn insert_at(&mut self, idx: usize, cmp: &dyn Comparator, entry: Entry) -> InsertOutcome {
        let child = match &self.nodes[idx] {
            BNode::Internal { keys, children } => {
                Some(children[Self::child_slot(cmp, keys, &entry.key, entry.seq)])
            }
            BNode::Leaf { .. } => None,
        };

        let Some(child) = child else {
            return self.insert_into_leaf(idx, cmp, entry);
        };

        let (sep, right) = match self.insert_at(child, cmp, entry) {
            InsertOutcome::Done(replaced) => return InsertOutcome::Done(replaced),
            InsertOutcome::Split(sep, right) => (sep, right),
        };

        let split = match &mut self.nodes[idx] {
            BNode::Internal { keys, children } => {
                let slot = Self::child_slot(cmp, keys, &sep.0, sep.1);
                keys.insert(slot, sep);
                children.insert(slot + 1, right);
                if children.len() > BTREE_FANOUT {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid + 1);
                    let promoted = keys.pop();
                    let right_children = children.split_off(mid + 1);
                    promoted.map(|p| (p, right_keys, right_children))
                } else {
                    None
                }
            }
            BNode::Leaf { .. } => None,
        };

        match split {
            Some((promoted, keys, children)) => {
                let new_idx = self.nodes.len();
                self.nodes.push(BNode::Internal { keys, children });
                InsertOutcome::Split(promoted, new_idx)
            }
            None => InsertOutcome::Done(None),
        }
    }

    fn insert_into_leaf(&mut self, idx: usize, cmp: &dyn Comparator, entry: Entry) -> InsertOutcome {
        let new_idx = self.nodes.len();
        let split = match &mut self.nodes[idx] {
            BNode::Leaf { entries, next, .. } => {
                let pos = entries.partition_point(|e| {
                    cmp_internal(cmp, e, &entry.key, entry.seq) == Ordering::Less
                });
                if let Some(existing) = entries.get_mut(pos) {
                    if cmp_internal(cmp, existing, &entry.key, entry.seq) == Ordering::Equal {
                        return InsertOutcome::Done(Some(std::mem::replace(existing, entry)));
                    }
                }
                entries.insert(pos, entry);
                if entries.len() > BTREE_FANOUT {
                    let right = entries.split_off(entries.len() / 2);
                    let old_next = *next;
                    *next = new_idx;
                    Some((right, old_next))
                } else {
                    None
                }
            }
            BNode::Internal { .. } => return InsertOutcome::Done(None),
        };

        let Some((right, old_next)) = split else {
            return InsertOutcome::Done(None);
        };
        let sep = (right[0].key.clone(), right[0].seq);
        self.nodes.push(BNode::Leaf {
            entries: right,
            next: old_next,
            prev: idx,
        });
        if let Some(BNode::Leaf { prev, .. }) = self.nodes.get_mut(old_next) {
            *prev = new_idx;
        }
        InsertOutcome::Split(sep, new_idx)
    }

    fn leaf_len(&self, idx: usize) -> usize {
        match &self.nodes[idx] {
            BNode::Leaf { entries, .. } => entries.len(),
            BNode::Internal { .. } => 0,
        }
    }

    fn entry(&self, (leaf, slot): (usize, usize)) -> Option<&Entry> {
        match self.nodes.get(leaf) {
            Some(BNode::Leaf { entries, .. }) => entries.get(slot),
            _ => None,
        }
    }

    fn edge_leaf(&self, rightmost: bool) -> usize {
        let mut idx = self.root;
        while let BNode::Internal { children, .. } = &self.nodes[idx] {
            idx = if rightmost {
                children[children.len() - 1]
            } else {
                children[0]
            };
        }
        idx
    }

    fn lower_bound(&self, cmp: &dyn Comparator, key: &[u8], seq: SeqNo) -> Option<(usize, usize)> {
        let mut idx = self.root;
        loop {
            match &self.nodes[idx] {
                BNode::Internal { keys, children } => {
                    idx = children[Self::child_slot(cmp, keys, key, seq)];
                }
                BNode::Leaf { entries, next, .. } => {
                    let pos = entries
                        .partition_point(|e| cmp_internal(cmp, e, key, seq) == Ordering::Less);
                    if pos < entries.len() {
                        return Some((idx, pos));
                    }
                    return (*next != NIL).then_some((*next, 0));
                }
            }
        }
    }

    fn first(&self) -> Option<(usize, usize)> {
        let leaf = self.edge_leaf(false);
        (self.leaf_len(leaf) > 0).then_some((leaf, 0))
    }

    fn last(&self) -> Option<(usize, usize)> {
        let leaf = self.edge_leaf(true);
        let len = self.leaf_len(leaf);
        (len > 0).then(|| (leaf, len - 1))
    }

    fn next(&self, (leaf, slot): (usize, usize)) -> Option<(usize, usize)> {
        match &self.nodes[leaf] {
            BNode::Leaf { entries, next, .. } => {
                if slot + 1 < entries.len() {
                    Some((leaf, slot + 1))
                } else if *next != NIL {
                    Some((*next, 0))
                } else {
                    None
                }
            }
            BNode::Internal { .. } => None,
        }
    }

    fn prev(&self, (leaf, slot): (usize, usize)) -> Option<(usize, usize)> {
        match &self.nodes[leaf] {
            BNode::Leaf { prev, .. } => {
                if slot > 0 {
                    Some((leaf, slot - 1))
                } else if *prev != NIL {
                    let len = self.leaf_len(*prev);
                    (len > 0).then(|| (*prev, len - 1))
                } else {
                    None
                }
            }
            BNode::Internal { .. } => None,
        }
    }
}

// === Dispatch ===

enum Index {
    SkipList(SkipList),
    BPlusTree(BPlusTree),
}

type Cursor = (usize, usize);

impl Index {
    fn insert(&mut self, cmp: &dyn Comparator, entry: Entry) -> Option<Entry> {
        match self {
            Index::SkipList(s) => s.insert(cmp, entry),
            Index::BPlusTree(t) => t.insert(cmp, entry),
        }
    }

    fn entry(&self, c: Cursor) -> Option<&Entry> {
        match self {
            Index::SkipList(s) => s.entry(c.0),
            Index::BPlusTree(t) => t.entry(c),
        }
    }

    fn lower_bound(&self, cmp: &dyn Comparator, key: &[u8], seq: SeqNo) -> Option<Cursor> {
        match self {
            Index::SkipList(s) => s.lower_bound(cmp, key, seq).map(|i| (i, 0)),
            Index::BPlusTree(t) => t.lower_bound(cmp, key, seq),
        }
    }

    fn first(&self) -> Option<Cursor> {
        match self {
            Index::SkipList(s) => s.first().map(|i| (i, 0)),
            Index::BPlusTree(t) => t.first(),
        }
    }

    fn last(&self) -> Option<Cursor> {
        match self {
            Index::SkipList(s) => s.last().map(|i| (i, 0)),
            Index::BPlusTree(t) => t.last(),
        }
    }

    fn next(&self, c: Cursor) -> Option<Cursor> {
        match self {
            Index::SkipList(s) => s.next(c.0).map(|i| (i, 0)),
            Index::BPlusTree(t) => t.next(c),
        }
    }

    fn prev(&self, c: Cursor) -> Option<Cursor> {
        match self {
            Index::SkipList(s) => s.prev(c.0).map(|i| (i, 0)),
            Index::BPlusTree(t) => t.prev(c),
        }
    }
}

/// Node count and height of a B+tree memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BTreeStats {
    pub nodes: usize,
    pub height: usize,
}

pub struct MemTable {
    /// Also the number of the WAL segment backing this memtable.
    id: u64,
    index: RwLock<Index>,
    comparator: Arc<dyn Comparator>,
    size_bytes: AtomicUsize,
    entries: AtomicUsize,
    key_bytes: AtomicUsize,
    value_bytes: AtomicUsize,
    max_seq: AtomicU64,
}

impl MemTable {
    pub fn new(id: u64, shape: MemTableShape, comparator: Arc<dyn Comparator>) -> Self {
        let index = match shape {
            MemTableShape::SkipList {
                max_level,
                probability,
            } => Index::SkipList(SkipList::new(max_level, probability)),
            MemTableShape::BPlusTree => Index::BPlusTree(BPlusTree::new()),
        };
        MemTable {
            id,
            index: RwLock::new(index),
            comparator,
            size_bytes: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            key_bytes: AtomicUsize::new(0),
            value_bytes: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert one version. A second write of the same key under the same
    /// sequence replaces the first.
    pub fn insert(&self, entry: Entry) {
        let size = entry.size() + NODE_OVERHEAD;
        let (klen, vlen) = (entry.key.len(), entry.value.len());
        let seq = entry.seq;
        let replaced = self.index.write().insert(self.comparator.as_ref(), entry);
        match replaced {
            Some(old) => {
                let old_size = old.size() + NODE_OVERHEAD;
                self.size_bytes.fetch_add(size, AtomicOrdering::Relaxed);
                self.size_bytes.fetch_sub(old_size, AtomicOrdering::Relaxed);
                self.value_bytes.fetch_add(vlen, AtomicOrdering::Relaxed);
                self.value_bytes.fetch_sub(old.value.len(), AtomicOrdering::Relaxed);
            }
            None => {
                self.size_bytes.fetch_add(size, AtomicOrdering::Relaxed);
                self.entries.fetch_add(1, AtomicOrdering::Relaxed);
                self.key_bytes.fetch_add(klen, AtomicOrdering::Relaxed);
                self.value_bytes.fetch_add(vlen, AtomicOrdering::Relaxed);
            }
        }
        self.max_seq.fetch_max(seq, AtomicOrdering::Relaxed);
    }

    /// Newest version of `key` with seq <= `snapshot`, tombstones included.
    pub fn get(&self, key: &[u8], snapshot: SeqNo) -> Option<Entry> {
        let index = self.index.read();
        let c = index.lower_bound(self.comparator.as_ref(), key, snapshot)?;
        let e = index.entry(c)?;
        (self.comparator.compare(&e.key, key) == Ordering::Equal).then(|| e.clone())
    }

    /// Every stored version of `key`, newest first.
    pub fn versions(&self, key: &[u8]) -> Vec<Entry> {
        let index = self.index.read();
        let mut out = Vec::new();
        let mut cur = index.lower_bound(self.comparator.as_ref(), key, SeqNo::MAX);
        while let Some(c) = cur {
            match index.entry(c) {
                Some(e) if self.comparator.compare(&e.key, key) == Ordering::Equal => {
                    out.push(e.clone())
                }
                _ => break,
            }
            cur = index.next(c);
        }
        out
    }

    pub fn first_key(&self) -> Option<Bytes> {
        let index = self.index.read();
        index.first().and_then(|c| index.entry(c)).map(|e| e.key.clone())
    }

    pub fn last_key(&self) -> Option<Bytes> {
        let index = self.index.read();
        index.last().and_then(|c| index.entry(c)).map(|e| e.key.clone())
    }

    /// Smallest key >= `key`.
    pub fn seek_ge(&self, key: &[u8]) -> Option<Bytes> {
        let index = self.index.read();
        let c = index.lower_bound(self.comparator.as_ref(), key, SeqNo::MAX)?;
        index.entry(c).map(|e| e.key.clone())
    }

    /// Smallest key > `key`.
    pub fn seek_gt(&self, key: &[u8]) -> Option<Bytes> {
        let index = self.index.read();
        let mut cur = index.lower_bound(self.comparator.as_ref(), key, 0);
        while let Some(c) = cur {
            let e = index.entry(c)?;
            if self.comparator.compare(&e.key, key) == Ordering::Greater {
                return Some(e.key.clone());
            }
            cur = index.next(c);
        }
        None
    }

    /// Largest key <= `key`.
    pub fn seek_le(&self, key: &[u8]) -> Option<Bytes> {
        let index = self.index.read();
        let mut cur = match index.lower_bound(self.comparator.as_ref(), key, 0) {
            Some(c) => Some(c),
            None => return index.last().and_then(|c| index.entry(c)).map(|e| e.key.clone()),
        };
        while let Some(c) = cur {
            let e = index.entry(c)?;
            if self.comparator.compare(&e.key, key) != Ordering::Greater {
                return Some(e.key.clone());
            }
            cur = index.prev(c);
        }
        None
    }

    /// Largest key < `key`.
    pub fn seek_lt(&self, key: &[u8]) -> Option<Bytes> {
        let index = self.index.read();
        let c = match index.lower_bound(self.comparator.as_ref(), key, SeqNo::MAX) {
            Some(c) => index.prev(c)?,
            None => index.last()?,
        };
        index.entry(c).map(|e| e.key.clone())
    }

    /// All entries in internal order, for flushing.
    pub fn entries(&self) -> Vec<Entry> {
        let index = self.index.read();
        let mut out = Vec::with_capacity(self.len());
        let mut cur = index.first();
        while let Some(c) = cur {
            if let Some(e) = index.entry(c) {
                out.push(e.clone());
            }
            cur = index.next(c);
        }
        out
    }

    /// (entries, bytes) stored for keys in [low, high].
    pub fn range_footprint(&self, low: &[u8], high: &[u8]) -> (usize, usize) {
        let index = self.index.read();
        let (mut n, mut bytes) = (0, 0);
        let mut cur = index.lower_bound(self.comparator.as_ref(), low, SeqNo::MAX);
        while let Some(c) = cur {
            match index.entry(c) {
                Some(e) if self.comparator.compare(&e.key, high) != Ordering::Greater => {
                    n += 1;
                    bytes += e.size();
                }
                _ => break,
            }
            cur = index.next(c);
        }
        (n, bytes)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (key bytes, value bytes) over every stored version.
    pub fn payload_bytes(&self) -> (usize, usize) {
        (
            self.key_bytes.load(AtomicOrdering::Relaxed),
            self.value_bytes.load(AtomicOrdering::Relaxed),
        )
    }

    pub fn max_seq(&self) -> SeqNo {
        self.max_seq.load(AtomicOrdering::Relaxed)
    }

    pub fn btree_stats(&self) -> Option<BTreeStats> {
        match &*self.index.read() {
            Index::BPlusTree(t) => Some(BTreeStats {
                nodes: t.nodes.len(),
                height: t.height,
            }),
            Index::SkipList(_) => None,
        }
    }
}
