//! Data blocks of the klog.
//!
//! Block payload (before compression):
//!
//! ```text
//! count u32 | entry*
//! entry: flags u8 | seq u64 | ttl u64 | klen u32 | key
//!        | inline: vlen u32 | value
//!        | vlog:   offset u64 | len u32
//! ```

use crate::{Entry, OpType, Result, SeqNo, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FLAG_TOMBSTONE: u8 = 0b01;
const FLAG_VLOG: u8 = 0b10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    Inline(Bytes),
    /// Frame offset and payload length of a value record in the vlog.
    Vlog { offset: u64, len: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: Bytes,
    pub seq: SeqNo,
    pub ttl: u64,
    pub tombstone: bool,
    pub value: ValueRef,
}

impl BlockEntry {
    pub fn inline(key: Bytes, value: Bytes, seq: SeqNo, ttl: u64, tombstone: bool) -> Self {
        BlockEntry {
            key,
            seq,
            ttl,
            tombstone,
            value: ValueRef::Inline(value),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && self.ttl <= now
    }

    fn encoded_len(&self) -> usize {
        1 + 8
            + 8
            + 4
            + self.key.len()
            + match &self.value {
                ValueRef::Inline(v) => 4 + v.len(),
                ValueRef::Vlog { .. } => 12,
            }
    }

    /// Materialize with an already-resolved value.
    pub fn to_entry(&self, value: Bytes) -> Entry {
        Entry {
            key: self.key.clone(),
            value,
            seq: self.seq,
            ttl: self.ttl,
            op: if self.tombstone {
                OpType::Delete
            } else {
                OpType::Put
            },
        }
    }
}

/// A decoded data block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub entries: Vec<BlockEntry>,
    /// Bytes the framed block occupies in the klog.
    pub disk_len: usize,
}

impl Block {
    pub fn new(entries: Vec<BlockEntry>, disk_len: usize) -> Self {
        Block { entries, disk_len }
    }

    /// Memory charged against the block cache.
    pub fn charge(&self) -> usize {
        std::mem::size_of::<Block>()
            + self
                .entries
                .iter()
                .map(|e| e.encoded_len() + std::mem::size_of::<BlockEntry>())
                .sum::<usize>()
    }

    pub fn decode(payload: Bytes, disk_len: usize) -> Result<Block> {
        let mut buf = payload;
        let short = || StorageError::Corruption("short data block".into());
        if buf.remaining() < 4 {
            return Err(short());
        }
        let count = buf.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            if buf.remaining() < 1 + 8 + 8 + 4 {
                return Err(short());
            }
            let flags = buf.get_u8();
            let seq = buf.get_u64_le();
            let ttl = buf.get_u64_le();
            let klen = buf.get_u32_le() as usize;
            if buf.remaining() < klen {
                return Err(short());
            }
            let key = buf.split_to(klen);
            let value = if flags & FLAG_VLOG != 0 {
                if buf.remaining() < 12 {
                    return Err(short());
                }
                ValueRef::Vlog {
                    offset: buf.get_u64_le(),
                    len: buf.get_u32_le(),
                }
            } else {
                if buf.remaining() < 4 {
                    return Err(short());
                }
                let vlen = buf.get_u32_le() as usize;
                if buf.remaining() < vlen {
                    return Err(short());
                }
                ValueRef::Inline(buf.split_to(vlen))
            };
            entries.push(BlockEntry {
                key,
                seq,
                ttl,
                tombstone: flags & FLAG_TOMBSTONE != 0,
                value,
            });
        }
        Ok(Block { entries, disk_len })
    }
}

/// Accumulates entries for one data block.
pub struct BlockBuilder {
    buf: BytesMut,
    count: u32,
}

impl BlockBuilder {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(super::format::DEFAULT_BLOCK_SIZE + 512);
        buf.put_u32_le(0);
        BlockBuilder { buf, count: 0 }
    }

    pub fn add(&mut self, entry: &BlockEntry) {
        let mut flags = 0;
        if entry.tombstone {
            flags |= FLAG_TOMBSTONE;
        }
        if matches!(entry.value, ValueRef::Vlog { .. }) {
            flags |= FLAG_VLOG;
        }
        self.buf.reserve(entry.encoded_len());
        self.buf.put_u8(flags);
        self.buf.put_u64_le(entry.seq);
        self.buf.put_u64_le(entry.ttl);
        self.buf.put_u32_le(entry.key.len() as u32);
        self.buf.put_slice(&entry.key);
        match &entry.value {
            ValueRef::Inline(v) => {
                self.buf.put_u32_le(v.len() as u32);
                self.buf.put_slice(v);
            }
            ValueRef::Vlog { offset, len } => {
                self.buf.put_u64_le(*offset);
                self.buf.put_u32_le(*len);
            }
        }
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn estimated_size(&self) -> usize {
        self.buf.len()
    }

    /// Uncompressed payload; the builder is left empty.
    pub fn finish(&mut self) -> Bytes {
        let count = self.count;
        self.buf[..4].copy_from_slice(&count.to_le_bytes());
        let payload = self.buf.split().freeze();
        self.buf.put_u32_le(0);
        self.count = 0;
        payload
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_encode_decode() -> Result<()> {
        let mut builder = BlockBuilder::new();
        assert!(builder.is_empty());
        let a = BlockEntry::inline(Bytes::from_static(b"a"), Bytes::from_static(b"1"), 7, 0, false);
        let b = BlockEntry {
            key: Bytes::from_static(b"b"),
            seq: 8,
            ttl: 99,
            tombstone: false,
            value: ValueRef::Vlog { offset: 128, len: 900 },
        };
        let c = BlockEntry::inline(Bytes::from_static(b"c"), Bytes::new(), 9, 0, true);
        for e in [&a, &b, &c] {
            builder.add(e);
        }
        let payload = builder.finish();
        assert!(builder.is_empty());

        let block = Block::decode(payload, 100)?;
        assert_eq!(block.entries, vec![a, b, c]);
        assert_eq!(block.disk_len, 100);
        assert!(block.charge() > 0);
        assert!(block.entries[2].to_entry(Bytes::new()).is_tombstone());

        // builder is reusable after finish
        builder.add(&block.entries[0]);
        let again = Block::decode(builder.finish(), 0)?;
        assert_eq!(again.entries.len(), 1);
        Ok(())
    }

    #[test]
    fn test_truncated_block_is_corruption() {
        let mut builder = BlockBuilder::new();
        builder.add(&BlockEntry::inline(
            Bytes::from_static(b"key"),
            Bytes::from_static(b"value"),
            1,
            0,
            false,
        ));
        let payload = builder.finish();
        let cut = payload.slice(..payload.len() - 2);
        assert!(matches!(Block::decode(cut, 0), Err(StorageError::Corruption(_))));
    }
}
