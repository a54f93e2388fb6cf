use super::block::{BlockBuilder, BlockEntry, ValueRef};
use super::bloom::{hash_key, BloomFilter};
use super::format::{
    compress, encode_index, put_frame, put_section, BlockIndex, Footer, IndexEntry, Properties,
    DEFAULT_BLOCK_SIZE, FRAME_OVERHEAD,
};
use crate::config::{ColumnFamilyConfig, CompressionAlgorithm};
use crate::{Entry, Result};
use bytes::{Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Knobs the writer takes from the column family config at creation time.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub block_size: usize,
    pub compression: CompressionAlgorithm,
    pub klog_value_threshold: usize,
    /// `None` disables the bloom filter.
    pub bloom_fpr: Option<f64>,
    /// `None` disables the sparse block index.
    pub index_sample_ratio: Option<usize>,
    pub prefix_len: usize,
    /// Truncate index keys to `prefix_len`; only sound for byte order.
    pub truncate_prefixes: bool,
}

impl WriterOptions {
    pub fn from_config(cfg: &ColumnFamilyConfig, bytewise: bool) -> Self {
        WriterOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: cfg.compression,
            klog_value_threshold: cfg.klog_value_threshold,
            bloom_fpr: cfg.enable_bloom_filter.then_some(cfg.bloom_fpr),
            index_sample_ratio: cfg.enable_block_indexes.then_some(cfg.index_sample_ratio),
            prefix_len: cfg.block_index_prefix_len,
            truncate_prefixes: bytewise,
        }
    }
}

pub fn klog_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{:06}.klog", file_id))
}

pub fn vlog_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{:06}.vlog", file_id))
}

/// Streams entries, already in (key asc, seq desc) order, into a new
/// klog/vlog pair.
pub struct SsTableWriter {
    file_id: u64,
    klog_path: PathBuf,
    vlog_path: PathBuf,
    klog: BufWriter<File>,
    vlog: BufWriter<File>,
    klog_offset: u64,
    vlog_offset: u64,
    opts: WriterOptions,
    block: BlockBuilder,
    block_first_key: Option<Bytes>,
    index: Vec<IndexEntry>,
    key_hashes: Vec<u64>,
    props: Properties,
    last_key: Option<Bytes>,
    scratch: BytesMut,
}

impl SsTableWriter {
    pub fn create(dir: impl AsRef<Path>, file_id: u64, opts: WriterOptions) -> Result<Self> {
        let dir = dir.as_ref();
        let klog_path = klog_path(dir, file_id);
        let vlog_path = vlog_path(dir, file_id);
        let open = |p: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(p)
        };
        let klog = BufWriter::new(open(&klog_path)?);
        let vlog = BufWriter::new(open(&vlog_path)?);

        Ok(SsTableWriter {
            file_id,
            klog_path,
            vlog_path,
            klog,
            vlog,
            klog_offset: 0,
            vlog_offset: 0,
            opts,
            block: BlockBuilder::new(),
            block_first_key: None,
            index: Vec::new(),
            key_hashes: Vec::new(),
            props: Properties {
                min_seq: u64::MAX,
                ..Default::default()
            },
            last_key: None,
            scratch: BytesMut::new(),
        })
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        let new_key = self.last_key.as_ref() != Some(&entry.key);

        // versions of one key may span blocks; cut only at a size boundary
        if !self.block.is_empty() && self.block.estimated_size() >= self.opts.block_size {
            self.flush_block()?;
        }

        let value = if !entry.is_tombstone() && entry.value.len() >= self.opts.klog_value_threshold {
            self.write_value(&entry.value)?
        } else {
            ValueRef::Inline(entry.value.clone())
        };

        if self.block.is_empty() {
            self.block_first_key = Some(entry.key.clone());
        }
        self.block.add(&BlockEntry {
            key: entry.key.clone(),
            seq: entry.seq,
            ttl: entry.ttl,
            tombstone: entry.is_tombstone(),
            value,
        });

        if new_key {
            self.props.distinct_keys += 1;
            if self.opts.bloom_fpr.is_some() {
                self.key_hashes.push(hash_key(&entry.key));
            }
            if self.props.entry_count == 0 {
                self.props.smallest_key = entry.key.clone();
            }
            self.last_key = Some(entry.key.clone());
        }
        self.props.entry_count += 1;
        self.props.key_bytes += entry.key.len() as u64;
        self.props.value_bytes += entry.value.len() as u64;
        if entry.is_tombstone() {
            self.props.tombstones += 1;
        }
        self.props.min_seq = self.props.min_seq.min(entry.seq);
        self.props.max_seq = self.props.max_seq.max(entry.seq);
        Ok(())
    }

    fn write_value(&mut self, value: &[u8]) -> Result<ValueRef> {
        let packed = compress(value, self.opts.compression)?;
        self.scratch.clear();
        put_frame(&mut self.scratch, &packed);
        self.vlog.write_all(&self.scratch)?;
        let reference = ValueRef::Vlog {
            offset: self.vlog_offset,
            len: packed.len() as u32,
        };
        self.vlog_offset += self.scratch.len() as u64;
        Ok(reference)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let ordinal = self.props.data_blocks as u32;
        if let (Some(ratio), Some(first)) = (self.opts.index_sample_ratio, self.block_first_key.take()) {
            if ordinal as usize % ratio == 0 {
                let cut = self.opts.truncate_prefixes && self.opts.prefix_len > 0;
                let prefix = if cut && first.len() > self.opts.prefix_len {
                    first.slice(..self.opts.prefix_len)
                } else {
                    first
                };
                self.index.push(IndexEntry {
                    prefix,
                    offset: self.klog_offset,
                    ordinal,
                });
            }
        }

        let payload = self.block.finish();
        let packed = compress(&payload, self.opts.compression)?;
        self.scratch.clear();
        put_frame(&mut self.scratch, &packed);
        self.klog.write_all(&self.scratch)?;
        self.klog_offset += (packed.len() + FRAME_OVERHEAD) as u64;
        self.props.data_blocks += 1;
        Ok(())
    }

    /// Approximate bytes written so far, for splitting compaction output.
    pub fn estimated_size(&self) -> u64 {
        self.klog_offset + self.vlog_offset + self.block.estimated_size() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.props.entry_count
    }

    /// Write the metadata sections and footer, then fsync both files.
    pub fn finish(mut self) -> Result<Properties> {
        self.flush_block()?;
        self.props.data_end = self.klog_offset;
        if self.props.entry_count == 0 {
            self.props.min_seq = 0;
        }
        if let Some(last) = &self.last_key {
            self.props.largest_key = last.clone();
        }

        let mut meta = BytesMut::new();
        let mut footer = Footer {
            compression: self.opts.compression.as_u8(),
            ..Default::default()
        };

        if let Some(fpr) = self.opts.bloom_fpr {
            let filter = BloomFilter::from_hashes(&self.key_hashes, fpr);
            let start = meta.len();
            put_section(&mut meta, &filter.encode()?);
            footer.bloom_offset = self.klog_offset + start as u64;
            footer.bloom_len = (meta.len() - start) as u64;
        }
        if let Some(ratio) = self.opts.index_sample_ratio {
            let index = BlockIndex {
                sample_ratio: ratio as u32,
                prefix_len: if self.opts.truncate_prefixes {
                    self.opts.prefix_len as u32
                } else {
                    0
                },
                entries: std::mem::take(&mut self.index),
            };
            let start = meta.len();
            put_section(&mut meta, &encode_index(&index));
            footer.index_offset = self.klog_offset + start as u64;
            footer.index_len = (meta.len() - start) as u64;
        }
        let start = meta.len();
        put_section(&mut meta, &self.props.encode());
        footer.props_offset = self.klog_offset + start as u64;
        footer.props_len = (meta.len() - start) as u64;
        footer.encode(&mut meta);

        self.klog.write_all(&meta)?;
        self.klog.flush()?;
        self.klog.get_ref().sync_all()?;
        self.vlog.flush()?;
        self.vlog.get_ref().sync_all()?;
        Ok(self.props)
    }

    /// Drop a partially written table.
    pub fn abandon(self) {
        let (klog, vlog) = (self.klog_path.clone(), self.vlog_path.clone());
        drop(self);
        let _ = std::fs::remove_file(klog);
        let _ = std::fs::remove_file(vlog);
    }
}
