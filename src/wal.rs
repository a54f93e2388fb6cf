//! Segmented Write-Ahead Log
//!
//! Each column family logs committed batches under `cf-<id>/wal/`. There
//! is one segment per memtable generation and the segment number equals
//! the memtable id:
//! - wal/000001.wal (sealed memtable, flush pending) ← deleted after flush
//! - wal/000002.wal (active memtable) ← current writes
//!
//! ## Record format
//!
//! `crc32 u32 | len u32 | type u8 | payload`, where the checksum covers
//! len, type and payload. A batch payload is
//! `seq u64 | count u32 | (op u8, ttl u64, klen u32, key, vlen u32, value)*`.
//!
//! ## Recovery
//!
//! Segments replay in number order; a torn or corrupt tail ends the
//! segment with a warning, everything before it is kept.

use crate::config::SyncMode;
use crate::{Entry, OpType, Result, SeqNo, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RECORD_BATCH: u8 = 1;
const HEADER_LEN: usize = 4 + 4 + 1;

/// One committed batch as logged for a single column family.
#[derive(Debug, Clone, PartialEq)]
pub struct WalBatch {
    pub seq: SeqNo,
    pub entries: Vec<Entry>,
}

pub struct Wal {
    dir: PathBuf,
    current_segment: WalSegment,
    segment_number: u64,
    sync_mode: SyncMode,
    sync_interval: Duration,
    last_sync: Instant,
    scratch: BytesMut,
}

struct WalSegment {
    file: File,
    /// End of the segment file.
    offset: u64,
    bytes_written: u64,
}

impl Wal {
    /// Open (or create) segment `segment_number` in `dir` for appending.
    pub fn open(
        dir: impl AsRef<Path>,
        segment_number: u64,
        sync_mode: SyncMode,
        sync_interval_us: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let current_segment = WalSegment::open(&dir, segment_number)?;

        Ok(Self {
            dir,
            current_segment,
            segment_number,
            sync_mode,
            sync_interval: Duration::from_micros(sync_interval_us),
            last_sync: Instant::now(),
            scratch: BytesMut::with_capacity(4096),
        })
    }

    pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
        dir.join(format!("{:06}.wal", segment_number))
    }

    fn parse_segment_number(path: &Path) -> Option<u64> {
        if path.extension().and_then(|s| s.to_str()) != Some("wal") {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// Segments present in `dir`, ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        if !dir.exists() {
            return Ok(segments);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(num) = Self::parse_segment_number(&path) {
                segments.push((num, path));
            }
        }
        segments.sort_by_key(|(num, _)| *num);
        Ok(segments)
    }

    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    pub fn set_sync(&mut self, sync_mode: SyncMode, sync_interval_us: u64) {
        self.sync_mode = sync_mode;
        self.sync_interval = Duration::from_micros(sync_interval_us);
    }

    /// Log one committed batch and return the segment offset it starts at.
    /// The bytes reach the OS before this returns; whether they reach the
    /// disk depends on the sync mode. On error the segment is cut back to
    /// where the record began.
    pub fn append_batch(&mut self, seq: SeqNo, entries: &[Entry]) -> Result<u64> {
        self.scratch.clear();
        encode_batch(&mut self.scratch, seq, entries)?;
        let start = self.current_segment.offset;
        if let Err(e) = self.write_record() {
            if let Err(undo) = self.truncate(start) {
                warn!(segment = self.segment_number, error = %undo, "could not cut torn WAL record");
            }
            return Err(e);
        }
        Ok(start)
    }

    fn write_record(&mut self) -> Result<()> {
        self.current_segment.append(&self.scratch)?;
        match self.sync_mode {
            SyncMode::Full => self.sync()?,
            SyncMode::Interval => {
                if self.last_sync.elapsed() >= self.sync_interval {
                    self.sync()?;
                }
            }
            SyncMode::None => {}
        }
        Ok(())
    }

    /// Drop everything in the active segment from `offset` on.
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        let segment = &mut self.current_segment;
        if offset >= segment.offset {
            return Ok(());
        }
        segment.file.set_len(offset)?;
        segment.file.sync_data()?;
        segment.bytes_written = segment.bytes_written.saturating_sub(segment.offset - offset);
        segment.offset = offset;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.current_segment.file.sync_data()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Seal the current segment and continue in `next_segment`.
    pub fn rotate(&mut self, next_segment: u64) -> Result<()> {
        self.sync()?;
        self.current_segment = WalSegment::open(&self.dir, next_segment)?;
        self.segment_number = next_segment;
        debug!(segment = next_segment, dir = %self.dir.display(), "rotated WAL segment");
        Ok(())
    }

    /// Delete every segment numbered `<= through`.
    pub fn remove_segments_through(dir: &Path, through: u64) -> Result<usize> {
        let mut deleted = 0;
        let mut reclaimed = 0u64;
        for (num, path) in Self::list_segments(dir)? {
            if num > through {
                break;
            }
            reclaimed += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)?;
            deleted += 1;
        }
        if deleted > 0 {
            debug!(segments = deleted, bytes = reclaimed, "removed flushed WAL segments");
        }
        Ok(deleted)
    }

    /// Replay every segment in `dir`, oldest first.
    pub fn recover(dir: &Path) -> Result<Vec<(u64, Vec<WalBatch>)>> {
        let mut out = Vec::new();
        let mut total = 0;
        for (num, path) in Self::list_segments(dir)? {
            let batches = Self::recover_segment(&path)?;
            total += batches.len();
            out.push((num, batches));
        }
        if total > 0 {
            info!(batches = total, dir = %dir.display(), "recovered WAL batches");
        }
        Ok(out)
    }

    pub fn recover_segment(path: &Path) -> Result<Vec<WalBatch>> {
        let mut file = File::open(path)?;
        let mut batches = Vec::new();

        loop {
            match read_record(&mut file) {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => break,
                Err(StorageError::Corruption(msg)) => {
                    warn!(segment = %path.display(), error = %msg, "WAL tail discarded");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(batches)
    }

    /// Bytes written to the active segment by this handle.
    pub fn bytes_written(&self) -> u64 {
        self.current_segment.bytes_written
    }

    pub fn total_size(dir: &Path) -> u64 {
        Self::list_segments(dir)
            .unwrap_or_default()
            .iter()
            .map(|(_, p)| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

impl WalSegment {
    fn open(dir: &Path, segment_number: u64) -> Result<Self> {
        let path = Wal::segment_path(dir, segment_number);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            file,
            offset,
            bytes_written: 0,
        })
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        // a partial write leaves the file longer than `offset`
        self.offset += record.len() as u64;
        self.bytes_written += record.len() as u64;
        self.file.write_all(record)?;
        Ok(())
    }
}

#[cfg(test)]
impl Wal {
    /// Swap the active segment for a read-only handle so appends fail.
    pub(crate) fn make_read_only(&mut self) -> Result<()> {
        let path = Wal::segment_path(&self.dir, self.segment_number);
        self.current_segment.file = File::open(path)?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.current_segment.file.sync_data();
    }
}

fn encode_batch(out: &mut BytesMut, seq: SeqNo, entries: &[Entry]) -> Result<()> {
    let mut data = BytesMut::new();
    data.put_u64_le(seq);
    data.put_u32_le(entries.len() as u32);
    for e in entries {
        if e.key.len() > u32::MAX as usize || e.value.len() > u32::MAX as usize {
            return Err(StorageError::TooLarge("WAL record field exceeds u32".into()));
        }
        data.put_u8(e.op as u8);
        data.put_u64_le(e.ttl);
        data.put_u32_le(e.key.len() as u32);
        data.put_slice(&e.key);
        data.put_u32_le(e.value.len() as u32);
        data.put_slice(&e.value);
    }

    let data_len = data.len();
    if data_len > u32::MAX as usize {
        return Err(StorageError::TooLarge("WAL batch exceeds 4 GiB".into()));
    }

    let mut hasher = Hasher::new();
    hasher.update(&(data_len as u32).to_le_bytes());
    hasher.update(&[RECORD_BATCH]);
    hasher.update(&data);
    let checksum = hasher.finalize();

    out.reserve(HEADER_LEN + data_len);
    out.put_u32_le(checksum);
    out.put_u32_le(data_len as u32);
    out.put_u8(RECORD_BATCH);
    out.put_slice(&data);
    Ok(())
}

fn read_record(file: &mut File) -> Result<Option<WalBatch>> {
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let mut buf = &header[..];
    let checksum = buf.get_u32_le();
    let length = buf.get_u32_le();
    let type_byte = buf.get_u8();

    if type_byte != RECORD_BATCH {
        return Err(StorageError::Corruption(format!("invalid record type {}", type_byte)));
    }

    let mut data = vec![0u8; length as usize];
    if let Err(e) = file.read_exact(&mut data) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(StorageError::Corruption("truncated record".into()));
        }
        return Err(e.into());
    }

    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(&[type_byte]);
    hasher.update(&data);
    let computed = hasher.finalize();

    if computed != checksum {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch: expected {}, got {}",
            checksum, computed
        )));
    }

    decode_batch(Bytes::from(data)).map(Some)
}

fn decode_batch(mut buf: Bytes) -> Result<WalBatch> {
    let short = || StorageError::Corruption("short batch payload".into());
    if buf.remaining() < 12 {
        return Err(short());
    }
    let seq = buf.get_u64_le();
    let count = buf.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if buf.remaining() < 1 + 8 + 4 {
            return Err(short());
        }
        let op_byte = buf.get_u8();
        let op = OpType::from_u8(op_byte)
            .ok_or_else(|| StorageError::Corruption(format!("invalid op type {}", op_byte)))?;
        let ttl = buf.get_u64_le();
        let klen = buf.get_u32_le() as usize;
        if buf.remaining() < klen + 4 {
            return Err(short());
        }
        let key = buf.split_to(klen);
        let vlen = buf.get_u32_le() as usize;
        if buf.remaining() < vlen {
            return Err(short());
        }
        let value = buf.split_to(vlen);
        entries.push(Entry {
            key,
            value,
            seq,
            ttl,
            op,
        });
    }
    Ok(WalBatch { seq, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(seq: SeqNo, n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| {
                if i % 3 == 2 {
                    Entry::delete(format!("key_{}", i).into_bytes(), seq)
                } else {
                    Entry::put(
                        format!("key_{}", i).into_bytes(),
                        format!("value_{}", i).into_bytes(),
                        seq,
                        i as u64,
                    )
                }
            })
            .collect()
    }

    #[test]
    fn test_wal_recovery() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut wal = Wal::open(dir.path(), 1, SyncMode::Full, 0)?;
            for seq in 1..=50 {
                wal.append_batch(seq, &batch(seq, 3))?;
            }
            assert!(wal.bytes_written() > 0);
        }

        let recovered = Wal::recover(dir.path())?;
        assert_eq!(recovered.len(), 1);
        let (num, batches) = &recovered[0];
        assert_eq!(*num, 1);
        assert_eq!(batches.len(), 50);
        assert_eq!(batches[0].entries, batch(1, 3));
        assert!(batches[49].entries[2].is_tombstone());
        assert_eq!(batches[49].entries[1].ttl, 1);
        Ok(())
    }

    #[test]
    fn test_truncate_drops_aborted_record() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut wal = Wal::open(dir.path(), 1, SyncMode::None, 0)?;
            assert_eq!(wal.append_batch(1, &batch(1, 2))?, 0);
            let second = wal.append_batch(2, &batch(2, 2))?;
            assert!(second > 0);
            wal.truncate(second)?;
            wal.append_batch(3, &batch(3, 1))?;
        }
        let batches = Wal::recover_segment(&Wal::segment_path(dir.path(), 1))?;
        let seqs: Vec<SeqNo> = batches.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn test_failed_append_leaves_segment_unchanged() -> Result<()> {
        let dir = tempdir()?;
        let mut wal = Wal::open(dir.path(), 1, SyncMode::None, 0)?;
        wal.append_batch(1, &batch(1, 2))?;
        let len = std::fs::metadata(Wal::segment_path(dir.path(), 1))?.len();
        wal.make_read_only()?;
        assert!(wal.append_batch(2, &batch(2, 2)).is_err());
        assert_eq!(std::fs::metadata(Wal::segment_path(dir.path(), 1))?.len(), len);
        Ok(())
    }

    #[test]
    fn test_rotation_and_cleanup() -> Result<()> {
        let dir = tempdir()?;
        let mut wal = Wal::open(dir.path(), 1, SyncMode::None, 0)?;
        wal.append_batch(1, &batch(1, 2))?;
        wal.rotate(2)?;
        wal.append_batch(2, &batch(2, 2))?;
        wal.rotate(3)?;
        assert_eq!(wal.segment_number(), 3);

        let nums: Vec<u64> = Wal::list_segments(dir.path())?.iter().map(|(n, _)| *n).collect();
        assert_eq!(nums, vec![1, 2, 3]);

        assert_eq!(Wal::remove_segments_through(dir.path(), 2)?, 2);
        let nums: Vec<u64> = Wal::list_segments(dir.path())?.iter().map(|(n, _)| *n).collect();
        assert_eq!(nums, vec![3]);
        Ok(())
    }

    #[test]
    fn test_torn_tail_keeps_prefix() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut wal = Wal::open(dir.path(), 7, SyncMode::Interval, 1_000_000)?;
            for seq in 1..=5 {
                wal.append_batch(seq, &batch(seq, 2))?;
            }
            wal.sync()?;
        }
        let path = Wal::segment_path(dir.path(), 7);
        let len = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 5)?;

        let batches = Wal::recover_segment(&path)?;
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3].seq, 4);
        Ok(())
    }

    #[test]
    fn test_corrupt_record_stops_replay() -> Result<()> {
        let dir = tempdir()?;
        {
            let mut wal = Wal::open(dir.path(), 1, SyncMode::Full, 0)?;
            wal.append_batch(1, &batch(1, 1))?;
            wal.append_batch(2, &batch(2, 1))?;
        }
        let path = Wal::segment_path(dir.path(), 1);
        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        let batches = Wal::recover_segment(&path)?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seq, 1);
        Ok(())
    }
}
