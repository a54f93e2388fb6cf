//! On-disk layout shared by the SSTable writer and reader.
//!
//! ```text
//! klog: [data block]* [bloom section] [index section] [properties section] [footer]
//! vlog: [value record]*
//!
//! data block / value record: len u32 | payload (compressed) | crc32 u32
//! section:                   payload | crc32 u32
//! footer (fixed):            bloom off u64 | bloom len u64 | index off u64 | index len u64
//!                            | props off u64 | props len u64 | compression u8 | version u8
//!                            | magic u32
//! ```
//!
//! Section lengths include the trailing checksum; an absent bloom filter or
//! index has length 0.

use crate::config::CompressionAlgorithm;
use crate::{Result, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const MAGIC: u32 = u32::from_le_bytes(*b"TDSK");
pub const FORMAT_VERSION: u8 = 1;
pub const FOOTER_LEN: usize = 6 * 8 + 1 + 1 + 4;
/// len prefix + crc trailer around every block or value record.
pub const FRAME_OVERHEAD: usize = 8;

pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 | CompressionAlgorithm::Lz4Fast => {
            Ok(lz4_flex::compress_prepend_size(data))
        }
        CompressionAlgorithm::Zstd => zstd::encode_all(data, 3).map_err(StorageError::from),
    }
}

pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 | CompressionAlgorithm::Lz4Fast => {
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StorageError::Corruption(format!("lz4: {}", e)))
        }
        CompressionAlgorithm::Zstd => zstd::decode_all(data)
            .map_err(|e| StorageError::Corruption(format!("zstd: {}", e))),
    }
}

/// Frame `payload` as `len | payload | crc`.
pub fn put_frame(out: &mut BytesMut, payload: &[u8]) {
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out.put_u32_le(crc32fast::hash(payload));
}

/// Verify a frame body (`payload | crc`) and return the payload.
pub fn check_frame(body: &[u8]) -> Result<&[u8]> {
    if body.len() < 4 {
        return Err(StorageError::Corruption("short frame".into()));
    }
    let (payload, mut crc) = body.split_at(body.len() - 4);
    let expected = crc.get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(StorageError::Corruption(format!(
            "block checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(payload)
}

pub fn put_section(out: &mut BytesMut, payload: &[u8]) {
    out.put_slice(payload);
    out.put_u32_le(crc32fast::hash(payload));
}

pub fn check_section(section: &[u8]) -> Result<&[u8]> {
    check_frame(section)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Footer {
    pub bloom_offset: u64,
    pub bloom_len: u64,
    pub index_offset: u64,
    pub index_len: u64,
    pub props_offset: u64,
    pub props_len: u64,
    pub compression: u8,
}

impl Footer {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u64_le(self.bloom_offset);
        out.put_u64_le(self.bloom_len);
        out.put_u64_le(self.index_offset);
        out.put_u64_le(self.index_len);
        out.put_u64_le(self.props_offset);
        out.put_u64_le(self.props_len);
        out.put_u8(self.compression);
        out.put_u8(FORMAT_VERSION);
        out.put_u32_le(MAGIC);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_LEN {
            return Err(StorageError::Corruption("bad footer length".into()));
        }
        let footer = Footer {
            bloom_offset: buf.get_u64_le(),
            bloom_len: buf.get_u64_le(),
            index_offset: buf.get_u64_le(),
            index_len: buf.get_u64_le(),
            props_offset: buf.get_u64_le(),
            props_len: buf.get_u64_le(),
            compression: buf.get_u8(),
        };
        let version = buf.get_u8();
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(StorageError::Corruption("not an SSTable (bad magic)".into()));
        }
        if version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!("unsupported SSTable version {}", version)));
        }
        Ok(footer)
    }
}

/// Summary of an SSTable, written once at finish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    pub entry_count: u64,
    pub distinct_keys: u64,
    pub key_bytes: u64,
    pub value_bytes: u64,
    pub tombstones: u64,
    pub data_blocks: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    /// End of the data-block region in the klog.
    pub data_end: u64,
    pub smallest_key: Bytes,
    pub largest_key: Bytes,
}

impl Properties {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            9 * 8 + 8 + self.smallest_key.len() + self.largest_key.len(),
        );
        buf.put_u64_le(self.entry_count);
        buf.put_u64_le(self.distinct_keys);
        buf.put_u64_le(self.key_bytes);
        buf.put_u64_le(self.value_bytes);
        buf.put_u64_le(self.tombstones);
        buf.put_u64_le(self.data_blocks);
        buf.put_u64_le(self.min_seq);
        buf.put_u64_le(self.max_seq);
        buf.put_u64_le(self.data_end);
        buf.put_u32_le(self.smallest_key.len() as u32);
        buf.put_slice(&self.smallest_key);
        buf.put_u32_le(self.largest_key.len() as u32);
        buf.put_slice(&self.largest_key);
        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let short = || StorageError::Corruption("short properties section".into());
        if buf.remaining() < 9 * 8 + 4 {
            return Err(short());
        }
        let mut props = Properties {
            entry_count: buf.get_u64_le(),
            distinct_keys: buf.get_u64_le(),
            key_bytes: buf.get_u64_le(),
            value_bytes: buf.get_u64_le(),
            tombstones: buf.get_u64_le(),
            data_blocks: buf.get_u64_le(),
            min_seq: buf.get_u64_le(),
            max_seq: buf.get_u64_le(),
            data_end: buf.get_u64_le(),
            ..Default::default()
        };
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len + 4 {
            return Err(short());
        }
        props.smallest_key = buf.split_to(len);
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(short());
        }
        props.largest_key = buf.split_to(len);
        Ok(props)
    }

    pub fn avg_entry_size(&self) -> f64 {
        if self.entry_count == 0 {
            return 0.0;
        }
        (self.key_bytes + self.value_bytes) as f64 / self.entry_count as f64
    }
}

/// Sparse index sample: the (possibly truncated) first key of a data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub prefix: Bytes,
    pub offset: u64,
    pub ordinal: u32,
}

/// Decoded index section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockIndex {
    /// One sample every `sample_ratio` data blocks.
    pub sample_ratio: u32,
    /// Length prefixes were cut to; 0 when keys are stored whole.
    pub prefix_len: u32,
    pub entries: Vec<IndexEntry>,
}

impl BlockIndex {
    /// `key` cut the way index prefixes were cut.
    pub fn truncate<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        let len = self.prefix_len as usize;
        if len > 0 && key.len() > len {
            &key[..len]
        } else {
            key
        }
    }
}

pub fn encode_index(index: &BlockIndex) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(index.sample_ratio);
    buf.put_u32_le(index.prefix_len);
    buf.put_u32_le(index.entries.len() as u32);
    for e in &index.entries {
        buf.put_u64_le(e.offset);
        buf.put_u32_le(e.ordinal);
        buf.put_u16_le(e.prefix.len() as u16);
        buf.put_slice(&e.prefix);
    }
    buf
}

pub fn decode_index(mut buf: Bytes) -> Result<BlockIndex> {
    let short = || StorageError::Corruption("short index section".into());
    if buf.remaining() < 12 {
        return Err(short());
    }
    let sample_ratio = buf.get_u32_le();
    let prefix_len = buf.get_u32_le();
    let count = buf.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        if buf.remaining() < 8 + 4 + 2 {
            return Err(short());
        }
        let offset = buf.get_u64_le();
        let ordinal = buf.get_u32_le();
        let len = buf.get_u16_le() as usize;
        if buf.remaining() < len {
            return Err(short());
        }
        entries.push(IndexEntry {
            prefix: buf.split_to(len),
            offset,
            ordinal,
        });
    }
    Ok(BlockIndex {
        sample_ratio,
        prefix_len,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_codecs() -> Result<()> {
        let data: Vec<u8> = b"tidesdb ".iter().cycle().take(8192).copied().collect();
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4Fast,
        ] {
            let packed = compress(&data, algo)?;
            if algo != CompressionAlgorithm::None {
                assert!(packed.len() < data.len());
            }
            assert_eq!(decompress(&packed, algo)?, data);
        }
        Ok(())
    }

    #[test]
    fn test_frame_detects_corruption() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"payload");
        assert_eq!(check_frame(&buf[4..]).unwrap(), b"payload");
        let mut bad = buf.to_vec();
        bad[6] ^= 1;
        assert!(matches!(check_frame(&bad[4..]), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer {
            props_offset: 10,
            props_len: 20,
            compression: 2,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        footer.encode(&mut buf);
        assert_eq!(buf.len(), FOOTER_LEN);
        assert_eq!(Footer::decode(&buf).unwrap(), footer);

        let mut bad = buf.to_vec();
        bad[FOOTER_LEN - 1] = 0;
        assert!(Footer::decode(&bad).is_err());
    }

    #[test]
    fn test_properties_and_index_decode() -> Result<()> {
        let props = Properties {
            entry_count: 3,
            key_bytes: 30,
            value_bytes: 60,
            smallest_key: Bytes::from_static(b"a"),
            largest_key: Bytes::from_static(b"zz"),
            ..Default::default()
        };
        let decoded = Properties::decode(props.encode().freeze())?;
        assert_eq!(decoded, props);
        assert_eq!(decoded.avg_entry_size(), 30.0);

        let index = BlockIndex {
            sample_ratio: 2,
            prefix_len: 3,
            entries: vec![IndexEntry {
                prefix: Bytes::from_static(b"key"),
                offset: 4096,
                ordinal: 2,
            }],
        };
        assert_eq!(decode_index(encode_index(&index).freeze())?, index);
        assert_eq!(index.truncate(b"keys"), b"key");
        assert!(decode_index(Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0])).is_err());
        Ok(())
    }
}
