//! # WAL Record Model
//!
//! A [`DataRecord`] batches the row snapshots of one logical mutation:
//! each [`DataEntry`] pairs a cache id and row link with the row's
//! serialized bytes at mutation time. Records serialize to a compact
//! little-endian body that the segment frames with a checksummed header.
//!
//! ## Record Body Format
//!
//! ```text
//! entry_count (4)
//! per entry:
//!   cache_id (4) | link (8) | row_len (4) | row bytes
//! ```
//!
//! ## Frame Header (16 bytes, on disk)
//!
//! ```text
//! record_type (1) | flags (1) | reserved (2) | len (4) | crc (8)
//! ```
//!
//! `len` is the body length; `crc` is CRC64 over the body. A header whose
//! type byte is unknown or whose checksum fails marks end-of-log during
//! sequential scans.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{WAL_RECORD_HEADER_SIZE, WAL_RECORD_TYPE_DATA};

/// Durable position of a record: segment index, byte offset of the frame,
/// and full frame length (header + body).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalPointer {
    pub segment: u64,
    pub offset: u32,
    pub len: u32,
}

impl WalPointer {
    pub fn new(segment: u64, offset: u32, len: u32) -> Self {
        Self {
            segment,
            offset,
            len,
        }
    }
}

impl std::fmt::Display for WalPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}+{}]", self.segment, self.offset, self.len)
    }
}

/// One row snapshot inside a data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub cache_id: u32,
    pub link: u64,
    pub row_bytes: Vec<u8>,
}

impl DataEntry {
    pub fn new(cache_id: u32, link: u64, row_bytes: Vec<u8>) -> Self {
        Self {
            cache_id,
            link,
            row_bytes,
        }
    }
}

/// A batch of data entries written as one WAL record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRecord {
    pub entries: Vec<DataEntry>,
}

impl DataRecord {
    pub fn new(entries: Vec<DataEntry>) -> Self {
        Self { entries }
    }

    /// Total row payload bytes across all entries.
    pub fn total_row_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.row_bytes.len()).sum()
    }

    /// Serialized body length.
    pub fn serialized_len(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|e| 4 + 8 + 4 + e.row_bytes.len())
            .sum::<usize>()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_len());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for entry in &self.entries {
            out.extend_from_slice(&entry.cache_id.to_le_bytes());
            out.extend_from_slice(&entry.link.to_le_bytes());
            out.extend_from_slice(&(entry.row_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&entry.row_bytes);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 4, "record body too short: {}", bytes.len());

        let entry_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(entry_count.min(1024));
        let mut cursor = 4usize;

        for index in 0..entry_count {
            ensure!(
                cursor + 16 <= bytes.len(),
                "record body truncated in entry {} header",
                index
            );

            let cache_id = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
            let link = u64::from_le_bytes(bytes[cursor + 4..cursor + 12].try_into().unwrap());
            let row_len =
                u32::from_le_bytes(bytes[cursor + 12..cursor + 16].try_into().unwrap()) as usize;
            cursor += 16;

            ensure!(
                cursor + row_len <= bytes.len(),
                "record body truncated in entry {} payload",
                index
            );

            entries.push(DataEntry {
                cache_id,
                link,
                row_bytes: bytes[cursor..cursor + row_len].to_vec(),
            });
            cursor += row_len;
        }

        ensure!(
            cursor == bytes.len(),
            "record body has {} trailing bytes",
            bytes.len() - cursor
        );

        Ok(Self { entries })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    record_type: u8,
    flags: u8,
    reserved: [u8; 2],
    len: U32,
    crc: U64,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == WAL_RECORD_HEADER_SIZE);

impl RecordHeader {
    pub fn new_data(len: u32, crc: u64) -> Self {
        Self {
            record_type: WAL_RECORD_TYPE_DATA,
            flags: 0,
            reserved: [0; 2],
            len: U32::new(len),
            crc: U64::new(crc),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= WAL_RECORD_HEADER_SIZE,
            "buffer too small for RecordHeader: {} < {}",
            bytes.len(),
            WAL_RECORD_HEADER_SIZE
        );

        Self::read_from_bytes(&bytes[..WAL_RECORD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read RecordHeader: {:?}", e))
    }

    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    pub fn is_data(&self) -> bool {
        self.record_type == WAL_RECORD_TYPE_DATA
    }

    zerocopy_accessors! {
        len: u32,
        crc: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DataRecord {
        DataRecord::new(vec![
            DataEntry::new(1, 0x10007, b"first row bytes".to_vec()),
            DataEntry::new(2, 0x20003, b"second".to_vec()),
            DataEntry::new(1, 0x30001, Vec::new()),
        ])
    }

    #[test]
    fn record_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<RecordHeader>(), 16);
    }

    #[test]
    fn record_header_round_trip() {
        let header = RecordHeader::new_data(512, 0xDEAD_BEEF_CAFE_F00D);
        let parsed = RecordHeader::from_bytes(header.as_bytes()).unwrap();

        assert!(parsed.is_data());
        assert_eq!(parsed.len(), 512);
        assert_eq!(parsed.crc(), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn record_serialization_round_trip() {
        let record = sample_record();

        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), record.serialized_len());

        let parsed = DataRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn record_rejects_truncated_bodies() {
        let bytes = sample_record().to_bytes();

        assert!(DataRecord::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(DataRecord::from_bytes(&bytes[..6]).is_err());
        assert!(DataRecord::from_bytes(&[]).is_err());
    }

    #[test]
    fn record_rejects_trailing_garbage() {
        let mut bytes = sample_record().to_bytes();
        bytes.push(0xFF);

        assert!(DataRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn total_row_bytes_sums_entries() {
        assert_eq!(sample_record().total_row_bytes(), 15 + 6);
    }

    #[test]
    fn pointer_orders_by_segment_then_offset() {
        let a = WalPointer::new(1, 100, 32);
        let b = WalPointer::new(1, 200, 32);
        let c = WalPointer::new(2, 0, 32);

        assert!(a < b);
        assert!(b < c);
    }
}
