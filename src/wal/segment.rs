//! # WAL Segment
//!
//! One append-only log file of CRC64-framed [`DataRecord`]s, written and
//! read through the strictly-ordered [`AsyncFileIo`] channel. Rotation and
//! naming belong to the surrounding file subsystem; the segment owns the
//! framing and checksum discipline.
//!
//! ## Frame Format
//!
//! ```text
//! +------------------+------------------+
//! | RecordHeader     | Record Body      |
//! | (16 bytes)       | (len bytes)      |
//! +------------------+------------------+
//! ```
//!
//! Appends write header and body as one positioned write, so a torn frame
//! can only be a suffix of the file. Reads validate the checksum before
//! deserializing; a sequential [`scan`](WalSegment::scan) treats the first
//! invalid frame as end-of-log, which is the normal crash-recovery
//! stopping condition rather than an error.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::config::WAL_RECORD_HEADER_SIZE;
use crate::io::AsyncFileIo;
use crate::metrics::StoreMetrics;
use crate::wal::record::{DataRecord, RecordHeader, WalPointer};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Computes the frame checksum over a record body.
pub fn compute_checksum(body: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(body);
    digest.finalize()
}

/// Append-only record log over one file.
pub struct WalSegment {
    io: AsyncFileIo,
    index: u64,
    append_offset: Mutex<u64>,
    metrics: Arc<StoreMetrics>,
}

impl WalSegment {
    /// Creates (truncating) a fresh segment file.
    pub fn create<P: AsRef<Path>>(path: P, index: u64, metrics: Arc<StoreMetrics>) -> Result<Self> {
        let io = AsyncFileIo::create(path)?;
        Ok(Self {
            io,
            index,
            append_offset: Mutex::new(0),
            metrics,
        })
    }

    /// Opens an existing segment; appends continue at the current file
    /// end. Callers recovering from a crash should [`scan`](Self::scan)
    /// first and truncate trailing garbage if they intend to keep
    /// appending.
    pub fn open<P: AsRef<Path>>(path: P, index: u64, metrics: Arc<StoreMetrics>) -> Result<Self> {
        let io = AsyncFileIo::open(path)?;
        let size = io.size()?;
        Ok(Self {
            io,
            index,
            append_offset: Mutex::new(size),
            metrics,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Bytes currently appended.
    pub fn size(&self) -> Result<u64> {
        self.io.size()
    }

    /// Appends one record and returns its durable pointer.
    pub fn append(&self, record: &DataRecord) -> Result<WalPointer> {
        let body = record.to_bytes();
        ensure!(
            body.len() <= u32::MAX as usize,
            "record body of {} bytes exceeds frame limit",
            body.len()
        );

        let header = RecordHeader::new_data(body.len() as u32, compute_checksum(&body));

        let mut frame = Vec::with_capacity(WAL_RECORD_HEADER_SIZE + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&body);

        let mut offset = self.append_offset.lock();
        ensure!(
            *offset + frame.len() as u64 <= u32::MAX as u64,
            "segment {} overflows pointer offset range",
            self.index
        );

        self.io
            .write_at(&frame, *offset)
            .wrap_err_with(|| format!("failed to append WAL record at offset {}", *offset))?;

        let pointer = WalPointer::new(self.index, *offset as u32, frame.len() as u32);
        *offset += frame.len() as u64;
        drop(offset);

        self.metrics.on_wal_record(frame.len() as u64);
        self.metrics.on_file_write();
        trace!(%pointer, "appended WAL record");
        Ok(pointer)
    }

    /// Reads and validates the record at `pointer`.
    pub fn read_at(&self, pointer: &WalPointer) -> Result<DataRecord> {
        ensure!(
            pointer.segment == self.index,
            "pointer {} does not belong to segment {}",
            pointer,
            self.index
        );
        ensure!(
            pointer.len as usize > WAL_RECORD_HEADER_SIZE,
            "pointer {} is too short for a record frame",
            pointer
        );

        let mut frame = vec![0u8; pointer.len as usize];
        let read = self.io.read_at(&mut frame, pointer.offset as u64)?;
        self.metrics.on_file_read();
        ensure!(
            read == frame.len(),
            "short read at {}: {} of {} bytes",
            pointer,
            read,
            frame.len()
        );

        let header = RecordHeader::from_bytes(&frame)?;
        ensure!(
            header.is_data(),
            "unknown record type {:#04x} at {}",
            header.record_type(),
            pointer
        );

        let body = &frame[WAL_RECORD_HEADER_SIZE..];
        ensure!(
            header.len() as usize == body.len(),
            "frame length mismatch at {}: header says {}, pointer spans {}",
            pointer,
            header.len(),
            body.len()
        );

        if compute_checksum(body) != header.crc() {
            bail!("checksum mismatch at {}", pointer);
        }

        DataRecord::from_bytes(body)
    }

    /// Sequentially scans valid records from the start of the segment,
    /// stopping at the first invalid or torn frame. Returns the number of
    /// records visited.
    pub fn scan(&self, mut visitor: impl FnMut(WalPointer, DataRecord) -> Result<()>) -> Result<u64> {
        let size = self.io.size()?;
        let mut offset = 0u64;
        let mut visited = 0u64;

        loop {
            if offset + WAL_RECORD_HEADER_SIZE as u64 > size {
                break;
            }

            let mut header_bytes = [0u8; WAL_RECORD_HEADER_SIZE];
            let read = self.io.read_at(&mut header_bytes, offset)?;
            self.metrics.on_file_read();
            if read < WAL_RECORD_HEADER_SIZE {
                break;
            }

            let header = RecordHeader::from_bytes(&header_bytes)?;
            if !header.is_data() {
                debug!(offset, "scan reached unknown record type, treating as end of log");
                break;
            }

            let body_len = header.len() as u64;
            if offset + WAL_RECORD_HEADER_SIZE as u64 + body_len > size {
                debug!(offset, "scan reached torn frame, treating as end of log");
                break;
            }

            let mut body = vec![0u8; body_len as usize];
            let read = self
                .io
                .read_at(&mut body, offset + WAL_RECORD_HEADER_SIZE as u64)?;
            self.metrics.on_file_read();
            if read < body.len() || compute_checksum(&body) != header.crc() {
                debug!(offset, "scan reached corrupt frame, treating as end of log");
                break;
            }

            let frame_len = (WAL_RECORD_HEADER_SIZE as u64 + body_len) as u32;
            let pointer = WalPointer::new(self.index, offset as u32, frame_len);
            visitor(pointer, DataRecord::from_bytes(&body)?)?;

            visited += 1;
            offset += frame_len as u64;
        }

        Ok(visited)
    }

    /// Flushes appended records to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.force(true)
    }

    /// Truncates the segment to empty.
    pub fn truncate(&self) -> Result<()> {
        let mut offset = self.append_offset.lock();
        self.io.clear()?;
        *offset = 0;
        Ok(())
    }
}
