//! # WAL Payload Linker
//!
//! Re-associates a [`DataRecord`]'s entry structures with their backing
//! row payload bytes. WAL fragment sizes are chosen by the log writer and
//! are independent of row and page boundaries, so a single source row may
//! be consumed across several `link_payload` calls, and one call never
//! spans two rows. The linker's cursor `(entry_index, byte_offset)` tracks
//! the exact resume position and only moves forward between `init` calls.
//!
//! ## Contract
//!
//! - `init` binds a record batch and its durable pointer, rewinding the
//!   cursor to the first entry.
//! - `has_payload` is false exactly when every entry is consumed.
//! - `link_payload` copies exactly `payload_size` bytes from the cursor
//!   position into a fresh buffer attached to the out-record. Fragmented
//!   requests resume mid-entry; non-fragmented requests must consume one
//!   whole row from its start.
//! - Calling past the end, overrunning the current entry, or requesting
//!   zero bytes is a [`LinkerContractError`]: a protocol bug in the
//!   caller, failed loudly.

use eyre::Result;

use crate::wal::record::{DataRecord, WalPointer};

/// Caller broke the linker protocol (see module docs).
#[derive(Debug)]
pub struct LinkerContractError {
    pub detail: String,
}

impl LinkerContractError {
    fn err(detail: String) -> eyre::Report {
        eyre::Report::new(Self { detail })
    }
}

impl std::fmt::Display for LinkerContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payload linker contract violation: {}", self.detail)
    }
}

impl std::error::Error for LinkerContractError {}

/// Destination record for one linked payload: declares how many bytes it
/// expects and whether it is a mid-row fragment, and receives the buffer.
#[derive(Debug)]
pub struct PayloadRequest {
    payload_size: usize,
    fragmented: bool,
    payload: Option<Box<[u8]>>,
}

impl PayloadRequest {
    pub fn new(payload_size: usize, fragmented: bool) -> Self {
        Self {
            payload_size,
            fragmented,
            payload: None,
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    /// The linked bytes, once `link_payload` succeeded.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn take_payload(&mut self) -> Option<Box<[u8]>> {
        self.payload.take()
    }
}

struct Bound {
    record: DataRecord,
    pointer: WalPointer,
}

/// Cursor over a record batch's row bytes.
#[derive(Default)]
pub struct PayloadLinker {
    bound: Option<Bound>,
    entry_index: usize,
    entry_offset: usize,
}

impl PayloadLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the linker to `record` and its durable `pointer`, rewinding
    /// the cursor.
    pub fn init(&mut self, record: DataRecord, pointer: WalPointer) {
        self.bound = Some(Bound { record, pointer });
        self.entry_index = 0;
        self.entry_offset = 0;
        self.skip_consumed();
    }

    /// The bound batch's durable pointer; unchanged by `link_payload`.
    ///
    /// Calling before `init` is a programmer error.
    pub fn pointer(&self) -> WalPointer {
        self.bound
            .as_ref()
            .expect("payload linker is not bound to a record")
            .pointer
    }

    /// True while unconsumed entry bytes remain.
    pub fn has_payload(&self) -> bool {
        match &self.bound {
            Some(bound) => self.entry_index < bound.record.entries.len(),
            None => false,
        }
    }

    /// Cursor position, for diagnostics and tests.
    pub fn cursor(&self) -> (usize, usize) {
        (self.entry_index, self.entry_offset)
    }

    /// Advances the cursor past fully consumed (or empty) entries.
    fn skip_consumed(&mut self) {
        let Some(bound) = &self.bound else { return };
        while self.entry_index < bound.record.entries.len()
            && self.entry_offset >= bound.record.entries[self.entry_index].row_bytes.len()
        {
            self.entry_index += 1;
            self.entry_offset = 0;
        }
    }

    /// Copies `out.payload_size()` bytes from the cursor position into a
    /// fresh buffer attached to `out`, advancing the cursor.
    pub fn link_payload(&mut self, out: &mut PayloadRequest) -> Result<()> {
        if !self.has_payload() {
            return Err(LinkerContractError::err(
                "link_payload called with no payload remaining".into(),
            ));
        }
        if out.payload_size == 0 {
            return Err(LinkerContractError::err(
                "zero-length payload request".into(),
            ));
        }

        let bound = self.bound.as_ref().expect("has_payload checked the bound");
        let entry = &bound.record.entries[self.entry_index];
        let remaining = entry.row_bytes.len() - self.entry_offset;

        if out.fragmented {
            if out.payload_size > remaining {
                return Err(LinkerContractError::err(format!(
                    "fragment of {} bytes overruns entry {} ({} bytes remaining)",
                    out.payload_size, self.entry_index, remaining
                )));
            }
        } else {
            if self.entry_offset != 0 {
                return Err(LinkerContractError::err(format!(
                    "whole-row request mid-entry (entry {}, offset {})",
                    self.entry_index, self.entry_offset
                )));
            }
            if out.payload_size != entry.row_bytes.len() {
                return Err(LinkerContractError::err(format!(
                    "whole-row request of {} bytes does not match entry {} length {}",
                    out.payload_size,
                    self.entry_index,
                    entry.row_bytes.len()
                )));
            }
        }

        let start = self.entry_offset;
        let bytes = entry.row_bytes[start..start + out.payload_size]
            .to_vec()
            .into_boxed_slice();
        out.payload = Some(bytes);

        self.entry_offset += out.payload_size;
        self.skip_consumed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::DataEntry;

    fn linker_over(rows: &[&[u8]]) -> PayloadLinker {
        let entries = rows
            .iter()
            .enumerate()
            .map(|(i, row)| DataEntry::new(1, 0x10000 + i as u64, row.to_vec()))
            .collect();

        let mut linker = PayloadLinker::new();
        linker.init(DataRecord::new(entries), WalPointer::new(3, 4096, 64));
        linker
    }

    fn link(linker: &mut PayloadLinker, size: usize, fragmented: bool) -> Vec<u8> {
        let mut request = PayloadRequest::new(size, fragmented);
        linker.link_payload(&mut request).unwrap();
        request.take_payload().unwrap().into_vec()
    }

    #[test]
    fn fresh_linker_has_no_payload() {
        let linker = PayloadLinker::new();
        assert!(!linker.has_payload());
    }

    #[test]
    fn whole_row_requests_consume_one_entry_each() {
        let mut linker = linker_over(&[b"alpha", b"bravo!"]);

        assert_eq!(link(&mut linker, 5, false), b"alpha");
        assert!(linker.has_payload());
        assert_eq!(link(&mut linker, 6, false), b"bravo!");
        assert!(!linker.has_payload());
    }

    #[test]
    fn fragmented_requests_resume_mid_entry() {
        let mut linker = linker_over(&[b"0123456789"]);

        assert_eq!(link(&mut linker, 4, true), b"0123");
        assert_eq!(linker.cursor(), (0, 4));
        assert_eq!(link(&mut linker, 6, true), b"456789");
        assert!(!linker.has_payload());
    }

    #[test]
    fn fragment_boundaries_cross_entries_byte_exactly() {
        let rows: [&[u8]; 3] = [b"aaaaaaa", b"bbb", b"cccccccccc"];
        let mut linker = linker_over(&rows);

        // Sizes independent of row boundaries: 7 = entry 0, then 2+1
        // splits entry 1, then 10 in uneven pieces from entry 2.
        let mut reassembled = Vec::new();
        for (size, fragmented) in [(7, true), (2, true), (1, true), (3, true), (7, true)] {
            reassembled.extend_from_slice(&link(&mut linker, size, fragmented));
        }

        let expected: Vec<u8> = rows.concat();
        assert_eq!(reassembled, expected);
        assert!(!linker.has_payload());
    }

    #[test]
    fn empty_entries_are_skipped() {
        let mut linker = linker_over(&[b"", b"data", b""]);

        assert!(linker.has_payload());
        assert_eq!(link(&mut linker, 4, false), b"data");
        assert!(!linker.has_payload());
    }

    #[test]
    fn pointer_is_stable_across_linking() {
        let mut linker = linker_over(&[b"xy"]);
        let before = linker.pointer();

        link(&mut linker, 2, false);

        assert_eq!(linker.pointer(), before);
        assert_eq!(before, WalPointer::new(3, 4096, 64));
    }

    #[test]
    fn init_rewinds_the_cursor() {
        let mut linker = linker_over(&[b"abcd"]);
        link(&mut linker, 4, false);
        assert!(!linker.has_payload());

        linker.init(
            DataRecord::new(vec![DataEntry::new(1, 0x10000, b"efgh".to_vec())]),
            WalPointer::new(4, 0, 16),
        );

        assert!(linker.has_payload());
        assert_eq!(linker.cursor(), (0, 0));
        assert_eq!(link(&mut linker, 4, false), b"efgh");
    }

    #[test]
    fn linking_past_the_end_is_a_contract_error() {
        let mut linker = linker_over(&[b"ab"]);
        link(&mut linker, 2, false);

        let mut request = PayloadRequest::new(1, true);
        let err = linker.link_payload(&mut request).unwrap_err();

        assert!(err.downcast_ref::<LinkerContractError>().is_some());
        assert!(request.payload().is_none());
    }

    #[test]
    fn fragment_overrunning_entry_is_a_contract_error() {
        let mut linker = linker_over(&[b"abcde"]);

        let mut request = PayloadRequest::new(6, true);
        let err = linker.link_payload(&mut request).unwrap_err();

        assert!(err.downcast_ref::<LinkerContractError>().is_some());
        // The cursor did not move; a correct retry still works.
        assert_eq!(link(&mut linker, 5, true), b"abcde");
    }

    #[test]
    fn whole_row_request_mid_entry_is_a_contract_error() {
        let mut linker = linker_over(&[b"abcdef"]);
        link(&mut linker, 2, true);

        let mut request = PayloadRequest::new(4, false);
        let err = linker.link_payload(&mut request).unwrap_err();

        assert!(err.downcast_ref::<LinkerContractError>().is_some());
    }

    #[test]
    fn whole_row_request_with_wrong_size_is_a_contract_error() {
        let mut linker = linker_over(&[b"abcdef"]);

        let mut request = PayloadRequest::new(3, false);
        let err = linker.link_payload(&mut request).unwrap_err();

        assert!(err.downcast_ref::<LinkerContractError>().is_some());
    }
}
