//! # Write-Ahead Log Linkage Layer
//!
//! The durability-facing side of the row store. A batch of row mutations
//! becomes a [`DataRecord`] (one [`DataEntry`] per row snapshot), which is
//! framed with a CRC64 checksum and appended to a [`WalSegment`] through
//! the ordered file channel. The [`PayloadLinker`] re-associates record
//! structures with their backing row payload bytes on the read side,
//! resolving fragmented and whole-row layouts byte-exactly.
//!
//! Segment naming, rotation, and checkpoint indexing belong to the
//! surrounding file subsystem; this module owns the record format, the
//! framing, and the payload linkage only.

mod linker;
mod record;
mod segment;

pub use linker::{LinkerContractError, PayloadLinker, PayloadRequest};
pub use record::{DataEntry, DataRecord, RecordHeader, WalPointer};
pub use segment::WalSegment;
