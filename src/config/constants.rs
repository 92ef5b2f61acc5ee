//! # pagecore Configuration Constants
//!
//! All numeric configuration for the storage core lives here. Interdependent
//! values are co-located and the derived relationships are enforced with
//! compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> DATA_PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │
//!       ├─> MAX_CELL_PAYLOAD (derived: PAGE_SIZE - header - slot - cell header)
//!       │     The largest row fragment a single page can carry. Rows larger
//!       │     than this are split into fragment chains.
//!       │
//!       └─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - DATA_PAGE_HEADER_SIZE)
//!
//! PAGE_TABLE_ENTRY_SIZE (24 bytes)
//!       │
//!       └─> LoadedPagesTable::required_memory sizes the slot array as
//!           next_power_of_two(2 * max_entries) * PAGE_TABLE_ENTRY_SIZE,
//!           keeping the load factor at or below 50% so probe sequences
//!           stay short and bounded.
//!
//! EVICTION_SAMPLE_SIZE (5)
//!       │
//!       ├─> EVICTION_MAX_ATTEMPTS (30): rounds of sampling tolerated when
//!       │     the chosen victim refuses eviction (pinned/busy pages).
//!       │
//!       └─> EVICTION_MAX_SAMPLE_SPIN (5000): random draws allowed within a
//!           single round before concluding the region has too few touched
//!           pages to sample. Independent of the attempt budget.
//!
//! WAL_RECORD_HEADER_SIZE (16 bytes)
//!       │
//!       └─> Each WAL frame = header + serialized record body; the header
//!           carries the body length and a CRC64 over the body.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by `const _: () = assert!(...)` below:
//!
//! 1. `PAGE_SIZE` is a power of two (page offset arithmetic uses masks)
//! 2. `MAX_CELL_PAYLOAD` fits a `u16` cell length field
//! 3. `CELL_HEADER_SIZE` matches the on-page cell header struct
//! 4. The row fixed header fits inside a single minimum fragment

// ============================================================================
// PAGE GEOMETRY
// These define the fundamental page structure used throughout the core
// ============================================================================

/// Size of every page in bytes. 16KB balances sequential throughput against
/// internal fragmentation and matches common OS page size multiples.
pub const PAGE_SIZE: usize = 16384;

/// Bytes reserved at the start of every data page for the page header.
pub const DATA_PAGE_HEADER_SIZE: usize = 16;

/// Usable bytes on a data page after the header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - DATA_PAGE_HEADER_SIZE;

/// Size of one entry in a data page's item slot directory.
pub const ITEM_SLOT_SIZE: usize = 2;

/// On-page header preceding every row fragment cell:
/// payload_len (2) + flags (1) + total_row_len (4) + next_link (8).
pub const CELL_HEADER_SIZE: usize = 15;

/// Largest fragment payload a single page can carry: one cell plus its
/// directory slot on an otherwise empty page.
pub const MAX_CELL_PAYLOAD: usize =
    PAGE_SIZE - DATA_PAGE_HEADER_SIZE - ITEM_SLOT_SIZE - CELL_HEADER_SIZE;

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "page offset math relies on PAGE_SIZE being a power of two");
const _: () = assert!(MAX_CELL_PAYLOAD <= u16::MAX as usize, "cell payload length is stored in a u16 field");

// ============================================================================
// ROW LAYOUT
// ============================================================================

/// Fixed prefix of a serialized row:
/// key_len (4) + value_len (4) + version (8) + expire_time (8).
pub const ROW_HEADER_SIZE: usize = 24;

const _: () = assert!(
    ROW_HEADER_SIZE < MAX_CELL_PAYLOAD,
    "a row header must fit into a single fragment"
);

// ============================================================================
// LOADED-PAGES TABLE
// ============================================================================

/// Bytes per table slot: cache_id (4) + tag (4) + page_id (8) + pointer (8).
pub const PAGE_TABLE_ENTRY_SIZE: usize = 24;

/// Smallest slot array the table will size itself to, regardless of the
/// requested entry count.
pub const PAGE_TABLE_MIN_SLOTS: usize = 16;

const _: () = assert!(PAGE_TABLE_MIN_SLOTS.is_power_of_two());

// ============================================================================
// EVICTION POLICY BUDGETS
// These convert unbounded retry loops into bounded-then-fail contracts
// ============================================================================

/// Number of touched slots drawn per sampling round; the round's victim is
/// the least-recently-touched of the sample.
pub const EVICTION_SAMPLE_SIZE: usize = 5;

/// Sampling rounds tolerated when the page-level eviction primitive keeps
/// rejecting victims (pinned or busy pages) before the whole call fails.
pub const EVICTION_MAX_ATTEMPTS: u32 = 30;

/// Random draws allowed within one sampling round before concluding there
/// are too few touched pages to build a sample. This budget is per round
/// and failing it fails the whole eviction call immediately.
pub const EVICTION_MAX_SAMPLE_SPIN: u32 = 5000;

// ============================================================================
// FREE-SPACE INDEX
// ============================================================================

/// Number of free-space buckets; bucket width is PAGE_USABLE_SIZE / buckets.
pub const FREE_SPACE_BUCKETS: usize = 8;

/// Pages whose remaining free space drops below this are not worth keeping
/// in the free-space index; a minimum cell barely fits.
pub const MIN_USEFUL_FREE_SPACE: usize = CELL_HEADER_SIZE + ITEM_SLOT_SIZE + 16;

const _: () = assert!(FREE_SPACE_BUCKETS.is_power_of_two());

// ============================================================================
// WAL FRAMING
// ============================================================================

/// On-disk header preceding every WAL record:
/// record_type (1) + flags (1) + reserved (2) + len (4) + crc (8).
pub const WAL_RECORD_HEADER_SIZE: usize = 16;

/// Record type tag for a batched data record.
pub const WAL_RECORD_TYPE_DATA: u8 = 0x01;
