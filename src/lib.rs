//! # pagecore - Page-Based Off-Heap Storage Core
//!
//! pagecore is the storage heart of a page-based cache/database node: raw
//! off-heap memory regions, a loaded-pages table, sampling LRU eviction, a
//! free-list row store with fragment chains, a write-ahead-log linkage layer,
//! and a strictly-ordered asynchronous file channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          Row Store (add/read/remove)          │
//! ├───────────────────────┬──────────────────────┤
//! │  Free-Space Index     │  WAL Payload Linker  │
//! ├───────────────────────┼──────────────────────┤
//! │  Region Page Memory   │     WAL Segment      │
//! │  (table + eviction)   │   (CRC64 framing)    │
//! ├───────────────────────┼──────────────────────┤
//! │  Direct Memory Region │    Async File I/O    │
//! └───────────────────────┴──────────────────────┘
//! ```
//!
//! A row mutation enters at the [`storage::RowStore`], which places the row's
//! fragments on data pages obtained from a [`storage::PageMemory`] provider.
//! The provider resolves `(cache_id, page_id)` through the
//! [`storage::LoadedPagesTable`] and records every access in the
//! [`storage::PageEvictionTracker`]. When durability is on, the
//! [`wal::PayloadLinker`] captures the row bytes for the log, which is
//! appended through [`io::AsyncFileIo`] by the [`wal::WalSegment`].
//!
//! ## Memory Model
//!
//! All hot data structures live in [`memory::DirectMemoryRegion`]s: fixed
//! anonymous memory maps with explicit lifetimes and bounds-checked
//! accessors. Raw pointers never cross a region's API boundary; components
//! address each other with page ids, frame indexes, and row links.
//!
//! ## Concurrency Model
//!
//! There is no global lock. Each component owns a narrow synchronization
//! domain:
//!
//! - loaded-pages table: `&mut` access, serialized by its owner's lock
//! - eviction tracker: per-slot atomic words, no cross-slot ordering
//! - page frames: per-frame read/write latches plus pin counts
//! - WAL segment: append offset under a mutex, payload linker single-writer
//! - async file: one in-flight operation per handle, callers serialize
//!
//! ## Module Overview
//!
//! - [`memory`]: off-heap regions and the allocation provider
//! - [`storage`]: pages, loaded-pages table, eviction, free list, row store
//! - [`wal`]: record model, payload linker, CRC64-framed segment
//! - [`io`]: strictly-ordered asynchronous file channel
//! - [`metrics`]: atomic counters for the surrounding node to export
//! - [`config`]: centralized constants with compile-time invariant checks

#[macro_use]
mod macros;

pub mod config;
pub mod io;
pub mod memory;
pub mod metrics;
pub mod storage;
pub mod wal;

pub use io::AsyncFileIo;
pub use memory::{DirectMemoryProvider, DirectMemoryRegion, RegionBudgetExceeded};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use storage::{
    CacheDataRow, EvictionConfig, EvictionExhausted, EvictionMode, FreeSpaceIndex, FullPageId,
    LoadedPagesTable, OutOfTableSpace, PageEvictionTracker, PageMemory, RegionPageMemory, RowStore,
};
pub use wal::{
    DataEntry, DataRecord, LinkerContractError, PayloadLinker, PayloadRequest, WalPointer,
    WalSegment,
};
