//! # Off-Heap Memory Management
//!
//! This module provides the raw memory substrate for the storage core:
//! fixed-size anonymous memory maps with explicit lifetimes, owned outside
//! the Rust heap and released exactly once.
//!
//! ## Design
//!
//! Every hot data structure in pagecore (page frames, the loaded-pages
//! table, eviction tracking slots) lives inside a [`DirectMemoryRegion`].
//! Regions are allocated through a [`DirectMemoryProvider`], which enforces
//! an optional total byte budget across all live regions and accounts for
//! every release.
//!
//! Regions never expose raw addresses: access goes through bounds-checked
//! slice and atomic-word accessors, and the one interior-mutable escape
//! hatch is `unsafe` with its obligations spelled out at the call site.
//!
//! ## Why Anonymous Maps
//!
//! Page frames are large (16KB each, typically thousands of them) and have
//! a lifetime decoupled from any Rust object graph. Anonymous memory maps
//! give page-aligned, zero-initialized memory that never moves, outside the
//! allocator's arenas, and release back to the OS in one call.

mod region;

pub use region::{DirectMemoryProvider, DirectMemoryRegion, RegionBudgetExceeded};
