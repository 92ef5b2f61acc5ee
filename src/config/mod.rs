//! # pagecore Configuration Module
//!
//! Centralizes every configuration constant for the storage core. Constants
//! are grouped by functional area and their interdependencies are documented
//! and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The page geometry, cell layout, table sizing, and eviction budgets all
//! depend on each other. A cell header that grows past its reserved size or
//! a table entry that no longer matches the slot stride corrupts off-heap
//! memory silently. Co-locating the constants and asserting the derived
//! relationships turns those mistakes into compile errors.
//!
//! ## Module Organization
//!
//! - [`constants`]: all numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;
