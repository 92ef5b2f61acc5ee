//! # Storage Metrics
//!
//! Lock-free counters incremented by the storage components and exported to
//! whatever metrics sink the surrounding node wires up. The core only counts;
//! it never formats, samples, or ships.
//!
//! All counters are monotonic `AtomicU64`s updated with relaxed ordering:
//! the values are statistical, not synchronization points.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the page memory, row store, WAL, and file channel.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
    pages_evicted: AtomicU64,
    pages_read: AtomicU64,
    pages_written: AtomicU64,
    rows_added: AtomicU64,
    rows_removed: AtomicU64,
    wal_records: AtomicU64,
    wal_bytes: AtomicU64,
    file_reads: AtomicU64,
    file_writes: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn on_page_allocated(&self) {
        self.pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_page_freed(&self) {
        self.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_page_evicted(&self) {
        self.pages_evicted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_page_read(&self) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_page_written(&self) {
        self.pages_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_row_added(&self) {
        self.rows_added.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_row_removed(&self) {
        self.rows_removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_wal_record(&self, bytes: u64) {
        self.wal_records.fetch_add(1, Ordering::Relaxed);
        self.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_file_read(&self) {
        self.file_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_file_write(&self) {
        self.file_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            rows_added: self.rows_added.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            wal_records: self.wal_records.load(Ordering::Relaxed),
            wal_bytes: self.wal_bytes.load(Ordering::Relaxed),
            file_reads: self.file_reads.load(Ordering::Relaxed),
            file_writes: self.file_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub pages_evicted: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub rows_added: u64,
    pub rows_removed: u64,
    pub wal_records: u64,
    pub wal_bytes: u64,
    pub file_reads: u64,
    pub file_writes: u64,
}

impl MetricsSnapshot {
    /// Pages currently resident: allocated minus freed and evicted.
    pub fn live_pages(&self) -> u64 {
        self.pages_allocated
            .saturating_sub(self.pages_freed)
            .saturating_sub(self.pages_evicted)
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pages alloc:{} free:{} evict:{} read:{} write:{}, rows add:{} rm:{}, wal rec:{} bytes:{}, io r:{} w:{}",
            self.pages_allocated,
            self.pages_freed,
            self.pages_evicted,
            self.pages_read,
            self.pages_written,
            self.rows_added,
            self.rows_removed,
            self.wal_records,
            self.wal_bytes,
            self.file_reads,
            self.file_writes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = StoreMetrics::new();
        let snap = metrics.snapshot();

        assert_eq!(snap.pages_allocated, 0);
        assert_eq!(snap.rows_added, 0);
        assert_eq!(snap.wal_bytes, 0);
        assert_eq!(snap.live_pages(), 0);
    }

    #[test]
    fn live_pages_subtracts_freed_and_evicted() {
        let metrics = StoreMetrics::new();

        for _ in 0..10 {
            metrics.on_page_allocated();
        }
        metrics.on_page_freed();
        metrics.on_page_freed();
        metrics.on_page_evicted();

        assert_eq!(metrics.snapshot().live_pages(), 7);
    }

    #[test]
    fn wal_record_tracks_both_count_and_bytes() {
        let metrics = StoreMetrics::new();

        metrics.on_wal_record(128);
        metrics.on_wal_record(72);

        let snap = metrics.snapshot();
        assert_eq!(snap.wal_records, 2);
        assert_eq!(snap.wal_bytes, 200);
    }
}
