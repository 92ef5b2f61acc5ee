//! # Row Store
//!
//! Stores variable-length rows on data pages obtained from a
//! [`PageMemory`] provider, splitting rows that exceed one page into
//! fragment chains and keeping a free-space index so small rows fill the
//! holes big ones leave behind.
//!
//! ## Row Format
//!
//! A [`CacheDataRow`] serializes to a fixed header followed by key and
//! value bytes:
//!
//! ```text
//! key_len (4) | value_len (4) | version (8) | expire_time (8) | key | value
//! ```
//!
//! ## Fragment Chains
//!
//! Rows larger than [`MAX_CELL_PAYLOAD`] are split: the head fragment
//! carries the first bytes plus the row's total length, and every
//! fragment stores the link of the fragment holding the following bytes.
//! Chains are written tail-first so each earlier fragment can embed its
//! successor's link; the link returned to the caller addresses the head.
//! Full-size middle and tail fragments always take fresh pages (they fill
//! a page exactly); the head fragment is placed like a small row, into a
//! partially-filled page when one fits.
//!
//! A failed chain write unwinds the fragments already placed, so no
//! half-row survives an allocation failure.
//!
//! ## Placement and Reclaim
//!
//! Placement decisions run under one mutex around the
//! [`FreeSpaceIndex`]; the provider's per-page latches make the page
//! mutations themselves exclusive. Removing a row walks its chain,
//! returns every cell's bytes to the owning page, re-registers pages that
//! still hold rows, and hands fully drained pages back to the provider.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::{MAX_CELL_PAYLOAD, ROW_HEADER_SIZE};
use crate::metrics::StoreMetrics;
use crate::storage::page::{
    init_data_page, insert_cell, overwrite_cell, page_free_space, read_cell, remove_cell,
    required_cell_space, CellFlags, DataPageHeader,
};
use crate::storage::{make_link, split_link, FreeSpaceIndex, PageMemory};

/// Logical record stored by the row store: key, value, version stamp, and
/// an expiration marker (0 = never expires).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDataRow {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub expire_time: u64,
}

impl CacheDataRow {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            expire_time: 0,
        }
    }

    pub fn with_expire_time(mut self, expire_time: u64) -> Self {
        self.expire_time = expire_time;
        self
    }

    /// Serialized length: fixed header plus key and value bytes.
    pub fn serialized_len(&self) -> usize {
        ROW_HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_len());
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.expire_time.to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= ROW_HEADER_SIZE,
            "row too short: {} < {}",
            bytes.len(),
            ROW_HEADER_SIZE
        );

        let key_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let version = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let expire_time = u64::from_le_bytes(bytes[16..24].try_into().unwrap());

        ensure!(
            bytes.len() == ROW_HEADER_SIZE + key_len + value_len,
            "row length {} inconsistent with header ({} + {} + {})",
            bytes.len(),
            ROW_HEADER_SIZE,
            key_len,
            value_len
        );

        let key = bytes[ROW_HEADER_SIZE..ROW_HEADER_SIZE + key_len].to_vec();
        let value = bytes[ROW_HEADER_SIZE + key_len..].to_vec();

        Ok(Self {
            key,
            value,
            version,
            expire_time,
        })
    }
}

/// Row storage over a page memory provider, scoped to one cache id.
pub struct RowStore<M: PageMemory> {
    mem: Arc<M>,
    cache_id: u32,
    placement: Mutex<FreeSpaceIndex>,
    metrics: Arc<StoreMetrics>,
}

impl<M: PageMemory> RowStore<M> {
    pub fn new(mem: Arc<M>, cache_id: u32, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            mem,
            cache_id,
            placement: Mutex::new(FreeSpaceIndex::new()),
            metrics,
        }
    }

    pub fn cache_id(&self) -> u32 {
        self.cache_id
    }

    /// Pages currently registered as having reusable free space.
    pub fn reusable_pages(&self) -> usize {
        self.placement.lock().len()
    }

    /// Runs `f` against the physical bytes of one of this store's pages.
    pub fn with_page<R>(&self, page_id: u64, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        self.mem.with_page(self.cache_id, page_id, f)
    }

    /// Remaining free space on `page_id`.
    pub fn page_free_space(&self, page_id: u64) -> Result<usize> {
        self.with_page(page_id, |page| page_free_space(page))
    }

    /// Serializes `row` onto one or more pages and returns its link.
    pub fn add_row(&self, row: &CacheDataRow) -> Result<u64> {
        self.add_row_bytes(&row.to_bytes())
    }

    /// Stores pre-serialized row bytes and returns the row's link.
    pub fn add_row_bytes(&self, bytes: &[u8]) -> Result<u64> {
        ensure!(!bytes.is_empty(), "cannot store an empty row");
        ensure!(
            bytes.len() <= u32::MAX as usize,
            "row of {} bytes exceeds the addressable row size",
            bytes.len()
        );

        let total = bytes.len() as u32;

        let link = if bytes.len() <= MAX_CELL_PAYLOAD {
            self.place_cell(bytes, CellFlags::HEAD, total, 0)?
        } else {
            self.add_fragmented(bytes, total)?
        };

        self.metrics.on_row_added();
        Ok(link)
    }

    fn add_fragmented(&self, bytes: &[u8], total: u32) -> Result<u64> {
        // Head takes the remainder so every later fragment is full-size;
        // tail-first writing lets each fragment embed its successor's link.
        let full_fragments = (bytes.len() - 1) / MAX_CELL_PAYLOAD;
        let head_len = bytes.len() - full_fragments * MAX_CELL_PAYLOAD;

        // Each written fragment chains to everything after it, so the most
        // recently written link is all the unwind path needs.
        let mut next_link = 0u64;

        for index in (0..full_fragments).rev() {
            let start = head_len + index * MAX_CELL_PAYLOAD;
            let chunk = &bytes[start..start + MAX_CELL_PAYLOAD];

            match self.place_fragment_page(chunk, total, next_link) {
                Ok(link) => next_link = link,
                Err(e) => {
                    self.unwind_fragments(next_link);
                    return Err(e);
                }
            }
        }

        match self.place_cell(
            &bytes[..head_len],
            CellFlags::HEAD | CellFlags::FRAGMENT,
            total,
            next_link,
        ) {
            Ok(link) => {
                debug!(total, fragments = full_fragments + 1, "stored fragmented row");
                Ok(link)
            }
            Err(e) => {
                self.unwind_fragments(next_link);
                Err(e)
            }
        }
    }

    /// Writes one full-size fragment onto a fresh page (it fills the page
    /// exactly, so the free-space index can never place it).
    fn place_fragment_page(&self, chunk: &[u8], total: u32, next_link: u64) -> Result<u64> {
        let page_id = self.new_data_page()?;
        let item = self.mem.with_page_mut(self.cache_id, page_id, |page| {
            insert_cell(page, chunk, CellFlags::FRAGMENT, total, next_link)
        })?;
        Ok(make_link(page_id, item))
    }

    /// Places a cell on a page with room for it, preferring pages from the
    /// free-space index over fresh allocations.
    fn place_cell(&self, payload: &[u8], flags: u8, total: u32, next_link: u64) -> Result<u64> {
        let need = required_cell_space(payload.len());
        let mut placement = self.placement.lock();

        loop {
            let (page_id, fresh) = match placement.take(need) {
                Some((page_id, _)) => (page_id, false),
                None => (self.new_data_page()?, true),
            };

            let result = self.mem.with_page_mut(self.cache_id, page_id, |page| {
                let item = insert_cell(page, payload, flags, total, next_link)?;
                Ok((item, page_free_space(page)?))
            });

            match result {
                Ok((item, free)) => {
                    placement.register(page_id, free);
                    return Ok(make_link(page_id, item));
                }
                Err(e) if !fresh => {
                    // A page evicted underneath us leaves a stale index
                    // entry; drop it and place elsewhere.
                    warn!(page_id, error = %e, "dropping stale free-space entry");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocates and formats an empty data page.
    fn new_data_page(&self) -> Result<u64> {
        let page_id = self.mem.allocate_page(self.cache_id)?;
        self.mem
            .with_page_mut(self.cache_id, page_id, |page| init_data_page(page))?;
        Ok(page_id)
    }

    /// Best-effort removal of a partially written fragment chain.
    fn unwind_fragments(&self, chain_head: u64) {
        if chain_head == 0 {
            return;
        }
        if let Err(e) = self.remove_chain(chain_head, false) {
            warn!(link = chain_head, error = %e, "failed to unwind row fragments");
        }
    }

    /// Removes the row at `link`, unlinking every fragment and returning
    /// freed space to the free-space index.
    ///
    /// A zero link is a caller bug, not a recoverable condition.
    pub fn remove_row(&self, link: u64) -> Result<()> {
        assert!(link != 0, "null link passed to remove_row");

        self.remove_chain(link, true)?;
        self.metrics.on_row_removed();
        Ok(())
    }

    /// Walks the chain starting at `link` and returns every fragment link
    /// in order. Rows rarely exceed a few fragments, so the collection
    /// stays inline and allocation-free for typical removals.
    fn collect_chain(&self, link: u64, expect_head: bool) -> Result<SmallVec<[u64; 8]>> {
        let mut links: SmallVec<[u64; 8]> = SmallVec::new();
        let mut next = link;
        let mut first = expect_head;

        while next != 0 {
            let (page_id, item) = split_link(next);
            let following = self.mem.with_page(self.cache_id, page_id, |page| {
                let (cell, _) = read_cell(page, item)?;
                if first {
                    ensure!(
                        cell.is_head(),
                        "link {:#x} does not address a row head",
                        link
                    );
                }
                Ok(cell.next_link())
            })?;

            links.push(next);
            first = false;
            next = following;
        }

        Ok(links)
    }

    fn remove_chain(&self, link: u64, expect_head: bool) -> Result<()> {
        for fragment in self.collect_chain(link, expect_head)? {
            let (page_id, item) = split_link(fragment);
            let mut placement = self.placement.lock();

            let (remaining_items, free) =
                self.mem.with_page_mut(self.cache_id, page_id, |page| {
                    remove_cell(page, item)?;
                    let header = DataPageHeader::from_bytes(page)?;
                    Ok((header.item_count(), header.free_space()))
                })?;

            if remaining_items == 0 {
                placement.unregister(page_id);
                self.mem.free_page(self.cache_id, page_id)?;
            } else {
                placement.register(page_id, free);
            }
        }

        Ok(())
    }

    /// Reads the raw serialized bytes of the row at `link`, reassembling
    /// fragment chains in link order.
    pub fn read_row_bytes(&self, link: u64) -> Result<Vec<u8>> {
        ensure!(link != 0, "null link passed to read_row_bytes");

        let (page_id, item) = split_link(link);
        let mut buf = Vec::new();
        let mut total = 0usize;

        let mut next = self.mem.with_page(self.cache_id, page_id, |page| {
            let (cell, payload) = read_cell(page, item)?;
            ensure!(
                cell.is_head(),
                "link {:#x} does not address a row head",
                link
            );
            total = cell.total_row_len() as usize;
            buf.reserve_exact(total);
            buf.extend_from_slice(payload);
            Ok(cell.next_link())
        })?;

        while next != 0 {
            let (page_id, item) = split_link(next);
            next = self.mem.with_page(self.cache_id, page_id, |page| {
                let (cell, payload) = read_cell(page, item)?;
                ensure!(
                    cell.is_fragment() && !cell.is_head(),
                    "fragment chain of link {:#x} reaches a non-fragment cell",
                    link
                );
                buf.extend_from_slice(payload);
                Ok(cell.next_link())
            })?;

            if buf.len() > total {
                bail!(
                    "fragment chain of link {:#x} longer than declared {} bytes",
                    link,
                    total
                );
            }
        }

        ensure!(
            buf.len() == total,
            "row at link {:#x} reassembled to {} bytes, expected {}",
            link,
            buf.len(),
            total
        );

        Ok(buf)
    }

    /// Reads and deserializes the row at `link`.
    pub fn read_row(&self, link: u64) -> Result<CacheDataRow> {
        CacheDataRow::from_bytes(&self.read_row_bytes(link)?)
    }

    /// Replaces the row at `link`, returning the row's (possibly new)
    /// link. Same-length single-fragment rows are overwritten in place;
    /// everything else is remove + add.
    pub fn update_row(&self, link: u64, row: &CacheDataRow) -> Result<u64> {
        assert!(link != 0, "null link passed to update_row");

        let bytes = row.to_bytes();
        let (page_id, item) = split_link(link);

        let replaced = self.mem.with_page_mut(self.cache_id, page_id, |page| {
            let (cell, _) = read_cell(page, item)?;
            ensure!(cell.is_head(), "link {:#x} does not address a row head", link);

            if !cell.is_fragment() && cell.payload_len() as usize == bytes.len() {
                overwrite_cell(page, item, &bytes)?;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;

        if replaced {
            return Ok(link);
        }

        self.remove_chain(link, true)?;
        let new_link = self.add_row_bytes(&bytes)?;
        Ok(new_link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DirectMemoryProvider;
    use crate::storage::{EvictionConfig, RegionPageMemory};

    fn store(frames: usize) -> RowStore<RegionPageMemory> {
        let metrics = Arc::new(StoreMetrics::new());
        let mem = Arc::new(
            RegionPageMemory::new(
                &DirectMemoryProvider::unbounded(),
                frames,
                EvictionConfig::default(),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        RowStore::new(mem, 1, metrics)
    }

    fn mem_of(store: &RowStore<RegionPageMemory>) -> &RegionPageMemory {
        &store.mem
    }

    #[test]
    fn row_serialization_round_trip() {
        let row = CacheDataRow::new(b"user:42".to_vec(), b"alice".to_vec(), 7).with_expire_time(99);

        let bytes = row.to_bytes();
        assert_eq!(bytes.len(), row.serialized_len());

        let parsed = CacheDataRow::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn row_deserialization_rejects_inconsistent_lengths() {
        let row = CacheDataRow::new(b"k".to_vec(), b"v".to_vec(), 1);
        let mut bytes = row.to_bytes();

        bytes.push(0);
        assert!(CacheDataRow::from_bytes(&bytes).is_err());

        assert!(CacheDataRow::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn add_read_remove_small_row() {
        let store = store(8);
        let row = CacheDataRow::new(b"key".to_vec(), vec![0xAB; 200], 3);

        let link = store.add_row(&row).unwrap();
        assert_ne!(link, 0);

        let read = store.read_row(link).unwrap();
        assert_eq!(read, row);

        store.remove_row(link).unwrap();
        assert!(store.read_row(link).is_err());
    }

    #[test]
    fn small_rows_share_a_page() {
        let store = store(8);

        let a = store.add_row(&CacheDataRow::new(b"a".to_vec(), vec![1; 50], 1)).unwrap();
        let b = store.add_row(&CacheDataRow::new(b"b".to_vec(), vec![2; 50], 1)).unwrap();

        let (page_a, _) = split_link(a);
        let (page_b, _) = split_link(b);
        assert_eq!(page_a, page_b);
        assert_eq!(mem_of(&store).loaded_pages(), 1);
    }

    #[test]
    fn remove_restores_exact_free_space() {
        let store = store(8);

        let anchor = store
            .add_row(&CacheDataRow::new(b"anchor".to_vec(), vec![9; 64], 1))
            .unwrap();
        let (page_id, _) = split_link(anchor);

        let before = store.page_free_space(page_id).unwrap();

        let row = CacheDataRow::new(b"transient".to_vec(), vec![7; 500], 2);
        let link = store.add_row(&row).unwrap();
        let (row_page, _) = split_link(link);
        assert_eq!(row_page, page_id, "transient row should fill the same page");
        assert!(store.page_free_space(page_id).unwrap() < before);

        store.remove_row(link).unwrap();
        assert_eq!(store.page_free_space(page_id).unwrap(), before);
    }

    #[test]
    fn removing_last_row_returns_page_to_provider() {
        let store = store(8);

        let link = store
            .add_row(&CacheDataRow::new(b"solo".to_vec(), vec![1; 100], 1))
            .unwrap();
        assert_eq!(mem_of(&store).loaded_pages(), 1);

        store.remove_row(link).unwrap();

        assert_eq!(mem_of(&store).loaded_pages(), 0);
        assert_eq!(store.reusable_pages(), 0);
    }

    #[test]
    #[should_panic(expected = "null link")]
    fn remove_row_with_zero_link_panics() {
        let store = store(2);
        let _ = store.remove_row(0);
    }

    #[test]
    fn boundary_row_stays_single_fragment() {
        let store = store(8);

        let value_len = MAX_CELL_PAYLOAD - ROW_HEADER_SIZE - 3;
        let row = CacheDataRow::new(b"big".to_vec(), vec![5; value_len], 1);
        assert_eq!(row.serialized_len(), MAX_CELL_PAYLOAD);

        let link = store.add_row(&row).unwrap();
        assert_eq!(mem_of(&store).loaded_pages(), 1);
        assert_eq!(store.read_row(link).unwrap(), row);
    }

    #[test]
    fn oversized_row_fragments_across_pages() {
        let store = store(8);

        let value_len = MAX_CELL_PAYLOAD - ROW_HEADER_SIZE - 3 + 1;
        let row = CacheDataRow::new(b"big".to_vec(), vec![6; value_len], 1);
        assert_eq!(row.serialized_len(), MAX_CELL_PAYLOAD + 1);

        let link = store.add_row(&row).unwrap();
        assert_eq!(mem_of(&store).loaded_pages(), 2);
        assert_eq!(store.read_row(link).unwrap(), row);

        store.remove_row(link).unwrap();
        assert_eq!(mem_of(&store).loaded_pages(), 0);
    }

    #[test]
    fn update_same_length_keeps_link() {
        let store = store(8);

        let link = store
            .add_row(&CacheDataRow::new(b"key".to_vec(), vec![1; 100], 1))
            .unwrap();

        let updated = CacheDataRow::new(b"key".to_vec(), vec![2; 100], 2);
        let new_link = store.update_row(link, &updated).unwrap();

        assert_eq!(new_link, link);
        assert_eq!(store.read_row(link).unwrap(), updated);
    }

    #[test]
    fn update_with_new_length_relinks() {
        let store = store(8);

        let link = store
            .add_row(&CacheDataRow::new(b"key".to_vec(), vec![1; 100], 1))
            .unwrap();

        let updated = CacheDataRow::new(b"key".to_vec(), vec![2; 400], 2);
        let new_link = store.update_row(link, &updated).unwrap();

        assert_ne!(new_link, link);
        assert_eq!(store.read_row(new_link).unwrap(), updated);
    }

    #[test]
    fn metrics_count_row_traffic() {
        let store = store(8);

        let link = store
            .add_row(&CacheDataRow::new(b"k".to_vec(), vec![0; 32], 1))
            .unwrap();
        store.remove_row(link).unwrap();

        let snap = store.metrics.snapshot();
        assert_eq!(snap.rows_added, 1);
        assert_eq!(snap.rows_removed, 1);
    }
}
