//! # Region-Backed Page Memory
//!
//! [`RegionPageMemory`] is the in-memory page provider behind the row
//! store: a fixed pool of page frames carved from one
//! [`DirectMemoryRegion`], looked up through a [`LoadedPagesTable`] and
//! covered by a [`PageEvictionTracker`].
//!
//! ## Frame Pool
//!
//! The region holds `frame_count` frames of `PAGE_SIZE` bytes. A frame is
//! either free (on the free-frame stack) or owned by a `(cache_id,
//! page_id)`; the table maps the id to the frame's byte offset and the
//! `owners` array maps back for eviction.
//!
//! ## Pin/Latch Protocol
//!
//! Page access follows the pin-then-latch discipline:
//!
//! 1. resolve the frame under the state lock and bump its pin count
//! 2. take the frame latch (shared for reads, exclusive for writes)
//! 3. run the caller's closure against the frame bytes
//! 4. drop the latch, then the pin
//!
//! Eviction refuses any frame whose latch is held or whose pin count is
//! non-zero, and it removes the table entry under the state lock before
//! recycling the frame, so a concurrent resolve either pins first (and
//! blocks the eviction) or misses the entry entirely. Lock order is
//! always latch before state lock on the eviction side and state lock
//! (released) before latch on the access side, so the two cannot
//! deadlock.
//!
//! ## Eviction
//!
//! `allocate_page` with no free frame asks the tracker for a victim; the
//! tracker samples recency slots and calls back into
//! [`try_evict_frame`](RegionPageMemory::try_evict_frame). Exhausted
//! budgets surface [`EvictionExhausted`](super::EvictionExhausted) to the
//! allocating caller, which may back off or fail its operation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::PAGE_SIZE;
use crate::memory::DirectMemoryProvider;
use crate::memory::DirectMemoryRegion;
use crate::metrics::StoreMetrics;
use crate::storage::evict::{EvictionConfig, PageEvictionTracker};
use crate::storage::table::LoadedPagesTable;
use crate::storage::{FullPageId, PageMemory};

/// Sentinel returned by table lookups for absent pages.
const POINTER_NOT_FOUND: u64 = u64::MAX;
/// Sentinel for tag mismatches; the provider stamps everything with tag 0,
/// so seeing this indicates table corruption.
const POINTER_OUTDATED: u64 = u64::MAX - 2;

struct MemState {
    table: LoadedPagesTable,
    free_frames: Vec<u32>,
    owners: Vec<Option<FullPageId>>,
}

/// Fixed-capacity page memory over an off-heap region.
pub struct RegionPageMemory {
    frames: DirectMemoryRegion,
    frame_count: usize,
    latches: Vec<RwLock<()>>,
    pins: Vec<AtomicU32>,
    dirty: Vec<AtomicBool>,
    state: Mutex<MemState>,
    tracker: PageEvictionTracker,
    next_page_id: AtomicU64,
    metrics: Arc<StoreMetrics>,
}

/// Decrements a frame's pin count when dropped, so early returns and
/// closure errors cannot leak pins.
struct PinGuard<'a> {
    pin: &'a AtomicU32,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        let prev = self.pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame");
    }
}

impl RegionPageMemory {
    /// Builds a pool of `frame_count` pages, drawing the frame region, the
    /// loaded-pages table, and the eviction tracker from `provider`.
    pub fn new(
        provider: &DirectMemoryProvider,
        frame_count: usize,
        eviction: EvictionConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Self> {
        ensure!(frame_count > 0, "page memory needs at least one frame");

        let frames = provider.allocate(frame_count * PAGE_SIZE)?;
        let table_region = provider.allocate(LoadedPagesTable::required_memory(frame_count))?;
        let table = LoadedPagesTable::new(table_region, frame_count)?;
        let tracker_region =
            provider.allocate(PageEvictionTracker::required_memory(frame_count, eviction.mode))?;
        let tracker = PageEvictionTracker::new(tracker_region, frame_count, eviction)?;

        let latches = (0..frame_count).map(|_| RwLock::new(())).collect();
        let pins = (0..frame_count).map(|_| AtomicU32::new(0)).collect();
        let dirty = (0..frame_count).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            frames,
            frame_count,
            latches,
            pins,
            dirty,
            state: Mutex::new(MemState {
                table,
                free_frames: (0..frame_count as u32).rev().collect(),
                owners: vec![None; frame_count],
            }),
            tracker,
            // Page id 0 is reserved for the null link.
            next_page_id: AtomicU64::new(1),
            metrics,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().free_frames.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirty
            .iter()
            .filter(|d| d.load(Ordering::Acquire))
            .count()
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    fn frame_offset(&self, frame: usize) -> usize {
        frame * PAGE_SIZE
    }

    /// Resolves `(cache_id, page_id)` to a pinned frame index. The caller
    /// owns the returned pin via `PinGuard`.
    fn resolve_and_pin(&self, cache_id: u32, page_id: u64) -> Result<(usize, PinGuard<'_>)> {
        let state = self.state.lock();
        let pointer = state
            .table
            .get(cache_id, page_id, 0, POINTER_NOT_FOUND, POINTER_OUTDATED);

        ensure!(
            pointer != POINTER_NOT_FOUND,
            "page {}:{} is not loaded",
            cache_id,
            page_id
        );
        ensure!(
            pointer != POINTER_OUTDATED,
            "page {}:{} has an unexpected generation tag",
            cache_id,
            page_id
        );

        let frame = pointer as usize / PAGE_SIZE;
        // Pin while still holding the state lock: eviction checks pins
        // under the same lock, so the frame cannot vanish between the
        // lookup and the pin.
        self.pins[frame].fetch_add(1, Ordering::AcqRel);
        Ok((
            frame,
            PinGuard {
                pin: &self.pins[frame],
            },
        ))
    }

    /// Page-level eviction primitive: tries to evict the page occupying
    /// `frame`. Refuses (returns `Ok(false)`) when the frame is latched,
    /// pinned, or already free.
    pub fn try_evict_frame(&self, frame: usize) -> Result<bool> {
        ensure!(frame < self.frame_count, "frame {} out of range", frame);

        let latch = match self.latches[frame].try_write() {
            Some(latch) => latch,
            None => return Ok(false),
        };

        let mut state = self.state.lock();
        if self.pins[frame].load(Ordering::Acquire) > 0 {
            return Ok(false);
        }
        let id = match state.owners[frame] {
            Some(id) => id,
            None => return Ok(false),
        };

        state.table.remove(id.cache_id, id.page_id, 0);
        state.owners[frame] = None;
        state.free_frames.push(frame as u32);
        drop(state);

        self.dirty[frame].store(false, Ordering::Release);
        let offset = self.frame_offset(frame);
        // SAFETY: the exclusive latch for this frame is held.
        unsafe {
            self.frames.slice_mut_unchecked(offset, PAGE_SIZE)?.fill(0);
        }
        drop(latch);

        self.metrics.on_page_evicted();
        debug!(frame, page = %id, "evicted data page");
        Ok(true)
    }

    /// Runs one round of policy-driven eviction, freeing some victim frame.
    pub fn evict_data_page(&self) -> Result<usize> {
        self.tracker.evict_data_page(|frame| self.try_evict_frame(frame))
    }
}

impl PageMemory for RegionPageMemory {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn loaded_pages(&self) -> u64 {
        self.state.lock().table.len() as u64
    }

    fn allocate_page(&self, cache_id: u32) -> Result<u64> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.free_frames.pop() {
                    let frame = frame as usize;
                    let page_id = self.next_page_id.fetch_add(1, Ordering::Relaxed);
                    let offset = self.frame_offset(frame) as u64;

                    if let Err(e) = state.table.put(cache_id, page_id, offset, 0) {
                        state.free_frames.push(frame as u32);
                        return Err(e);
                    }
                    state.owners[frame] = Some(FullPageId::new(cache_id, page_id));
                    drop(state);

                    self.dirty[frame].store(false, Ordering::Release);
                    self.metrics.on_page_allocated();
                    return Ok(page_id);
                }
            }

            // No free frame: push a victim out and retry. Budget overruns
            // propagate to the caller as EvictionExhausted.
            self.evict_data_page()?;
        }
    }

    fn free_page(&self, cache_id: u32, page_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let pointer = state
            .table
            .get(cache_id, page_id, 0, POINTER_NOT_FOUND, POINTER_OUTDATED);
        ensure!(
            pointer != POINTER_NOT_FOUND && pointer != POINTER_OUTDATED,
            "cannot free page {}:{}: not loaded",
            cache_id,
            page_id
        );

        let frame = pointer as usize / PAGE_SIZE;
        ensure!(
            self.pins[frame].load(Ordering::Acquire) == 0,
            "cannot free page {}:{}: pinned",
            cache_id,
            page_id
        );

        state.table.remove(cache_id, page_id, 0);
        state.owners[frame] = None;
        state.free_frames.push(frame as u32);
        drop(state);

        self.tracker.forget_page(frame);
        self.dirty[frame].store(false, Ordering::Release);

        let _latch = self.latches[frame].write();
        let offset = self.frame_offset(frame);
        // SAFETY: the exclusive latch for this frame is held.
        unsafe {
            self.frames.slice_mut_unchecked(offset, PAGE_SIZE)?.fill(0);
        }

        self.metrics.on_page_freed();
        Ok(())
    }

    fn with_page<R>(
        &self,
        cache_id: u32,
        page_id: u64,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        let (frame, _pin) = self.resolve_and_pin(cache_id, page_id)?;
        let _latch = self.latches[frame].read();

        self.tracker.touch_page(frame);
        self.metrics.on_page_read();

        let offset = self.frame_offset(frame);
        // SAFETY: the shared latch for this frame is held; all writers take
        // the exclusive latch first.
        let bytes = unsafe { self.frames.slice_unchecked(offset, PAGE_SIZE)? };
        f(bytes)
    }

    fn with_page_mut<R>(
        &self,
        cache_id: u32,
        page_id: u64,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let (frame, _pin) = self.resolve_and_pin(cache_id, page_id)?;
        let _latch = self.latches[frame].write();

        self.tracker.touch_page(frame);
        self.dirty[frame].store(true, Ordering::Release);
        self.metrics.on_page_written();

        let offset = self.frame_offset(frame);
        // SAFETY: the exclusive latch for this frame is held for the whole
        // closure call.
        let bytes = unsafe { self.frames.slice_mut_unchecked(offset, PAGE_SIZE)? };
        f(bytes)
    }
}
