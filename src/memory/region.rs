//! # Direct Memory Regions
//!
//! A [`DirectMemoryRegion`] owns one contiguous off-heap byte range backed
//! by an anonymous memory map. The region is the only owner of its bytes:
//! dropping it unmaps the range and returns the bytes to the provider's
//! outstanding-allocation counter exactly once.
//!
//! ## Safety Model
//!
//! The region hands out three kinds of access:
//!
//! - `as_slice` / `as_mut_slice`: plain borrows, checked by the compiler
//! - `atomic_u32` / `atomic_u32_slice`: shared-access single words for
//!   concurrent slot updates (eviction timestamps)
//! - `slice_unchecked` / `slice_mut_unchecked`: interior-mutable range
//!   views for the page frame pool, where per-frame latches provide the
//!   exclusivity the borrow checker cannot see
//!
//! The unchecked accessors are `pub(crate)` and `unsafe`; every call site
//! must hold the corresponding frame latch. Bounds are still checked -
//! `unsafe` here waives aliasing proof, never range proof.
//!
//! ## Budget Enforcement
//!
//! A [`DirectMemoryProvider`] tracks the total bytes of all live regions it
//! has allocated. When constructed with a limit, an allocation that would
//! exceed it fails with [`RegionBudgetExceeded`] - a recoverable error the
//! caller can answer by freeing regions or shrinking its request.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

/// Failed region allocation: the provider's byte budget is exhausted.
#[derive(Debug)]
pub struct RegionBudgetExceeded {
    pub requested: usize,
    pub allocated: usize,
    pub limit: usize,
}

impl std::fmt::Display for RegionBudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "region allocation of {} bytes exceeds budget: {}/{} bytes in use",
            self.requested, self.allocated, self.limit
        )
    }
}

impl std::error::Error for RegionBudgetExceeded {}

#[derive(Debug)]
struct ProviderShared {
    limit: Option<usize>,
    allocated: AtomicUsize,
}

/// Allocates [`DirectMemoryRegion`]s and accounts for their lifetimes.
#[derive(Debug, Clone)]
pub struct DirectMemoryProvider {
    shared: Arc<ProviderShared>,
}

impl DirectMemoryProvider {
    /// Provider with no total budget; allocations fail only when the OS does.
    pub fn unbounded() -> Self {
        Self {
            shared: Arc::new(ProviderShared {
                limit: None,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Provider that refuses allocations once `limit` bytes are live.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            shared: Arc::new(ProviderShared {
                limit: Some(limit),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocates a zero-initialized region of exactly `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<DirectMemoryRegion> {
        ensure!(size > 0, "region size must be at least 1 byte");

        if let Some(limit) = self.shared.limit {
            // Reserve first so concurrent allocators cannot both slip under
            // the limit; back out on failure.
            let prev = self.shared.allocated.fetch_add(size, Ordering::AcqRel);
            if prev + size > limit {
                self.shared.allocated.fetch_sub(size, Ordering::AcqRel);
                return Err(eyre::Report::new(RegionBudgetExceeded {
                    requested: size,
                    allocated: prev,
                    limit,
                }));
            }
        } else {
            self.shared.allocated.fetch_add(size, Ordering::AcqRel);
        }

        match DirectMemoryRegion::map(size, Some(Arc::clone(&self.shared))) {
            Ok(region) => {
                debug!(size, total = self.allocated_bytes(), "allocated direct memory region");
                Ok(region)
            }
            Err(e) => {
                self.shared.allocated.fetch_sub(size, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Total bytes currently held by live regions from this provider.
    pub fn allocated_bytes(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Configured budget, if any.
    pub fn limit(&self) -> Option<usize> {
        self.shared.limit
    }
}

/// A contiguous off-heap byte range with an explicit lifetime.
pub struct DirectMemoryRegion {
    ptr: *mut u8,
    len: usize,
    // Held for Drop; all access goes through `ptr` so interior-mutable
    // views do not fight the borrow on the map itself.
    _map: MmapMut,
    shared: Option<Arc<ProviderShared>>,
}

// SAFETY: the region is a plain byte arena. Shared references only reach
// the bytes through `as_slice`, the atomic accessors, or the unsafe
// unchecked accessors whose callers provide exclusivity; none of those
// carry thread affinity.
unsafe impl Send for DirectMemoryRegion {}
unsafe impl Sync for DirectMemoryRegion {}

impl DirectMemoryRegion {
    /// Allocates a standalone region not accounted by any provider.
    pub fn allocate(size: usize) -> Result<Self> {
        ensure!(size > 0, "region size must be at least 1 byte");
        Self::map(size, None)
    }

    fn map(size: usize, shared: Option<Arc<ProviderShared>>) -> Result<Self> {
        let mut map = MmapMut::map_anon(size)
            .wrap_err_with(|| format!("failed to map {} bytes of anonymous memory", size))?;
        let ptr = map.as_mut_ptr();

        Ok(Self {
            ptr,
            len: size,
            _map: map,
            shared,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region as an immutable byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live mapping owned by self; the
        // shared borrow of self keeps the mapping alive for the slice's
        // lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The whole region as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Zeroes the entire region.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// A 4-byte word at word index `index`, viewed as an atomic.
    ///
    /// The mapping is page-aligned, so every 4-byte word at a 4-byte word
    /// index is properly aligned for `AtomicU32`.
    pub fn atomic_u32(&self, index: usize) -> Result<&AtomicU32> {
        let offset = index
            .checked_mul(4)
            .filter(|end| end + 4 <= self.len)
            .ok_or_else(|| {
                eyre::eyre!("atomic word index {} out of bounds (region len {})", index, self.len)
            })?;

        // SAFETY: offset + 4 <= len was checked above; the mapping base is
        // page-aligned and offset is a multiple of 4, so the word is aligned;
        // AtomicU32 has the same layout as u32.
        Ok(unsafe { &*(self.ptr.add(offset) as *const AtomicU32) })
    }

    /// `count` consecutive atomic words starting at byte offset `offset`.
    pub fn atomic_u32_slice(&self, offset: usize, count: usize) -> Result<&[AtomicU32]> {
        ensure!(offset % 4 == 0, "atomic slice offset {} is not word-aligned", offset);
        let bytes = count
            .checked_mul(4)
            .and_then(|b| b.checked_add(offset))
            .ok_or_else(|| eyre::eyre!("atomic slice overflows usize"))?;
        ensure!(
            bytes <= self.len,
            "atomic slice [{}, {}) out of bounds (region len {})",
            offset,
            bytes,
            self.len
        );

        // SAFETY: range checked above; alignment as in atomic_u32.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset) as *const AtomicU32, count) })
    }

    /// Immutable view of `[offset, offset + len)` without borrowing the
    /// whole region.
    ///
    /// # Safety
    /// The caller must guarantee no concurrent mutable access to the same
    /// range (in the page pool: the frame's latch is held for reading).
    pub(crate) unsafe fn slice_unchecked(&self, offset: usize, len: usize) -> Result<&[u8]> {
        ensure!(
            offset.checked_add(len).map(|end| end <= self.len).unwrap_or(false),
            "range [{}, {}+{}) out of region bounds (len {})",
            offset,
            offset,
            len,
            self.len
        );
        Ok(std::slice::from_raw_parts(self.ptr.add(offset), len))
    }

    /// Mutable view of `[offset, offset + len)` through a shared reference.
    ///
    /// # Safety
    /// The caller must guarantee exclusive access to the range for the
    /// lifetime of the returned slice (in the page pool: the frame's write
    /// latch is held). Bounds are still checked.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut_unchecked(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        ensure!(
            offset.checked_add(len).map(|end| end <= self.len).unwrap_or(false),
            "range [{}, {}+{}) out of region bounds (len {})",
            offset,
            offset,
            len,
            self.len
        );
        Ok(std::slice::from_raw_parts_mut(self.ptr.add(offset), len))
    }
}

impl std::fmt::Debug for DirectMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectMemoryRegion")
            .field("len", &self.len)
            .field("accounted", &self.shared.is_some())
            .finish()
    }
}

impl Drop for DirectMemoryRegion {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.allocated.fetch_sub(self.len, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_zero_initialized_region() {
        let region = DirectMemoryRegion::allocate(4096).unwrap();

        assert_eq!(region.len(), 4096);
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_fails_for_zero_size() {
        assert!(DirectMemoryRegion::allocate(0).is_err());
    }

    #[test]
    fn writes_are_visible_through_reads() {
        let mut region = DirectMemoryRegion::allocate(64).unwrap();

        region.as_mut_slice()[10] = 0xAB;
        region.as_mut_slice()[63] = 0xCD;

        assert_eq!(region.as_slice()[10], 0xAB);
        assert_eq!(region.as_slice()[63], 0xCD);
    }

    #[test]
    fn zero_clears_all_bytes() {
        let mut region = DirectMemoryRegion::allocate(128).unwrap();
        region.as_mut_slice().fill(0xFF);

        region.zero();

        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn atomic_word_round_trip() {
        let region = DirectMemoryRegion::allocate(64).unwrap();

        region.atomic_u32(3).unwrap().store(0xDEAD_BEEF, Ordering::Release);

        assert_eq!(region.atomic_u32(3).unwrap().load(Ordering::Acquire), 0xDEAD_BEEF);
        assert_eq!(region.as_slice()[12..16], 0xDEAD_BEEFu32.to_ne_bytes());
    }

    #[test]
    fn atomic_word_out_of_bounds() {
        let region = DirectMemoryRegion::allocate(16).unwrap();

        assert!(region.atomic_u32(3).is_ok());
        assert!(region.atomic_u32(4).is_err());
    }

    #[test]
    fn atomic_slice_covers_requested_words() {
        let region = DirectMemoryRegion::allocate(64).unwrap();

        let slots = region.atomic_u32_slice(16, 8).unwrap();
        assert_eq!(slots.len(), 8);

        slots[0].store(7, Ordering::Relaxed);
        assert_eq!(region.atomic_u32(4).unwrap().load(Ordering::Relaxed), 7);
    }

    #[test]
    fn provider_accounts_allocation_and_release() {
        let provider = DirectMemoryProvider::unbounded();

        let region = provider.allocate(1024).unwrap();
        assert_eq!(provider.allocated_bytes(), 1024);

        let second = provider.allocate(512).unwrap();
        assert_eq!(provider.allocated_bytes(), 1536);

        drop(region);
        assert_eq!(provider.allocated_bytes(), 512);

        drop(second);
        assert_eq!(provider.allocated_bytes(), 0);
    }

    #[test]
    fn provider_enforces_budget() {
        let provider = DirectMemoryProvider::with_limit(2048);

        let keep = provider.allocate(1536).unwrap();
        let err = provider.allocate(1024).unwrap_err();

        assert!(err.downcast_ref::<RegionBudgetExceeded>().is_some());

        drop(keep);
        assert!(provider.allocate(1024).is_ok());
    }

    #[test]
    fn unchecked_slices_are_bounds_checked() {
        let region = DirectMemoryRegion::allocate(32).unwrap();

        // SAFETY: no other access to the region exists in this test.
        unsafe {
            assert!(region.slice_unchecked(0, 32).is_ok());
            assert!(region.slice_unchecked(16, 17).is_err());
            assert!(region.slice_mut_unchecked(usize::MAX, 2).is_err());
        }
    }
}
