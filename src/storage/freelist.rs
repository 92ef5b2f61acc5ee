//! # Free-Space Index
//!
//! Tracks the remaining free space of partially-filled data pages so the
//! row store can place new fragments without scanning pages. Pages are
//! grouped into power-of-two-many buckets by free-space range; an exact
//! per-page byte count is kept in a back-map for precise placement checks.
//!
//! A page moves through three states as rows come and go:
//!
//! ```text
//! Free ──add──> PartiallyFilled ──add──> Full
//!   ^                 │  ^                 │
//!   └────remove───────┘  └────remove───────┘
//! ```
//!
//! Pages that fill up (or drop below the useful-space floor) are simply
//! not registered; pages drained back to empty are unregistered by the
//! row store and returned to the page provider.
//!
//! Placement policy: `take` starts at the smallest bucket that can satisfy
//! the request and walks upward, taking the first page whose exact free
//! space fits. Bucketing gives coarse best-fit; first-fit inside a bucket
//! keeps the take cheap.
//!
//! The index is in-memory bookkeeping owned by the row store and mutated
//! under the row store's placement lock; it is not itself thread-safe.

use hashbrown::HashMap;

use crate::config::{FREE_SPACE_BUCKETS, MIN_USEFUL_FREE_SPACE, PAGE_USABLE_SIZE};

/// Occupancy classification for a data page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    PartiallyFilled,
    Full,
}

impl PageState {
    /// Classifies a page by its remaining free space.
    pub fn classify(free_space: usize) -> Self {
        if free_space >= PAGE_USABLE_SIZE {
            PageState::Free
        } else if free_space >= MIN_USEFUL_FREE_SPACE {
            PageState::PartiallyFilled
        } else {
            PageState::Full
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PageFree {
    bucket: usize,
    free: usize,
}

/// Bucketed index of pages with reusable free space.
#[derive(Debug)]
pub struct FreeSpaceIndex {
    buckets: Vec<Vec<u64>>,
    pages: HashMap<u64, PageFree>,
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_for(free_space: usize) -> usize {
    (free_space * FREE_SPACE_BUCKETS / (PAGE_USABLE_SIZE + 1)).min(FREE_SPACE_BUCKETS - 1)
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: (0..FREE_SPACE_BUCKETS).map(|_| Vec::new()).collect(),
            pages: HashMap::new(),
        }
    }

    /// Number of pages currently indexed.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: u64) -> bool {
        self.pages.contains_key(&page_id)
    }

    /// Exact free space recorded for `page_id`, if indexed.
    pub fn free_space(&self, page_id: u64) -> Option<usize> {
        self.pages.get(&page_id).map(|p| p.free)
    }

    /// Records (or re-records) `page_id` as having `free_space` bytes
    /// available. Pages below the useful-space floor are dropped instead:
    /// nothing can be placed on them until a removal frees room.
    pub fn register(&mut self, page_id: u64, free_space: usize) {
        self.unregister(page_id);

        if free_space < MIN_USEFUL_FREE_SPACE {
            return;
        }

        let bucket = bucket_for(free_space);
        self.buckets[bucket].push(page_id);
        self.pages.insert(
            page_id,
            PageFree {
                bucket,
                free: free_space,
            },
        );
    }

    /// Removes `page_id` from the index, returning its recorded free space.
    pub fn unregister(&mut self, page_id: u64) -> Option<usize> {
        let entry = self.pages.remove(&page_id)?;
        let bucket = &mut self.buckets[entry.bucket];
        if let Some(pos) = bucket.iter().position(|&p| p == page_id) {
            bucket.swap_remove(pos);
        }
        Some(entry.free)
    }

    /// Takes a page with at least `min_bytes` of free space out of the
    /// index. The caller re-registers the page after consuming space.
    pub fn take(&mut self, min_bytes: usize) -> Option<(u64, usize)> {
        for bucket in bucket_for(min_bytes)..FREE_SPACE_BUCKETS {
            let candidates = &self.buckets[bucket];
            let found = candidates
                .iter()
                .position(|page_id| self.pages[page_id].free >= min_bytes);

            if let Some(pos) = found {
                let page_id = self.buckets[bucket].swap_remove(pos);
                let entry = self.pages.remove(&page_id).expect("bucket/map out of sync");
                return Some((page_id, entry.free));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tracks_fill_transitions() {
        assert_eq!(PageState::classify(PAGE_USABLE_SIZE), PageState::Free);
        assert_eq!(PageState::classify(4000), PageState::PartiallyFilled);
        assert_eq!(PageState::classify(MIN_USEFUL_FREE_SPACE), PageState::PartiallyFilled);
        assert_eq!(PageState::classify(MIN_USEFUL_FREE_SPACE - 1), PageState::Full);
        assert_eq!(PageState::classify(0), PageState::Full);
    }

    #[test]
    fn register_and_take_round_trip() {
        let mut index = FreeSpaceIndex::new();

        index.register(5, 4000);
        assert_eq!(index.len(), 1);
        assert_eq!(index.free_space(5), Some(4000));

        let (page_id, free) = index.take(1000).unwrap();
        assert_eq!(page_id, 5);
        assert_eq!(free, 4000);
        assert!(index.is_empty());
    }

    #[test]
    fn take_respects_minimum_bytes() {
        let mut index = FreeSpaceIndex::new();

        index.register(1, 500);
        index.register(2, 8000);

        let (page_id, _) = index.take(6000).unwrap();
        assert_eq!(page_id, 2);

        assert!(index.take(6000).is_none());
        assert_eq!(index.free_space(1), Some(500));
    }

    #[test]
    fn take_prefers_smaller_eligible_buckets() {
        let mut index = FreeSpaceIndex::new();

        index.register(1, PAGE_USABLE_SIZE);
        index.register(2, 3000);

        // Both fit, but the 3000-byte page sits in a lower bucket and is
        // offered first, keeping nearly-empty pages available for big rows.
        let (page_id, _) = index.take(1000).unwrap();
        assert_eq!(page_id, 2);
    }

    #[test]
    fn register_below_floor_drops_page() {
        let mut index = FreeSpaceIndex::new();

        index.register(9, MIN_USEFUL_FREE_SPACE - 1);

        assert!(index.is_empty());
        assert!(!index.contains(9));
    }

    #[test]
    fn re_register_moves_page_between_buckets() {
        let mut index = FreeSpaceIndex::new();

        index.register(7, 12000);
        index.register(7, 600);

        assert_eq!(index.len(), 1);
        assert_eq!(index.free_space(7), Some(600));

        // The old bucket entry is gone: a take that only the old record
        // could satisfy finds nothing.
        assert!(index.take(10000).is_none());
        let (page_id, _) = index.take(500).unwrap();
        assert_eq!(page_id, 7);
    }

    #[test]
    fn unregister_returns_recorded_space() {
        let mut index = FreeSpaceIndex::new();

        index.register(3, 2500);

        assert_eq!(index.unregister(3), Some(2500));
        assert_eq!(index.unregister(3), None);
        assert!(index.take(100).is_none());
    }
}
