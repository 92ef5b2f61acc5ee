//! # Row Store Fragmentation Tests
//!
//! End-to-end checks that rows larger than one page survive the full
//! split/store/reassemble/remove cycle:
//!
//! 1. A multi-page row is retrievable as the byte-exact concatenation of
//!    its fragments in link order
//! 2. Removing a fragmented row frees every fragment page
//! 3. Mixed small and large rows coexist without corrupting each other

use std::sync::Arc;

use pagecore::storage::PAGE_SIZE;
use pagecore::{
    CacheDataRow, DirectMemoryProvider, EvictionConfig, PageMemory, RegionPageMemory, RowStore,
    StoreMetrics,
};

fn store(frames: usize) -> (RowStore<RegionPageMemory>, Arc<RegionPageMemory>, Arc<StoreMetrics>) {
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
    (
        RowStore::new(Arc::clone(&mem), 1, Arc::clone(&metrics)),
        mem,
        metrics,
    )
}

/// A value with position-dependent bytes, so any reordering or loss of a
/// fragment changes the reassembled image.
fn patterned_value(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(i as u64 >> 8)) as u8)
        .collect()
}

#[test]
fn multi_page_row_reassembles_byte_exactly() {
    let (store, mem, _) = store(16);

    let value = patterned_value(PAGE_SIZE * 3 + PAGE_SIZE / 2);
    let row = CacheDataRow::new(b"bulk".to_vec(), value.clone(), 42);

    let link = store.add_row(&row).unwrap();

    // Head fragment plus three full-size fragments.
    assert_eq!(mem.loaded_pages(), 4);

    let read = store.read_row(link).unwrap();
    assert_eq!(read.key, b"bulk");
    assert_eq!(read.value, value);
    assert_eq!(read.version, 42);
}

#[test]
fn removing_fragmented_row_frees_every_fragment_page() {
    let (store, mem, metrics) = store(16);

    let row = CacheDataRow::new(b"wide".to_vec(), patterned_value(PAGE_SIZE * 4), 1);
    let link = store.add_row(&row).unwrap();

    let loaded = mem.loaded_pages();
    assert!(loaded >= 4, "row should span several pages, got {}", loaded);

    store.remove_row(link).unwrap();

    assert_eq!(mem.loaded_pages(), 0);
    let snap = metrics.snapshot();
    assert_eq!(snap.pages_allocated, snap.pages_freed);
}

#[test]
fn small_and_large_rows_coexist() {
    let (store, _, _) = store(32);

    let small: Vec<_> = (0u8..20)
        .map(|i| {
            let row = CacheDataRow::new(vec![b's', i], vec![i; 64], i as u64);
            (store.add_row(&row).unwrap(), row)
        })
        .collect();

    let big_value = patterned_value(PAGE_SIZE * 2 + 123);
    let big_row = CacheDataRow::new(b"big".to_vec(), big_value, 99);
    let big_link = store.add_row(&big_row).unwrap();

    let more: Vec<_> = (20u8..40)
        .map(|i| {
            let row = CacheDataRow::new(vec![b's', i], vec![i; 64], i as u64);
            (store.add_row(&row).unwrap(), row)
        })
        .collect();

    assert_eq!(store.read_row(big_link).unwrap(), big_row);
    for (link, row) in small.iter().chain(more.iter()) {
        assert_eq!(&store.read_row(*link).unwrap(), row);
    }
}

#[test]
fn interleaved_adds_and_removes_reclaim_space() {
    let (store, mem, _) = store(16);

    let mut survivors = Vec::new();
    for round in 0u64..30 {
        let value_len = if round % 3 == 0 { PAGE_SIZE + 100 } else { 900 };
        let row = CacheDataRow::new(
            round.to_le_bytes().to_vec(),
            patterned_value(value_len),
            round,
        );
        let link = store.add_row(&row).unwrap();

        if round % 2 == 0 {
            store.remove_row(link).unwrap();
        } else {
            survivors.push((link, row));
        }
    }

    for (link, row) in &survivors {
        assert_eq!(&store.read_row(*link).unwrap(), row);
    }

    for (link, _) in &survivors {
        store.remove_row(*link).unwrap();
    }
    assert_eq!(mem.loaded_pages(), 0);
}

#[test]
fn update_preserves_other_rows_on_shared_pages() {
    let (store, _, _) = store(8);

    let neighbor_row = CacheDataRow::new(b"neighbor".to_vec(), vec![7; 300], 1);
    let neighbor = store.add_row(&neighbor_row).unwrap();

    let target = store
        .add_row(&CacheDataRow::new(b"target".to_vec(), vec![1; 300], 1))
        .unwrap();

    // Grow the target past one page so the update relinks it. The new
    // link may reuse the old page and slot; only the contents matter.
    let grown = CacheDataRow::new(b"target".to_vec(), patterned_value(PAGE_SIZE * 2), 2);
    let new_link = store.update_row(target, &grown).unwrap();

    assert_eq!(store.read_row(new_link).unwrap(), grown);
    assert_eq!(store.read_row(neighbor).unwrap(), neighbor_row);
}
