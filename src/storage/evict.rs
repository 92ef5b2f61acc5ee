//! # Page Eviction Tracking
//!
//! Maintains per-frame recency metadata and selects eviction victims by
//! bounded random sampling. True LRU needs a total order over accesses,
//! which means a global lock or linked-list surgery on every page touch;
//! sampling approximates it with one atomic store per touch and a handful
//! of random probes per eviction, and never promises more than "no older
//! than the oldest of a random sample".
//!
//! ## Tracking Slots
//!
//! One slot per physical frame, living in a [`DirectMemoryRegion`] viewed
//! as atomic 32-bit words. A slot holds a compact timestamp: the current
//! epoch time in seconds, truncated to 32 bits and clamped to at least 1.
//! Zero always means "never touched" - cleared on [`forget_page`] when a
//! frame is freed or evicted so stale recency cannot mislead later rounds.
//!
//! Slots are racy by design: concurrent `touch_page` and `evict_data_page`
//! on the same slot resolve to whichever single-word store lands last.
//!
//! ## Policy Variants
//!
//! The closed set of policies, chosen at construction via
//! [`EvictionConfig`]:
//!
//! - [`EvictionMode::RandomLru`]: one timestamp per slot; victim metric is
//!   the timestamp itself.
//! - [`EvictionMode::Random2Lru`]: two timestamps per slot; a touch
//!   overwrites the older of the two and the victim metric is the older
//!   one (the second-most-recent access). One sequential scan cannot
//!   refresh a page's metric, which keeps scan traffic from flushing the
//!   working set.
//!
//! ## Bounded Budgets
//!
//! Two independent budgets convert retry loops into bounded-then-fail
//! contracts:
//!
//! - `max_attempts` (default 30) rounds of sampling when the page-level
//!   eviction primitive keeps rejecting victims (pinned/busy pages)
//! - `max_sample_spin` (default 5000) random draws within a single round
//!   before concluding there are too few touched slots to sample
//!
//! The spin budget is per round and failing it fails the whole call:
//! a tracker with nothing touched reports [`EvictionExhausted`]
//! immediately instead of burning all 30 rounds on futile sampling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result};
use rand::Rng;
use tracing::warn;

use crate::config::{EVICTION_MAX_ATTEMPTS, EVICTION_MAX_SAMPLE_SPIN, EVICTION_SAMPLE_SIZE};
use crate::memory::DirectMemoryRegion;

/// No victim could be evicted within the configured budgets.
#[derive(Debug)]
pub struct EvictionExhausted {
    pub attempts: u32,
    pub reason: &'static str,
}

impl std::fmt::Display for EvictionExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "eviction gave up after {} attempts: {}",
            self.attempts, self.reason
        )
    }
}

impl std::error::Error for EvictionExhausted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// One compact timestamp per frame.
    RandomLru,
    /// Two compact timestamps per frame; evicts by the older of the two.
    Random2Lru,
}

impl EvictionMode {
    /// Tracking words each frame consumes under this policy.
    pub fn words_per_slot(&self) -> usize {
        match self {
            EvictionMode::RandomLru => 1,
            EvictionMode::Random2Lru => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvictionConfig {
    pub mode: EvictionMode,
    pub sample_size: usize,
    pub max_attempts: u32,
    pub max_sample_spin: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            mode: EvictionMode::RandomLru,
            sample_size: EVICTION_SAMPLE_SIZE,
            max_attempts: EVICTION_MAX_ATTEMPTS,
            max_sample_spin: EVICTION_MAX_SAMPLE_SPIN,
        }
    }
}

/// Epoch seconds truncated to a 32-bit compact timestamp, clamped so zero
/// stays reserved for "never touched".
fn compact_timestamp() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs as u32).max(1)
}

/// Recency tracker over a fixed set of frame slots.
pub struct PageEvictionTracker {
    region: DirectMemoryRegion,
    slots: usize,
    config: EvictionConfig,
}

impl PageEvictionTracker {
    /// Region bytes needed to track `slots` frames under `mode`.
    pub fn required_memory(slots: usize, mode: EvictionMode) -> usize {
        slots * mode.words_per_slot() * 4
    }

    /// Builds a tracker over `region`; all slots start as "never touched".
    pub fn new(mut region: DirectMemoryRegion, slots: usize, config: EvictionConfig) -> Result<Self> {
        ensure!(slots > 0, "tracker needs at least one slot");
        ensure!(config.sample_size > 0, "sample size must be at least 1");

        let required = Self::required_memory(slots, config.mode);
        ensure!(
            region.len() >= required,
            "region too small for eviction tracker: {} < {}",
            region.len(),
            required
        );

        region.zero();

        Ok(Self {
            region,
            slots,
            config,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn mode(&self) -> EvictionMode {
        self.config.mode
    }

    fn words(&self) -> &[AtomicU32] {
        let count = self.slots * self.config.mode.words_per_slot();
        // Slot geometry was validated at construction.
        self.region
            .atomic_u32_slice(0, count)
            .expect("tracker region shrank")
    }

    /// Records an access to `slot` at the current compact time.
    ///
    /// Never fails; an out-of-range slot is a programmer error.
    pub fn touch_page(&self, slot: usize) {
        assert!(slot < self.slots, "tracking slot {} out of range", slot);

        let now = compact_timestamp();
        let words = self.words();

        match self.config.mode {
            EvictionMode::RandomLru => {
                words[slot].store(now, Ordering::Relaxed);
            }
            EvictionMode::Random2Lru => {
                let first = &words[slot * 2];
                let second = &words[slot * 2 + 1];
                // Overwrite the older of the pair so the slot retains the
                // two most recent access times.
                if first.load(Ordering::Relaxed) <= second.load(Ordering::Relaxed) {
                    first.store(now, Ordering::Relaxed);
                } else {
                    second.store(now, Ordering::Relaxed);
                }
            }
        }
    }

    /// Clears `slot` back to "never touched". Called when the frame is
    /// freed or evicted.
    pub fn forget_page(&self, slot: usize) {
        assert!(slot < self.slots, "tracking slot {} out of range", slot);

        let words = self.words();
        match self.config.mode {
            EvictionMode::RandomLru => {
                words[slot].store(0, Ordering::Relaxed);
            }
            EvictionMode::Random2Lru => {
                words[slot * 2].store(0, Ordering::Relaxed);
                words[slot * 2 + 1].store(0, Ordering::Relaxed);
            }
        }
    }

    /// The victim-selection metric for `slot`: 0 when never touched,
    /// otherwise the policy's notion of "last useful access".
    fn slot_metric(&self, slot: usize) -> u32 {
        let words = self.words();
        match self.config.mode {
            EvictionMode::RandomLru => words[slot].load(Ordering::Relaxed),
            EvictionMode::Random2Lru => {
                let a = words[slot * 2].load(Ordering::Relaxed);
                let b = words[slot * 2 + 1].load(Ordering::Relaxed);
                match (a, b) {
                    (0, 0) => 0,
                    (a, 0) => a,
                    (0, b) => b,
                    (a, b) => a.min(b),
                }
            }
        }
    }

    /// Selects a victim by bounded random sampling and hands it to the
    /// page-level eviction primitive `evict`.
    ///
    /// `evict` returns `Ok(true)` when it evicted the frame, `Ok(false)`
    /// when the frame refused (pinned or busy - the round is retried with
    /// a fresh sample), and `Err` for hard failures that propagate as-is.
    ///
    /// On success the victim's slot is cleared and its index returned.
    /// Fails with [`EvictionExhausted`] when a sampling round cannot find
    /// enough touched slots within the spin budget, or when `max_attempts`
    /// rounds all had their victim refused.
    pub fn evict_data_page(&self, mut evict: impl FnMut(usize) -> Result<bool>) -> Result<usize> {
        let mut rng = rand::thread_rng();

        for attempt in 0..self.config.max_attempts {
            let mut victim: Option<(usize, u32)> = None;
            let mut sampled = 0usize;
            let mut spins = 0u32;

            while sampled < self.config.sample_size {
                spins += 1;
                if spins > self.config.max_sample_spin {
                    // Too few touched slots to even build a sample; more
                    // rounds would draw from the same near-empty set.
                    return Err(eyre::Report::new(EvictionExhausted {
                        attempts: attempt + 1,
                        reason: "not enough touched pages to sample",
                    }));
                }

                let slot = rng.gen_range(0..self.slots);
                let metric = self.slot_metric(slot);
                if metric == 0 {
                    continue;
                }

                sampled += 1;
                match victim {
                    Some((_, best)) if best <= metric => {}
                    _ => victim = Some((slot, metric)),
                }
            }

            let (slot, _) = victim.expect("sample loop always selects a victim");
            if evict(slot)? {
                self.forget_page(slot);
                return Ok(slot);
            }

            warn!(attempt, slot, "eviction victim refused, resampling");
        }

        Err(eyre::Report::new(EvictionExhausted {
            attempts: self.config.max_attempts,
            reason: "every sampled victim refused eviction",
        }))
    }
}
