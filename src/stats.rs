//! Process-wide monitoring counters.
//!
//! These are separate from the correctness-critical per-bin counters in
//! [`crate::sec::SecBinStats`] (which are protected by each bin's mutex and
//! participate in the `bytes_cur` invariant). Everything here uses `Relaxed`
//! atomics purely for observability — gated behind the `stats` feature so
//! builds that don't want the counters pay nothing for them.
//!
//! # Usage
//!
//! ```ignore
//! let snap = hpa_sec::stats::snapshot();
//! println!("eden grows: {}", snap.eden_grows);
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Times `HpaCentral::extract` had to map a fresh eden region.
    pub eden_grows: AtomicU64,
    /// Bytes requested from the OS via `platform::map_aligned` for eden.
    pub eden_bytes_mapped: AtomicU64,
    /// Hugepage-sized descriptors handed out by `HpaCentral::extract`.
    pub hugepages_extracted: AtomicU64,
    /// Calls to `hooks.vectorized_purge`.
    pub vectorized_purge_calls: AtomicU64,
    /// Of those, the ones that reported failure (fell back to per-range).
    pub vectorized_purge_failures: AtomicU64,
    /// Calls to `hooks.purge` (either standalone, or as fallback).
    pub purge_calls: AtomicU64,
    /// Bytes passed to `hooks.purge` or `hooks.vectorized_purge`.
    pub purge_bytes: AtomicU64,
    /// Calls to `hooks.hugify`.
    pub hugify_calls: AtomicU64,
    /// Calls to `hooks.dehugify`.
    pub dehugify_calls: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            eden_grows: AtomicU64::new(0),
            eden_bytes_mapped: AtomicU64::new(0),
            hugepages_extracted: AtomicU64::new(0),
            vectorized_purge_calls: AtomicU64::new(0),
            vectorized_purge_failures: AtomicU64::new(0),
            purge_calls: AtomicU64::new(0),
            purge_bytes: AtomicU64::new(0),
            hugify_calls: AtomicU64::new(0),
            dehugify_calls: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of the process-wide monitoring counters.
///
/// Each field is loaded atomically but the snapshot as a whole is not
/// globally consistent — concurrent activity may race between loads. Fine
/// for monitoring; not meant for correctness checks (use the per-bin stats
/// returned by `Sec::stats_merge` for those).
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub eden_grows: u64,
    pub eden_bytes_mapped: u64,
    pub hugepages_extracted: u64,
    pub vectorized_purge_calls: u64,
    pub vectorized_purge_failures: u64,
    pub purge_calls: u64,
    pub purge_bytes: u64,
    pub hugify_calls: u64,
    pub dehugify_calls: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        eden_grows: s.eden_grows.load(Ordering::Relaxed),
        eden_bytes_mapped: s.eden_bytes_mapped.load(Ordering::Relaxed),
        hugepages_extracted: s.hugepages_extracted.load(Ordering::Relaxed),
        vectorized_purge_calls: s.vectorized_purge_calls.load(Ordering::Relaxed),
        vectorized_purge_failures: s.vectorized_purge_failures.load(Ordering::Relaxed),
        purge_calls: s.purge_calls.load(Ordering::Relaxed),
        purge_bytes: s.purge_bytes.load(Ordering::Relaxed),
        hugify_calls: s.hugify_calls.load(Ordering::Relaxed),
        dehugify_calls: s.dehugify_calls.load(Ordering::Relaxed),
    }
}
