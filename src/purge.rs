//! Vectorized purge batching.
//!
//! Purging (advising the OS that dirty pages can be reclaimed) is cheap per
//! syscall but expensive in aggregate when done one small range at a time,
//! and some hosts expose a single syscall that can purge many ranges at
//! once. `RangeAccum` buffers ranges up to a vector-length limit and flushes
//! through [`Hooks::vectorized_purge`], falling back to one [`Hooks::purge`]
//! call per range on failure. `PurgeBatch` then sits one level up,
//! bounding how many hugepages get purged in one pass so allocation
//! isn't blocked on too many in-flight purges at once.
//!
//! Grounded on `hpa_utils.c`/`hpa_utils.h`. The dirty-run iterator those
//! files call `hpdata_purge_next` is the hpdata coalescing state machine,
//! which is out of scope here; [`HpData`] is a minimal stand-in — a flat
//! list of dirty byte ranges with a cursor — sufficient to drive and test
//! the batching contract without reimplementing hpdata's internals.

use crate::config::{HPA_MIN_VAR_VEC_SIZE, HPA_PURGE_BATCH_MAX, HUGEPAGE, PROCESS_MADVISE_MAX_BATCH_LIMIT};
use crate::hooks::{Hooks, Range};

#[cfg(feature = "std")]
use std::vec::Vec;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// Minimal stand-in for the real hpdata dirty-run tracker: a flat list of
/// dirty `(offset, len)` ranges relative to `addr`, consumed front-to-back.
pub struct HpData {
    pub addr: *mut u8,
    dirty: Vec<(usize, usize)>,
}

/// Cursor into an [`HpData`]'s dirty-range list. Opaque to callers; reset
/// to the front with `PurgeState::new` before each fresh purge pass.
#[derive(Default)]
pub struct PurgeState {
    next: usize,
}

impl PurgeState {
    pub fn new() -> Self {
        Self { next: 0 }
    }
}

impl HpData {
    pub fn new(addr: *mut u8) -> Self {
        Self {
            addr,
            dirty: Vec::new(),
        }
    }

    /// Mark `[offset, offset+len)` as dirty (eligible for a future purge).
    pub fn mark_dirty(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= HUGEPAGE);
        self.dirty.push((offset, len));
    }

    /// Pull the next dirty range out of the tracker, advancing `state`.
    /// Returns `None` once every range has been consumed.
    fn purge_next(&mut self, state: &mut PurgeState) -> Option<(*mut u8, usize)> {
        if state.next >= self.dirty.len() {
            return None;
        }
        let (offset, len) = self.dirty[state.next];
        state.next += 1;
        Some((unsafe { self.addr.add(offset) }, len))
    }
}

/// Buffers ranges for a single vectorized purge call, flushing through
/// [`Hooks::vectorized_purge`] (falling back to per-range [`Hooks::purge`]
/// on failure, or unconditionally when `vectorized_enabled` is false) once
/// `capacity` ranges have accumulated.
struct RangeAccum<'h, H: Hooks> {
    hooks: &'h H,
    vec: Vec<Range>,
    capacity: usize,
    total_bytes: usize,
    vectorized_enabled: bool,
}

impl<'h, H: Hooks> RangeAccum<'h, H> {
    fn new(hooks: &'h H, capacity: usize, vectorized_enabled: bool) -> Self {
        Self {
            hooks,
            vec: Vec::with_capacity(capacity),
            capacity,
            total_bytes: 0,
            vectorized_enabled,
        }
    }

    fn add(&mut self, ptr: *mut u8, len: usize) {
        debug_assert!(self.vec.len() < self.capacity);
        self.vec.push(Range { ptr, len });
        self.total_bytes += len;
        if self.vec.len() == self.capacity {
            self.flush();
        }
    }

    fn flush(&mut self) {
        debug_assert!(!self.vec.is_empty());
        try_vectorized_purge(self.hooks, &self.vec, self.vectorized_enabled);
        self.vec.clear();
        self.total_bytes = 0;
    }

    fn finish(&mut self) {
        if !self.vec.is_empty() {
            self.flush();
        }
    }
}

/// Attempt a single vectorized purge over `ranges`; on failure (or when
/// `enabled` is false, i.e. `opt_process_madvise_max_batch == 0` and
/// vectorized purging is administratively disabled), purge each range
/// individually. Mirrors the original's
/// `success = opt_process_madvise_max_batch > 0 && !vectorized_purge(...)`:
/// disabled must skip the vectorized call entirely, not just ignore its
/// result, since some hooks report success (`false`) while still having
/// purged nothing when never actually invoked for real.
fn try_vectorized_purge<H: Hooks>(hooks: &H, ranges: &[Range], enabled: bool) {
    let success = if enabled {
        crate::stat_inc!(vectorized_purge_calls);
        crate::stat_add!(purge_bytes, ranges.iter().map(|r| r.len as u64).sum::<u64>());
        !unsafe { hooks.vectorized_purge(ranges) }
    } else {
        false
    };
    if success {
        return;
    }
    if enabled {
        crate::stat_inc!(vectorized_purge_failures);
    }
    for r in ranges {
        crate::stat_inc!(purge_calls);
        unsafe { hooks.purge(r.ptr, r.len) };
    }
}

/// `opt_process_madvise_max_batch == 0` falls back to the minimum vector
/// size ([`HPA_MIN_VAR_VEC_SIZE`]); otherwise the configured value is used,
/// clamped at build time by [`PROCESS_MADVISE_MAX_BATCH_LIMIT`].
pub fn max_iovec_len(opt_process_madvise_max_batch: usize) -> usize {
    debug_assert!(opt_process_madvise_max_batch <= PROCESS_MADVISE_MAX_BATCH_LIMIT);
    if opt_process_madvise_max_batch == 0 {
        HPA_MIN_VAR_VEC_SIZE
    } else {
        opt_process_madvise_max_batch
    }
}

/// One hugepage's worth of purge work queued for a batch pass.
pub struct PurgeItem<'a> {
    pub hp: &'a mut HpData,
    pub dehugify: bool,
    state: PurgeState,
}

impl<'a> PurgeItem<'a> {
    pub fn new(hp: &'a mut HpData, dehugify: bool) -> Self {
        Self {
            hp,
            dehugify,
            state: PurgeState::new(),
        }
    }
}

/// Purge every item in `batch`: dehugify first (if requested), then drain
/// each hugepage's dirty ranges through a shared [`RangeAccum`].
///
/// Must be called with no allocator locks held — purging calls into the
/// host hooks, which may themselves block on the kernel.
pub fn purge_batch<H: Hooks>(
    hooks: &H,
    batch: &mut [PurgeItem],
    opt_process_madvise_max_batch: usize,
) {
    assert!(!batch.is_empty());
    let len = max_iovec_len(opt_process_madvise_max_batch);
    let mut accum = RangeAccum::new(hooks, len, opt_process_madvise_max_batch > 0);

    for item in batch.iter_mut() {
        if item.dehugify {
            crate::stat_inc!(dehugify_calls);
            unsafe { hooks.dehugify(item.hp.addr, HUGEPAGE) };
        }
        let mut total_purged = 0usize;
        while let Some((addr, size)) = item.hp.purge_next(&mut item.state) {
            total_purged += size;
            debug_assert!(total_purged <= HUGEPAGE);
            accum.add(addr, size);
        }
    }
    accum.finish();
}

/// Bounds how many hugepages get purged in one pass, so a purge never
/// blocks allocation against too many in-flight hugepages at once.
pub struct PurgeBatch {
    /// Max hugepages to purge across the batch's lifetime.
    max_hp: usize,
    /// Max items the per-pass `items` array can hold. Distinct from
    /// `max_hp`: `item_cnt` resets every `pass_start` while
    /// `npurged_hp_total` accumulates across passes, so a batch with a
    /// large lifetime `max_hp` can still be limited to a small
    /// `items_capacity` per individual pass.
    items_capacity: usize,
    /// Once `nranges` in the current pass reaches this, stop adding more
    /// items even though `item_cnt`/`npurged_hp_total` have headroom.
    range_watermark: usize,
    item_cnt: usize,
    nranges: usize,
    ndirty_in_batch: usize,
    npurged_hp_total: usize,
}

impl PurgeBatch {
    pub fn new(max_hp: usize, items_capacity: usize, range_watermark: usize) -> Self {
        assert!(max_hp > 0);
        assert!(max_hp <= HPA_PURGE_BATCH_MAX);
        assert!(items_capacity > 0);
        Self {
            max_hp,
            items_capacity,
            range_watermark,
            item_cnt: 0,
            nranges: 0,
            ndirty_in_batch: 0,
            npurged_hp_total: 0,
        }
    }

    /// Whether the current pass should stop accepting more hugepages.
    /// Ranges are allowed to overshoot `range_watermark` slightly (we only
    /// check before adding an item, not mid-item).
    pub fn is_full(&self) -> bool {
        self.npurged_hp_total == self.max_hp
            || self.item_cnt == self.items_capacity
            || self.nranges >= self.range_watermark
    }

    pub fn is_empty(&self) -> bool {
        self.item_cnt == 0
    }

    /// Reset the per-pass counters (`item_cnt`, `nranges`, `ndirty_in_batch`)
    /// while keeping the lifetime total (`npurged_hp_total`).
    pub fn pass_start(&mut self) {
        self.item_cnt = 0;
        self.nranges = 0;
        self.ndirty_in_batch = 0;
    }

    /// Record that one more hugepage with `nranges` dirty ranges
    /// (`ndirty` pages total) has been added to the current pass.
    pub fn record_item(&mut self, nranges: usize, ndirty: usize) {
        self.item_cnt += 1;
        self.nranges += nranges;
        self.ndirty_in_batch += ndirty;
        self.npurged_hp_total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHooks {
        vectorized_calls: AtomicUsize,
        vectorized_fails: bool,
        purge_calls: AtomicUsize,
        dehugify_calls: AtomicUsize,
    }

    impl Hooks for FakeHooks {
        unsafe fn map(&self, _size: usize, _align: usize) -> *mut u8 {
            core::ptr::null_mut()
        }
        unsafe fn unmap(&self, _ptr: *mut u8, _size: usize) {}
        unsafe fn purge(&self, _ptr: *mut u8, _size: usize) {
            self.purge_calls.fetch_add(1, Ordering::Relaxed);
        }
        unsafe fn vectorized_purge(&self, _ranges: &[Range]) -> bool {
            self.vectorized_calls.fetch_add(1, Ordering::Relaxed);
            self.vectorized_fails
        }
        unsafe fn hugify(&self, _ptr: *mut u8, _size: usize, _sync: bool) -> bool {
            false
        }
        unsafe fn dehugify(&self, _ptr: *mut u8, _size: usize) {
            self.dehugify_calls.fetch_add(1, Ordering::Relaxed);
        }
        fn curtime(&self) -> u64 {
            0
        }
    }

    #[test]
    fn successful_vectorized_purge_never_falls_back() {
        let hooks = FakeHooks {
            vectorized_calls: AtomicUsize::new(0),
            vectorized_fails: false,
            purge_calls: AtomicUsize::new(0),
            dehugify_calls: AtomicUsize::new(0),
        };
        let mut buf = Vec::from([0u8; 4096 * 8].as_slice());
        let mut hp = HpData::new(buf.as_mut_ptr());
        hp.mark_dirty(0, 4096);
        hp.mark_dirty(8192, 4096);
        let mut items = [PurgeItem::new(&mut hp, false)];
        purge_batch(&hooks, &mut items, 8);

        assert_eq!(hooks.vectorized_calls.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.purge_calls.load(Ordering::Relaxed), 0);
        assert_eq!(hooks.dehugify_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn failed_vectorized_purge_falls_back_to_per_range_purge() {
        let hooks = FakeHooks {
            vectorized_calls: AtomicUsize::new(0),
            vectorized_fails: true,
            purge_calls: AtomicUsize::new(0),
            dehugify_calls: AtomicUsize::new(0),
        };
        let mut buf = Vec::from([0u8; 4096 * 8].as_slice());
        let mut hp = HpData::new(buf.as_mut_ptr());
        hp.mark_dirty(0, 4096);
        hp.mark_dirty(8192, 4096);
        hp.mark_dirty(16384, 4096);
        let mut items = [PurgeItem::new(&mut hp, true)];
        purge_batch(&hooks, &mut items, 8);

        assert_eq!(hooks.vectorized_calls.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.purge_calls.load(Ordering::Relaxed), 3);
        assert_eq!(hooks.dehugify_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disabled_vectorized_purge_skips_straight_to_fallback() {
        let hooks = FakeHooks {
            vectorized_calls: AtomicUsize::new(0),
            vectorized_fails: false,
            purge_calls: AtomicUsize::new(0),
            dehugify_calls: AtomicUsize::new(0),
        };
        // process_madvise_max_batch == 0 still uses HPA_MIN_VAR_VEC_SIZE as
        // the accumulation width, but the vectorized hook must never be
        // called at all: the disabled case goes straight to per-range
        // purge, regardless of what the hook would have returned.
        let mut buf = Vec::from([0u8; 4096].as_slice());
        let mut hp = HpData::new(buf.as_mut_ptr());
        hp.mark_dirty(0, 4096);
        let mut items = [PurgeItem::new(&mut hp, false)];
        purge_batch(&hooks, &mut items, 0);
        assert_eq!(hooks.vectorized_calls.load(Ordering::Relaxed), 0);
        assert_eq!(hooks.purge_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn max_iovec_len_falls_back_to_minimum_when_unset() {
        assert_eq!(max_iovec_len(0), HPA_MIN_VAR_VEC_SIZE);
        assert_eq!(max_iovec_len(32), 32);
    }

    #[test]
    fn purge_batch_tracker_is_full_on_any_limit() {
        let mut b = PurgeBatch::new(4, 10, 10);
        assert!(!b.is_full());
        b.record_item(3, 3);
        b.record_item(3, 3);
        b.record_item(3, 3);
        assert!(!b.is_full());
        b.record_item(3, 3);
        assert!(b.is_full());

        b.pass_start();
        assert!(b.is_empty());
        assert_eq!(b.item_cnt, 0);
        assert_eq!(b.npurged_hp_total, 4);
    }

    #[test]
    fn purge_batch_items_capacity_is_distinct_from_max_hp() {
        // max_hp is large (lifetime cap), but items_capacity bounds a
        // single pass independently, and resets every pass_start while
        // npurged_hp_total keeps accumulating.
        let mut b = PurgeBatch::new(100, 2, 100);
        b.record_item(1, 1);
        assert!(!b.is_full());
        b.record_item(1, 1);
        assert!(b.is_full());
        assert_eq!(b.npurged_hp_total, 2);

        b.pass_start();
        assert!(!b.is_full());
        b.record_item(1, 1);
        b.record_item(1, 1);
        assert!(b.is_full());
        assert_eq!(b.npurged_hp_total, 4);
    }
}
