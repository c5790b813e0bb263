//! Small extent cache: a sharded, per-page-size-class free-list cache that
//! sits in front of a slower backing allocator.
//!
//! Each shard gets its own set of bins (one per page-size class) so
//! unrelated threads don't contend on the same lock. A thread picks a
//! "preferred" shard once (stuck for its lifetime) and tries that shard
//! first on every alloc/dalloc, rotating through the rest via
//! non-blocking [`crate::sync::SpinMutex::try_lock`] before falling back to
//! a blocking lock on its preferred shard — the rotation is a load-balancing
//! heuristic, not a correctness mechanism; a hit on any shard behaves
//! identically to a hit on the preferred one.
//!
//! Grounded on `sec.c`/`sec.h`/`sec_opts.h`.

use crate::config::PAGE_SIZE;
use crate::edata::{Edata, EdataList};
use crate::pszind;
use crate::sync::SpinMutex;

#[cfg(feature = "std")]
use std::vec::Vec;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// Tunables for a [`Sec`] instance.
#[derive(Clone, Copy, Debug)]
pub struct SecOpts {
    /// Number of shards. `0` disables the cache entirely: every alloc
    /// misses and every dalloc is a no-op, so callers don't need a
    /// separate "is this cache on" check at every call site.
    pub nshards: usize,
    /// Largest size this cache will hold. Larger deallocations pass
    /// through untouched.
    pub max_alloc: usize,
    /// Per-bin flush watermark: exceeding `max_bytes` in a bin triggers a
    /// flush down to 3/4 of `max_bytes`.
    pub max_bytes: usize,
    /// Extra items a caller should request, beyond what it currently
    /// needs, when filling a bin from the backing allocator. `Sec` itself
    /// doesn't consult this — it's a knob for the layer above that decides
    /// how many extents to hand to [`Sec::fill`].
    pub batch_fill_extra: usize,
}

impl SecOpts {
    pub const NSHARDS_DEFAULT: usize = 2;
    pub const BATCH_FILL_EXTRA_DEFAULT: usize = 3;

    /// `max(32 KiB, PAGE_SIZE)`, matching the upstream default.
    pub fn max_alloc_default() -> usize {
        (32 * 1024).max(PAGE_SIZE)
    }

    /// `max(256 KiB, 4 * max_alloc_default())`.
    pub fn max_bytes_default() -> usize {
        (256 * 1024).max(4 * Self::max_alloc_default())
    }

    pub fn default_opts() -> Self {
        Self {
            nshards: Self::NSHARDS_DEFAULT,
            max_alloc: Self::max_alloc_default(),
            max_bytes: Self::max_bytes_default(),
            batch_fill_extra: Self::BATCH_FILL_EXTRA_DEFAULT,
        }
    }
}

/// Per-bin counters, accumulated under the bin's own lock (these are plain
/// counters, not atomics — correctness here comes from the lock, not from
/// the memory ordering of the counters themselves).
#[derive(Clone, Copy, Debug, Default)]
pub struct SecBinStats {
    pub nhits: u64,
    pub nmisses: u64,
    pub ndalloc_flush: u64,
    pub ndalloc_noflush: u64,
    pub noverfills: u64,
}

impl SecBinStats {
    fn accum(&mut self, other: &SecBinStats) {
        self.nhits += other.nhits;
        self.nmisses += other.nmisses;
        self.ndalloc_flush += other.ndalloc_flush;
        self.ndalloc_noflush += other.ndalloc_noflush;
        self.noverfills += other.noverfills;
    }
}

/// Aggregate stats across every bin, returned by [`Sec::stats_merge`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SecStats {
    pub bytes: usize,
    pub total: SecBinStats,
}

struct SecBinInner {
    bytes_cur: usize,
    freelist: EdataList,
    stats: SecBinStats,
}

impl SecBinInner {
    const fn new() -> Self {
        Self {
            bytes_cur: 0,
            freelist: EdataList::new(),
            stats: SecBinStats {
                nhits: 0,
                nmisses: 0,
                ndalloc_flush: 0,
                ndalloc_noflush: 0,
                noverfills: 0,
            },
        }
    }
}

struct SecBin {
    mtx: SpinMutex<SecBinInner>,
}

impl SecBin {
    fn new() -> Self {
        Self {
            mtx: SpinMutex::new(SecBinInner::new()),
        }
    }
}

/// Lazy per-thread sticky shard index plus the xorshift state used to pick
/// it, following Lemire's multiply-and-shift trick for mapping a 32-bit
/// sample onto `[0, nshards)` without a modulo.
#[cfg(feature = "std")]
struct ShardPicker {
    idx: core::cell::Cell<Option<u8>>,
    prng: core::cell::Cell<u64>,
}

#[cfg(feature = "std")]
impl ShardPicker {
    fn seed() -> u64 {
        use std::hash::{BuildHasher, Hash, Hasher};
        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() | 1
    }
}

#[cfg(feature = "std")]
std::thread_local! {
    static SHARD_PICKER: ShardPicker = ShardPicker {
        idx: core::cell::Cell::new(None),
        prng: core::cell::Cell::new(ShardPicker::seed()),
    };
}

#[cfg(feature = "std")]
fn next_u32(state: &core::cell::Cell<u64>) -> u32 {
    // xorshift64*
    let mut x = state.get();
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    state.set(x);
    (x.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32
}

/// Pick (and, on a thread's first call, commit) this thread's preferred
/// shard. Sticky for the thread's lifetime. Without the `std` feature
/// there's no thread-local storage to stick a choice in, so every caller
/// gets shard 0 — equivalent to the upstream `tsdn_null` fallback.
fn shard_pick(nshards: usize) -> usize {
    #[cfg(feature = "std")]
    {
        SHARD_PICKER.with(|picker| {
            if let Some(idx) = picker.idx.get() {
                return idx as usize;
            }
            let rand32 = next_u32(&picker.prng);
            let idx = ((rand32 as u64 * nshards as u64) >> 32) as u8;
            picker.idx.set(Some(idx));
            idx as usize
        })
    }
    #[cfg(not(feature = "std"))]
    {
        let _ = nshards;
        0
    }
}

/// A sharded small extent cache. `npsizes` bins per shard, one per
/// page-size class up to `opts.max_alloc`.
pub struct Sec {
    opts: SecOpts,
    bins: Vec<SecBin>,
    npsizes: usize,
}

impl Sec {
    pub fn new(opts: SecOpts) -> Self {
        if opts.nshards == 0 {
            return Self {
                opts,
                bins: Vec::new(),
                npsizes: 0,
            };
        }
        assert!(opts.max_alloc >= PAGE_SIZE);
        let max_alloc = opts.max_alloc & !(PAGE_SIZE - 1);
        let npsizes = pszind::npsizes_for_max_pages(max_alloc / PAGE_SIZE);
        let ntotal = opts.nshards * npsizes;
        let mut bins = Vec::with_capacity(ntotal);
        for _ in 0..ntotal {
            bins.push(SecBin::new());
        }
        Self {
            opts,
            bins,
            npsizes,
        }
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.opts.nshards != 0
    }

    #[inline]
    fn size_supported(&self, size: usize) -> bool {
        self.is_used() && size <= self.opts.max_alloc
    }

    fn bin(&self, shard: usize, pszind: usize) -> &SecBin {
        debug_assert!(shard < self.opts.nshards);
        let ind = shard * self.npsizes + pszind;
        debug_assert!(ind < self.npsizes * self.opts.nshards);
        &self.bins[ind]
    }

    fn bin_alloc_locked(inner: &mut SecBinInner) -> *mut Edata {
        let edata = inner.freelist.first();
        if !edata.is_null() {
            unsafe {
                inner.freelist.remove(edata);
                let sz = (*edata).size;
                debug_assert!(sz <= inner.bytes_cur && sz > 0);
                inner.bytes_cur -= sz;
            }
            inner.stats.nhits += 1;
        }
        edata
    }

    fn multishard_trylock_alloc(&self, pszind: usize) -> *mut Edata {
        debug_assert!(self.opts.nshards > 0);
        let preferred = shard_pick(self.opts.nshards);
        let mut cur = preferred;
        for _ in 0..self.opts.nshards {
            let bin = self.bin(cur, pszind);
            if let Some(mut inner) = bin.mtx.try_lock() {
                let edata = Self::bin_alloc_locked(&mut inner);
                if !edata.is_null() {
                    return edata;
                }
            }
            cur += 1;
            if cur == self.opts.nshards {
                cur = 0;
            }
        }
        debug_assert_eq!(cur, preferred);
        let bin = self.bin(cur, pszind);
        let mut inner = bin.mtx.lock();
        let edata = Self::bin_alloc_locked(&mut inner);
        if edata.is_null() {
            inner.stats.nmisses += 1;
        }
        edata
    }

    /// Try to serve `size` bytes from the cache. Returns null on a miss
    /// (either the cache doesn't hold this size class, or every bin that
    /// could serve it is currently empty).
    pub fn alloc(&self, size: usize) -> *mut Edata {
        if !self.size_supported(size) {
            return core::ptr::null_mut();
        }
        debug_assert_eq!(size & (PAGE_SIZE - 1), 0);
        let pszind = pszind::psz2ind(size / PAGE_SIZE);
        debug_assert!(pszind < self.npsizes);

        if self.opts.nshards == 1 {
            let bin = self.bin(0, pszind);
            let mut inner = bin.mtx.lock();
            let edata = Self::bin_alloc_locked(&mut inner);
            if edata.is_null() {
                inner.stats.nmisses += 1;
            }
            return edata;
        }
        self.multishard_trylock_alloc(pszind)
    }

    fn bin_dalloc_locked(inner: &mut SecBinInner, opts: &SecOpts, size: usize, dalloc_list: &mut EdataList) {
        inner.bytes_cur += size;
        let edata = dalloc_list.first();
        debug_assert!(!edata.is_null());
        unsafe {
            dalloc_list.remove(edata);
            inner.freelist.prepend(edata);
        }
        debug_assert!(dalloc_list.is_empty());

        if inner.bytes_cur <= opts.max_bytes {
            inner.stats.ndalloc_noflush += 1;
            return;
        }
        inner.stats.ndalloc_flush += 1;
        let bytes_target = opts.max_bytes - (opts.max_bytes >> 2);
        while inner.bytes_cur > bytes_target && !inner.freelist.is_empty() {
            let cur = inner.freelist.last();
            unsafe {
                let sz = (*cur).size;
                debug_assert!(sz <= inner.bytes_cur && sz > 0);
                inner.bytes_cur -= sz;
                inner.freelist.remove(cur);
                dalloc_list.append(cur);
            }
        }
    }

    fn multishard_trylock_dalloc(&self, size: usize, pszind: usize, dalloc_list: &mut EdataList) {
        debug_assert!(self.opts.nshards > 0);
        let preferred = shard_pick(self.opts.nshards);
        let mut cur = preferred;
        for _ in 0..self.opts.nshards {
            let bin = self.bin(cur, pszind);
            if let Some(mut inner) = bin.mtx.try_lock() {
                Self::bin_dalloc_locked(&mut inner, &self.opts, size, dalloc_list);
                return;
            }
            cur += 1;
            if cur == self.opts.nshards {
                cur = 0;
            }
        }
        debug_assert_eq!(cur, preferred);
        let bin = self.bin(cur, pszind);
        let mut inner = bin.mtx.lock();
        Self::bin_dalloc_locked(&mut inner, &self.opts, size, dalloc_list);
    }

    /// Return the single extent in `dalloc_list` to the cache. If the
    /// extent is larger than `max_alloc`, `dalloc_list` is left untouched
    /// (the caller must route it to the backing allocator instead). On a
    /// successful return, `dalloc_list` may come back non-empty: flushed
    /// extents (evicted to stay under `max_bytes`) are handed back to the
    /// caller through the same list.
    pub fn dalloc(&self, dalloc_list: &mut EdataList) {
        if !self.is_used() {
            return;
        }
        let edata = dalloc_list.first();
        debug_assert!(!edata.is_null());
        let size = unsafe { (*edata).size };
        if size > self.opts.max_alloc {
            return;
        }
        let pszind = pszind::psz2ind(size / PAGE_SIZE);
        debug_assert!(pszind < self.npsizes);

        if self.opts.nshards == 1 {
            let bin = self.bin(0, pszind);
            let mut inner = bin.mtx.lock();
            Self::bin_dalloc_locked(&mut inner, &self.opts, size, dalloc_list);
            return;
        }
        self.multishard_trylock_dalloc(size, pszind, dalloc_list)
    }

    /// Bulk-insert `nallocs * size` bytes worth of extents (already
    /// removed from wherever they came from) into one bin, picked by this
    /// thread's preferred shard. If the whole batch doesn't fit under
    /// `max_bytes`, items are added one at a time until the bin is full
    /// and the rest are left in `result` — counted as one overfill, not
    /// one per leftover item, since it's one fill operation racing against
    /// the watermark, not `nallocs` independent ones.
    pub fn fill(&self, size: usize, result: &mut EdataList, nallocs: usize) {
        debug_assert_eq!(size & (PAGE_SIZE - 1), 0);
        debug_assert!(self.opts.nshards != 0 && size <= self.opts.max_alloc);
        debug_assert!(nallocs > 0);

        let pszind = pszind::psz2ind(size / PAGE_SIZE);
        debug_assert!(pszind < self.npsizes);
        let bin = self.bin(shard_pick(self.opts.nshards), pszind);
        let mut inner = bin.mtx.lock();

        let new_cached_bytes = nallocs * size;
        if inner.bytes_cur + new_cached_bytes <= self.opts.max_bytes {
            debug_assert!(!result.is_empty());
            inner.freelist.concat(result);
            inner.bytes_cur += new_cached_bytes;
        } else {
            inner.stats.noverfills += 1;
            while inner.bytes_cur + size <= self.opts.max_bytes {
                let edata = result.first();
                if edata.is_null() {
                    break;
                }
                unsafe {
                    result.remove(edata);
                    debug_assert_eq!(size, (*edata).size);
                    inner.freelist.append(edata);
                }
                inner.bytes_cur += size;
            }
        }
    }

    /// Empty every bin, moving everything into `to_flush`.
    pub fn flush(&self, to_flush: &mut EdataList) {
        if !self.is_used() {
            return;
        }
        for bin in &self.bins {
            let mut inner = bin.mtx.lock();
            inner.bytes_cur = 0;
            to_flush.concat(&mut inner.freelist);
        }
    }

    /// Sum `bytes_cur` and accumulate per-bin counters across every bin.
    pub fn stats_merge(&self, stats: &mut SecStats) {
        if !self.is_used() {
            return;
        }
        let mut sum = 0;
        for bin in &self.bins {
            let inner = bin.mtx.lock();
            sum += inner.bytes_cur;
            stats.total.accum(&inner.stats);
        }
        stats.bytes += sum;
    }

    /// Phase 2 of the host's fork protocol: take every bin's lock, in a
    /// fixed order, before any lock belonging to the backing allocator.
    /// Returns a guard set that keeps every bin locked until the parent
    /// calls [`Sec::postfork_parent`].
    ///
    /// Phase 2 because witness ordering requires all `SecBin` locks to be
    /// acquired before any downstream PAI lock; earlier phases (acquiring
    /// those downstream locks) are the host's responsibility, not this
    /// type's.
    pub fn prefork2(&self) -> SecForkGuard<'_> {
        let mut guards = Vec::with_capacity(self.bins.len());
        for bin in &self.bins {
            guards.push(bin.mtx.lock());
        }
        SecForkGuard { guards }
    }

    /// Parent side of the fork protocol: release every bin lock taken by
    /// `prefork2`, in acquisition order.
    pub fn postfork_parent(&self, guard: SecForkGuard<'_>) {
        drop(guard);
    }

    /// Child side of the fork protocol. The child process has only the
    /// forking thread; any bin lock held by some other thread at fork time
    /// is permanently stuck (that thread doesn't exist here), so rather
    /// than releasing the guards normally we force every bin's lock back to
    /// unlocked. The guard set is consumed without running its normal
    /// unlock-on-drop path.
    pub fn postfork_child(&self, guard: SecForkGuard<'_>) {
        let SecForkGuard { guards } = guard;
        core::mem::forget(guards);
        for bin in &self.bins {
            unsafe { bin.mtx.force_unlock() };
        }
    }
}

/// All of a [`Sec`]'s bin locks, held simultaneously across a fork.
/// Produced by [`Sec::prefork2`]; consumed by [`Sec::postfork_parent`] or
/// [`Sec::postfork_child`].
pub struct SecForkGuard<'a> {
    guards: Vec<crate::sync::SpinMutexGuard<'a, SecBinInner>>,
}
