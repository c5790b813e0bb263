//! Host hook contract: the operations [`crate::hpa_central`] and
//! [`crate::purge`] need from the surrounding allocator, injected rather than
//! called directly so tests can swap in a fake without touching real OS
//! state.
//!
//! Mirrors the function-pointer-struct shape the upstream PAI contract uses
//! for the same reason: the page allocator doesn't know or care whether it's
//! talking to `mmap` or a test double, only that the contract holds.

use crate::platform;

/// A contiguous range of mapped, `purge`-able bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub ptr: *mut u8,
    pub len: usize,
}

/// Operations the rest of the crate needs from the host environment.
///
/// Every method takes `&self` rather than being a bare free function so a
/// caller can hold a `Hooks` trait object or swap a test double in without
/// a generic parameter threading through every struct that uses one.
///
/// # The `vectorized_purge` contract
///
/// **`vectorized_purge` returns `true` on FAILURE, not success.** This
/// matches the inverted convention of the underlying batched-madvise-style
/// syscall it wraps (a `true` return means "the call failed, none of these
/// ranges were purged; fall back to purging them one at a time"). Getting
/// this backwards silently turns "everything purged" into "nothing purged"
/// or vice versa with no type-level signal — every caller must treat
/// `true` as "retry via per-range `purge`", never as "done".
pub trait Hooks {
    /// Map `size` bytes of fresh address space aligned to `align`. Null on
    /// failure. Memory is zeroed.
    ///
    /// # Safety
    /// Caller must eventually `unmap` the returned range.
    unsafe fn map(&self, size: usize, align: usize) -> *mut u8;

    /// Release address space returned by `map`.
    ///
    /// # Safety
    /// `ptr`/`size` must match a prior `map` call exactly.
    unsafe fn unmap(&self, ptr: *mut u8, size: usize);

    /// Advise `[ptr, ptr+size)` as reclaimable. Idempotent.
    ///
    /// # Safety
    /// The range must lie within a live `map` allocation.
    unsafe fn purge(&self, ptr: *mut u8, size: usize);

    /// Attempt to purge all of `ranges` in a single batched call. Returns
    /// `true` on failure (see contract note on the trait). On failure the
    /// caller must fall back to calling `purge` once per range.
    ///
    /// # Safety
    /// Every range must lie within a live `map` allocation.
    unsafe fn vectorized_purge(&self, ranges: &[Range]) -> bool;

    /// Promote `[ptr, ptr+size)` to hugepages where supported. `sync`
    /// requests synchronous promotion. Returns `true` on failure.
    ///
    /// # Safety
    /// The range must lie within a live `map` allocation.
    unsafe fn hugify(&self, ptr: *mut u8, size: usize, sync: bool) -> bool;

    /// Demote `[ptr, ptr+size)`, undoing a prior `hugify`.
    ///
    /// # Safety
    /// The range must lie within a live `map` allocation.
    unsafe fn dehugify(&self, ptr: *mut u8, size: usize);

    /// Current monotonic time in nanoseconds, for `PeakDemand` epoch math.
    fn curtime(&self) -> u64;

    /// Nanoseconds elapsed since `earlier` (a value previously returned by
    /// `curtime`). Saturates at zero rather than wrapping if the clock
    /// somehow went backwards.
    fn ms_since(&self, earlier: u64) -> u64 {
        self.curtime().saturating_sub(earlier) / 1_000_000
    }
}

/// The default [`Hooks`] implementation, wired to the real OS via
/// [`crate::platform`]. No per-process-madvise batching syscall is wired up
/// here (the kernels we target don't expose one through libc), so
/// `vectorized_purge` always reports failure and every caller falls back to
/// the documented per-range path — exercising the fallback is itself part
/// of the contract, not a missing feature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHooks;

impl Hooks for SystemHooks {
    #[inline]
    unsafe fn map(&self, size: usize, align: usize) -> *mut u8 {
        unsafe { platform::map_aligned(size, align) }
    }

    #[inline]
    unsafe fn unmap(&self, ptr: *mut u8, size: usize) {
        unsafe { platform::unmap(ptr, size) };
    }

    #[inline]
    unsafe fn purge(&self, ptr: *mut u8, size: usize) {
        unsafe { platform::purge(ptr, size) };
    }

    unsafe fn vectorized_purge(&self, _ranges: &[Range]) -> bool {
        true
    }

    #[inline]
    unsafe fn hugify(&self, ptr: *mut u8, size: usize, sync: bool) -> bool {
        unsafe { platform::hugify(ptr, size, sync) }
    }

    #[inline]
    unsafe fn dehugify(&self, ptr: *mut u8, size: usize) {
        unsafe { platform::dehugify(ptr, size) };
    }

    fn curtime(&self) -> u64 {
        #[cfg(feature = "std")]
        {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        }
        #[cfg(not(feature = "std"))]
        {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    #[test]
    fn system_hooks_map_unmap_roundtrip() {
        let hooks = SystemHooks;
        unsafe {
            let ptr = hooks.map(PAGE_SIZE, PAGE_SIZE);
            assert!(!ptr.is_null());
            hooks.purge(ptr, PAGE_SIZE);
            hooks.unmap(ptr, PAGE_SIZE);
        }
    }

    #[test]
    fn vectorized_purge_reports_failure_by_default() {
        let hooks = SystemHooks;
        let ranges = [Range {
            ptr: core::ptr::null_mut(),
            len: 0,
        }];
        assert!(unsafe { hooks.vectorized_purge(&ranges) });
    }

    #[test]
    fn ms_since_does_not_underflow_on_backwards_clock() {
        let hooks = SystemHooks;
        assert_eq!(hooks.ms_since(u64::MAX), 0);
    }
}
