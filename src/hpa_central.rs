//! Process-wide hugepage-aligned address space provider.
//!
//! `HpaCentral` owns "eden": a hugepage-aligned region mapped in
//! `HPA_EDEN_SIZE`-sized chunks and carved into individual hugepage-sized
//! descriptors on demand. It exists so that per-shard growth (each shard
//! wants its own hugepage-sized chunk to manage) doesn't turn into a
//! storm of small `mmap` calls: eden amortizes the mapping cost across many
//! extractions.
//!
//! Grounded directly on `hpa_central.c`/`hpa_central.h`: one `grow_mtx`
//! guarding `eden`/`eden_len`, extracted via [`HpaCentral::extract`].

use crate::config::{EDEN_SIZE, HUGEPAGE};
use crate::edata::{alloc_edata, dealloc_edata, Edata};
use crate::hooks::Hooks;
use crate::sync::SpinMutex;

struct Eden {
    base: *mut u8,
    len: usize,
}

// SAFETY: only accessed through the SpinMutex in HpaCentral.
unsafe impl Send for Eden {}

/// Outcome of [`HpaCentral::extract`] when it can't satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractError {
    /// Ran out of memory either mapping fresh eden or allocating the
    /// descriptor for the extracted range.
    Oom,
}

pub struct HpaCentral<H: Hooks> {
    grow_mtx: SpinMutex<Eden>,
    hooks: H,
}

impl<H: Hooks> HpaCentral<H> {
    pub const fn new(hooks: H) -> Self {
        Self {
            grow_mtx: SpinMutex::new(Eden {
                base: core::ptr::null_mut(),
                len: 0,
            }),
            hooks,
        }
    }

    /// Extract one hugepage-sized range from eden, growing eden first if
    /// it's empty or can't cover the request (`size` must be `<= HUGEPAGE`;
    /// this central allocator doesn't serve multi-hugepage requests).
    ///
    /// `hugify_eager` requests that the OS promote a freshly mapped eden
    /// chunk to hugepages immediately, and also marks the returned
    /// descriptor as [`Edata::start_as_huge`] so the shard that owns it
    /// treats it as huge from the start rather than waiting for a
    /// background promotion.
    ///
    /// Must only be called once the calling shard's own growth lock is
    /// already held — `HpaCentral` coordinates growth *across* shards, not
    /// within one.
    pub fn extract(
        &self,
        size: usize,
        age: u64,
        hugify_eager: bool,
    ) -> Result<*mut Edata, ExtractError> {
        assert!(size <= HUGEPAGE, "hpa_central only serves <= HUGEPAGE requests");

        let mut eden = self.grow_mtx.lock();
        // Spec: start_as_huge = hugify_eager || (system_thp_mode == always
        // && opt_start_huge_if_thp_always). The second disjunct is omitted:
        // no THP-mode capability is modeled in Hooks/config, so there's
        // nothing to read it from.
        let start_as_huge = hugify_eager;

        // Eden is a perfect fit: hand the whole thing out as one descriptor.
        if !eden.base.is_null() && eden.len == HUGEPAGE {
            let ps = alloc_edata();
            if ps.is_null() {
                return Err(ExtractError::Oom);
            }
            unsafe {
                (*ps).addr = eden.base;
                (*ps).size = HUGEPAGE;
                (*ps).age = age;
                (*ps).start_as_huge = start_as_huge;
            }
            eden.base = core::ptr::null_mut();
            eden.len = 0;
            return Ok(ps);
        }

        // Need to grow eden, or we only need a fresh descriptor for the
        // slice we're about to carve off an already-nonempty eden.
        if eden.base.is_null() {
            let new_eden = unsafe { self.hooks.map(EDEN_SIZE, HUGEPAGE) };
            if new_eden.is_null() {
                return Err(ExtractError::Oom);
            }
            crate::stat_inc!(eden_grows);
            crate::stat_add!(eden_bytes_mapped, EDEN_SIZE);
            if hugify_eager {
                unsafe { self.hooks.hugify(new_eden, EDEN_SIZE, false) };
            }
            let ps = alloc_edata();
            if ps.is_null() {
                unsafe { self.hooks.unmap(new_eden, EDEN_SIZE) };
                return Err(ExtractError::Oom);
            }
            eden.base = new_eden;
            eden.len = EDEN_SIZE;
            return self.carve_from_eden(&mut eden, ps, age, start_as_huge);
        }

        let ps = alloc_edata();
        if ps.is_null() {
            return Err(ExtractError::Oom);
        }
        self.carve_from_eden(&mut eden, ps, age, start_as_huge)
    }

    fn carve_from_eden(
        &self,
        eden: &mut Eden,
        ps: *mut Edata,
        age: u64,
        start_as_huge: bool,
    ) -> Result<*mut Edata, ExtractError> {
        debug_assert!(!eden.base.is_null());
        debug_assert!(eden.len > HUGEPAGE);
        debug_assert_eq!(eden.len % HUGEPAGE, 0);
        debug_assert_eq!(eden.base as usize % HUGEPAGE, 0);

        unsafe {
            (*ps).addr = eden.base;
            (*ps).size = HUGEPAGE;
            (*ps).age = age;
            (*ps).start_as_huge = start_as_huge;
        }

        eden.base = unsafe { eden.base.add(HUGEPAGE) };
        eden.len -= HUGEPAGE;

        crate::stat_inc!(hugepages_extracted);
        Ok(ps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Hooks, Range};
    use core::cell::Cell;
    use core::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    /// A fake `Hooks` whose `map` hands out addresses from a big static
    /// buffer, aligned as requested, so tests don't touch the real OS.
    struct FakeHooks {
        unmap_calls: AtomicUsize,
        hugify_calls: Cell<usize>,
    }

    unsafe impl Sync for FakeHooks {}

    static mut ARENA: [u8; 4 * HUGEPAGE] = [0u8; 4 * HUGEPAGE];

    impl Hooks for FakeHooks {
        unsafe fn map(&self, size: usize, align: usize) -> *mut u8 {
            let base = core::ptr::addr_of_mut!(ARENA) as *mut u8 as usize;
            let aligned = (base + align - 1) & !(align - 1);
            assert!(aligned + size <= base + 4 * HUGEPAGE, "test arena too small");
            aligned as *mut u8
        }
        unsafe fn unmap(&self, _ptr: *mut u8, _size: usize) {
            self.unmap_calls.fetch_add(1, AOrdering::Relaxed);
        }
        unsafe fn purge(&self, _ptr: *mut u8, _size: usize) {}
        unsafe fn vectorized_purge(&self, _ranges: &[Range]) -> bool {
            true
        }
        unsafe fn hugify(&self, _ptr: *mut u8, _size: usize, _sync: bool) -> bool {
            self.hugify_calls.set(self.hugify_calls.get() + 1);
            false
        }
        unsafe fn dehugify(&self, _ptr: *mut u8, _size: usize) {}
        fn curtime(&self) -> u64 {
            0
        }
    }

    fn fake_hooks() -> FakeHooks {
        FakeHooks {
            unmap_calls: AtomicUsize::new(0),
            hugify_calls: Cell::new(0),
        }
    }

    #[test]
    fn first_extract_grows_eden_and_returns_one_hugepage() {
        let central = HpaCentral::new(fake_hooks());
        let ps = central.extract(HUGEPAGE, 1, false).unwrap();
        unsafe {
            assert_eq!((*ps).size, HUGEPAGE);
            assert_eq!((*ps).age, 1);
            assert!(!(*ps).start_as_huge);
            assert_eq!((*ps).addr as usize % HUGEPAGE, 0);
            dealloc_edata(ps);
        }
    }

    #[test]
    fn repeated_extracts_carve_eden_down_to_empty_then_regrow() {
        let central = HpaCentral::new(fake_hooks());
        let eden_hugepages = EDEN_SIZE / HUGEPAGE;
        let mut descriptors = alloc::vec::Vec::new();
        for i in 0..eden_hugepages {
            let ps = central.extract(HUGEPAGE, i as u64, false).unwrap();
            descriptors.push(ps);
        }
        // Eden should be fully consumed; the next extract grows a new eden.
        let ps = central.extract(HUGEPAGE, 999, false).unwrap();
        unsafe {
            assert_eq!((*ps).age, 999);
            dealloc_edata(ps);
        }
        for ps in descriptors {
            unsafe { dealloc_edata(ps) };
        }
    }

    #[test]
    fn hugify_eager_promotes_fresh_eden_and_marks_descriptor() {
        let hooks = fake_hooks();
        let central = HpaCentral::new(hooks);
        let ps = central.extract(HUGEPAGE, 5, true).unwrap();
        unsafe {
            assert!((*ps).start_as_huge);
            dealloc_edata(ps);
        }
        assert_eq!(central.hooks.hugify_calls.get(), 1);
    }

    #[test]
    #[should_panic(expected = "hpa_central only serves")]
    fn extract_rejects_multi_hugepage_requests() {
        let central = HpaCentral::new(fake_hooks());
        let _ = central.extract(HUGEPAGE + 1, 0, false);
    }
}
