//! Miri-compatible platform shim using std::alloc as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/VirtualAlloc), so we use the
//! system allocator to provide aligned memory. This lets Miri check all the
//! unsafe pointer logic in hpa_central/sec/purge without real syscalls.

extern crate alloc;

use core::alloc::Layout;

pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    // The real alignment doesn't matter for Miri's pointer-logic checks;
    // pin it to PAGE_SIZE so `unmap` can reconstruct an identical layout
    // without having to thread the caller's alignment through.
    let _ = align;
    let layout = Layout::from_size_align(size, crate::config::PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    let layout = Layout::from_size_align(size, crate::config::PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

pub unsafe fn purge(_ptr: *mut u8, _size: usize) {}

pub unsafe fn hugify(_ptr: *mut u8, _size: usize, _sync: bool) -> bool {
    true
}

pub unsafe fn dehugify(_ptr: *mut u8, _size: usize) {}
