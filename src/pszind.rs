//! Page-size-class indexing.
//!
//! The full byte-granularity size-class table (`size_class.rs` in the
//! allocator this crate is descended from) encodes the object-size
//! geometry of the whole front-end allocator, which is out of scope here.
//! What `Sec`'s bins and `HpaCentral`'s eden carve-outs actually need is
//! much narrower: a page-count to a small dense index and back, so bins
//! can be stored in a flat array instead of a map keyed by raw size.
//!
//! Classes are every power of two page count from `1` up to
//! `max_pages_per_class`, i.e. pszind `k` covers exactly `1 << k` pages.
//! This is a deliberate simplification of the original's finer-grained,
//! table-driven pszind geometry (which also includes non-power-of-two
//! classes for better fragmentation behavior) — sufficient to drive and
//! test `Sec`/`HpaCentral`'s external contract without reimplementing the
//! whole size-class subsystem.

use crate::config::PAGE_SIZE;

/// Round `size` up to a whole number of pages and return the page count.
#[inline]
pub fn size_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Map a page count to its pszind. `npages` must be nonzero; rounds up to
/// the next power of two if it isn't one already.
#[inline]
pub fn psz2ind(npages: usize) -> usize {
    debug_assert!(npages > 0);
    npages.next_power_of_two().trailing_zeros() as usize
}

/// Map a pszind back to the page count it represents.
#[inline]
pub fn pind2sz_pages(pszind: usize) -> usize {
    1usize << pszind
}

/// Map a pszind back to a byte size.
#[inline]
pub fn pind2sz(pszind: usize) -> usize {
    pind2sz_pages(pszind) * PAGE_SIZE
}

/// Number of pszind classes needed to cover up to (and including)
/// `max_pages`, inclusive of pszind 0.
#[inline]
pub fn npsizes_for_max_pages(max_pages: usize) -> usize {
    psz2ind(max_pages.max(1)) + 1
}
