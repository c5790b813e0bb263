//! Extent descriptors (`Edata`) and the intrusive list they live in.
//!
//! An `Edata` describes one mapped, page-aligned range of address space —
//! the unit that flows through [`crate::sec`]'s bins and
//! [`crate::hpa_central`]'s eden carve-outs. It participates in exactly one
//! [`EdataList`] at a time via an intrusive doubly-linked pointer pair, the
//! same trick the teacher uses for `Span`/`SpanList`, generalized with a
//! tail pointer so `append`/`concat` are O(1) too.

use crate::platform;
use crate::sync::SpinMutex;
use core::ptr;

/// Descriptor for one mapped range of pages.
///
/// `Edata` structs are allocated from a dedicated slab (see
/// [`alloc_edata`]/[`dealloc_edata`]) rather than from the memory they
/// describe, so carving up a range never needs to recursively allocate.
#[repr(C)]
pub struct Edata {
    /// Base address of the range this descriptor covers.
    pub addr: *mut u8,
    /// Size of the range in bytes.
    pub size: usize,
    /// Page-size-class index this range is filed under (see
    /// [`crate::pszind`]).
    pub pszind: usize,
    /// Whether the OS has promoted the backing pages to hugepages.
    pub hugified: bool,
    /// Logical age/generation this range was created at, used by callers
    /// that order ranges for eviction (oldest first) or recency (most
    /// recently freed first).
    pub age: u64,
    /// Whether this range should be treated as huge from the moment it's
    /// handed out, independent of whether `hugified` (an actual completed
    /// OS-level promotion) has happened yet.
    pub start_as_huge: bool,
    prev: *mut Edata,
    next: *mut Edata,
}

impl Edata {
    #[inline]
    pub fn end_addr(&self) -> *mut u8 {
        unsafe { self.addr.add(self.size) }
    }
}

/// A doubly-linked list of `Edata` descriptors with O(1) append, prepend,
/// remove, concat, `first`, `last`, and `is_empty`.
///
/// An `Edata` belongs to at most one list at a time; moving it between
/// lists requires removing it from the old one first. Nothing enforces
/// this at the type level (the teacher's `SpanList` has the same property)
/// so it's on the caller.
pub struct EdataList {
    head: *mut Edata,
    tail: *mut Edata,
    pub count: usize,
}

impl Default for EdataList {
    fn default() -> Self {
        Self::new()
    }
}

impl EdataList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub fn first(&self) -> *mut Edata {
        self.head
    }

    #[inline]
    pub fn last(&self) -> *mut Edata {
        self.tail
    }

    /// Insert `edata` at the front of the list.
    ///
    /// # Safety
    /// `edata` must be a valid pointer to an `Edata` not already in a list.
    pub unsafe fn prepend(&mut self, edata: *mut Edata) {
        unsafe {
            (*edata).prev = ptr::null_mut();
            (*edata).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = edata;
            } else {
                self.tail = edata;
            }
            self.head = edata;
            self.count += 1;
        }
    }

    /// Insert `edata` at the back of the list.
    ///
    /// # Safety
    /// `edata` must be a valid pointer to an `Edata` not already in a list.
    pub unsafe fn append(&mut self, edata: *mut Edata) {
        unsafe {
            (*edata).next = ptr::null_mut();
            (*edata).prev = self.tail;
            if !self.tail.is_null() {
                (*self.tail).next = edata;
            } else {
                self.head = edata;
            }
            self.tail = edata;
            self.count += 1;
        }
    }

    /// Remove `edata` from the list.
    ///
    /// # Safety
    /// `edata` must currently be a member of this list.
    pub unsafe fn remove(&mut self, edata: *mut Edata) {
        unsafe {
            let prev = (*edata).prev;
            let next = (*edata).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            } else {
                self.tail = prev;
            }
            (*edata).prev = ptr::null_mut();
            (*edata).next = ptr::null_mut();
            self.count -= 1;
        }
    }

    /// Pop the first element off the list, or null if empty.
    pub fn pop_first(&mut self) -> *mut Edata {
        let edata = self.head;
        if !edata.is_null() {
            unsafe { self.remove(edata) };
        }
        edata
    }

    /// Pop the last element off the list, or null if empty.
    pub fn pop_last(&mut self) -> *mut Edata {
        let edata = self.tail;
        if !edata.is_null() {
            unsafe { self.remove(edata) };
        }
        edata
    }

    /// Move every element of `other` onto the back of `self`, leaving
    /// `other` empty. O(1): just splices the two tail/head pointers.
    pub fn concat(&mut self, other: &mut EdataList) {
        if other.is_empty() {
            return;
        }
        unsafe {
            if self.tail.is_null() {
                self.head = other.head;
            } else {
                (*self.tail).next = other.head;
                (*other.head).prev = self.tail;
            }
        }
        self.tail = other.tail;
        self.count += other.count;
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.count = 0;
    }
}

struct EdataSlabInner {
    free_list: *mut Edata,
    bump_ptr: *mut u8,
    bump_end: *mut u8,
}

// SAFETY: only ever touched through the SpinMutex below, which serializes
// access; the bump region outlives every thread that can reach it.
unsafe impl Send for EdataSlabInner {}

impl EdataSlabInner {
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            bump_ptr: ptr::null_mut(),
            bump_end: ptr::null_mut(),
        }
    }

    unsafe fn alloc(&mut self) -> *mut Edata {
        if !self.free_list.is_null() {
            let edata = self.free_list;
            unsafe { self.free_list = (*edata).next };
            return edata;
        }

        let size = core::mem::size_of::<Edata>();
        let align = core::mem::align_of::<Edata>();
        let ptr = self.bump_ptr as usize;
        let aligned = (ptr + align - 1) & !(align - 1);
        let end = aligned + size;

        if end <= self.bump_end as usize {
            self.bump_ptr = end as *mut u8;
            return aligned as *mut Edata;
        }

        let slab = unsafe { platform::map_aligned(crate::config::PAGE_SIZE, crate::config::PAGE_SIZE) };
        if slab.is_null() {
            return ptr::null_mut();
        }
        self.bump_ptr = slab;
        self.bump_end = unsafe { slab.add(crate::config::PAGE_SIZE) };
        unsafe { self.alloc() }
    }

    unsafe fn dealloc(&mut self, edata: *mut Edata) {
        unsafe {
            (*edata).next = self.free_list;
        }
        self.free_list = edata;
    }
}

static EDATA_SLAB: SpinMutex<EdataSlabInner> = SpinMutex::new(EdataSlabInner::new());

/// Allocate a zero-initialized `Edata` descriptor.
pub fn alloc_edata() -> *mut Edata {
    let edata = unsafe { EDATA_SLAB.lock().alloc() };
    if !edata.is_null() {
        unsafe { ptr::write_bytes(edata as *mut u8, 0, core::mem::size_of::<Edata>()) };
    }
    edata
}

/// Return an `Edata` descriptor to the slab for reuse.
///
/// # Safety
/// `edata` must have come from [`alloc_edata`] and must not be in any list.
pub unsafe fn dealloc_edata(edata: *mut Edata) {
    unsafe { EDATA_SLAB.lock().dealloc(edata) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_edata(addr: usize, size: usize) -> *mut Edata {
        let e = alloc_edata();
        unsafe {
            (*e).addr = addr as *mut u8;
            (*e).size = size;
        }
        e
    }

    #[test]
    fn alloc_dealloc_roundtrip() {
        let e = alloc_edata();
        assert!(!e.is_null());
        unsafe {
            assert_eq!((*e).addr, ptr::null_mut());
            assert_eq!((*e).size, 0);
            assert!(!(*e).hugified);
            dealloc_edata(e);
        }
        let e2 = alloc_edata();
        assert_eq!(e, e2);
        unsafe { dealloc_edata(e2) };
    }

    #[test]
    fn append_and_prepend_order() {
        let mut list = EdataList::new();
        let a = new_edata(0x1000, 4096);
        let b = new_edata(0x2000, 4096);
        let c = new_edata(0x3000, 4096);

        unsafe {
            list.append(a);
            list.append(b);
            list.prepend(c);
        }
        assert_eq!(list.count, 3);
        assert_eq!(list.first(), c);
        assert_eq!(list.last(), b);

        unsafe {
            list.remove(a);
        }
        assert_eq!(list.count, 2);
        assert_eq!(list.first(), c);
        assert_eq!(list.last(), b);

        unsafe {
            dealloc_edata(a);
            dealloc_edata(list.pop_first());
            dealloc_edata(list.pop_first());
        }
        assert!(list.is_empty());
    }

    #[test]
    fn concat_moves_all_elements_and_empties_source() {
        let mut left = EdataList::new();
        let mut right = EdataList::new();
        let a = new_edata(0x1000, 4096);
        let b = new_edata(0x2000, 4096);
        let c = new_edata(0x3000, 4096);

        unsafe {
            left.append(a);
            right.append(b);
            right.append(c);
            left.concat(&mut right);
        }

        assert_eq!(left.count, 3);
        assert!(right.is_empty());
        assert_eq!(left.first(), a);
        assert_eq!(left.last(), c);

        unsafe {
            while !left.is_empty() {
                dealloc_edata(left.pop_first());
            }
        }
    }

    #[test]
    fn concat_onto_empty_list_takes_source_head_and_tail() {
        let mut left = EdataList::new();
        let mut right = EdataList::new();
        let a = new_edata(0x1000, 4096);
        unsafe {
            right.append(a);
            left.concat(&mut right);
        }
        assert_eq!(left.count, 1);
        assert_eq!(left.first(), a);
        assert_eq!(left.last(), a);
        assert!(right.is_empty());
        unsafe { dealloc_edata(left.pop_first()) };
    }
}
