//! Page-allocated object pool with a free-span freelist.
//!
//! Pages hold 102 fixed 40-byte slots. Slot 0 of every page is a reserved
//! guard so the free path can always inspect "the slot immediately
//! preceding" without walking off the page. The remaining 101 slots start
//! life as a single free span; frees coalesce backward into the preceding
//! span, allocation detaches one slot from the head span.
//!
//! Oversized objects (strings past their pool payload, closures past three
//! captures, user objects past four fields) come from the general
//! allocator with an identical header prefix; they are identified by
//! size-category checks in the kind-specific free path, never by
//! inspecting a slot.

use crate::intern::InternMap;
use crate::object::{
    FreeSpan, HeapObject, ObjHeader, TypeId, TYPE_FREE, TYPE_RESERVED,
};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Slots per page, guard slot included.
pub const PAGE_SLOTS: usize = 102;

/// Bytes per pool slot.
pub const POOL_SLOT_SIZE: usize = std::mem::size_of::<HeapObject>();

/// One heap page: a guard slot plus 101 allocatable slots.
#[repr(C)]
pub struct HeapPage {
    pub slots: [HeapObject; PAGE_SLOTS],
}

/// Allocation and reclamation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub pool_allocated: u64,
    pub pool_freed: u64,
    pub large_allocated: u64,
    pub large_freed: u64,
}

/// The process-wide object pool plus intern map and rc diagnostics.
pub struct Heap {
    pages: Vec<NonNull<HeapPage>>,
    free_head: *mut HeapObject,
    /// Short-string intern table.
    pub intern: InternMap,
    /// Process-wide live reference count (diagnostic; exact absent cycles).
    pub global_rc: u64,
    pub stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            pages: Vec::new(),
            free_head: std::ptr::null_mut(),
            intern: InternMap::new(),
            global_rc: 0,
            stats: HeapStats::default(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[NonNull<HeapPage>] {
        &self.pages
    }

    // ── Pool allocation ────────────────────────────────────────────────

    /// Pop one slot off the head free span, growing the pool if empty.
    /// Returns `None` only when the allocator itself fails.
    pub fn alloc_pool_slot(&mut self) -> Option<NonNull<HeapObject>> {
        if self.free_head.is_null() {
            let grow_by = std::cmp::max(1, self.pages.len() * 3 / 2);
            self.grow_pages(grow_by)?;
        }
        let head = self.free_head;
        // SAFETY: free_head is non-null after growth and always points at
        // the head slot of a live free span.
        unsafe {
            let span = (*head).free;
            debug_assert_eq!(span.type_id, TYPE_FREE);
            debug_assert_eq!(span.start, head);
            if span.len == 1 {
                self.free_head = span.next;
            } else {
                // Detach the head slot: the span shrinks by one and the
                // tail backlink must follow the new head.
                let new_head = head.add(1);
                (*new_head).free = FreeSpan {
                    type_id: TYPE_FREE,
                    len: span.len - 1,
                    start: new_head,
                    next: span.next,
                };
                let tail = new_head.add((span.len - 2) as usize);
                (*tail).free.type_id = TYPE_FREE;
                (*tail).free.start = new_head;
                self.free_head = new_head;
            }
        }
        self.stats.pool_allocated += 1;
        // SAFETY: head came from a page allocation.
        Some(unsafe { NonNull::new_unchecked(head) })
    }

    /// Return a slot to the pool, coalescing with the preceding span.
    ///
    /// # Safety
    ///
    /// `obj` must be a live pool slot obtained from [`Heap::alloc_pool_slot`]
    /// whose contents have already been torn down.
    pub unsafe fn free_pool_slot(&mut self, obj: *mut HeapObject) {
        // SAFETY: every allocatable slot has index ≥ 1, so the preceding
        // slot is within the same page (possibly the guard).
        unsafe {
            let prev = obj.sub(1);
            if (*prev).common.type_id == TYPE_FREE {
                // prev is the tail of its span; extend that span by one and
                // move the backlink onto the new tail.
                let start = (*prev).free.start;
                (*start).free.len += 1;
                (*obj).free = FreeSpan {
                    type_id: TYPE_FREE,
                    len: 0,
                    start,
                    next: std::ptr::null_mut(),
                };
            } else {
                (*obj).free = FreeSpan {
                    type_id: TYPE_FREE,
                    len: 1,
                    start: obj,
                    next: self.free_head,
                };
                self.free_head = obj;
            }
        }
        self.stats.pool_freed += 1;
    }

    fn grow_pages(&mut self, n: usize) -> Option<()> {
        for _ in 0..n {
            let layout = Layout::new::<HeapPage>();
            // SAFETY: HeapPage has non-zero size.
            let raw = unsafe { alloc_zeroed(layout) } as *mut HeapPage;
            let page = NonNull::new(raw)?;
            // SAFETY: freshly allocated, exclusively owned page.
            unsafe {
                let slots = (*page.as_ptr()).slots.as_mut_ptr();
                (*slots).common = ObjHeader {
                    type_id: TYPE_RESERVED,
                    rc: 1,
                };
                // Mark every allocatable slot free, then thread slots
                // 1..PAGE_SLOTS as one span at the freelist head.
                for i in 1..PAGE_SLOTS {
                    (*slots.add(i)).free.type_id = TYPE_FREE;
                }
                let first = slots.add(1);
                (*first).free = FreeSpan {
                    type_id: TYPE_FREE,
                    len: (PAGE_SLOTS - 1) as u32,
                    start: first,
                    next: self.free_head,
                };
                let tail = slots.add(PAGE_SLOTS - 1);
                (*tail).free.start = first;
                self.free_head = first;
            }
            self.pages.push(page);
        }
        Some(())
    }

    // ── Large allocation ───────────────────────────────────────────────

    /// Allocate `size` bytes from the general allocator for an oversized
    /// object. The caller initializes the header.
    pub fn alloc_large(&mut self, size: usize) -> Option<NonNull<HeapObject>> {
        let layout = Layout::from_size_align(size, 8).ok()?;
        // SAFETY: size ≥ header size for every caller; layout is non-zero.
        let raw = unsafe { alloc(layout) } as *mut HeapObject;
        let ptr = NonNull::new(raw)?;
        self.stats.large_allocated += 1;
        Some(ptr)
    }

    /// Free an oversized object allocated with the same `size`.
    ///
    /// # Safety
    ///
    /// `obj` must come from [`Heap::alloc_large`] with exactly `size`.
    pub unsafe fn free_large(&mut self, obj: *mut HeapObject, size: usize) {
        let layout = Layout::from_size_align(size, 8).expect("valid large layout");
        // SAFETY: same layout as the allocation per the contract.
        unsafe { dealloc(obj as *mut u8, layout) };
        self.stats.large_freed += 1;
    }

    // ── Diagnostics ────────────────────────────────────────────────────

    /// Count free slots across all pages (equals the sum of span lengths).
    pub fn free_slot_count(&self) -> usize {
        let mut n = 0;
        for page in &self.pages {
            // SAFETY: pages are live for the heap's lifetime.
            unsafe {
                let slots = (*page.as_ptr()).slots.as_ptr();
                for i in 1..PAGE_SLOTS {
                    if (*slots.add(i)).common.type_id == TYPE_FREE {
                        n += 1;
                    }
                }
            }
        }
        n
    }

    /// Count live (non-free, non-guard) objects across all pages.
    pub fn live_object_count(&self) -> usize {
        self.pages.len() * (PAGE_SLOTS - 1) - self.free_slot_count()
    }

    /// Span lengths in freelist order, for topology checks.
    pub fn free_span_lens(&self) -> Vec<u32> {
        let mut lens = Vec::new();
        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: freelist links always point at live span heads.
            unsafe {
                lens.push((*cur).free.len);
                cur = (*cur).free.next;
            }
        }
        lens
    }

    /// Look up a live pool object's type id by address, used by tests.
    ///
    /// # Safety
    ///
    /// `ptr` must point inside one of this heap's pages.
    pub unsafe fn slot_type(&self, ptr: *const HeapObject) -> TypeId {
        // SAFETY: per the contract.
        unsafe { (*ptr).common.type_id }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let layout = Layout::new::<HeapPage>();
        for page in &self.pages {
            // SAFETY: each page was allocated with this exact layout and
            // is not referenced after the heap dies.
            unsafe { dealloc(page.as_ptr() as *mut u8, layout) };
        }
    }
}
