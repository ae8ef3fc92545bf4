//! Raw element buffers backing the list kind.
//!
//! Lists keep their elements in a separately allocated `Value` buffer so
//! the 40-byte pool slot only carries `(ptr, len, cap)`. These helpers own
//! the buffer arithmetic; element reference counts are the caller's
//! responsibility.

use crate::object::ListObject;
use std::alloc::{alloc, dealloc, Layout};
use vesper_core::Value;

#[inline]
fn buf_layout(cap: usize) -> Layout {
    Layout::array::<Value>(cap).expect("list capacity overflow")
}

/// Allocate a buffer of exactly `cap` values. Returns null for `cap == 0`.
pub fn alloc_elems(cap: usize) -> *mut Value {
    if cap == 0 {
        return std::ptr::null_mut();
    }
    // SAFETY: non-zero layout.
    let ptr = unsafe { alloc(buf_layout(cap)) } as *mut Value;
    if ptr.is_null() {
        std::alloc::handle_alloc_error(buf_layout(cap));
    }
    ptr
}

/// Free a buffer previously allocated with capacity `cap`.
///
/// # Safety
///
/// `ptr` must come from [`alloc_elems`] with exactly `cap`.
pub unsafe fn free_elems(ptr: *mut Value, cap: usize) {
    if cap != 0 {
        // SAFETY: same layout as the allocation.
        unsafe { dealloc(ptr as *mut u8, buf_layout(cap)) };
    }
}

/// Ensure room for at least one more element, doubling on growth.
///
/// # Safety
///
/// `list` must point at a live, coherent list object.
pub unsafe fn reserve_one(list: *mut ListObject) {
    // SAFETY: caller guarantees a live list.
    unsafe {
        if (*list).len < (*list).cap {
            return;
        }
        let new_cap = std::cmp::max(4, (*list).cap as usize * 2);
        let new_buf = alloc_elems(new_cap);
        if (*list).len > 0 {
            std::ptr::copy_nonoverlapping((*list).elems, new_buf, (*list).len as usize);
        }
        free_elems((*list).elems, (*list).cap as usize);
        (*list).elems = new_buf;
        (*list).cap = new_cap as u32;
    }
}

/// Append without rc adjustment.
///
/// # Safety
///
/// `list` must point at a live, coherent list object.
pub unsafe fn push(list: *mut ListObject, v: Value) {
    // SAFETY: per the contract; reserve_one keeps len < cap.
    unsafe {
        reserve_one(list);
        *(*list).elems.add((*list).len as usize) = v;
        (*list).len += 1;
    }
}

/// The element slice.
///
/// # Safety
///
/// `list` must point at a live, coherent list object, and the slice must
/// not outlive any mutation of the list.
pub unsafe fn elems<'a>(list: *const ListObject) -> &'a [Value] {
    // SAFETY: len ≤ cap elements are initialized.
    unsafe { std::slice::from_raw_parts((*list).elems, (*list).len as usize) }
}
