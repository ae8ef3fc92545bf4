//! Managed string kinds: construction, interning, character indexing.
//!
//! Three encodings: astring (ASCII), ustring (UTF-8 with a code-point
//! length cache and MRU random-access cache), rawstring (opaque bytes).
//! Payloads up to the per-kind pool threshold live inline in the 40-byte
//! slot; longer payloads move the whole object to the general allocator
//! behind the same header. Astrings and ustrings at or below
//! [`INTERN_MAX_LEN`](crate::intern::INTERN_MAX_LEN) bytes are
//! canonicalized through the intern map.

use crate::heap::Heap;
use crate::intern::INTERN_MAX_LEN;
use crate::object::{
    string_payload, AstringObject, AstringSliceObject, HeapObject, ObjHeader,
    RawStringObject, RawStringSliceObject, UstringObject, UstringSliceObject,
    ASTRING_POOL_MAX, RAWSTRING_POOL_MAX, TYPE_ASTRING, TYPE_ASTRING_SLICE,
    TYPE_RAWSTRING, TYPE_RAWSTRING_SLICE, TYPE_USTRING, TYPE_USTRING_SLICE,
    USTRING_POOL_MAX,
};
use std::ptr::NonNull;
use vesper_core::Value;

/// Count UTF-8 code points (non-continuation bytes).
#[inline]
pub fn utf8_char_len(bytes: &[u8]) -> u32 {
    bytes.iter().filter(|b| (**b & 0xc0) != 0x80).count() as u32
}

/// Byte index of `target_char`, seeking forward from an MRU
/// (byte, char) position when the target lies at or past it, otherwise
/// from the start. Returns `None` past the end.
pub fn seek_char_index(
    bytes: &[u8],
    mru_byte: u32,
    mru_char: u32,
    target_char: u32,
) -> Option<u32> {
    let (mut byte, mut ch) = if target_char >= mru_char && (mru_byte as usize) < bytes.len()
    {
        (mru_byte as usize, mru_char)
    } else {
        (0, 0)
    };
    while byte < bytes.len() {
        if (bytes[byte] & 0xc0) != 0x80 {
            if ch == target_char {
                return Some(byte as u32);
            }
            ch += 1;
        }
        byte += 1;
    }
    None
}

// Fixed prefix sizes, used for payload offsets and large-object layouts.
pub const ASTRING_FIXED: usize = std::mem::size_of::<AstringObject>();
pub const USTRING_FIXED: usize = std::mem::size_of::<UstringObject>();
pub const RAWSTRING_FIXED: usize = std::mem::size_of::<RawStringObject>();

impl Heap {
    // ── Construction ───────────────────────────────────────────────────

    /// Allocate an astring (no interning) with `rc = 1`.
    pub fn new_astring(&mut self, bytes: &[u8]) -> Option<NonNull<HeapObject>> {
        debug_assert!(bytes.is_ascii());
        let obj = if bytes.len() <= ASTRING_POOL_MAX {
            self.alloc_pool_slot()?
        } else {
            self.alloc_large(ASTRING_FIXED + bytes.len())?
        };
        // SAFETY: freshly allocated storage with room for the payload.
        unsafe {
            (*obj.as_ptr()).astring = AstringObject {
                header: ObjHeader {
                    type_id: TYPE_ASTRING,
                    rc: 1,
                },
                len: bytes.len() as u32,
            };
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                string_payload(obj.as_ptr(), ASTRING_FIXED),
                bytes.len(),
            );
        }
        self.global_rc += 1;
        Some(obj)
    }

    /// Allocate a ustring (no interning) with `rc = 1`.
    pub fn new_ustring(&mut self, bytes: &[u8]) -> Option<NonNull<HeapObject>> {
        let obj = if bytes.len() <= USTRING_POOL_MAX {
            self.alloc_pool_slot()?
        } else {
            self.alloc_large(USTRING_FIXED + bytes.len())?
        };
        // SAFETY: freshly allocated storage with room for the payload.
        unsafe {
            (*obj.as_ptr()).ustring = UstringObject {
                header: ObjHeader {
                    type_id: TYPE_USTRING,
                    rc: 1,
                },
                len: bytes.len() as u32,
                char_len: utf8_char_len(bytes),
                mru_byte_idx: 0,
                mru_char_idx: 0,
                _pad: 0,
            };
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                string_payload(obj.as_ptr(), USTRING_FIXED),
                bytes.len(),
            );
        }
        self.global_rc += 1;
        Some(obj)
    }

    /// Allocate a rawstring with `rc = 1`. Never interned.
    pub fn new_rawstring(&mut self, bytes: &[u8]) -> Option<NonNull<HeapObject>> {
        let obj = if bytes.len() <= RAWSTRING_POOL_MAX {
            self.alloc_pool_slot()?
        } else {
            self.alloc_large(RAWSTRING_FIXED + bytes.len())?
        };
        // SAFETY: freshly allocated storage with room for the payload.
        unsafe {
            (*obj.as_ptr()).rawstring = RawStringObject {
                header: ObjHeader {
                    type_id: TYPE_RAWSTRING,
                    rc: 1,
                },
                len: bytes.len() as u32,
            };
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                string_payload(obj.as_ptr(), RAWSTRING_FIXED),
                bytes.len(),
            );
        }
        self.global_rc += 1;
        Some(obj)
    }

    /// Get-or-alloc through the intern map. Picks astring or ustring by
    /// content; strings past the intern threshold always allocate fresh.
    /// The returned object is retained for the caller either way.
    pub fn get_or_intern_string(&mut self, bytes: &[u8]) -> Option<Value> {
        if bytes.len() <= INTERN_MAX_LEN {
            if let Some(existing) = self.intern.get(bytes) {
                // SAFETY: intern entries always point at live objects; the
                // identity-checked removal in the free path guarantees it.
                unsafe { (*existing).common.rc += 1 };
                self.global_rc += 1;
                return Some(Value::pointer(existing));
            }
        }
        let obj = if bytes.is_ascii() {
            self.new_astring(bytes)?
        } else {
            self.new_ustring(bytes)?
        };
        if bytes.len() <= INTERN_MAX_LEN {
            self.intern.insert(bytes, obj.as_ptr());
        }
        Some(Value::pointer(obj.as_ptr()))
    }

    // ── Slices ─────────────────────────────────────────────────────────

    /// Allocate a slice object over a managed string, retaining `parent`.
    ///
    /// # Safety
    ///
    /// `buf..buf+len` must lie inside `parent`'s payload and `parent` must
    /// be a live astring/ustring/rawstring of the matching kind.
    pub unsafe fn new_string_slice(
        &mut self,
        kind: u32,
        parent: *mut HeapObject,
        buf: *const u8,
        len: u32,
    ) -> Option<NonNull<HeapObject>> {
        let obj = self.alloc_pool_slot()?;
        // SAFETY: freshly allocated slot; parent is live per the contract.
        unsafe {
            match kind {
                TYPE_ASTRING_SLICE => {
                    (*obj.as_ptr()).astring_slice = AstringSliceObject {
                        header: ObjHeader {
                            type_id: TYPE_ASTRING_SLICE,
                            rc: 1,
                        },
                        buf,
                        len,
                        _pad: 0,
                        parent,
                    }
                }
                TYPE_USTRING_SLICE => {
                    let char_len =
                        utf8_char_len(std::slice::from_raw_parts(buf, len as usize));
                    (*obj.as_ptr()).ustring_slice = UstringSliceObject {
                        header: ObjHeader {
                            type_id: TYPE_USTRING_SLICE,
                            rc: 1,
                        },
                        buf,
                        len,
                        char_len,
                        parent,
                    }
                }
                TYPE_RAWSTRING_SLICE => {
                    (*obj.as_ptr()).rawstring_slice = RawStringSliceObject {
                        header: ObjHeader {
                            type_id: TYPE_RAWSTRING_SLICE,
                            rc: 1,
                        },
                        buf,
                        len,
                        _pad: 0,
                        parent,
                    }
                }
                _ => unreachable!("not a slice kind"),
            }
            (*parent).common.rc += 1;
        }
        self.global_rc += 2;
        Some(obj)
    }
}

/// Bytes of any managed (heap) string kind.
///
/// # Safety
///
/// `ptr` must point at a live string or string-slice object.
pub unsafe fn heap_string_bytes<'a>(ptr: *mut HeapObject) -> &'a [u8] {
    // SAFETY: per the contract; payload/buf pointers are valid for len.
    unsafe {
        match (*ptr).common.type_id {
            TYPE_ASTRING => std::slice::from_raw_parts(
                string_payload(ptr, ASTRING_FIXED),
                (*ptr).astring.len as usize,
            ),
            TYPE_USTRING => std::slice::from_raw_parts(
                string_payload(ptr, USTRING_FIXED),
                (*ptr).ustring.len as usize,
            ),
            TYPE_RAWSTRING => std::slice::from_raw_parts(
                string_payload(ptr, RAWSTRING_FIXED),
                (*ptr).rawstring.len as usize,
            ),
            TYPE_ASTRING_SLICE => std::slice::from_raw_parts(
                (*ptr).astring_slice.buf,
                (*ptr).astring_slice.len as usize,
            ),
            TYPE_USTRING_SLICE => std::slice::from_raw_parts(
                (*ptr).ustring_slice.buf,
                (*ptr).ustring_slice.len as usize,
            ),
            TYPE_RAWSTRING_SLICE => std::slice::from_raw_parts(
                (*ptr).rawstring_slice.buf,
                (*ptr).rawstring_slice.len as usize,
            ),
            other => unreachable!("not a string kind: {other}"),
        }
    }
}

/// Char index into a live ustring object, updating its MRU cache.
///
/// # Safety
///
/// `ptr` must point at a live ustring object.
pub unsafe fn ustring_char_at(ptr: *mut HeapObject, target_char: u32) -> Option<char> {
    // SAFETY: per the contract.
    unsafe {
        let bytes = heap_string_bytes(ptr);
        let us = &mut (*ptr).ustring;
        if target_char >= us.char_len {
            return None;
        }
        let byte_idx =
            seek_char_index(bytes, us.mru_byte_idx as u32, us.mru_char_idx as u32, target_char)?;
        // The inline MRU words are 16-bit; skip the cache update for
        // positions past that range instead of truncating.
        if byte_idx <= u16::MAX as u32 && target_char <= u16::MAX as u32 {
            us.mru_byte_idx = byte_idx as u16;
            us.mru_char_idx = target_char as u16;
        }
        let tail = std::str::from_utf8_unchecked(&bytes[byte_idx as usize..]);
        tail.chars().next()
    }
}
