//! Reference counting and kind-dispatched object destruction.
//!
//! `retain`/`release` guard on the pointer tag so they are safe to call on
//! any value. When a count hits zero the kind-specific free path runs:
//! release contained children, drop the intern entry when the map still
//! points at this exact object, then return the storage to the pool or
//! the general allocator (chosen by the same size-category check the
//! allocation made).
//!
//! The heap's `global_rc` counter tracks every retain/release pair; it is
//! the diagnostic the refcount-balance tests read.

use crate::vm::Vm;
use smallvec::SmallVec;
use vesper_core::Value;
use vesper_runtime::list;
use vesper_runtime::object::*;
use vesper_runtime::string::{
    heap_string_bytes, ASTRING_FIXED, RAWSTRING_FIXED, USTRING_FIXED,
};
use vesper_runtime::INTERN_MAX_LEN;

impl Vm {
    /// Increment the target's rc when `v` is a pointer.
    #[inline]
    pub fn retain(&mut self, v: Value) {
        if v.is_pointer() {
            // SAFETY: pointer values always target live objects.
            unsafe {
                let obj = v.as_pointer::<HeapObject>();
                debug_assert_ne!(type_of(obj), TYPE_FREE);
                (*obj).common.rc += 1;
            }
            self.heap.global_rc += 1;
        }
    }

    /// Batched retain.
    #[inline]
    pub fn retain_inc(&mut self, v: Value, n: u32) {
        if v.is_pointer() && n > 0 {
            // SAFETY: pointer values always target live objects.
            unsafe {
                (*v.as_pointer::<HeapObject>()).common.rc += n;
            }
            self.heap.global_rc += n as u64;
        }
    }

    /// Decrement the target's rc when `v` is a pointer, freeing at zero.
    #[inline]
    pub fn release(&mut self, v: Value) {
        if v.is_pointer() {
            // SAFETY: pointer values always target live objects.
            unsafe { self.release_object(v.as_pointer()) };
        }
    }

    /// Decrement an object's rc directly, freeing at zero.
    ///
    /// # Safety
    ///
    /// `obj` must point at a live heap object with `rc ≥ 1`.
    pub(crate) unsafe fn release_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per the contract.
        unsafe {
            debug_assert_ne!(type_of(obj), TYPE_FREE);
            debug_assert!((*obj).common.rc >= 1);
            (*obj).common.rc -= 1;
            self.heap.global_rc -= 1;
            if (*obj).common.rc == 0 {
                self.free_object(obj);
            }
        }
    }

    /// Kind-dispatched destructor.
    ///
    /// # Safety
    ///
    /// `obj` must point at a live heap object whose rc just reached zero.
    pub(crate) unsafe fn free_object(&mut self, obj: *mut HeapObject) {
        // SAFETY: per the contract; every branch tears down exactly the
        // storage its kind allocated.
        unsafe {
            let type_id = type_of(obj);
            match type_id {
                TYPE_LIST => {
                    let elems = (*obj).list.elems;
                    let len = (*obj).list.len as usize;
                    let cap = (*obj).list.cap as usize;
                    for i in 0..len {
                        self.release(*elems.add(i));
                    }
                    list::free_elems(elems, cap);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_LIST_ITER => {
                    let parent = (*obj).list_iter.list;
                    self.release_object(parent);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_MAP => {
                    let map = Box::from_raw((*obj).map.map);
                    let mut idx = 0;
                    while let Some((at, key, val)) = map.next_entry(idx) {
                        self.release(key);
                        self.release(val);
                        idx = at + 1;
                    }
                    drop(map);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_MAP_ITER => {
                    let parent = (*obj).map_iter.map;
                    self.release_object(parent);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_CLOSURE => {
                    let n = (*obj).closure.num_captured as usize;
                    let captured = closure_captured(obj as *mut ClosureObject);
                    for i in 0..n {
                        self.release(*captured.add(i));
                    }
                    if n <= CLOSURE_POOL_MAX_CAPTURED {
                        self.heap.free_pool_slot(obj);
                    } else {
                        let size = std::mem::size_of::<ClosureObject>() + n * 8;
                        self.heap.free_large(obj, size);
                    }
                }
                TYPE_LAMBDA | TYPE_NATIVE_FUNC | TYPE_OPAQUE_PTR | TYPE_TCC_STATE => {
                    self.heap.free_pool_slot(obj);
                }
                TYPE_ASTRING => {
                    let len = (*obj).astring.len as usize;
                    if len <= INTERN_MAX_LEN {
                        // Copy the bytes out before the slot is reused.
                        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
                        buf.extend_from_slice(heap_string_bytes(obj));
                        self.heap.intern.remove_if_same(&buf, obj);
                    }
                    if len <= ASTRING_POOL_MAX {
                        self.heap.free_pool_slot(obj);
                    } else {
                        self.heap.free_large(obj, ASTRING_FIXED + len);
                    }
                }
                TYPE_USTRING => {
                    let len = (*obj).ustring.len as usize;
                    if len <= INTERN_MAX_LEN {
                        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
                        buf.extend_from_slice(heap_string_bytes(obj));
                        self.heap.intern.remove_if_same(&buf, obj);
                    }
                    if len <= USTRING_POOL_MAX {
                        self.heap.free_pool_slot(obj);
                    } else {
                        self.heap.free_large(obj, USTRING_FIXED + len);
                    }
                }
                TYPE_RAWSTRING => {
                    let len = (*obj).rawstring.len as usize;
                    if len <= RAWSTRING_POOL_MAX {
                        self.heap.free_pool_slot(obj);
                    } else {
                        self.heap.free_large(obj, RAWSTRING_FIXED + len);
                    }
                }
                TYPE_ASTRING_SLICE => {
                    let parent = (*obj).astring_slice.parent;
                    self.release_object(parent);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_USTRING_SLICE => {
                    let parent = (*obj).ustring_slice.parent;
                    self.release_object(parent);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_RAWSTRING_SLICE => {
                    let parent = (*obj).rawstring_slice.parent;
                    self.release_object(parent);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_FIBER => {
                    self.release_fiber_stack(obj as *mut FiberObject);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_BOX => {
                    let inner = (*obj).boxed.value;
                    self.release(inner);
                    self.heap.free_pool_slot(obj);
                }
                TYPE_FILE => {
                    let handle = (*obj).file.handle;
                    if !handle.is_null() {
                        drop(Box::from_raw(handle));
                    }
                    self.heap.free_pool_slot(obj);
                }
                TYPE_DIR => {
                    let path = (*obj).dir.path;
                    if !path.is_null() {
                        drop(Box::from_raw(path));
                    }
                    self.heap.free_pool_slot(obj);
                }
                TYPE_DIR_ITER => {
                    let iter = (*obj).dir_iter.iter;
                    if !iter.is_null() {
                        drop(Box::from_raw(iter));
                    }
                    self.heap.free_pool_slot(obj);
                }
                _ => {
                    debug_assert!(type_id >= FIRST_USER_TYPE, "freeing unknown kind");
                    let n = self.syms.struct_num_fields(type_id) as usize;
                    let fields = user_object_fields(obj as *mut UserObject);
                    for i in 0..n {
                        self.release(*fields.add(i));
                    }
                    if n <= USER_OBJECT_POOL_MAX_FIELDS {
                        self.heap.free_pool_slot(obj);
                    } else {
                        let size = std::mem::size_of::<UserObject>() + n * 8;
                        self.heap.free_large(obj, size);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::END_NO_RESULT;
    use vesper_bytecode::{OpCode, ProgramBuilder};

    fn test_vm() -> Vm {
        let mut b = ProgramBuilder::new();
        b.op(OpCode::End).u8(END_NO_RESULT);
        Vm::new(b.build())
    }

    #[test]
    fn test_retain_release_balances_global_rc() {
        let mut vm = test_vm();
        let v = vm.heap.get_or_intern_string(b"balanced").unwrap();
        let base = vm.global_rc();
        vm.retain(v);
        assert_eq!(vm.global_rc(), base + 1);
        vm.release(v);
        assert_eq!(vm.global_rc(), base);
        vm.release(v);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn test_retain_release_noop_on_primitives() {
        let mut vm = test_vm();
        vm.retain(Value::number(3.0));
        vm.release(Value::NONE);
        vm.retain_inc(Value::TRUE, 5);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn test_string_free_removes_intern_entry() {
        let mut vm = test_vm();
        let v = vm.heap.get_or_intern_string(b"ephemeral").unwrap();
        assert_eq!(vm.heap.intern.len(), 1);
        vm.release(v);
        assert_eq!(vm.heap.intern.len(), 0);
        assert_eq!(vm.heap.live_object_count(), 0);
    }

    #[test]
    fn test_large_string_free_uses_large_path() {
        let mut vm = test_vm();
        let bytes = vec![b'q'; 200];
        let obj = vm.heap.new_astring(&bytes).unwrap();
        assert_eq!(vm.heap.stats.large_allocated, 1);
        vm.release(Value::pointer(obj.as_ptr()));
        assert_eq!(vm.heap.stats.large_freed, 1);
    }

    #[test]
    fn test_box_releases_inner() {
        let mut vm = test_vm();
        let inner = vm.heap.get_or_intern_string(b"inside").unwrap();
        let slot = vm.heap.alloc_pool_slot().unwrap();
        unsafe {
            (*slot.as_ptr()).boxed = BoxObject {
                header: ObjHeader {
                    type_id: TYPE_BOX,
                    rc: 1,
                },
                value: inner,
            };
        }
        vm.heap.global_rc += 1;
        vm.release(Value::pointer(slot.as_ptr()));
        assert_eq!(vm.global_rc(), 0);
        assert_eq!(vm.heap.live_object_count(), 0);
    }

    #[test]
    fn test_retain_inc_batches() {
        let mut vm = test_vm();
        let v = vm.heap.get_or_intern_string(b"many").unwrap();
        vm.retain_inc(v, 3);
        assert_eq!(vm.global_rc(), 4);
        for _ in 0..4 {
            vm.release(v);
        }
        assert_eq!(vm.global_rc(), 0);
        assert_eq!(vm.heap.live_object_count(), 0);
    }
}
