//! On-demand cycle detection over the live heap.
//!
//! Reference counting reclaims everything acyclic; lists (and user
//! objects holding lists) can close cycles that never hit rc zero. This
//! pass walks every slot of every page into a node map, DFS-colors the
//! object graph along list elements and user-object fields, collects the
//! target of every back edge as a cycle root, and force-releases each
//! root: the object is deallocated without touching its children and the
//! global rc drops by the object's own count (the object is assumed
//! otherwise unreachable).
//!
//! This is a diagnostic pass, not a collector; the embedder decides when
//! to run it.

use crate::vm::Vm;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use vesper_core::Value;
use vesper_runtime::heap::PAGE_SLOTS;
use vesper_runtime::list;
use vesper_runtime::object::{
    type_of, user_object_fields, HeapObject, UserObject, FIRST_USER_TYPE, TYPE_FREE,
    TYPE_LIST, TYPE_RESERVED,
};

/// Outcome of a [`Vm::check_memory`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// True when no cycle was found.
    pub clean: bool,
    /// Cycle roots that were force-released.
    pub roots_freed: usize,
}

#[derive(Default, Clone, Copy)]
struct RcNode {
    visited: bool,
    entered: bool,
}

impl Vm {
    /// Detect and break reference cycles among live pool objects.
    pub fn check_memory(&mut self) -> CycleReport {
        let mut nodes: FxHashMap<*mut HeapObject, RcNode> = FxHashMap::default();
        let mut live: Vec<*mut HeapObject> = Vec::new();
        for page in self.heap.pages() {
            // SAFETY: pages are live for the heap's lifetime; slot 0 is
            // the reserved guard.
            unsafe {
                let slots = (*page.as_ptr()).slots.as_mut_ptr();
                for i in 1..PAGE_SLOTS {
                    let slot = slots.add(i);
                    let t = type_of(slot);
                    if t != TYPE_FREE && t != TYPE_RESERVED {
                        nodes.insert(slot, RcNode::default());
                        live.push(slot);
                    }
                }
            }
        }

        let mut roots: SmallVec<[*mut HeapObject; 4]> = SmallVec::new();
        for obj in live {
            if !nodes[&obj].visited {
                // SAFETY: obj is a live slot collected above.
                unsafe { self.dfs(obj, &mut nodes, &mut roots) };
            }
        }

        let clean = roots.is_empty();
        for root in &roots {
            // SAFETY: roots are live objects; force_release drops exactly
            // their own storage.
            unsafe { self.force_release(*root) };
        }
        CycleReport {
            clean,
            roots_freed: roots.len(),
        }
    }

    /// # Safety
    ///
    /// `obj` must be a live pool object present in `nodes`.
    unsafe fn dfs(
        &mut self,
        obj: *mut HeapObject,
        nodes: &mut FxHashMap<*mut HeapObject, RcNode>,
        roots: &mut SmallVec<[*mut HeapObject; 4]>,
    ) {
        {
            let node = nodes.get_mut(&obj).expect("node for live object");
            node.entered = true;
        }
        // SAFETY: obj is live per the contract.
        let children = unsafe { object_children(self, obj) };
        for child in children {
            let Some(node) = nodes.get(&child).copied() else {
                // Large objects are outside the pages; skip them.
                continue;
            };
            if node.entered && !node.visited {
                // Back edge: the target roots a cycle.
                if !roots.contains(&child) {
                    roots.push(child);
                }
            } else if !node.visited {
                // SAFETY: child is a live node.
                unsafe { self.dfs(child, nodes, roots) };
            }
        }
        let node = nodes.get_mut(&obj).expect("node for live object");
        node.visited = true;
    }

    /// Deallocate a cycle root without releasing its children, adjusting
    /// the global rc by the root's own count.
    ///
    /// # Safety
    ///
    /// `obj` must be a live list or user object.
    unsafe fn force_release(&mut self, obj: *mut HeapObject) {
        // SAFETY: per the contract.
        unsafe {
            self.heap.global_rc -= (*obj).common.rc as u64;
            match type_of(obj) {
                TYPE_LIST => {
                    list::free_elems((*obj).list.elems, (*obj).list.cap as usize);
                    self.heap.free_pool_slot(obj);
                }
                t if t >= FIRST_USER_TYPE => {
                    let n = self.syms.struct_num_fields(t) as usize;
                    if n <= vesper_runtime::object::USER_OBJECT_POOL_MAX_FIELDS {
                        self.heap.free_pool_slot(obj);
                    } else {
                        let size = std::mem::size_of::<UserObject>() + n * 8;
                        self.heap.free_large(obj, size);
                    }
                }
                other => debug_assert!(false, "cycle root of kind {other}"),
            }
        }
    }
}

/// Pointer-valued children reachable along the cycle-prone edges: list
/// elements and user-object fields.
///
/// # Safety
///
/// `obj` must be a live heap object.
unsafe fn object_children(
    vm: &Vm,
    obj: *mut HeapObject,
) -> SmallVec<[*mut HeapObject; 8]> {
    let mut children: SmallVec<[*mut HeapObject; 8]> = SmallVec::new();
    // SAFETY: per the contract.
    unsafe {
        let t = type_of(obj);
        if t == TYPE_LIST {
            for v in list::elems(&(*obj).list) {
                push_child(&mut children, *v);
            }
        } else if t >= FIRST_USER_TYPE {
            let n = vm.syms.struct_num_fields(t) as usize;
            let fields = user_object_fields(obj as *mut UserObject);
            for i in 0..n {
                push_child(&mut children, *fields.add(i));
            }
        }
    }
    children
}

fn push_child(children: &mut SmallVec<[*mut HeapObject; 8]>, v: Value) {
    if v.is_pointer() {
        // SAFETY: pointer values always target live objects.
        children.push(unsafe { v.as_pointer::<HeapObject>() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::END_NO_RESULT;
    use vesper_bytecode::{OpCode, ProgramBuilder};
    use vesper_runtime::object::{ListObject, ObjHeader};

    fn test_vm() -> Vm {
        let mut b = ProgramBuilder::new();
        b.op(OpCode::End).u8(END_NO_RESULT);
        Vm::new(b.build())
    }

    fn new_list(vm: &mut Vm) -> Value {
        let slot = vm.heap.alloc_pool_slot().unwrap();
        unsafe {
            (*slot.as_ptr()).list = ListObject {
                header: ObjHeader {
                    type_id: TYPE_LIST,
                    rc: 1,
                },
                elems: std::ptr::null_mut(),
                len: 0,
                cap: 0,
            };
        }
        vm.heap.global_rc += 1;
        Value::pointer(slot.as_ptr())
    }

    #[test]
    fn test_clean_heap_reports_clean() {
        let mut vm = test_vm();
        let a = new_list(&mut vm);
        let report = vm.check_memory();
        assert!(report.clean);
        assert_eq!(report.roots_freed, 0);
        vm.release(a);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn test_self_cycle_detected_and_broken() {
        let mut vm = test_vm();
        let a = new_list(&mut vm);
        // a.append(a): the list holds a pointer to itself.
        unsafe {
            let obj = a.as_pointer::<HeapObject>();
            vm.retain(a);
            list::push(&mut (*obj).list, a);
        }
        // Drop the binding; the self edge keeps rc at 1.
        vm.release(a);
        assert_eq!(vm.global_rc(), 1);

        let report = vm.check_memory();
        assert!(!report.clean);
        assert_eq!(report.roots_freed, 1);
        assert_eq!(vm.global_rc(), 0);
        assert_eq!(vm.heap.live_object_count(), 0);
    }

    #[test]
    fn test_two_list_cycle() {
        let mut vm = test_vm();
        let a = new_list(&mut vm);
        let b = new_list(&mut vm);
        unsafe {
            let ap = a.as_pointer::<HeapObject>();
            let bp = b.as_pointer::<HeapObject>();
            vm.retain(b);
            list::push(&mut (*ap).list, b);
            vm.retain(a);
            list::push(&mut (*bp).list, a);
        }
        vm.release(a);
        vm.release(b);
        assert_eq!(vm.global_rc(), 2);

        let report = vm.check_memory();
        assert!(!report.clean);
        // Only the back-edge target is force-released; the other member
        // keeps the count the freed root held on it.
        assert_eq!(report.roots_freed, 1);
        assert_eq!(vm.global_rc(), 1);
    }

    #[test]
    fn test_acyclic_nesting_is_clean() {
        let mut vm = test_vm();
        let outer = new_list(&mut vm);
        let inner = new_list(&mut vm);
        unsafe {
            let op = outer.as_pointer::<HeapObject>();
            vm.retain(inner);
            list::push(&mut (*op).list, inner);
        }
        vm.release(inner);
        let report = vm.check_memory();
        assert!(report.clean);
        vm.release(outer);
        assert_eq!(vm.global_rc(), 0);
        assert_eq!(vm.heap.live_object_count(), 0);
    }
}
