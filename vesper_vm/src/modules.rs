//! Module interface and the built-in `core` module.
//!
//! A module maps names to either a constant value binding or a native
//! function descriptor. Modules are registered with a loader hook and
//! loaded eagerly: the loader runs immediately, populating the module,
//! and the VM folds the result into its symbol tables (vars into the
//! variable table, natives into the function table).
//!
//! # Native ABI
//!
//! ```text
//! fn(vm, args_ptr, num_args) -> Value            plain function
//! fn(vm, receiver, args_ptr, num_args) -> Value  object method
//! fn(vm, receiver, args_ptr, num_args) -> [Value; 2]   two-result method
//! ```
//!
//! Returning [`Value::PANIC`] asks the VM to raise Panic with the message
//! previously set via [`Vm::set_panic_msg`]. Natives run to completion
//! atomically; re-entrant allocation is fine as long as rc and pool
//! invariants hold on return.

use crate::symbols::{FuncSymbol, MethodEntry};
use crate::vm::Vm;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use vesper_core::Value;
use vesper_runtime::object::{
    type_of, HeapObject, ListIterObject, MapIterObject, ObjHeader, TYPE_ASTRING,
    TYPE_ASTRING_SLICE, TYPE_LIST, TYPE_LIST_ITER, TYPE_MAP, TYPE_MAP_ITER,
    TYPE_RAWSTRING, TYPE_RAWSTRING_SLICE, TYPE_USTRING, TYPE_USTRING_SLICE,
};
use vesper_runtime::{list, FIRST_USER_TYPE};

/// Plain native function.
pub type NativeFn = fn(&mut Vm, *const Value, u8) -> Value;
/// Native object method.
pub type NativeObjFn = fn(&mut Vm, *mut HeapObject, *const Value, u8) -> Value;
/// Native object method returning two results.
pub type NativeObjFn2 = fn(&mut Vm, *mut HeapObject, *const Value, u8) -> [Value; 2];

/// One module binding.
#[derive(Clone, Copy)]
pub enum ModuleSym {
    /// Constant value binding.
    Var(Value),
    /// Native function descriptor.
    NativeFunc { func: NativeFn, num_params: u8 },
}

/// A named set of bindings, populated by a loader hook.
#[derive(Default)]
pub struct Module {
    syms: FxHashMap<Arc<str>, ModuleSym>,
}

/// Initializer hook invoked at registration.
pub type ModuleLoader = fn(&mut Vm, &mut Module);

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.syms.insert(Arc::from(name), ModuleSym::Var(value));
    }

    pub fn set_native_func(&mut self, name: &str, num_params: u8, func: NativeFn) {
        self.syms
            .insert(Arc::from(name), ModuleSym::NativeFunc { func, num_params });
    }

    pub fn syms(&self) -> &FxHashMap<Arc<str>, ModuleSym> {
        &self.syms
    }
}

impl Vm {
    /// Register a module and fold its bindings into the symbol tables.
    pub fn register_module(&mut self, name: &str, loader: ModuleLoader) {
        let mut module = Module::new();
        loader(self, &mut module);
        for (sym_name, sym) in module.syms.iter() {
            match *sym {
                ModuleSym::Var(value) => {
                    let id = self.syms.ensure_var_sym(sym_name);
                    self.retain(value);
                    let old = self.syms.set_var_value(id, value);
                    self.release(old);
                }
                ModuleSym::NativeFunc { func, num_params } => {
                    let id = self.syms.ensure_func_sym(sym_name, num_params);
                    self.syms.bind_func(id, FuncSymbol::Native { func, num_params });
                }
            }
        }
        self.modules.insert(Arc::from(name), module);
    }
}

// =============================================================================
// Core module
// =============================================================================

/// Install the `core` module: plain natives plus the method symbols for
/// the built-in container and string kinds.
pub(crate) fn install_core(vm: &mut Vm) {
    vm.register_module("core", |_vm, module| {
        module.set_native_func("print", 1, native_print);
        module.set_native_func("typeof", 1, native_typeof);
        module.set_native_func("checkMemory", 0, native_check_memory);
    });

    let append = vm.syms.ensure_method_sym("append");
    let len = vm.syms.ensure_method_sym("len");
    let iterator = vm.syms.ensure_method_sym("iterator");
    let next = vm.syms.ensure_method_sym("next");
    let remove = vm.syms.ensure_method_sym("remove");

    vm.syms.bind_method(TYPE_LIST, append, MethodEntry::Native1(list_append));
    vm.syms.bind_method(TYPE_LIST, len, MethodEntry::Native1(list_len));
    vm.syms
        .bind_method(TYPE_LIST, iterator, MethodEntry::Native1(list_iterator));
    vm.syms
        .bind_method(TYPE_LIST_ITER, next, MethodEntry::Native1(list_iter_next));

    vm.syms.bind_method(TYPE_MAP, len, MethodEntry::Native1(map_len));
    vm.syms.bind_method(TYPE_MAP, remove, MethodEntry::Native1(map_remove));
    vm.syms
        .bind_method(TYPE_MAP, iterator, MethodEntry::Native1(map_iterator));
    vm.syms
        .bind_method(TYPE_MAP_ITER, next, MethodEntry::Native1(map_iter_next));

    for str_type in [
        TYPE_ASTRING,
        TYPE_USTRING,
        TYPE_RAWSTRING,
        TYPE_ASTRING_SLICE,
        TYPE_USTRING_SLICE,
        TYPE_RAWSTRING_SLICE,
    ] {
        vm.syms.bind_method(str_type, len, MethodEntry::Native1(string_len));
    }
}

// ── Plain natives ──────────────────────────────────────────────────────

fn native_print(vm: &mut Vm, args: *const Value, nargs: u8) -> Value {
    if nargs != 1 {
        vm.set_panic_msg("print expects one argument");
        return Value::PANIC;
    }
    // SAFETY: the dispatch loop passes a valid args window.
    let arg = unsafe { *args };
    println!("{}", vm.value_display(arg));
    Value::NONE
}

fn native_typeof(vm: &mut Vm, args: *const Value, nargs: u8) -> Value {
    if nargs != 1 {
        vm.set_panic_msg("typeof expects one argument");
        return Value::PANIC;
    }
    // SAFETY: the dispatch loop passes a valid args window.
    let arg = unsafe { *args };
    let name = vm.type_name(arg);
    match vm.heap.get_or_intern_string(name.as_bytes()) {
        Some(v) => v,
        None => {
            vm.set_panic_msg("out of memory");
            Value::PANIC
        }
    }
}

fn native_check_memory(vm: &mut Vm, _args: *const Value, _nargs: u8) -> Value {
    let report = vm.check_memory();
    Value::boolean(report.clean)
}

// ── List methods ───────────────────────────────────────────────────────

fn list_append(vm: &mut Vm, recv: *mut HeapObject, args: *const Value, nargs: u8) -> Value {
    if nargs != 1 {
        vm.set_panic_msg("append expects one argument");
        return Value::PANIC;
    }
    // SAFETY: recv is a live list (method dispatch checked the type id);
    // the args window holds one value.
    unsafe {
        let arg = *args;
        vm.retain(arg);
        list::push(&mut (*recv).list, arg);
    }
    Value::NONE
}

fn list_len(_vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    // SAFETY: recv is a live list.
    Value::number(unsafe { (*recv).list.len } as f64)
}

fn list_iterator(vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    let Some(obj) = vm.heap.alloc_pool_slot() else {
        vm.set_panic_msg("out of memory");
        return Value::PANIC;
    };
    // SAFETY: fresh slot; recv stays live through the retain.
    unsafe {
        (*obj.as_ptr()).list_iter = ListIterObject {
            header: ObjHeader {
                type_id: TYPE_LIST_ITER,
                rc: 1,
            },
            list: recv,
            next_idx: 0,
            _pad: 0,
        };
        (*recv).common.rc += 1;
    }
    vm.heap.global_rc += 2;
    Value::pointer(obj.as_ptr())
}

fn list_iter_next(vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    // SAFETY: recv is a live list iterator; its parent list is retained.
    unsafe {
        let iter = &mut (*recv).list_iter;
        let parent = &(*iter.list).list;
        if iter.next_idx >= parent.len {
            return Value::NONE;
        }
        let v = *parent.elems.add(iter.next_idx as usize);
        iter.next_idx += 1;
        vm.retain(v);
        v
    }
}

// ── Map methods ────────────────────────────────────────────────────────

fn map_len(_vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    // SAFETY: recv is a live map.
    Value::number(unsafe { (*(*recv).map.map).len() } as f64)
}

fn map_remove(vm: &mut Vm, recv: *mut HeapObject, args: *const Value, nargs: u8) -> Value {
    if nargs != 1 {
        vm.set_panic_msg("remove expects one argument");
        return Value::PANIC;
    }
    // SAFETY: recv is a live map; the args window holds the key.
    unsafe {
        let key = *args;
        let hash = vm.value_hash(key);
        let map = &mut *(*recv).map.map;
        match map.remove(hash, |k| vm.values_eq(k, key)) {
            Some((stored_key, old_val)) => {
                vm.release(stored_key);
                vm.release(old_val);
                Value::TRUE
            }
            None => Value::FALSE,
        }
    }
}

fn map_iterator(vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    let Some(obj) = vm.heap.alloc_pool_slot() else {
        vm.set_panic_msg("out of memory");
        return Value::PANIC;
    };
    // SAFETY: fresh slot; recv stays live through the retain.
    unsafe {
        (*obj.as_ptr()).map_iter = MapIterObject {
            header: ObjHeader {
                type_id: TYPE_MAP_ITER,
                rc: 1,
            },
            map: recv,
            next_idx: 0,
            _pad: 0,
        };
        (*recv).common.rc += 1;
    }
    vm.heap.global_rc += 2;
    Value::pointer(obj.as_ptr())
}

/// Yields keys; indexing the map retrieves values.
fn map_iter_next(vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    // SAFETY: recv is a live map iterator; its parent map is retained.
    unsafe {
        let iter = &mut (*recv).map_iter;
        let map = &*(*iter.map).map.map;
        match map.next_entry(iter.next_idx as usize) {
            Some((at, key, _val)) => {
                iter.next_idx = at as u32 + 1;
                vm.retain(key);
                key
            }
            None => Value::NONE,
        }
    }
}

// ── String methods ─────────────────────────────────────────────────────

/// Code-point length for the UTF-8 kinds, byte length otherwise.
fn string_len(_vm: &mut Vm, recv: *mut HeapObject, _args: *const Value, _nargs: u8) -> Value {
    // SAFETY: recv is a live string kind.
    unsafe {
        let n = match type_of(recv) {
            TYPE_USTRING => (*recv).ustring.char_len,
            TYPE_USTRING_SLICE => (*recv).ustring_slice.char_len,
            TYPE_ASTRING => (*recv).astring.len,
            TYPE_ASTRING_SLICE => (*recv).astring_slice.len,
            TYPE_RAWSTRING => (*recv).rawstring.len,
            _ => (*recv).rawstring_slice.len,
        };
        Value::number(n as f64)
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────

impl Vm {
    /// Human-readable type name of any value.
    pub fn type_name(&self, v: Value) -> &'static str {
        use vesper_core::Tag;
        if v.is_pointer() {
            // SAFETY: script-visible pointers always target live objects.
            return match unsafe { type_of(v.as_pointer()) } {
                TYPE_LIST => "list",
                TYPE_LIST_ITER => "list-iterator",
                TYPE_MAP => "map",
                TYPE_MAP_ITER => "map-iterator",
                vesper_runtime::TYPE_CLOSURE => "closure",
                vesper_runtime::TYPE_LAMBDA => "lambda",
                TYPE_ASTRING | TYPE_USTRING | TYPE_ASTRING_SLICE | TYPE_USTRING_SLICE => {
                    "string"
                }
                TYPE_RAWSTRING | TYPE_RAWSTRING_SLICE => "rawstring",
                vesper_runtime::TYPE_FIBER => "fiber",
                vesper_runtime::TYPE_BOX => "box",
                vesper_runtime::TYPE_NATIVE_FUNC => "native-function",
                vesper_runtime::TYPE_OPAQUE_PTR => "opaque",
                vesper_runtime::TYPE_FILE => "file",
                vesper_runtime::TYPE_DIR => "dir",
                vesper_runtime::TYPE_DIR_ITER => "dir-iterator",
                vesper_runtime::TYPE_TCC_STATE => "tcc-state",
                t if t >= FIRST_USER_TYPE => "object",
                _ => "unknown",
            };
        }
        if v.is_number() {
            return "number";
        }
        match v.tag() {
            Tag::None => "none",
            Tag::Bool => "bool",
            Tag::Integer => "int",
            Tag::Error => "error",
            Tag::Symbol => "tag",
            Tag::Enum => "tag",
            Tag::StaticAstring | Tag::StaticUstring => "string",
            _ => "unknown",
        }
    }
}
