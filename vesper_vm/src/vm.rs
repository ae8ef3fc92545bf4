//! The runtime instance.
//!
//! One `Vm` per embedding. It owns the heap, the program, the symbol
//! tables, the fiber chain, and the active execution registers
//! (`stack`/`fp`/`pc`), which the dispatch loop caches in locals and
//! writes back at every boundary (call into the VM, fiber switch, loop
//! exit).

use crate::modules::{install_core, Module};
use crate::profiler::OpProfiler;
use crate::stack::{
    alloc_stack, free_stack, pack_ret_info, DEFAULT_STACK_CAP, FRAME_RET_FP,
    FRAME_RET_INFO, FRAME_RET_PC,
};
use crate::symbols::SymbolTables;
use crate::trace::PanicPayload;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use vesper_bytecode::Program;
use vesper_core::{Tag, Value, VesperError, VesperResult};
use vesper_runtime::object::{type_of, FiberObject, NO_PARENT_DST, TYPE_FIBER};
use vesper_runtime::string::heap_string_bytes;
use vesper_runtime::{Heap, HeapObject, ObjHeader};

/// `End` operand meaning "the program produces no value".
pub const END_NO_RESULT: u8 = 0xff;

/// Loop-internal failure channel. `Ok(())` from the loop means normal
/// termination (`End`, or a `ret` with the ret flag set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmError {
    /// The next frame would exceed the stack; the outer wrapper grows the
    /// stack and re-enters at the same pc.
    StackOverflow,
    /// The panic slot is set; unwind and exit.
    Panic,
    /// The allocator failed; the VM state is undefined from here on.
    OutOfMemory,
}

/// Pre-interned error-tag ids.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTags {
    pub invalid_signature: u32,
    pub index_out_of_bounds: u32,
    pub field_missing: u32,
    pub not_found: u32,
    pub out_of_memory: u32,
}

pub struct Vm {
    pub heap: Heap,
    pub program: Program,
    pub syms: SymbolTables,
    pub profiler: OpProfiler,
    pub error_tags: ErrorTags,

    // Active execution registers.
    pub(crate) stack: *mut Value,
    pub(crate) stack_cap: usize,
    pub(crate) fp: *mut Value,
    pub(crate) pc: usize,
    pub(crate) initial_stack_cap: usize,

    // Fibers. The main fiber is boxed, never pool-allocated, and never
    // visible to scripts.
    pub(crate) main_fiber: Box<FiberObject>,
    pub(crate) cur_fiber: *mut FiberObject,

    pub(crate) panic: PanicPayload,
    pub(crate) end_result: Value,
    pub(crate) modules: FxHashMap<Arc<str>, Module>,
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self::with_stack_size(program, DEFAULT_STACK_CAP)
    }

    /// Create a VM whose main fiber starts with `stack_cap` value slots.
    pub fn with_stack_size(program: Program, stack_cap: usize) -> Self {
        let mut syms = SymbolTables::new();
        let error_tags = ErrorTags {
            invalid_signature: syms.ensure_tag_lit("InvalidSignature"),
            index_out_of_bounds: syms.ensure_tag_lit("IndexOutOfBounds"),
            field_missing: syms.ensure_tag_lit("FieldMissing"),
            not_found: syms.ensure_tag_lit("NotFound"),
            out_of_memory: syms.ensure_tag_lit("OutOfMemory"),
        };
        let mut main_fiber = Box::new(FiberObject {
            header: ObjHeader {
                type_id: TYPE_FIBER,
                rc: 1,
            },
            prev: std::ptr::null_mut(),
            stack: std::ptr::null_mut(),
            stack_cap: 0,
            pc: 0,
            fp_off: 0,
            parent_dst_local: NO_PARENT_DST,
            num_args: 0,
            started: 1,
            _pad: 0,
        });
        let cur_fiber: *mut FiberObject = &mut *main_fiber;
        let mut vm = Vm {
            heap: Heap::new(),
            program,
            syms,
            profiler: OpProfiler::new(),
            error_tags,
            stack: std::ptr::null_mut(),
            stack_cap: 0,
            fp: std::ptr::null_mut(),
            pc: 0,
            initial_stack_cap: stack_cap.max(8),
            main_fiber,
            cur_fiber,
            panic: PanicPayload::None,
            end_result: Value::NONE,
            modules: FxHashMap::default(),
        };
        install_core(&mut vm);
        vm
    }

    // ── Execution ──────────────────────────────────────────────────────

    /// Run the program from pc 0 in the main fiber.
    pub fn execute(&mut self) -> VesperResult<Value> {
        if self.stack.is_null() {
            let stack = alloc_stack(self.initial_stack_cap);
            if stack.is_null() {
                return Err(VesperError::OutOfMemory);
            }
            self.stack = stack;
            self.stack_cap = self.initial_stack_cap;
        }
        self.fp = self.stack;
        self.pc = 0;
        self.end_result = Value::NONE;
        // SAFETY: the stack was just allocated with ≥ 8 slots.
        unsafe {
            *self.fp.add(FRAME_RET_INFO) = pack_ret_info(0, true);
            *self.fp.add(FRAME_RET_PC) = Value::from_raw(0);
            *self.fp.add(FRAME_RET_FP) = Value::from_raw(self.stack as u64);
        }
        loop {
            match self.run_loop() {
                Ok(()) => return Ok(self.end_result),
                Err(VmError::StackOverflow) => {
                    // Grow with headroom for the largest frame and retry
                    // the same instruction.
                    if !self.grow_stack(self.stack_cap + 512) {
                        self.set_panic_msg("stack overflow");
                        return Err(self.take_panic_error());
                    }
                }
                Err(VmError::Panic) => return Err(self.take_panic_error()),
                Err(VmError::OutOfMemory) => return Err(VesperError::OutOfMemory),
            }
        }
    }

    // ── Panic helpers ──────────────────────────────────────────────────

    /// Stash a panic message for a subsequent [`Value::PANIC`] return or
    /// [`VmError::Panic`].
    pub fn set_panic_msg(&mut self, msg: impl Into<String>) {
        self.panic = PanicPayload::Msg(msg.into());
    }

    /// Enter the panic state with a message.
    #[cold]
    pub(crate) fn panic_with(&mut self, msg: impl Into<String>) -> VmError {
        self.panic = PanicPayload::Msg(msg.into());
        VmError::Panic
    }

    /// Enter the panic state with an unhandled error value.
    #[cold]
    pub(crate) fn panic_err(&mut self, err: Value) -> VmError {
        self.panic = PanicPayload::Err(err);
        VmError::Panic
    }

    // ── Value inspection helpers ───────────────────────────────────────

    /// Copy a value's string bytes into `buf`; false when not a string.
    pub fn value_str_bytes(&self, v: Value, buf: &mut SmallVec<[u8; 64]>) -> bool {
        if v.is_pointer() {
            // SAFETY: script-visible pointers target live objects.
            unsafe {
                let ptr = v.as_pointer::<HeapObject>();
                match type_of(ptr) {
                    vesper_runtime::TYPE_ASTRING
                    | vesper_runtime::TYPE_USTRING
                    | vesper_runtime::TYPE_RAWSTRING
                    | vesper_runtime::TYPE_ASTRING_SLICE
                    | vesper_runtime::TYPE_USTRING_SLICE
                    | vesper_runtime::TYPE_RAWSTRING_SLICE => {
                        buf.extend_from_slice(heap_string_bytes(ptr));
                        return true;
                    }
                    _ => return false,
                }
            }
        }
        if v.is_static_string() {
            let (start, len) = v.static_string_parts();
            buf.extend_from_slice(self.program.static_str_bytes(start, len));
            return true;
        }
        false
    }

    /// Hash for map keys: strings hash their bytes, everything else its
    /// raw bits.
    pub fn value_hash(&self, v: Value) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
        if self.value_str_bytes(v, &mut buf) {
            buf.as_slice().hash(&mut hasher);
        } else {
            v.raw().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Map-key equality: byte equality for strings, bit equality
    /// otherwise.
    pub fn values_eq(&self, a: Value, b: Value) -> bool {
        if a.raw() == b.raw() {
            return true;
        }
        let mut ab: SmallVec<[u8; 64]> = SmallVec::new();
        let mut bb: SmallVec<[u8; 64]> = SmallVec::new();
        if self.value_str_bytes(a, &mut ab) && self.value_str_bytes(b, &mut bb) {
            return ab == bb;
        }
        false
    }

    /// Full numeric coercion: numbers pass through, bool/none/int coerce,
    /// strings parse (0.0 on parse failure), other pointers coerce to 0.
    pub fn value_to_f64(&self, v: Value) -> f64 {
        if let Some(n) = v.to_f64() {
            return n;
        }
        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
        if self.value_str_bytes(v, &mut buf) {
            return std::str::from_utf8(&buf)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
        }
        0.0
    }

    /// Display formatting for `print` and friends.
    pub fn value_display(&self, v: Value) -> String {
        if v.is_number() {
            let n = v.as_f64();
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                return format!("{}", n as i64);
            }
            return format!("{n}");
        }
        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
        if self.value_str_bytes(v, &mut buf) {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        if v.is_pointer() {
            // SAFETY: script-visible pointers target live objects.
            unsafe {
                let ptr = v.as_pointer::<HeapObject>();
                return match type_of(ptr) {
                    vesper_runtime::TYPE_LIST => {
                        format!("list(len={})", (*ptr).list.len)
                    }
                    vesper_runtime::TYPE_MAP => {
                        format!("map(len={})", (*(*ptr).map.map).len())
                    }
                    _ => self.type_name(v).to_string(),
                };
            }
        }
        match v.tag() {
            Tag::None => "none".to_string(),
            Tag::Bool => v.as_bool().to_string(),
            Tag::Integer => v.as_i32().to_string(),
            Tag::Error => format!("error.{}", self.syms.tag_lit_name(v.error_tag())),
            Tag::Symbol => format!("#{}", self.syms.tag_lit_name(v.symbol_id())),
            Tag::Enum => {
                let (t, m) = v.enum_parts();
                format!("tag({t}.{m})")
            }
            _ => "<value>".to_string(),
        }
    }

    // ── Test and embedder hooks ────────────────────────────────────────

    /// Absolute stack slot, for tests inspecting results after `execute`.
    pub fn stack_value(&self, idx: usize) -> Value {
        assert!(idx < self.stack_cap, "stack index out of range");
        // SAFETY: idx is in range and the region stays allocated for the
        // VM's lifetime.
        unsafe { *self.stack.add(idx) }
    }

    /// The diagnostic process-wide reference count.
    pub fn global_rc(&self) -> u64 {
        self.heap.global_rc
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // SAFETY: the region came from alloc_stack with this capacity.
        unsafe { free_stack(self.stack, self.stack_cap) };
        self.stack = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_bytecode::ProgramBuilder;

    fn empty_vm() -> Vm {
        let mut b = ProgramBuilder::new();
        b.op(vesper_bytecode::OpCode::End).u8(END_NO_RESULT);
        Vm::new(b.build())
    }

    #[test]
    fn test_execute_empty_program() {
        let mut vm = empty_vm();
        let out = vm.execute().unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_error_tags_preinterned() {
        let vm = empty_vm();
        assert_eq!(
            vm.syms.tag_lit_name(vm.error_tags.invalid_signature),
            "InvalidSignature"
        );
        assert_eq!(
            vm.syms.tag_lit_name(vm.error_tags.index_out_of_bounds),
            "IndexOutOfBounds"
        );
    }

    #[test]
    fn test_value_to_f64_string_parse() {
        let mut b = ProgramBuilder::new();
        let s = b.static_astring("12.5");
        let junk = b.static_astring("pear");
        b.op(vesper_bytecode::OpCode::End).u8(END_NO_RESULT);
        let vm = Vm::new(b.build());
        assert_eq!(vm.value_to_f64(s), 12.5);
        // Parse failure absorbs to 0.0.
        assert_eq!(vm.value_to_f64(junk), 0.0);
        assert_eq!(vm.value_to_f64(Value::TRUE), 1.0);
    }

    #[test]
    fn test_values_eq_across_string_kinds() {
        let mut b = ProgramBuilder::new();
        let s1 = b.static_astring("abc");
        let s2 = b.static_astring("abc");
        b.op(vesper_bytecode::OpCode::End).u8(END_NO_RESULT);
        let mut vm = Vm::new(b.build());
        // Two distinct static slices with equal bytes.
        assert_ne!(s1.raw(), s2.raw());
        assert!(vm.values_eq(s1, s2));
        assert_eq!(vm.value_hash(s1), vm.value_hash(s2));
        // A heap string with the same bytes is equal too.
        let h = vm.heap.get_or_intern_string(b"abc").unwrap();
        assert!(vm.values_eq(s1, h));
        vm.release(h);
    }
}
