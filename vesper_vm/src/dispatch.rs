//! The bytecode dispatch loop.
//!
//! One tight match over the opcode byte. `pc` and `fp` live in locals and
//! are written back to the VM at every boundary: before any operation
//! that can panic (traces read them), before fiber switches, and on every
//! exit. Each handler fully updates `pc` before the loop continues; there
//! is no fall-through.
//!
//! # Inline caching
//!
//! Shape-dispatching opcodes (`Field*`, `SetFieldRelease`, `CallSym`,
//! `CallObjSym`) rewrite themselves in place on first execution into a
//! specialized form carrying the observed type id and offset/target. On a
//! type mismatch the specialized form rewrites back to the general form
//! and re-dispatches at the same pc. The stream has a single owner, this
//! loop, so in-place mutation is safe by construction.
//!
//! # Error channels
//!
//! `Err(StackOverflow)` asks the outer wrapper to grow the stack and
//! re-enter at the same pc. `Err(Panic)` unwinds with the panic slot set.
//! `Ok(())` is normal termination (`End`, or a `ret` whose frame carried
//! the ret flag).

use crate::modules::{NativeFn, NativeObjFn, NativeObjFn2};
use crate::stack::{
    pack_ret_info, unpack_ret_info, FRAME_ARG_START, FRAME_RET_FP, FRAME_RET_INFO,
    FRAME_RET_PC,
};
use crate::symbols::{FuncSymbol, MethodEntry};
use crate::vm::{Vm, VmError, END_NO_RESULT};
use smallvec::SmallVec;
use vesper_bytecode::OpCode;
use vesper_core::Value;
use vesper_runtime::object::{
    closure_captured, type_of, user_object_fields, ClosureObject, HeapObject,
    LambdaObject, ListObject, MapObject, ObjHeader, UserObject, CLOSURE_POOL_MAX_CAPTURED,
    FIRST_USER_TYPE, TYPE_ASTRING, TYPE_ASTRING_SLICE, TYPE_BOX, TYPE_CLOSURE,
    TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_NATIVE_FUNC, TYPE_RAWSTRING,
    TYPE_RAWSTRING_SLICE, TYPE_USTRING, TYPE_USTRING_SLICE,
    USER_OBJECT_POOL_MAX_FIELDS,
};
use vesper_runtime::string::ustring_char_at;
use vesper_runtime::{list, ValueMap};

#[inline(always)]
unsafe fn get(fp: *mut Value, i: u8) -> Value {
    // SAFETY: the caller guarantees fp and the local index are in-frame.
    unsafe { *fp.add(i as usize) }
}

#[inline(always)]
unsafe fn set(fp: *mut Value, i: u8, v: Value) {
    // SAFETY: the caller guarantees fp and the local index are in-frame.
    unsafe { *fp.add(i as usize) = v }
}

impl Vm {
    pub(crate) fn run_loop(&mut self) -> Result<(), VmError> {
        let mut pc = self.pc;
        let mut fp = self.fp;

        macro_rules! sync {
            () => {
                self.pc = pc;
                self.fp = fp;
            };
        }

        loop {
            let op_byte = self.program.ops[pc];
            self.profiler.record(op_byte);
            let Some(op) = OpCode::from_u8(op_byte) else {
                sync!();
                return Err(self.panic_with("invalid opcode"));
            };

            match op {
                OpCode::Nop => pc += 1,

                OpCode::End => {
                    let res = self.program.ops[pc + 1];
                    self.end_result = if res == END_NO_RESULT {
                        Value::NONE
                    } else {
                        // SAFETY: frame locals are in-bounds by codegen.
                        unsafe { get(fp, res) }
                    };
                    sync!();
                    return Ok(());
                }

                // ── Constants and copies ───────────────────────────────
                OpCode::ConstOp => {
                    let idx = self.program.ops[pc + 1] as usize;
                    let dst = self.program.ops[pc + 2];
                    let v = Value::from_raw(self.program.consts[idx]);
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, v) };
                    pc += 3;
                }
                OpCode::ConstI8 => {
                    let v = self.program.ops[pc + 1] as i8;
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::number(v as f64)) };
                    pc += 3;
                }
                OpCode::ConstIntI8 => {
                    let v = self.program.ops[pc + 1] as i8;
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::integer(v as i32)) };
                    pc += 3;
                }
                OpCode::True => {
                    let dst = self.program.ops[pc + 1];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::TRUE) };
                    pc += 2;
                }
                OpCode::False => {
                    let dst = self.program.ops[pc + 1];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::FALSE) };
                    pc += 2;
                }
                OpCode::None => {
                    let dst = self.program.ops[pc + 1];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::NONE) };
                    pc += 2;
                }
                OpCode::Not => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, Value::boolean(!get(fp, src).to_bool())) };
                    pc += 3;
                }
                OpCode::Neg => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = get(fp, src);
                        let n = if v.is_number() {
                            v.as_f64()
                        } else {
                            self.value_to_f64(v)
                        };
                        set(fp, dst, Value::number(-n));
                    }
                    pc += 3;
                }
                OpCode::Copy => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { set(fp, dst, get(fp, src)) };
                    pc += 3;
                }
                OpCode::CopyReleaseDst => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let old = get(fp, dst);
                        self.release(old);
                        set(fp, dst, get(fp, src));
                    }
                    pc += 3;
                }
                OpCode::CopyRetainSrc => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = get(fp, src);
                        self.retain(v);
                        set(fp, dst, v);
                    }
                    pc += 3;
                }

                // ── Collections ────────────────────────────────────────
                OpCode::List => {
                    let start = self.program.ops[pc + 1];
                    let n = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    let v = unsafe { self.op_list(fp, start, n)? };
                    unsafe { set(fp, dst, v) };
                    pc += 4;
                }
                OpCode::Map => {
                    let start = self.program.ops[pc + 1];
                    let n_pairs = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    let v = unsafe { self.op_map(fp, start, n_pairs)? };
                    unsafe { set(fp, dst, v) };
                    pc += 4;
                }
                OpCode::MapEmpty => {
                    let dst = self.program.ops[pc + 1];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    let v = unsafe { self.op_map(fp, 0, 0)? };
                    unsafe { set(fp, dst, v) };
                    pc += 2;
                }
                OpCode::Object => {
                    let type_op = self.program.ops[pc + 1];
                    let start = self.program.ops[pc + 2];
                    let n = self.program.ops[pc + 3];
                    let dst = self.program.ops[pc + 4];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    let v = unsafe { self.op_object(fp, type_op, start, n)? };
                    unsafe { set(fp, dst, v) };
                    pc += 5;
                }

                OpCode::Index => {
                    let recv = self.program.ops[pc + 1];
                    let idx = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = self.op_index(get(fp, recv), get(fp, idx), false)?;
                        set(fp, dst, v);
                    }
                    pc += 4;
                }
                OpCode::ReverseIndex => {
                    let recv = self.program.ops[pc + 1];
                    let idx = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = self.op_index(get(fp, recv), get(fp, idx), true)?;
                        set(fp, dst, v);
                    }
                    pc += 4;
                }
                OpCode::SetIndex => {
                    let recv = self.program.ops[pc + 1];
                    let idx = self.program.ops[pc + 2];
                    let val = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        self.op_set_index(get(fp, recv), get(fp, idx), get(fp, val), false)?;
                    }
                    pc += 4;
                }
                OpCode::SetIndexRelease => {
                    let recv = self.program.ops[pc + 1];
                    let idx = self.program.ops[pc + 2];
                    let val = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        self.op_set_index(get(fp, recv), get(fp, idx), get(fp, val), true)?;
                    }
                    pc += 4;
                }
                OpCode::Slice => {
                    let recv = self.program.ops[pc + 1];
                    let s = self.program.ops[pc + 2];
                    let e = self.program.ops[pc + 3];
                    let dst = self.program.ops[pc + 4];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = self.op_slice(get(fp, recv), get(fp, s), get(fp, e))?;
                        set(fp, dst, v);
                    }
                    pc += 5;
                }

                // ── Control flow ───────────────────────────────────────
                OpCode::Jump => {
                    let off = self.program.read_u16(pc + 1) as i16;
                    pc = (pc as isize + off as isize) as usize;
                }
                OpCode::JumpCond => {
                    let cond = self.program.ops[pc + 1];
                    let off = self.program.read_u16(pc + 2) as i16;
                    // SAFETY: locals are in-bounds by codegen.
                    if unsafe { get(fp, cond) }.to_bool() {
                        pc = (pc as isize + off as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::JumpNotCond => {
                    let cond = self.program.ops[pc + 1];
                    let off = self.program.read_u16(pc + 2) as i16;
                    // SAFETY: locals are in-bounds by codegen.
                    if !unsafe { get(fp, cond) }.to_bool() {
                        pc = (pc as isize + off as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::JumpNotNone => {
                    let src = self.program.ops[pc + 1];
                    let off = self.program.read_u16(pc + 2) as i16;
                    // SAFETY: locals are in-bounds by codegen.
                    if !unsafe { get(fp, src) }.is_none() {
                        pc = (pc as isize + off as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::Match => {
                    let expr = self.program.ops[pc + 1];
                    let n_cases = self.program.ops[pc + 2] as usize;
                    // SAFETY: locals are in-bounds by codegen.
                    let subject = unsafe { get(fp, expr) };
                    let mut target = None;
                    for case in 0..n_cases {
                        let at = pc + 3 + case * 3;
                        let konst = Value::from_raw(
                            self.program.consts[self.program.ops[at] as usize],
                        );
                        if self.values_eq(subject, konst) {
                            target = Some(self.program.read_u16(at + 1));
                            break;
                        }
                    }
                    let off = target
                        .unwrap_or_else(|| self.program.read_u16(pc + 3 + n_cases * 3));
                    pc += off as usize;
                }

                OpCode::ForRangeInit => {
                    let start = self.program.ops[pc + 1];
                    let end = self.program.ops[pc + 2];
                    let step = self.program.ops[pc + 3];
                    let iter = self.program.ops[pc + 4];
                    let off = self.program.read_u16(pc + 5) as usize;
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let s = self.value_to_f64(get(fp, start));
                        let e = self.value_to_f64(get(fp, end));
                        set(fp, iter, Value::number(s));
                        let _ = step;
                        let forward = s <= e;
                        // First execution picks the specialization for the
                        // paired back-edge op.
                        let paired = pc + off;
                        self.program.ops[paired] = if forward {
                            OpCode::ForRange as u8
                        } else {
                            OpCode::ForRangeReverse as u8
                        };
                        let empty = if forward { s >= e } else { s <= e };
                        if empty {
                            pc = paired + 6;
                        } else {
                            pc += 7;
                        }
                    }
                }
                OpCode::ForRange => {
                    let iter = self.program.ops[pc + 1];
                    let end = self.program.ops[pc + 2];
                    let step = self.program.ops[pc + 3];
                    let back = self.program.read_u16(pc + 4) as usize;
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let next = get(fp, iter).as_f64() + self.value_to_f64(get(fp, step));
                        if next < self.value_to_f64(get(fp, end)) {
                            set(fp, iter, Value::number(next));
                            pc -= back;
                        } else {
                            pc += 6;
                        }
                    }
                }
                OpCode::ForRangeReverse => {
                    let iter = self.program.ops[pc + 1];
                    let end = self.program.ops[pc + 2];
                    let step = self.program.ops[pc + 3];
                    let back = self.program.read_u16(pc + 4) as usize;
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let next = get(fp, iter).as_f64() - self.value_to_f64(get(fp, step));
                        if next > self.value_to_f64(get(fp, end)) {
                            set(fp, iter, Value::number(next));
                            pc -= back;
                        } else {
                            pc += 6;
                        }
                    }
                }

                // ── Calls and returns ──────────────────────────────────
                OpCode::Ret0 | OpCode::Ret1 => {
                    // SAFETY: the frame header was written by the call
                    // that pushed this frame.
                    unsafe {
                        let (num_ret, ret_flag) =
                            unpack_ret_info(*fp.add(FRAME_RET_INFO));
                        let produced = (op == OpCode::Ret1) as u8;
                        if produced == 1 && num_ret == 0 {
                            let v = *fp.add(0);
                            self.release(v);
                        } else if produced == 0 && num_ret == 1 {
                            *fp.add(0) = Value::NONE;
                        }
                        pc = (*fp.add(FRAME_RET_PC)).raw() as usize;
                        fp = (*fp.add(FRAME_RET_FP)).raw() as *mut Value;
                        if ret_flag {
                            sync!();
                            return Ok(());
                        }
                    }
                }

                OpCode::Call0 | OpCode::Call1 => {
                    let start = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let nret = (op == OpCode::Call1) as u8;
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        match self.call_value(fp, start, nargs, nret, pc + 3)? {
                            Some((new_fp, entry)) => {
                                fp = new_fp;
                                pc = entry;
                            }
                            None => pc += 3,
                        }
                    }
                }

                OpCode::CallSym => {
                    let start = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let nret = self.program.ops[pc + 3];
                    let sym = self.program.read_u16(pc + 4);
                    sync!();
                    match self.syms.func_entry(sym as u32) {
                        FuncSymbol::Func {
                            pc: func_pc,
                            num_params,
                            num_locals,
                        } => {
                            if num_params != nargs {
                                return Err(self.panic_with("function arity mismatch"));
                            }
                            // Specialize the site for bytecode targets.
                            // Targets past the 16-bit operand range stay on
                            // the general form.
                            if func_pc <= u16::MAX as u32 {
                                self.program.ops[pc] = OpCode::CallFuncIC as u8;
                                let enc = (func_pc as u16).to_le_bytes();
                                self.program.ops[pc + 4] = enc[0];
                                self.program.ops[pc + 5] = enc[1];
                                self.program.ops[pc + 6] = num_locals;
                            }
                            // SAFETY: locals are in-bounds by codegen.
                            unsafe {
                                let new_fp =
                                    self.push_frame(fp, start, nret, pc + 8, num_locals)?;
                                fp = new_fp;
                                pc = func_pc as usize;
                            }
                        }
                        FuncSymbol::Native { func, num_params } => {
                            if num_params != nargs {
                                return Err(self.panic_with("function arity mismatch"));
                            }
                            self.program.ops[pc] = OpCode::CallNativeFuncIC as u8;
                            // SAFETY: locals are in-bounds by codegen.
                            unsafe { self.call_native(fp, start, nargs, nret, func)? };
                            pc += 8;
                        }
                        FuncSymbol::Closure(callee) => {
                            // SAFETY: locals are in-bounds by codegen.
                            unsafe {
                                match self.call_closure_value(
                                    fp,
                                    start,
                                    nargs,
                                    nret,
                                    callee,
                                    pc + 8,
                                    true,
                                )? {
                                    Some((new_fp, entry)) => {
                                        fp = new_fp;
                                        pc = entry;
                                    }
                                    None => pc += 8,
                                }
                            }
                        }
                        FuncSymbol::None => {
                            return Err(self.panic_with("undefined function"));
                        }
                    }
                }
                OpCode::CallFuncIC => {
                    let start = self.program.ops[pc + 1];
                    let nret = self.program.ops[pc + 3];
                    let func_pc = self.program.read_u16(pc + 4) as usize;
                    let num_locals = self.program.ops[pc + 6];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let new_fp = self.push_frame(fp, start, nret, pc + 8, num_locals)?;
                        fp = new_fp;
                        pc = func_pc;
                    }
                }
                OpCode::CallNativeFuncIC => {
                    let start = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let nret = self.program.ops[pc + 3];
                    let sym = self.program.read_u16(pc + 4);
                    sync!();
                    let FuncSymbol::Native { func, .. } = self.syms.func_entry(sym as u32)
                    else {
                        return Err(self.panic_with("stale native call site"));
                    };
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe { self.call_native(fp, start, nargs, nret, func)? };
                    pc += 8;
                }

                OpCode::CallObjSym => {
                    let start = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let nret = self.program.ops[pc + 3];
                    let sym = self.program.read_u16(pc + 4);
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let recv = get(fp, start + FRAME_ARG_START as u8);
                        if !recv.is_pointer() {
                            return Err(self.missing_method(recv, sym as u32));
                        }
                        let obj = recv.as_pointer::<HeapObject>();
                        let type_id = type_of(obj);
                        match self.syms.method_entry(type_id, sym as u32) {
                            Some(MethodEntry::Func {
                                pc: func_pc,
                                num_params,
                                num_locals,
                            }) => {
                                if num_params != nargs + 1 {
                                    return Err(
                                        self.panic_with("method arity mismatch")
                                    );
                                }
                                if func_pc <= u16::MAX as u32
                                    && type_id <= u16::MAX as u32
                                {
                                    self.program.ops[pc] = OpCode::CallObjFuncIC as u8;
                                    let enc = (func_pc as u16).to_le_bytes();
                                    self.program.ops[pc + 4] = enc[0];
                                    self.program.ops[pc + 5] = enc[1];
                                    let t = (type_id as u16).to_le_bytes();
                                    self.program.ops[pc + 6] = t[0];
                                    self.program.ops[pc + 7] = t[1];
                                    self.program.ops[pc + 8] = num_locals;
                                }
                                let new_fp =
                                    self.push_frame(fp, start, nret, pc + 9, num_locals)?;
                                fp = new_fp;
                                pc = func_pc as usize;
                            }
                            Some(entry @ (MethodEntry::Native1(_) | MethodEntry::Native2(_))) => {
                                self.program.ops[pc] = OpCode::CallObjNativeFuncIC as u8;
                                let t = (type_id as u16).to_le_bytes();
                                self.program.ops[pc + 6] = t[0];
                                self.program.ops[pc + 7] = t[1];
                                self.call_obj_native(fp, start, nargs, nret, obj, entry)?;
                                pc += 9;
                            }
                            Some(MethodEntry::None) | None => {
                                return Err(self.missing_method(recv, sym as u32));
                            }
                        }
                    }
                }
                OpCode::CallObjFuncIC => {
                    let start = self.program.ops[pc + 1];
                    let nret = self.program.ops[pc + 3];
                    let func_pc = self.program.read_u16(pc + 4) as usize;
                    let cached_type = self.program.read_u16(pc + 6) as u32;
                    let num_locals = self.program.ops[pc + 8];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let recv = get(fp, start + FRAME_ARG_START as u8);
                        if !recv.is_pointer()
                            || type_of(recv.as_pointer::<HeapObject>()) != cached_type
                        {
                            // Shape changed: deoptimize and re-dispatch.
                            self.program.ops[pc] = OpCode::CallObjSym as u8;
                            continue;
                        }
                        let new_fp = self.push_frame(fp, start, nret, pc + 9, num_locals)?;
                        fp = new_fp;
                        pc = func_pc;
                    }
                }
                OpCode::CallObjNativeFuncIC => {
                    let start = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let nret = self.program.ops[pc + 3];
                    let sym = self.program.read_u16(pc + 4);
                    let cached_type = self.program.read_u16(pc + 6) as u32;
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let recv = get(fp, start + FRAME_ARG_START as u8);
                        if !recv.is_pointer()
                            || type_of(recv.as_pointer::<HeapObject>()) != cached_type
                        {
                            self.program.ops[pc] = OpCode::CallObjSym as u8;
                            continue;
                        }
                        let obj = recv.as_pointer::<HeapObject>();
                        let entry = self
                            .syms
                            .method_entry(cached_type, sym as u32)
                            .unwrap_or(MethodEntry::None);
                        self.call_obj_native(fp, start, nargs, nret, obj, entry)?;
                        pc += 9;
                    }
                }

                // ── Fields ─────────────────────────────────────────────
                OpCode::Field | OpCode::FieldRetain => {
                    let recv = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    let sym = self.program.ops[pc + 3];
                    let retain = op == OpCode::FieldRetain;
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let (type_id, offset, obj) =
                            self.resolve_field(get(fp, recv), sym)?;
                        // Specialize the site.
                        self.program.ops[pc] = if retain {
                            OpCode::FieldRetainIC as u8
                        } else {
                            OpCode::FieldIC as u8
                        };
                        let t = (type_id as u16).to_le_bytes();
                        self.program.ops[pc + 4] = t[0];
                        self.program.ops[pc + 5] = t[1];
                        self.program.ops[pc + 6] = offset;
                        let v = *user_object_fields(obj as *mut UserObject)
                            .add(offset as usize);
                        if retain {
                            self.retain(v);
                        }
                        set(fp, dst, v);
                    }
                    pc += 7;
                }
                OpCode::FieldIC | OpCode::FieldRetainIC => {
                    let recv = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    let cached_type = self.program.read_u16(pc + 4) as u32;
                    let offset = self.program.ops[pc + 6];
                    let retain = op == OpCode::FieldRetainIC;
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let rv = get(fp, recv);
                        if !rv.is_pointer()
                            || type_of(rv.as_pointer::<HeapObject>()) != cached_type
                        {
                            self.program.ops[pc] = if retain {
                                OpCode::FieldRetain as u8
                            } else {
                                OpCode::Field as u8
                            };
                            continue;
                        }
                        let obj = rv.as_pointer::<HeapObject>();
                        let v = *user_object_fields(obj as *mut UserObject)
                            .add(offset as usize);
                        if retain {
                            self.retain(v);
                        }
                        set(fp, dst, v);
                    }
                    pc += 7;
                }
                OpCode::SetFieldRelease => {
                    let recv = self.program.ops[pc + 1];
                    let val = self.program.ops[pc + 2];
                    let sym = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let (type_id, offset, obj) =
                            self.resolve_field(get(fp, recv), sym)?;
                        self.program.ops[pc] = OpCode::SetFieldReleaseIC as u8;
                        let t = (type_id as u16).to_le_bytes();
                        self.program.ops[pc + 4] = t[0];
                        self.program.ops[pc + 5] = t[1];
                        self.program.ops[pc + 6] = offset;
                        let slot =
                            user_object_fields(obj as *mut UserObject).add(offset as usize);
                        let old = *slot;
                        self.release(old);
                        *slot = get(fp, val);
                    }
                    pc += 7;
                }
                OpCode::SetFieldReleaseIC => {
                    let recv = self.program.ops[pc + 1];
                    let val = self.program.ops[pc + 2];
                    let cached_type = self.program.read_u16(pc + 4) as u32;
                    let offset = self.program.ops[pc + 6];
                    sync!();
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let rv = get(fp, recv);
                        if !rv.is_pointer()
                            || type_of(rv.as_pointer::<HeapObject>()) != cached_type
                        {
                            self.program.ops[pc] = OpCode::SetFieldRelease as u8;
                            continue;
                        }
                        let obj = rv.as_pointer::<HeapObject>();
                        let slot =
                            user_object_fields(obj as *mut UserObject).add(offset as usize);
                        let old = *slot;
                        self.release(old);
                        *slot = get(fp, val);
                    }
                    pc += 7;
                }

                // ── Functions ──────────────────────────────────────────
                OpCode::Lambda => {
                    let func_pc = self.program.read_u16(pc + 1) as u32;
                    let num_params = self.program.ops[pc + 3];
                    let num_locals = self.program.ops[pc + 4];
                    let dst = self.program.ops[pc + 5];
                    sync!();
                    let Some(slot) = self.heap.alloc_pool_slot() else {
                        return Err(VmError::OutOfMemory);
                    };
                    // SAFETY: fresh slot; locals are in-bounds by codegen.
                    unsafe {
                        (*slot.as_ptr()).lambda = LambdaObject {
                            header: ObjHeader {
                                type_id: TYPE_LAMBDA,
                                rc: 1,
                            },
                            func_pc,
                            num_params,
                            num_locals,
                            _pad: 0,
                        };
                        self.heap.global_rc += 1;
                        set(fp, dst, Value::pointer(slot.as_ptr()));
                    }
                    pc += 6;
                }
                OpCode::Closure => {
                    let func_pc = self.program.read_u16(pc + 1) as u32;
                    let num_params = self.program.ops[pc + 3];
                    let num_captured = self.program.ops[pc + 4];
                    let num_locals = self.program.ops[pc + 5];
                    let dst = self.program.ops[pc + 6];
                    sync!();
                    let n = num_captured as usize;
                    let obj = if n <= CLOSURE_POOL_MAX_CAPTURED {
                        self.heap.alloc_pool_slot()
                    } else {
                        self.heap
                            .alloc_large(std::mem::size_of::<ClosureObject>() + n * 8)
                    };
                    let Some(obj) = obj else {
                        return Err(VmError::OutOfMemory);
                    };
                    // SAFETY: fresh storage sized for n captures; capture
                    // indices are in-frame by codegen.
                    unsafe {
                        (*obj.as_ptr()).closure = ClosureObject {
                            header: ObjHeader {
                                type_id: TYPE_CLOSURE,
                                rc: 1,
                            },
                            func_pc,
                            num_params,
                            num_locals,
                            num_captured,
                            _pad: 0,
                        };
                        let captured = closure_captured(obj.as_ptr() as *mut ClosureObject);
                        for i in 0..n {
                            let local = self.program.ops[pc + 7 + i];
                            let v = get(fp, local);
                            self.retain(v);
                            *captured.add(i) = v;
                        }
                        self.heap.global_rc += 1;
                        set(fp, dst, Value::pointer(obj.as_ptr()));
                    }
                    pc += 7 + n;
                }

                // ── Reference counting ─────────────────────────────────
                OpCode::Retain => {
                    let local = self.program.ops[pc + 1];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = get(fp, local);
                        self.retain(v);
                    }
                    pc += 2;
                }
                OpCode::Release => {
                    let local = self.program.ops[pc + 1];
                    // SAFETY: locals are in-bounds by codegen.
                    unsafe {
                        let v = get(fp, local);
                        self.release(v);
                    }
                    pc += 2;
                }
                OpCode::ReleaseN => {
                    let n = self.program.ops[pc + 1] as usize;
                    for i in 0..n {
                        let local = self.program.ops[pc + 2 + i];
                        // SAFETY: locals are in-bounds by codegen.
                        unsafe {
                            let v = get(fp, local);
                            self.release(v);
                        }
                    }
                    pc += 2 + n;
                }

                // ── Boxes ──────────────────────────────────────────────
                OpCode::Box => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    sync!();
                    let Some(slot) = self.heap.alloc_pool_slot() else {
                        return Err(VmError::OutOfMemory);
                    };
                    // SAFETY: fresh slot; locals in-bounds by codegen.
                    unsafe {
                        (*slot.as_ptr()).boxed = vesper_runtime::object::BoxObject {
                            header: ObjHeader {
                                type_id: TYPE_BOX,
                                rc: 1,
                            },
                            value: get(fp, src),
                        };
                        self.heap.global_rc += 1;
                        set(fp, dst, Value::pointer(slot.as_ptr()));
                    }
                    pc += 3;
                }
                OpCode::SetBoxValue | OpCode::SetBoxValueRelease => {
                    let box_local = self.program.ops[pc + 1];
                    let val = self.program.ops[pc + 2];
                    sync!();
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let bv = get(fp, box_local);
                        let obj = self.expect_box(bv)?;
                        if op == OpCode::SetBoxValueRelease {
                            let old = (*obj).boxed.value;
                            self.release(old);
                        }
                        (*obj).boxed.value = get(fp, val);
                    }
                    pc += 3;
                }
                OpCode::BoxValue | OpCode::BoxValueRetain => {
                    let box_local = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    sync!();
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let bv = get(fp, box_local);
                        let obj = self.expect_box(bv)?;
                        let v = (*obj).boxed.value;
                        if op == OpCode::BoxValueRetain {
                            self.retain(v);
                        }
                        set(fp, dst, v);
                    }
                    pc += 3;
                }

                // ── Tags and errors ────────────────────────────────────
                OpCode::Tag => {
                    let tag_type = self.program.ops[pc + 1];
                    let member = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe { set(fp, dst, Value::enum_member(tag_type, member)) };
                    pc += 4;
                }
                OpCode::TagLiteral => {
                    let sym = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe { set(fp, dst, Value::symbol(sym as u32)) };
                    pc += 3;
                }
                OpCode::TryValue => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    let off = self.program.read_u16(pc + 3) as usize;
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let v = get(fp, src);
                        if !v.is_error() {
                            set(fp, dst, v);
                            pc += 5;
                        } else if fp != self.stack {
                            // Divert the error into the frame's return slot
                            // and take the jump out.
                            *fp.add(0) = v;
                            pc += off;
                        } else {
                            sync!();
                            return Err(self.panic_err(v));
                        }
                    }
                }

                // ── Static variables ───────────────────────────────────
                OpCode::StaticVar => {
                    let sym = self.program.read_u16(pc + 1) as u32;
                    let dst = self.program.ops[pc + 3];
                    let v = self.syms.var_value(sym);
                    self.retain(v);
                    // SAFETY: locals in-bounds by codegen.
                    unsafe { set(fp, dst, v) };
                    pc += 4;
                }
                OpCode::SetStaticVar => {
                    let sym = self.program.read_u16(pc + 1) as u32;
                    let src = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let v = get(fp, src);
                        let old = self.syms.set_var_value(sym, v);
                        self.release(old);
                    }
                    pc += 4;
                }

                // ── Strings ────────────────────────────────────────────
                OpCode::StrConcat => {
                    let l = self.program.ops[pc + 1];
                    let r = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    sync!();
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let v = self.op_concat(&[get(fp, l), get(fp, r)])?;
                        set(fp, dst, v);
                    }
                    pc += 4;
                }
                OpCode::StrConcat3 => {
                    let first = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    sync!();
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let v = self.op_concat(&[
                            get(fp, first),
                            get(fp, first + 1),
                            get(fp, first + 2),
                        ])?;
                        set(fp, dst, v);
                    }
                    pc += 3;
                }

                // ── Arithmetic and comparison ──────────────────────────
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Pow
                | OpCode::Mod => {
                    let l = self.program.ops[pc + 1];
                    let r = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let lv = get(fp, l);
                        let rv = get(fp, r);
                        // Hot path: both operands are already numbers.
                        let (a, b) = if lv.is_number() && rv.is_number() {
                            (lv.as_f64(), rv.as_f64())
                        } else {
                            (self.value_to_f64(lv), self.value_to_f64(rv))
                        };
                        let out = match op {
                            OpCode::Add => a + b,
                            OpCode::Sub => a - b,
                            OpCode::Mul => a * b,
                            OpCode::Div => a / b,
                            OpCode::Pow => a.powf(b),
                            _ => a % b,
                        };
                        set(fp, dst, Value::number(out));
                    }
                    pc += 4;
                }
                OpCode::Less | OpCode::Greater | OpCode::LessEq | OpCode::GreaterEq => {
                    let l = self.program.ops[pc + 1];
                    let r = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let lv = get(fp, l);
                        let rv = get(fp, r);
                        let (a, b) = if lv.is_number() && rv.is_number() {
                            (lv.as_f64(), rv.as_f64())
                        } else {
                            (self.value_to_f64(lv), self.value_to_f64(rv))
                        };
                        let out = match op {
                            OpCode::Less => a < b,
                            OpCode::Greater => a > b,
                            OpCode::LessEq => a <= b,
                            _ => a >= b,
                        };
                        set(fp, dst, Value::boolean(out));
                    }
                    pc += 4;
                }
                OpCode::CompareEq | OpCode::CompareNeq => {
                    let l = self.program.ops[pc + 1];
                    let r = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let eq = self.values_eq(get(fp, l), get(fp, r));
                        set(
                            fp,
                            dst,
                            Value::boolean(if op == OpCode::CompareEq { eq } else { !eq }),
                        );
                    }
                    pc += 4;
                }
                OpCode::BitAnd
                | OpCode::BitOr
                | OpCode::BitXor
                | OpCode::ShiftLeft
                | OpCode::ShiftRight => {
                    let l = self.program.ops[pc + 1];
                    let r = self.program.ops[pc + 2];
                    let dst = self.program.ops[pc + 3];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let a = self.value_to_f64(get(fp, l)) as i64 as i32;
                        let b = self.value_to_f64(get(fp, r)) as i64 as i32;
                        let out = match op {
                            OpCode::BitAnd => a & b,
                            OpCode::BitOr => a | b,
                            OpCode::BitXor => a ^ b,
                            OpCode::ShiftLeft => a.wrapping_shl(b as u32 & 31),
                            _ => a.wrapping_shr(b as u32 & 31),
                        };
                        set(fp, dst, Value::number(out as f64));
                    }
                    pc += 4;
                }
                OpCode::BitNot => {
                    let src = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let a = self.value_to_f64(get(fp, src)) as i64 as i32;
                        set(fp, dst, Value::number(!a as f64));
                    }
                    pc += 3;
                }

                // ── Fibers ─────────────────────────────────────────────
                OpCode::Coinit => {
                    let start_args = self.program.ops[pc + 1];
                    let nargs = self.program.ops[pc + 2];
                    let body_len = self.program.ops[pc + 3] as usize;
                    let init_stack = self.program.ops[pc + 4] as usize;
                    let dst = self.program.ops[pc + 5];
                    sync!();
                    // SAFETY: locals in-bounds by codegen; the body starts
                    // right after this instruction.
                    unsafe {
                        let fv =
                            self.fiber_coinit(fp, start_args, nargs, pc + 6, init_stack)?;
                        set(fp, dst, fv);
                    }
                    pc += 6 + body_len;
                }
                OpCode::Coresume => {
                    let fiber_local = self.program.ops[pc + 1];
                    let dst = self.program.ops[pc + 2];
                    // Save the resume point before switching.
                    self.pc = pc + 3;
                    self.fp = fp;
                    // SAFETY: locals in-bounds by codegen.
                    unsafe {
                        let fv = get(fp, fiber_local);
                        if self.fiber_resume(fv, dst) {
                            pc = self.pc;
                            fp = self.fp;
                        } else {
                            set(fp, dst, Value::NONE);
                            pc += 3;
                        }
                    }
                }
                OpCode::Coyield => {
                    // Save the yield site itself; resuming continues at
                    // pc + 3.
                    self.pc = pc;
                    self.fp = fp;
                    // SAFETY: registers just synced.
                    unsafe { self.fiber_yield()? };
                    pc = self.pc;
                    fp = self.fp;
                }
                OpCode::Coreturn => {
                    self.pc = pc;
                    self.fp = fp;
                    // SAFETY: registers just synced; the return value
                    // convention places it at fp[1].
                    unsafe {
                        let ret_val = get(fp, 1);
                        if !self.fiber_return(ret_val) {
                            self.end_result = Value::NONE;
                            return Ok(());
                        }
                    }
                    pc = self.pc;
                    fp = self.fp;
                }
            }
        }
    }

    // ── Call helpers ───────────────────────────────────────────────────

    /// Push a bytecode frame at `fp + start`, checking capacity first.
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer.
    unsafe fn push_frame(
        &mut self,
        fp: *mut Value,
        start: u8,
        nret: u8,
        ret_pc: usize,
        num_locals: u8,
    ) -> Result<*mut Value, VmError> {
        // SAFETY: per the contract; bounds are checked before any write.
        unsafe {
            let new_fp = fp.add(start as usize);
            if new_fp.add(num_locals as usize) > self.stack_end() {
                return Err(VmError::StackOverflow);
            }
            *new_fp.add(FRAME_RET_INFO) = pack_ret_info(nret, false);
            *new_fp.add(FRAME_RET_PC) = Value::from_raw(ret_pc as u64);
            *new_fp.add(FRAME_RET_FP) = Value::from_raw(fp as u64);
            Ok(new_fp)
        }
    }

    /// Dynamic `call0`/`call1`: the callee sits one slot past the args.
    /// Returns the new `(fp, pc)` for bytecode targets, `None` when the
    /// call completed inline (native) or was rejected (arity error value
    /// written to the destination).
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer with a valid call window.
    unsafe fn call_value(
        &mut self,
        fp: *mut Value,
        start: u8,
        nargs: u8,
        nret: u8,
        ret_pc: usize,
    ) -> Result<Option<(*mut Value, usize)>, VmError> {
        // SAFETY: per the contract.
        unsafe {
            let callee = get(fp, start + FRAME_ARG_START as u8 + nargs);
            if !callee.is_pointer() {
                return Err(self.panic_with("calling a non-function value"));
            }
            let obj = callee.as_pointer::<HeapObject>();
            match type_of(obj) {
                TYPE_CLOSURE | TYPE_LAMBDA => {
                    self.call_closure_value(fp, start, nargs, nret, callee, ret_pc, false)
                }
                TYPE_NATIVE_FUNC => {
                    let nf = (*obj).native_func;
                    if nf.num_params != nargs as u32 {
                        self.reject_call(fp, start, nargs, callee);
                        return Ok(None);
                    }
                    let func: NativeFn = std::mem::transmute::<*const (), NativeFn>(nf.func);
                    self.call_native(fp, start, nargs, nret, func)?;
                    self.release(callee);
                    Ok(None)
                }
                _ => Err(self.panic_with("calling a non-function value")),
            }
        }
    }

    /// Closure/lambda invocation shared by dynamic calls and
    /// closure-valued function symbols. `from_sym` callers have no callee
    /// slot in the frame, so the closure value is written (retained) into
    /// it to keep the callee-owns-its-value convention.
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer with a valid call window.
    unsafe fn call_closure_value(
        &mut self,
        fp: *mut Value,
        start: u8,
        nargs: u8,
        nret: u8,
        callee: Value,
        ret_pc: usize,
        from_sym: bool,
    ) -> Result<Option<(*mut Value, usize)>, VmError> {
        // SAFETY: per the contract.
        unsafe {
            let obj = callee.as_pointer::<HeapObject>();
            let (func_pc, num_params, num_locals, num_captured) =
                if type_of(obj) == TYPE_CLOSURE {
                    let c = (*obj).closure;
                    (c.func_pc, c.num_params, c.num_locals, c.num_captured)
                } else {
                    let l = (*obj).lambda;
                    (l.func_pc, l.num_params, l.num_locals, 0)
                };
            if num_params != nargs {
                self.reject_call(fp, start, nargs, callee);
                return Ok(None);
            }
            let new_fp = self.push_frame(fp, start, nret, ret_pc, num_locals)?;
            if from_sym {
                self.retain(callee);
                *new_fp.add(FRAME_ARG_START + nargs as usize) = callee;
            }
            if num_captured > 0 {
                let captured = closure_captured(obj as *mut ClosureObject);
                // Captured vars land after the args and the callee slot.
                let base = FRAME_ARG_START + nargs as usize + 1;
                for i in 0..num_captured as usize {
                    let v = *captured.add(i);
                    self.retain(v);
                    *new_fp.add(base + i) = v;
                }
            }
            Ok(Some((new_fp, func_pc as usize)))
        }
    }

    /// Arity mismatch: release the callee and every arg, store
    /// `error(InvalidSignature)` in the destination, skip the body.
    unsafe fn reject_call(&mut self, fp: *mut Value, start: u8, nargs: u8, callee: Value) {
        // SAFETY: the caller's call window is valid.
        unsafe {
            self.release(callee);
            for i in 0..nargs {
                let v = get(fp, start + FRAME_ARG_START as u8 + i);
                self.release(v);
            }
            set(fp, start, Value::error(self.error_tags.invalid_signature));
        }
    }

    /// Invoke a plain native: args borrowed from the stack, released by
    /// the VM afterwards, result moved into the destination slot.
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer with a valid call window.
    unsafe fn call_native(
        &mut self,
        fp: *mut Value,
        start: u8,
        nargs: u8,
        nret: u8,
        func: NativeFn,
    ) -> Result<(), VmError> {
        // SAFETY: per the contract.
        unsafe {
            let args = fp.add(start as usize + FRAME_ARG_START);
            let res = func(self, args, nargs);
            if res.is_panic() {
                return Err(VmError::Panic);
            }
            for i in 0..nargs as usize {
                let v = *args.add(i);
                self.release(v);
            }
            if nret >= 1 {
                set(fp, start, res);
            } else {
                self.release(res);
            }
            Ok(())
        }
    }

    /// Invoke a native method. The caller encodes the required return
    /// count: extra results are released, missing ones filled with none.
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer; `obj` the receiver at
    /// `fp[start + 4]`.
    unsafe fn call_obj_native(
        &mut self,
        fp: *mut Value,
        start: u8,
        nargs: u8,
        nret: u8,
        obj: *mut HeapObject,
        entry: MethodEntry,
    ) -> Result<(), VmError> {
        // SAFETY: per the contract.
        unsafe {
            let recv = get(fp, start + FRAME_ARG_START as u8);
            let args = fp.add(start as usize + FRAME_ARG_START + 1);
            let results: SmallVec<[Value; 2]> = match entry {
                MethodEntry::Native1(func) => {
                    let func: NativeObjFn = func;
                    let r = func(self, obj, args, nargs);
                    if r.is_panic() {
                        return Err(VmError::Panic);
                    }
                    SmallVec::from_slice(&[r])
                }
                MethodEntry::Native2(func) => {
                    let func: NativeObjFn2 = func;
                    let rs = func(self, obj, args, nargs);
                    if rs[0].is_panic() || rs[1].is_panic() {
                        return Err(VmError::Panic);
                    }
                    SmallVec::from_slice(&rs)
                }
                _ => return Err(self.panic_with("stale method call site")),
            };
            for i in 0..nargs as usize {
                let v = *args.add(i);
                self.release(v);
            }
            self.release(recv);
            for (i, r) in results.iter().enumerate() {
                if (i as u8) < nret {
                    set(fp, start + i as u8, *r);
                } else {
                    self.release(*r);
                }
            }
            for i in results.len() as u8..nret {
                set(fp, start + i, Value::NONE);
            }
            Ok(())
        }
    }

    #[cold]
    fn missing_method(&mut self, recv: Value, sym: u32) -> VmError {
        let msg = format!(
            "`{}` has no method `{}`",
            self.type_name(recv),
            self.syms.method_name(sym)
        );
        self.panic_with(msg)
    }

    // ── Field helpers ──────────────────────────────────────────────────

    /// Resolve `(type, offset, object)` for a field access, through the
    /// MRU/fallback tables.
    ///
    /// # Safety
    ///
    /// `recv` must be a script-visible value.
    unsafe fn resolve_field(
        &mut self,
        recv: Value,
        sym: u8,
    ) -> Result<(u32, u8, *mut HeapObject), VmError> {
        if !recv.is_pointer() {
            return Err(self.missing_field(recv, sym));
        }
        // SAFETY: pointer values target live objects.
        let obj = unsafe { recv.as_pointer::<HeapObject>() };
        let type_id = unsafe { type_of(obj) };
        if type_id < FIRST_USER_TYPE {
            return Err(self.missing_field(recv, sym));
        }
        match self.syms.field_offset(type_id, sym as u32) {
            Some(offset) => Ok((type_id, offset, obj)),
            None => Err(self.missing_field(recv, sym)),
        }
    }

    #[cold]
    fn missing_field(&mut self, recv: Value, sym: u8) -> VmError {
        let msg = format!(
            "`{}` has no field `{}`",
            self.type_name(recv),
            self.syms.field_name(sym as u32)
        );
        self.panic_with(msg)
    }

    unsafe fn expect_box(&mut self, v: Value) -> Result<*mut HeapObject, VmError> {
        if !v.is_pointer() {
            return Err(self.panic_with("expected a box"));
        }
        // SAFETY: pointer values target live objects.
        let obj = unsafe { v.as_pointer::<HeapObject>() };
        if unsafe { type_of(obj) } != TYPE_BOX {
            return Err(self.panic_with("expected a box"));
        }
        Ok(obj)
    }

    // ── Collection helpers ─────────────────────────────────────────────

    /// Build a list from `n` consecutive locals (values are moved in).
    ///
    /// # Safety
    ///
    /// `fp` and the local window must be valid.
    unsafe fn op_list(&mut self, fp: *mut Value, start: u8, n: u8) -> Result<Value, VmError> {
        let Some(slot) = self.heap.alloc_pool_slot() else {
            return Err(VmError::OutOfMemory);
        };
        // SAFETY: fresh slot; literal lists start with capacity == length.
        unsafe {
            let elems = list::alloc_elems(n as usize);
            for i in 0..n as usize {
                *elems.add(i) = get(fp, start + i as u8);
            }
            (*slot.as_ptr()).list = ListObject {
                header: ObjHeader {
                    type_id: TYPE_LIST,
                    rc: 1,
                },
                elems,
                len: n as u32,
                cap: n as u32,
            };
        }
        self.heap.global_rc += 1;
        Ok(Value::pointer(slot.as_ptr()))
    }

    /// Build a map from consecutive key/value local pairs (moved in).
    ///
    /// # Safety
    ///
    /// `fp` and the local window must be valid.
    unsafe fn op_map(&mut self, fp: *mut Value, start: u8, n_pairs: u8) -> Result<Value, VmError> {
        let Some(slot) = self.heap.alloc_pool_slot() else {
            return Err(VmError::OutOfMemory);
        };
        let map = Box::into_raw(Box::new(ValueMap::with_capacity(n_pairs as usize)));
        // SAFETY: fresh slot and map.
        unsafe {
            (*slot.as_ptr()).map = MapObject {
                header: ObjHeader {
                    type_id: TYPE_MAP,
                    rc: 1,
                },
                map,
            };
            for i in 0..n_pairs {
                let key = get(fp, start + i * 2);
                let val = get(fp, start + i * 2 + 1);
                let hash = self.value_hash(key);
                let old = (*map).insert(hash, key, val, |k| self.values_eq(k, key));
                if let Some(old) = old {
                    // Duplicate literal key: the entry keeps its original
                    // key, so the incoming copy and old value die here.
                    self.release(key);
                    self.release(old);
                }
            }
        }
        self.heap.global_rc += 1;
        Ok(Value::pointer(slot.as_ptr()))
    }

    /// Build a user object from consecutive locals (moved in); fields the
    /// window does not cover are initialized to none.
    ///
    /// # Safety
    ///
    /// `fp` and the local window must be valid.
    unsafe fn op_object(
        &mut self,
        fp: *mut Value,
        type_op: u8,
        start: u8,
        n: u8,
    ) -> Result<Value, VmError> {
        let type_id = FIRST_USER_TYPE + type_op as u32;
        let num_fields = self.syms.struct_num_fields(type_id) as usize;
        let obj = if num_fields <= USER_OBJECT_POOL_MAX_FIELDS {
            self.heap.alloc_pool_slot()
        } else {
            self.heap
                .alloc_large(std::mem::size_of::<UserObject>() + num_fields * 8)
        };
        let Some(obj) = obj else {
            return Err(VmError::OutOfMemory);
        };
        // SAFETY: fresh storage sized for num_fields values.
        unsafe {
            (*obj.as_ptr()).user = UserObject {
                header: ObjHeader { type_id, rc: 1 },
            };
            let fields = user_object_fields(obj.as_ptr() as *mut UserObject);
            for i in 0..num_fields {
                *fields.add(i) = if i < n as usize {
                    get(fp, start + i as u8)
                } else {
                    Value::NONE
                };
            }
        }
        self.heap.global_rc += 1;
        Ok(Value::pointer(obj.as_ptr()))
    }

    /// `recv[idx]` (retaining the result). `reverse` indexes from the
    /// back.
    ///
    /// # Safety
    ///
    /// `recv` and `idx` must be script-visible values.
    unsafe fn op_index(
        &mut self,
        recv: Value,
        idx: Value,
        reverse: bool,
    ) -> Result<Value, VmError> {
        if recv.is_pointer() {
            // SAFETY: pointer values target live objects.
            unsafe {
                let obj = recv.as_pointer::<HeapObject>();
                match type_of(obj) {
                    TYPE_LIST => {
                        let len = (*obj).list.len as usize;
                        let i = self.index_within(idx, len, reverse)?;
                        let v = *(*obj).list.elems.add(i);
                        self.retain(v);
                        return Ok(v);
                    }
                    TYPE_MAP => {
                        let hash = self.value_hash(idx);
                        let map = &*(*obj).map.map;
                        let found = map.get(hash, |k| self.values_eq(k, idx));
                        let v = found.unwrap_or(Value::NONE);
                        self.retain(v);
                        return Ok(v);
                    }
                    TYPE_USTRING => {
                        let len = (*obj).ustring.char_len as usize;
                        let i = self.index_within(idx, len, reverse)?;
                        let ch = ustring_char_at(obj, i as u32)
                            .expect("checked char index");
                        return self.intern_char(ch);
                    }
                    TYPE_ASTRING | TYPE_RAWSTRING | TYPE_ASTRING_SLICE
                    | TYPE_RAWSTRING_SLICE | TYPE_USTRING_SLICE => {
                        return self.index_string_bytes(recv, idx, reverse);
                    }
                    _ => {}
                }
            }
            return Err(self.panic_with("type does not support indexing"));
        }
        if recv.is_static_string() {
            // SAFETY: static slices reference the program string buffer.
            return unsafe { self.index_string_bytes(recv, idx, reverse) };
        }
        Err(self.panic_with("type does not support indexing"))
    }

    /// Character indexing over any byte-addressable string value.
    ///
    /// # Safety
    ///
    /// `recv` must be a string value.
    unsafe fn index_string_bytes(
        &mut self,
        recv: Value,
        idx: Value,
        reverse: bool,
    ) -> Result<Value, VmError> {
        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
        if !self.value_str_bytes(recv, &mut buf) {
            return Err(self.panic_with("type does not support indexing"));
        }
        let text = std::str::from_utf8(&buf)
            .map_err(|_| self.panic_with("invalid utf-8 in string"))?;
        let len = text.chars().count();
        let i = self.index_within(idx, len, reverse)?;
        let ch = text.chars().nth(i).expect("checked char index");
        self.intern_char(ch)
    }

    fn intern_char(&mut self, ch: char) -> Result<Value, VmError> {
        let mut encoded = [0u8; 4];
        let s = ch.encode_utf8(&mut encoded);
        self.heap
            .get_or_intern_string(s.as_bytes())
            .ok_or(VmError::OutOfMemory)
    }

    /// Bounds-check a numeric index against `len`.
    fn index_within(&mut self, idx: Value, len: usize, reverse: bool) -> Result<usize, VmError> {
        let raw = self.value_to_f64(idx);
        if raw < 0.0 || raw.fract() != 0.0 {
            return Err(self.panic_with("index out of bounds"));
        }
        let i = raw as usize;
        let i = if reverse {
            match len.checked_sub(i + 1) {
                Some(i) => i,
                None => return Err(self.panic_with("index out of bounds")),
            }
        } else {
            i
        };
        if i >= len {
            return Err(self.panic_with("index out of bounds"));
        }
        Ok(i)
    }

    /// `recv[idx] = val`. Values are moved in; `release_prior` releases
    /// the overwritten value (the `set_index_release` form).
    ///
    /// # Safety
    ///
    /// `recv`, `idx`, and `val` must be script-visible values.
    unsafe fn op_set_index(
        &mut self,
        recv: Value,
        idx: Value,
        val: Value,
        release_prior: bool,
    ) -> Result<(), VmError> {
        if !recv.is_pointer() {
            return Err(self.panic_with("type does not support index assignment"));
        }
        // SAFETY: pointer values target live objects.
        unsafe {
            let obj = recv.as_pointer::<HeapObject>();
            match type_of(obj) {
                TYPE_LIST => {
                    let len = (*obj).list.len as usize;
                    let i = self.index_within(idx, len, false)?;
                    let slot = (*obj).list.elems.add(i);
                    if release_prior {
                        let old = *slot;
                        self.release(old);
                    }
                    *slot = val;
                    Ok(())
                }
                TYPE_MAP => {
                    let hash = self.value_hash(idx);
                    let map = &mut *(*obj).map.map;
                    let old = map.insert(hash, idx, val, |k| self.values_eq(k, idx));
                    if let Some(old) = old {
                        // The entry keeps its stored key; the incoming
                        // copy dies here.
                        self.release(idx);
                        if release_prior {
                            self.release(old);
                        }
                    }
                    Ok(())
                }
                _ => Err(self.panic_with("type does not support index assignment")),
            }
        }
    }

    /// `recv[start..end]`: lists copy, managed strings produce retained
    /// slice objects, static strings produce static slice values.
    ///
    /// # Safety
    ///
    /// Operands must be script-visible values.
    unsafe fn op_slice(
        &mut self,
        recv: Value,
        start: Value,
        end: Value,
    ) -> Result<Value, VmError> {
        if recv.is_static_string() {
            let (s_start, s_len) = recv.static_string_parts();
            let (a, b) = self.slice_range(start, end, s_len as usize)?;
            let out_start = s_start + a as u32;
            let out_len = (b - a) as u16;
            return Ok(match recv.tag() {
                vesper_core::Tag::StaticAstring => {
                    Value::static_astring(out_start, out_len)
                }
                _ => Value::static_ustring(out_start, out_len),
            });
        }
        if !recv.is_pointer() {
            return Err(self.panic_with("type does not support slicing"));
        }
        // SAFETY: pointer values target live objects.
        unsafe {
            let obj = recv.as_pointer::<HeapObject>();
            match type_of(obj) {
                TYPE_LIST => {
                    let len = (*obj).list.len as usize;
                    let (a, b) = self.slice_range(start, end, len)?;
                    let Some(slot) = self.heap.alloc_pool_slot() else {
                        return Err(VmError::OutOfMemory);
                    };
                    let n = b - a;
                    let elems = list::alloc_elems(n);
                    for i in 0..n {
                        let v = *(*obj).list.elems.add(a + i);
                        self.retain(v);
                        *elems.add(i) = v;
                    }
                    (*slot.as_ptr()).list = ListObject {
                        header: ObjHeader {
                            type_id: TYPE_LIST,
                            rc: 1,
                        },
                        elems,
                        len: n as u32,
                        cap: n as u32,
                    };
                    self.heap.global_rc += 1;
                    Ok(Value::pointer(slot.as_ptr()))
                }
                t @ (TYPE_ASTRING | TYPE_USTRING | TYPE_RAWSTRING | TYPE_ASTRING_SLICE
                | TYPE_USTRING_SLICE | TYPE_RAWSTRING_SLICE) => {
                    let bytes = vesper_runtime::string::heap_string_bytes(obj);
                    let (a, b) = self.slice_range(start, end, bytes.len())?;
                    let kind = match t {
                        TYPE_USTRING | TYPE_USTRING_SLICE => TYPE_USTRING_SLICE,
                        TYPE_RAWSTRING | TYPE_RAWSTRING_SLICE => TYPE_RAWSTRING_SLICE,
                        _ => TYPE_ASTRING_SLICE,
                    };
                    let slice = self
                        .heap
                        .new_string_slice(kind, obj, bytes.as_ptr().add(a), (b - a) as u32)
                        .ok_or(VmError::OutOfMemory)?;
                    Ok(Value::pointer(slice.as_ptr()))
                }
                _ => Err(self.panic_with("type does not support slicing")),
            }
        }
    }

    /// Decode `[start..end]` operands: none defaults to the ends, bounds
    /// clamp to `len`, inverted ranges panic.
    fn slice_range(
        &mut self,
        start: Value,
        end: Value,
        len: usize,
    ) -> Result<(usize, usize), VmError> {
        let a = if start.is_none() {
            0
        } else {
            self.value_to_f64(start).max(0.0) as usize
        };
        let b = if end.is_none() {
            len
        } else {
            (self.value_to_f64(end) as usize).min(len)
        };
        if a > b {
            return Err(self.panic_with("invalid slice range"));
        }
        Ok((a, b))
    }

    /// Concatenation: hash the prospective result and consult the intern
    /// table before materializing; strings past the intern threshold
    /// always allocate.
    ///
    /// # Safety
    ///
    /// Operands must be script-visible values.
    unsafe fn op_concat(&mut self, parts: &[Value]) -> Result<Value, VmError> {
        let mut buf: SmallVec<[u8; 64]> = SmallVec::new();
        for part in parts {
            if !self.value_str_bytes(*part, &mut buf) {
                return Err(self.panic_with("cannot concatenate a non-string"));
            }
        }
        self.heap
            .get_or_intern_string(&buf)
            .ok_or(VmError::OutOfMemory)
    }
}
