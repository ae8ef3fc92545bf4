//! Cooperative fibers: creation, switching, and stack teardown.
//!
//! Fibers form a parent chain through `prev`. A switch saves the active
//! fiber's `stack`/`stack_cap`/`pc`/`fp` into its object and installs the
//! target's. The three stack registers move together, atomically from
//! the script's perspective, because switches happen only inside the four
//! fiber opcodes.
//!
//! A fiber's first frame runs at `fp = stack + 1`, so coinit writes the
//! initial args to absolute slots `[5..5+nargs]` and the stack-base guard
//! at slot 0 terminates frame walks. The resumer pins the target with one
//! retain; yield and coreturn unpin.

use crate::stack::{alloc_stack, free_stack, FRAME_RET_FP, FRAME_RET_PC};
use crate::vm::{Vm, VmError};
use smallvec::SmallVec;
use vesper_bytecode::OpCode;
use vesper_core::{Value, NULL_ID};
use vesper_runtime::object::{
    type_of, FiberObject, HeapObject, ObjHeader, FIBER_TERMINATED, NO_PARENT_DST,
    TYPE_FIBER,
};

impl Vm {
    #[inline]
    pub(crate) fn main_fiber_ptr(&mut self) -> *mut FiberObject {
        &mut *self.main_fiber
    }

    /// Allocate a fiber whose body starts at `body_pc`, copying `nargs`
    /// args from `fp[start_args..]` into the new stack.
    ///
    /// # Safety
    ///
    /// `fp` must be the live frame pointer and the arg window valid.
    pub(crate) unsafe fn fiber_coinit(
        &mut self,
        fp: *mut Value,
        start_args: u8,
        nargs: u8,
        body_pc: usize,
        init_stack: usize,
    ) -> Result<Value, VmError> {
        let Some(slot) = self.heap.alloc_pool_slot() else {
            return Err(VmError::OutOfMemory);
        };
        // Room for the guard, the first frame header, and the args.
        let cap = std::cmp::max(init_stack, 12 + nargs as usize);
        let stack = alloc_stack(cap);
        if stack.is_null() {
            // SAFETY: the slot was just detached and never initialized.
            unsafe { self.heap.free_pool_slot(slot.as_ptr()) };
            return Err(VmError::OutOfMemory);
        }
        // SAFETY: fresh stack of cap ≥ 12 + nargs slots; the arg window
        // is valid per the contract.
        unsafe {
            for i in 0..nargs as usize {
                let v = *fp.add(start_args as usize + i);
                self.retain(v);
                *stack.add(5 + i) = v;
            }
            // First frame at fp = stack + 1: its caller link points at the
            // stack base, terminating frame walks.
            *stack.add(1 + FRAME_RET_FP) = Value::from_raw(stack as u64);
            (*slot.as_ptr()).fiber = FiberObject {
                header: ObjHeader {
                    type_id: TYPE_FIBER,
                    rc: 1,
                },
                prev: std::ptr::null_mut(),
                stack,
                stack_cap: cap as u32,
                pc: body_pc as u32,
                fp_off: 1,
                parent_dst_local: NO_PARENT_DST,
                num_args: nargs,
                started: 0,
                _pad: 0,
            };
        }
        self.heap.global_rc += 1;
        Ok(Value::pointer(slot.as_ptr()))
    }

    /// Switch into `fiber_val` if it is a live, suspended fiber other
    /// than the current one. The caller must have stored the resume
    /// point in `self.pc` / `self.fp`. Returns whether a switch happened.
    ///
    /// # Safety
    ///
    /// `self.pc`/`self.fp` must reflect the instruction after the resume.
    pub(crate) unsafe fn fiber_resume(&mut self, fiber_val: Value, dst_local: u8) -> bool {
        if !fiber_val.is_pointer() {
            return false;
        }
        // SAFETY: pointer values target live objects.
        let fiber = unsafe { fiber_val.as_pointer::<HeapObject>() } as *mut FiberObject;
        // SAFETY: header read of a live object.
        unsafe {
            if type_of(fiber as *mut HeapObject) != TYPE_FIBER
                || fiber == self.cur_fiber
                || (*fiber).pc == FIBER_TERMINATED
            {
                return false;
            }
            self.save_cur_fiber();
            self.retain(fiber_val);
            (*fiber).prev = self.cur_fiber;
            (*fiber).parent_dst_local = dst_local;
            self.install_fiber(fiber);
            if (*fiber).started == 0 {
                (*fiber).started = 1;
            } else if self.program.ops[self.pc] == OpCode::Coyield as u8 {
                // Parked on a coyield: continue just past it.
                self.pc += 3;
            }
        }
        true
    }

    /// Yield to the parent fiber. The caller must have stored the yield
    /// pc in `self.pc` (the `coyield` opcode itself, so a later resume
    /// can continue at `pc + 3`).
    ///
    /// # Safety
    ///
    /// `self.pc`/`self.fp` must reflect the yield site.
    pub(crate) unsafe fn fiber_yield(&mut self) -> Result<(), VmError> {
        let cur = self.cur_fiber;
        if cur == self.main_fiber_ptr() {
            return Err(self.panic_with("cannot yield from the main fiber"));
        }
        // SAFETY: cur is a live fiber; its parent chain was set on resume.
        unsafe {
            self.save_cur_fiber();
            let parent = (*cur).prev;
            (*cur).prev = std::ptr::null_mut();
            self.install_fiber(parent);
            let dst = (*cur).parent_dst_local;
            if dst != NO_PARENT_DST {
                *self.fp.add(dst as usize) = Value::NONE;
            }
            // Unpin the resumer's retain.
            self.release_object(cur as *mut HeapObject);
        }
        Ok(())
    }

    /// Return from the current fiber, marking it terminated and handing
    /// `ret_val` to the parent. Returns false when the current fiber is
    /// main (the dispatch loop treats that as normal termination).
    ///
    /// # Safety
    ///
    /// `self.pc`/`self.fp` must be current.
    pub(crate) unsafe fn fiber_return(&mut self, ret_val: Value) -> bool {
        let cur = self.cur_fiber;
        if cur == self.main_fiber_ptr() {
            return false;
        }
        // SAFETY: cur is a live fiber; its parent chain was set on resume.
        unsafe {
            self.save_cur_fiber();
            (*cur).pc = FIBER_TERMINATED;
            let parent = (*cur).prev;
            (*cur).prev = std::ptr::null_mut();
            self.install_fiber(parent);
            let dst = (*cur).parent_dst_local;
            if dst != NO_PARENT_DST {
                *self.fp.add(dst as usize) = ret_val;
            } else {
                self.release(ret_val);
            }
            self.release_object(cur as *mut HeapObject);
        }
        true
    }

    unsafe fn save_cur_fiber(&mut self) {
        let cur = self.cur_fiber;
        // SAFETY: cur is live and the registers are coherent.
        unsafe {
            (*cur).stack = self.stack;
            (*cur).stack_cap = self.stack_cap as u32;
            (*cur).pc = self.pc as u32;
            (*cur).fp_off = self.fp.offset_from(self.stack) as u32;
        }
    }

    unsafe fn install_fiber(&mut self, fiber: *mut FiberObject) {
        // SAFETY: fiber is live with a coherent saved state.
        unsafe {
            self.stack = (*fiber).stack;
            self.stack_cap = (*fiber).stack_cap as usize;
            self.fp = self.stack.add((*fiber).fp_off as usize);
            self.pc = (*fiber).pc as usize;
        }
        self.cur_fiber = fiber;
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Release a dying fiber's pending stack.
    ///
    /// Terminated fibers own no values (their epilogue released every
    /// local before `coreturn`). A fiber that never entered its body owns
    /// only the initial args. A fiber suspended mid-body walks its frame
    /// chain, releasing the locals live at each frame's pc.
    ///
    /// # Safety
    ///
    /// `fiber` must point at a live fiber object with rc zero.
    pub(crate) unsafe fn release_fiber_stack(&mut self, fiber: *mut FiberObject) {
        // SAFETY: per the contract.
        unsafe {
            let stack = (*fiber).stack;
            if stack.is_null() {
                return;
            }
            let cap = (*fiber).stack_cap as usize;
            if (*fiber).pc != FIBER_TERMINATED {
                if (*fiber).started == 0 {
                    for i in 0..(*fiber).num_args as usize {
                        self.release(*stack.add(5 + i));
                    }
                } else {
                    let mut fp = stack.add((*fiber).fp_off as usize);
                    let mut pc = (*fiber).pc as usize;
                    loop {
                        self.release_frame_locals(fp, pc);
                        let ret_fp = (*fp.add(FRAME_RET_FP)).raw() as *mut Value;
                        if ret_fp == stack || ret_fp == fp {
                            break;
                        }
                        pc = (*fp.add(FRAME_RET_PC)).raw() as usize;
                        fp = ret_fp;
                    }
                }
            }
            free_stack(stack, cap);
            (*fiber).stack = std::ptr::null_mut();
        }
    }

    /// Release one suspended frame's live locals: a yield site names its
    /// live range inline, anything else goes through the debug table's
    /// end-locals entry.
    unsafe fn release_frame_locals(&mut self, fp: *mut Value, pc: usize) {
        let ops = &self.program.ops;
        if pc >= ops.len() {
            return;
        }
        let mut locals: SmallVec<[u8; 8]> = SmallVec::new();
        if ops[pc] == OpCode::Coyield as u8 {
            let first = ops[pc + 1];
            let last = ops[pc + 2];
            if first <= last {
                locals.extend(first..=last);
            }
        } else if let Some(sym) = self.program.debug.lookup(pc as u32) {
            if sym.end_locals_pc != NULL_ID {
                let p = sym.end_locals_pc as usize;
                match OpCode::from_u8(ops[p]) {
                    Some(OpCode::ReleaseN) => {
                        let n = ops[p + 1] as usize;
                        locals.extend_from_slice(&ops[p + 2..p + 2 + n]);
                    }
                    Some(OpCode::Release) => locals.push(ops[p + 1]),
                    _ => {}
                }
            }
        }
        for local in locals {
            // SAFETY: fp and the local indices come from the frame's own
            // code region.
            unsafe { self.release(*fp.add(local as usize)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::END_NO_RESULT;
    use vesper_bytecode::ProgramBuilder;

    fn test_vm() -> Vm {
        let mut b = ProgramBuilder::new();
        b.op(OpCode::End).u8(END_NO_RESULT);
        let mut vm = Vm::new(b.build());
        // Give the VM a live stack so coinit can read an arg window.
        vm.execute().unwrap();
        vm
    }

    #[test]
    fn test_coinit_copies_args_and_retains() {
        let mut vm = test_vm();
        let s = vm.heap.get_or_intern_string(b"arg").unwrap();
        unsafe {
            *vm.stack.add(4) = s;
            let fv = vm.fiber_coinit(vm.stack, 4, 1, 0, 16).unwrap();
            let fiber = fv.as_pointer::<HeapObject>() as *mut FiberObject;
            assert_eq!((*fiber).num_args, 1);
            assert_eq!((*fiber).started, 0);
            assert_eq!((*(*fiber).stack.add(5)).raw(), s.raw());
            // One count for the binding, one copied into the fiber stack.
            assert_eq!((*s.as_pointer::<HeapObject>()).common.rc, 2);

            // Releasing the unstarted fiber releases exactly the args.
            vm.release(fv);
            assert_eq!((*s.as_pointer::<HeapObject>()).common.rc, 1);
        }
        vm.release(s);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn test_resume_rejects_terminated_and_non_fibers() {
        let mut vm = test_vm();
        unsafe {
            assert!(!vm.fiber_resume(Value::number(1.0), NO_PARENT_DST));
            let fv = vm.fiber_coinit(vm.stack, 4, 0, 0, 16).unwrap();
            let fiber = fv.as_pointer::<HeapObject>() as *mut FiberObject;
            (*fiber).pc = FIBER_TERMINATED;
            assert!(!vm.fiber_resume(fv, NO_PARENT_DST));
            vm.release(fv);
        }
        assert_eq!(vm.global_rc(), 0);
    }
}
