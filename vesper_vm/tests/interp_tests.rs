//! End-to-end interpreter scenarios over hand-assembled programs.
//!
//! Programs are built with `ProgramBuilder` following the frame
//! convention: four header slots per frame, args from slot 4, locals
//! after. The main frame sits at the stack base.

use vesper_bytecode::{OpCode, ProgramBuilder};
use vesper_core::{Value, VesperError, NULL_ID};
use vesper_runtime::FIRST_USER_TYPE;
use vesper_vm::{FuncSymbol, Vm, END_NO_RESULT};

fn top_level(b: &mut ProgramBuilder) {
    b.debug_here(0, NULL_ID);
}

/// Function-symbol ids are only known once the VM (and its core module)
/// exists, so call sites emit a placeholder and tests patch the resolved
/// id into the operand stream afterwards.
fn patch_sym(vm: &mut Vm, at: u32, sym: u32) {
    let enc = (sym as u16).to_le_bytes();
    vm.program.ops[at as usize] = enc[0];
    vm.program.ops[at as usize + 1] = enc[1];
}

// =============================================================================
// Arithmetic, control flow, collections
// =============================================================================

#[test]
fn test_arithmetic_smoke() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    b.op(OpCode::ConstI8).i8(41).u8(4);
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::Add).u8(4).u8(5).u8(6);
    b.op(OpCode::End).u8(6);
    let mut vm = Vm::new(b.build());
    assert_eq!(vm.execute().unwrap().as_f64(), 42.0);
}

#[test]
fn test_arithmetic_coercion_fallback() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let s = b.static_astring("12");
    let idx = b.const_value(s);
    b.op(OpCode::ConstOp).u8(idx).u8(4);
    b.op(OpCode::True).u8(5);
    // "12" + true coerces to 12 + 1.
    b.op(OpCode::Add).u8(4).u8(5).u8(6);
    b.op(OpCode::End).u8(6);
    let mut vm = Vm::new(b.build());
    assert_eq!(vm.execute().unwrap().as_f64(), 13.0);
}

#[test]
fn test_jump_cond_complements_jump_not_cond() {
    // For any condition value, jump_cond jumps iff jump_not_cond does not.
    let conds = [
        Value::TRUE,
        Value::FALSE,
        Value::NONE,
        Value::number(0.0),
        Value::number(2.5),
        Value::integer(0),
        Value::integer(-3),
    ];
    for cond in conds {
        let run = |positive: bool| -> f64 {
            let mut b = ProgramBuilder::new();
            top_level(&mut b);
            let idx = b.const_value(cond);
            b.op(OpCode::ConstOp).u8(idx).u8(4);
            let jump_pc = b.pos();
            b.op(if positive {
                OpCode::JumpCond
            } else {
                OpCode::JumpNotCond
            })
            .u8(4);
            let patch_at = b.pos();
            b.u16(0);
            // Fall-through: result = 0.
            b.op(OpCode::ConstI8).i8(0).u8(5);
            let skip_pc = b.pos();
            b.op(OpCode::Jump);
            let skip_patch = b.pos();
            b.u16(0);
            // Jump target: result = 1.
            let taken = b.pos();
            b.patch_u16(patch_at, (taken - jump_pc) as u16);
            b.op(OpCode::ConstI8).i8(1).u8(5);
            let end = b.pos();
            b.patch_u16(skip_patch, (end - skip_pc) as u16);
            b.op(OpCode::End).u8(5);
            let mut vm = Vm::new(b.build());
            vm.execute().unwrap().as_f64()
        };
        let jumped = run(true);
        let not_jumped = run(false);
        assert_eq!(jumped, 1.0 - not_jumped, "cond {cond:?}");
    }
}

#[test]
fn test_for_range_loop_sums() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    b.op(OpCode::ConstI8).i8(0).u8(4);
    b.op(OpCode::ConstI8).i8(10).u8(5);
    b.op(OpCode::ConstI8).i8(1).u8(6);
    b.op(OpCode::ConstI8).i8(0).u8(8);
    let init_pc = b.pos();
    b.op(OpCode::ForRangeInit).u8(4).u8(5).u8(6).u8(7);
    let init_patch = b.pos();
    b.u16(0);
    let body = b.pos();
    b.op(OpCode::Add).u8(8).u8(7).u8(8);
    let range_pc = b.pos();
    b.patch_u16(init_patch, (range_pc - init_pc) as u16);
    b.op(OpCode::ForRange).u8(7).u8(5).u8(6).u16((range_pc - body) as u16);
    b.op(OpCode::End).u8(8);
    let mut vm = Vm::new(b.build());
    // 0 + 1 + ... + 9
    assert_eq!(vm.execute().unwrap().as_f64(), 45.0);
    // The init op specialized the back-edge to the forward form.
    assert!(vm.profiler.count(OpCode::ForRange) >= 9);
}

#[test]
fn test_match_selects_case_and_else() {
    let run = |subject: i8| -> f64 {
        let mut b = ProgramBuilder::new();
        top_level(&mut b);
        let c1 = b.const_number(1.0);
        let c2 = b.const_number(2.0);
        b.op(OpCode::ConstI8).i8(subject).u8(4);
        let match_pc = b.pos();
        // match(4) { 1 => .., 2 => .., else => .. }; offsets patched below.
        b.op(OpCode::Match).u8(4).u8(2);
        let case1_at = b.pos();
        b.u8(c1).u16(0);
        let case2_at = b.pos();
        b.u8(c2).u16(0);
        let else_at = b.pos();
        b.u16(0);

        b.patch_u16(case1_at + 1, (b.pos() - match_pc) as u16);
        b.op(OpCode::ConstI8).i8(10).u8(5);
        let j1 = b.pos();
        b.op(OpCode::Jump);
        let j1_at = b.pos();
        b.u16(0);

        b.patch_u16(case2_at + 1, (b.pos() - match_pc) as u16);
        b.op(OpCode::ConstI8).i8(20).u8(5);
        let j2 = b.pos();
        b.op(OpCode::Jump);
        let j2_at = b.pos();
        b.u16(0);

        b.patch_u16(else_at, (b.pos() - match_pc) as u16);
        b.op(OpCode::ConstI8).i8(30).u8(5);

        let end = b.pos();
        b.patch_u16(j1_at, (end - j1) as u16);
        b.patch_u16(j2_at, (end - j2) as u16);
        b.op(OpCode::End).u8(5);
        let mut vm = Vm::new(b.build());
        vm.execute().unwrap().as_f64()
    };
    assert_eq!(run(1), 10.0);
    assert_eq!(run(2), 20.0);
    assert_eq!(run(7), 30.0);
}

#[test]
fn test_map_literal_index_and_overwrite() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let key = b.static_astring("count");
    let kidx = b.const_value(key);
    // {"count": 3}
    b.op(OpCode::ConstOp).u8(kidx).u8(4);
    b.op(OpCode::ConstI8).i8(3).u8(5);
    b.op(OpCode::Map).u8(4).u8(1).u8(6);
    // m["count"] = 8 (releasing form; prior value is a number)
    b.op(OpCode::ConstOp).u8(kidx).u8(7);
    b.op(OpCode::ConstI8).i8(8).u8(8);
    b.op(OpCode::SetIndexRelease).u8(6).u8(7).u8(8);
    // result = m["count"]
    b.op(OpCode::ConstOp).u8(kidx).u8(9);
    b.op(OpCode::Index).u8(6).u8(9).u8(10);
    b.op(OpCode::Release).u8(6);
    b.op(OpCode::End).u8(10);
    let mut vm = Vm::new(b.build());
    assert_eq!(vm.execute().unwrap().as_f64(), 8.0);
    assert_eq!(vm.global_rc(), 0);
}

#[test]
fn test_list_set_index_past_length_panics() {
    let mut b = ProgramBuilder::new();
    b.source("a = [1]\na[5] = 2\n");
    top_level(&mut b);
    b.op(OpCode::ConstI8).i8(1).u8(4);
    b.op(OpCode::List).u8(4).u8(1).u8(5);
    b.op(OpCode::ConstI8).i8(5).u8(6);
    b.op(OpCode::ConstI8).i8(2).u8(7);
    b.op(OpCode::SetIndexRelease).u8(5).u8(6).u8(7);
    b.op(OpCode::End).u8(END_NO_RESULT);
    let mut vm = Vm::new(b.build());
    let err = vm.execute().unwrap_err();
    assert!(matches!(err, VesperError::Panic { .. }));
    assert!(err.panic_msg().unwrap().contains("out of bounds"));
}

// =============================================================================
// Scenario 1: refcount balance
// =============================================================================

#[test]
fn test_refcount_balance_after_rebinding() {
    // a = [1,2,3]; b = a; b = none
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    b.op(OpCode::ConstI8).i8(1).u8(4);
    b.op(OpCode::ConstI8).i8(2).u8(5);
    b.op(OpCode::ConstI8).i8(3).u8(6);
    b.op(OpCode::List).u8(4).u8(3).u8(7);
    b.op(OpCode::CopyRetainSrc).u8(7).u8(8);
    b.op(OpCode::Release).u8(8);
    b.op(OpCode::None).u8(8);
    b.op(OpCode::Release).u8(7);
    b.op(OpCode::End).u8(END_NO_RESULT);
    let mut vm = Vm::new(b.build());
    vm.execute().unwrap();
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_object_count(), 0);
}

// =============================================================================
// Scenario 2: inline caches
// =============================================================================

#[test]
fn test_field_inline_cache_specializes_on_second_call() {
    let mut b = ProgramBuilder::new();
    b.source("func getx(o):\n  return o.x\n");
    top_level(&mut b);

    // main: two same-shape objects, two calls through one Field site.
    b.op(OpCode::ConstI8).i8(7).u8(4);
    b.op(OpCode::Object).u8(0).u8(4).u8(1).u8(5);
    b.op(OpCode::ConstI8).i8(9).u8(4);
    b.op(OpCode::Object).u8(0).u8(4).u8(1).u8(6);
    b.op(OpCode::CopyRetainSrc).u8(5).u8(11);
    b.op(OpCode::CallSym).u8(7).u8(1).u8(1);
    let call1_sym_at = b.pos();
    b.u16(0).u8(0).u8(0);
    b.op(OpCode::CopyRetainSrc).u8(6).u8(11);
    b.op(OpCode::CallSym).u8(7).u8(1).u8(1);
    let call2_sym_at = b.pos();
    b.u16(0).u8(0).u8(0);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::Release).u8(6);
    b.op(OpCode::End).u8(7);

    // getx(o): field read, release the arg, return.
    let getx_name = b.name("getx");
    let func_pc = b.pos();
    b.debug_here(0, getx_name);
    b.op(OpCode::Field).u8(4).u8(0).u8(0).u8(0).u8(0).u8(0);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::Ret1);

    let mut vm = Vm::new(b.build());
    let point = vm.syms.add_struct("Point", 1);
    assert_eq!(point, FIRST_USER_TYPE);
    let x = vm.syms.ensure_field_sym("x");
    vm.syms.set_field_offset(point, x, 0);
    let getx = vm.syms.ensure_func_sym("getx", 1);
    vm.syms.bind_func(
        getx,
        FuncSymbol::Func {
            pc: func_pc,
            num_params: 1,
            num_locals: 8,
        },
    );
    patch_sym(&mut vm, call1_sym_at, getx);
    patch_sym(&mut vm, call2_sym_at, getx);

    let out = vm.execute().unwrap();
    assert_eq!(out.as_f64(), 9.0);
    // First access runs the general form and rewrites the site; the
    // second runs the specialized form.
    assert_eq!(vm.profiler.count(OpCode::Field), 1);
    assert_eq!(vm.profiler.count(OpCode::FieldIC), 1);
    // The call site specialized too.
    assert_eq!(vm.profiler.count(OpCode::CallSym), 1);
    assert_eq!(vm.profiler.count(OpCode::CallFuncIC), 1);
    assert_eq!(vm.global_rc(), 0);
}

// =============================================================================
// Scenario 3: fiber round trip
// =============================================================================

#[test]
fn test_fiber_yield_then_return() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let coinit_pc = b.pos();
    b.op(OpCode::Coinit).u8(0).u8(0);
    let body_len_at = b.pos();
    b.u8(0).u8(32).u8(4);
    let body = b.pos();
    // Fiber body: yield once (no live locals), then return 5.
    b.op(OpCode::Coyield).u8(1).u8(0);
    b.op(OpCode::ConstI8).i8(5).u8(1);
    b.op(OpCode::Coreturn);
    let body_len = b.pos() - body;
    assert_eq!(coinit_pc + 6, body);
    b.patch_u8(body_len_at, body_len as u8);

    b.op(OpCode::Coresume).u8(4).u8(5);
    b.op(OpCode::Coresume).u8(4).u8(6);
    b.op(OpCode::Coresume).u8(4).u8(7);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(6);

    let mut vm = Vm::new(b.build());
    let out = vm.execute().unwrap();
    // First resumption observes the yield (none), the second the return
    // value, the third finds the fiber terminated.
    assert!(vm.stack_value(5).is_none());
    assert_eq!(out.as_f64(), 5.0);
    assert!(vm.stack_value(7).is_none());
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_object_count(), 0);
}

#[test]
fn test_fiber_released_while_suspended_frees_yield_locals() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let s = b.static_astring("pinned by the fiber");
    let sidx = b.const_value(s);
    let coinit_pc = b.pos();
    b.op(OpCode::Coinit).u8(0).u8(0);
    let body_len_at = b.pos();
    b.u8(0).u8(32).u8(4);
    let body = b.pos();
    // Body: intern a heap string into local 4 (fp = stack + 1), then
    // yield with local 4 live.
    b.op(OpCode::ConstOp).u8(sidx).u8(4);
    b.op(OpCode::ConstOp).u8(sidx).u8(5);
    b.op(OpCode::StrConcat).u8(4).u8(5).u8(6);
    b.op(OpCode::Coyield).u8(6).u8(6);
    b.op(OpCode::Coreturn);
    let body_len = b.pos() - body;
    assert_eq!(coinit_pc + 6, body);
    b.patch_u8(body_len_at, body_len as u8);

    b.op(OpCode::Coresume).u8(4).u8(5);
    // Drop the fiber while it is parked on the coyield.
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::End).u8(END_NO_RESULT);

    let mut vm = Vm::new(b.build());
    vm.execute().unwrap();
    // The concatenated heap string owned at the yield site was released.
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_object_count(), 0);
}

// =============================================================================
// Scenario 4: stack growth under recursion
// =============================================================================

#[test]
fn test_recursion_grows_stack_and_rewrites_frames() {
    // sum(n) = n == 0 ? 0 : n + sum(n - 1), at depth 4096 on a 511-slot
    // initial stack.
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let n4096 = b.const_number(4096.0);
    b.op(OpCode::ConstOp).u8(n4096).u8(11);
    b.op(OpCode::CallSym).u8(7).u8(1).u8(1);
    let outer_sym_at = b.pos();
    b.u16(0).u8(0).u8(0);
    b.op(OpCode::End).u8(7);

    let sum_name = b.name("sum");
    let func_pc = b.pos();
    b.debug_here(0, sum_name);
    b.op(OpCode::ConstI8).i8(0).u8(5);
    b.op(OpCode::CompareEq).u8(4).u8(5).u8(6);
    let branch_pc = b.pos();
    b.op(OpCode::JumpNotCond).u8(6);
    let branch_at = b.pos();
    b.u16(0);
    b.op(OpCode::ConstI8).i8(0).u8(0);
    b.op(OpCode::Ret1);
    let else_pc = b.pos();
    b.patch_u16(branch_at, (else_pc - branch_pc) as u16);
    b.op(OpCode::ConstI8).i8(1).u8(5);
    b.op(OpCode::Sub).u8(4).u8(5).u8(11);
    b.op(OpCode::CallSym).u8(7).u8(1).u8(1);
    let inner_sym_at = b.pos();
    b.u16(0).u8(0).u8(0);
    b.op(OpCode::Add).u8(4).u8(7).u8(0);
    b.op(OpCode::Ret1);

    let mut vm = Vm::with_stack_size(b.build(), 511);
    let sum = vm.syms.ensure_func_sym("sum", 1);
    vm.syms.bind_func(
        sum,
        FuncSymbol::Func {
            pc: func_pc,
            num_params: 1,
            num_locals: 12,
        },
    );
    patch_sym(&mut vm, outer_sym_at, sum);
    patch_sym(&mut vm, inner_sym_at, sum);
    let out = vm.execute().unwrap();
    assert_eq!(out.as_f64(), 4096.0 * 4097.0 / 2.0);
}

// =============================================================================
// Scenario 5: cycle detection
// =============================================================================

#[test]
fn test_self_referencing_list_breaks_via_check_memory() {
    // a = []; a.append(a); a goes out of scope.
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    b.op(OpCode::List).u8(4).u8(0).u8(5);
    // a.append(a): receiver at 4+4=8, arg at 9, both retained copies.
    b.op(OpCode::CopyRetainSrc).u8(5).u8(8);
    b.op(OpCode::CopyRetainSrc).u8(5).u8(9);
    b.op(OpCode::CallObjSym).u8(4).u8(1).u8(0).u16(0).u16(0).u8(0);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::End).u8(END_NO_RESULT);

    let mut vm = Vm::new(b.build());
    let append = vm.syms.ensure_method_sym("append");
    assert_eq!(append, 0, "core installs `append` as method sym 0");
    vm.execute().unwrap();

    // The self edge keeps the list alive past its binding.
    assert_eq!(vm.global_rc(), 1);
    let report = vm.check_memory();
    assert!(!report.clean);
    assert_eq!(report.roots_freed, 1);
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_object_count(), 0);
}

// =============================================================================
// Scenario 6: panic stack trace
// =============================================================================

#[test]
fn test_missing_field_panic_names_function_and_position() {
    let src = "func boom(o):\n  return o.y\nboom(p)\n";
    let mut b = ProgramBuilder::new();
    b.source(src);
    // Top-level entry covering the call on line 3.
    b.debug_here(27, NULL_ID);
    b.op(OpCode::ConstI8).i8(1).u8(4);
    b.op(OpCode::Object).u8(0).u8(4).u8(1).u8(5);
    b.op(OpCode::CopyRetainSrc).u8(5).u8(11);
    b.op(OpCode::CallSym).u8(7).u8(1).u8(1);
    let call_sym_at = b.pos();
    b.u16(0).u8(0).u8(0);
    b.op(OpCode::Release).u8(5);
    b.op(OpCode::End).u8(END_NO_RESULT);

    let boom_name = b.name("boom");
    let func_pc = b.pos();
    // `o.y` sits at line 2, column 10.
    b.debug_here(23, boom_name);
    b.op(OpCode::Field).u8(4).u8(0).u8(1).u8(0).u8(0).u8(0);
    b.op(OpCode::Release).u8(4);
    b.op(OpCode::Ret1);

    let mut vm = Vm::new(b.build());
    let point = vm.syms.add_struct("Point", 1);
    let x = vm.syms.ensure_field_sym("x");
    let y = vm.syms.ensure_field_sym("y");
    assert_eq!(y, 1, "test encodes field sym 1 in the Field operands");
    vm.syms.set_field_offset(point, x, 0);
    let boom = vm.syms.ensure_func_sym("boom", 1);
    vm.syms.bind_func(
        boom,
        FuncSymbol::Func {
            pc: func_pc,
            num_params: 1,
            num_locals: 8,
        },
    );
    patch_sym(&mut vm, call_sym_at, boom);

    let err = vm.execute().unwrap_err();
    let VesperError::Panic { msg, trace } = err else {
        panic!("expected a panic");
    };
    assert!(msg.contains("no field"), "msg: {msg}");
    assert!(msg.contains('y'), "msg: {msg}");
    assert_eq!(&*trace[0].name, "boom");
    assert_eq!((trace[0].line, trace[0].col), (2, 10));
    assert_eq!(&*trace[1].name, "main");
    assert_eq!(trace[1].line, 3);
}

// =============================================================================
// Errors and try_value
// =============================================================================

#[test]
fn test_try_value_passes_non_errors_through() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    b.op(OpCode::ConstI8).i8(7).u8(4);
    b.op(OpCode::TryValue).u8(4).u8(5).u16(100);
    b.op(OpCode::End).u8(5);
    let mut vm = Vm::new(b.build());
    // Non-error: lands in dst, no jump taken.
    assert_eq!(vm.execute().unwrap().as_f64(), 7.0);
}

#[test]
fn test_unhandled_error_at_root_becomes_panic() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let err = b.const_value(Value::error(3));
    b.op(OpCode::ConstOp).u8(err).u8(4);
    b.op(OpCode::TryValue).u8(4).u8(5).u16(100);
    b.op(OpCode::End).u8(5);
    let mut vm = Vm::new(b.build());
    let failure = vm.execute().unwrap_err();
    assert!(matches!(failure, VesperError::Panic { .. }));
    assert!(failure.panic_msg().unwrap().contains("unhandled error"));
}

#[test]
fn test_closure_arity_mismatch_writes_error_value() {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    // lambda of two params, called with one arg.
    b.op(OpCode::Lambda);
    let lambda_patch = b.pos();
    b.u16(0).u8(2).u8(8).u8(4);
    b.op(OpCode::ConstI8).i8(1).u8(11); // arg0 for call at start=7
    b.op(OpCode::Copy).u8(4).u8(12); // callee slot = start + 4 + nargs
    b.op(OpCode::Call1).u8(7).u8(1);
    b.op(OpCode::End).u8(7);
    let body = b.pos();
    b.patch_u16(lambda_patch, body as u16);
    b.op(OpCode::Ret0);

    let mut vm = Vm::new(b.build());
    let out = vm.execute().unwrap();
    assert!(out.is_error());
    assert_eq!(out.error_tag(), vm.error_tags.invalid_signature);
    assert_eq!(vm.global_rc(), 0);
    assert_eq!(vm.heap.live_object_count(), 0);
}

// =============================================================================
// String interning laws
// =============================================================================

fn build_concat_program() -> (Vm, u8, u8) {
    let mut b = ProgramBuilder::new();
    top_level(&mut b);
    let s_ab = b.static_astring("ab");
    let s_cd = b.static_astring("cd");
    let s_a = b.static_astring("a");
    let s_b = b.static_astring("b");
    let i_ab = b.const_value(s_ab);
    let i_cd = b.const_value(s_cd);
    let i_a = b.const_value(s_a);
    let i_b = b.const_value(s_b);
    b.op(OpCode::ConstOp).u8(i_ab).u8(4);
    b.op(OpCode::ConstOp).u8(i_cd).u8(5);
    b.op(OpCode::StrConcat).u8(4).u8(5).u8(6);
    b.op(OpCode::ConstOp).u8(i_a).u8(7);
    b.op(OpCode::ConstOp).u8(i_b).u8(8);
    b.op(OpCode::ConstOp).u8(i_cd).u8(9);
    b.op(OpCode::StrConcat3).u8(7).u8(10);
    b.op(OpCode::End).u8(END_NO_RESULT);
    (Vm::new(b.build()), 6, 10)
}

#[test]
fn test_concat_interning_pointer_equality() {
    let (mut vm, two_way, three_way) = build_concat_program();
    vm.execute().unwrap();
    let a = vm.stack_value(two_way as usize);
    let b = vm.stack_value(three_way as usize);
    assert!(a.is_pointer());
    // concat("ab","cd") and concat3("a","b","cd") canonicalize to the
    // same interned object.
    assert_eq!(a.raw(), b.raw());
    vm.release(a);
    vm.release(b);
    assert_eq!(vm.global_rc(), 0);
}
