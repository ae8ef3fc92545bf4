//! Dispatch-loop throughput on a numeric range loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vesper_bytecode::{OpCode, ProgramBuilder};
use vesper_core::NULL_ID;
use vesper_vm::Vm;

/// sum 0..1000 with a specialized for-range back edge.
fn loop_program() -> vesper_bytecode::Program {
    let mut b = ProgramBuilder::new();
    b.debug_here(0, NULL_ID);
    b.op(OpCode::ConstI8).i8(0).u8(4);
    let thousand = b.const_number(1000.0);
    b.op(OpCode::ConstOp).u8(thousand).u8(5);
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
    b.op(OpCode::ForRange)
        .u8(7)
        .u8(5)
        .u8(6)
        .u16((range_pc - body) as u16);
    b.op(OpCode::End).u8(8);
    b.build()
}

fn bench_dispatch(c: &mut Criterion) {
    c.bench_function("range_loop_1k", |bench| {
        let mut vm = Vm::new(loop_program());
        bench.iter(|| {
            let out = vm.execute().unwrap();
            black_box(out.as_f64())
        });
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
