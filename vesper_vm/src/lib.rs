//! The Vesper execution core: a register-based bytecode interpreter with a
//! pooled heap, reference-counted objects, cooperative fibers, and
//! inline-caching dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                             Vm                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌───────────────┐  ┌───────────────────────┐ │
//! │  │  Program  │  │  value stack  │  │  Heap (pool + intern) │ │
//! │  │ ops/consts│  │  fp ──► frame │  │  global_rc diagnostic │ │
//! │  └───────────┘  └───────────────┘  └───────────────────────┘ │
//! │                                                              │
//! │  ┌───────────────┐  ┌────────────┐  ┌─────────────────────┐  │
//! │  │ SymbolTables  │  │   fibers   │  │ modules / natives   │  │
//! │  │ (MRU caches)  │  │ prev chain │  │ (core builtins)     │  │
//! │  └───────────────┘  └────────────┘  └─────────────────────┘  │
//! │                                                              │
//! │  dispatch loop: decode → execute → rewrite inline caches     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One `Vm` per embedding; nothing is process-global. Scheduling is
//! cooperative: the only suspension points are the four fiber opcodes, so
//! the mutable bytecode stream and the heap need no synchronization.
//!
//! # Example
//!
//! ```ignore
//! use vesper_bytecode::{OpCode, ProgramBuilder};
//! use vesper_vm::Vm;
//!
//! let mut b = ProgramBuilder::new();
//! b.debug_here(0, vesper_core::NULL_ID);
//! b.op(OpCode::ConstI8).i8(41).u8(4);
//! b.op(OpCode::ConstI8).i8(1).u8(5);
//! b.op(OpCode::Add).u8(4).u8(5).u8(6);
//! b.op(OpCode::End).u8(6);
//! let mut vm = Vm::new(b.build());
//! assert_eq!(vm.execute().unwrap().as_f64(), 42.0);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod cycle;
pub mod dispatch;
pub mod fiber;
pub mod modules;
pub mod profiler;
pub mod rc;
pub mod stack;
pub mod symbols;
pub mod trace;
pub mod vm;

pub use cycle::CycleReport;
pub use modules::{Module, ModuleLoader, ModuleSym, NativeFn, NativeObjFn, NativeObjFn2};
pub use profiler::OpProfiler;
pub use symbols::{FuncSymbol, MethodEntry, SymbolTables};
pub use trace::PanicPayload;
pub use vm::{Vm, END_NO_RESULT};
