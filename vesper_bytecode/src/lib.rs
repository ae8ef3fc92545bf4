//! Bytecode stream, opcode set, and program container.
//!
//! The code stream is a packed byte array: one opcode byte followed by a
//! fixed number of operand bytes per instruction. Multi-byte operands are
//! little-endian and unaligned. The stream is *mutable* by design: inline
//! caches rewrite instruction bytes in place, and the dispatch loop is the
//! stream's single owner (scheduling is cooperative, so there are no
//! concurrent readers).
//!
//! A [`Program`] bundles the stream with everything execution needs:
//! the constant pool, the static string buffer, the name table used by
//! stack traces, and the pc-sorted [`DebugTable`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod builder;
pub mod debug;
pub mod op;
pub mod program;

pub use builder::ProgramBuilder;
pub use debug::{DebugSym, DebugTable};
pub use op::{inst_len, OpCode};
pub use program::{Program, UstringHeader, USTRING_HEADER_LEN};
