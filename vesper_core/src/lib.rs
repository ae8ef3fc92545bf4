//! Core value representation and error types for the Vesper runtime.
//!
//! This crate is the leaf of the workspace: every other crate depends on it
//! and it depends on nothing. It provides:
//!
//! - **`Value`**: the 64-bit NaN-boxed word every register, stack slot,
//!   constant, and heap field holds
//! - **`VesperError`**: the error type surfaced to embedders
//! - **`TraceFrame`**: one formatted stack-trace entry
//!
//! # Value encoding
//!
//! ```text
//! 63 62          52 51 50      47 46                                  0
//! ┌──┬─────────────┬──┬──────────┬─────────────────────────────────────┐
//! │ S│ exponent    │ Q│   tag    │               payload               │
//! └──┴─────────────┴──┴──────────┴─────────────────────────────────────┘
//!
//! finite double            → the word IS the number
//! S=0, Q=1, tag=0, pay=0   → canonical NaN (still a number)
//! S=0, Q=1, tag=1..14      → primitive (none, bool, int, error, ...)
//! S=1, Q=1                 → heap pointer (48-bit address in payload)
//! S=0, Q=1, tag=15         → panic sentinel (native-call return only)
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod value;

pub use error::{TraceFrame, VesperError, VesperResult};
pub use value::{Tag, Value};

/// Runtime version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Id used by symbol and debug tables to mean "absent".
pub const NULL_ID: u32 = u32::MAX;
