//! Pooled heap and managed object kinds for the Vesper runtime.
//!
//! Small objects live in 40-byte slots inside fixed-size pages threaded
//! into a free-span freelist; oversized objects come from the general
//! allocator behind an identical header. Every object kind's first word is
//! its type id, the second its reference count. Reclamation is
//! deterministic reference counting driven by the VM crate; this crate
//! owns layout, allocation, and the raw data structures (strings, lists,
//! the value map, the intern map).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                           Heap                             │
//! ├────────────────────────────────────────────────────────────┤
//! │  pages: ┌──────────┐ ┌──────────┐ ┌──────────┐             │
//! │         │ 102 slots│ │ 102 slots│ │ 102 slots│  × 40 bytes │
//! │         └──────────┘ └──────────┘ └──────────┘             │
//! │              │  free spans threaded head → next → ...      │
//! │                                                            │
//! │  intern: FxHashMap<bytes ≤ 64, *mut HeapObject>            │
//! │  global_rc / HeapStats: diagnostic counters                │
//! └────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod heap;
pub mod intern;
pub mod list;
pub mod map;
pub mod object;
pub mod string;

pub use heap::{Heap, HeapStats, PAGE_SLOTS, POOL_SLOT_SIZE};
pub use intern::{InternMap, INTERN_MAX_LEN};
pub use map::ValueMap;
pub use object::*;
