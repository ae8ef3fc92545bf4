//! Panic state and stack-trace construction.
//!
//! A panic carries either an allocated message or an unhandled error
//! value. Once the panic slot is set, the dispatch loop performs no side
//! effect other than unwinding: it returns to the outer wrapper, which
//! builds the trace from the live frame chain and the debug table.

use crate::stack::{FRAME_RET_FP, FRAME_RET_PC};
use crate::vm::Vm;
use smallvec::SmallVec;
use vesper_bytecode::debug::line_col;
use vesper_bytecode::inst_len;
use vesper_core::{TraceFrame, Value, VesperError};

/// The VM's panic slot.
#[derive(Debug, Clone, PartialEq)]
pub enum PanicPayload {
    None,
    /// Allocated message from an illegal operation.
    Msg(String),
    /// An error value that escaped the root frame.
    Err(Value),
}

impl PanicPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, PanicPayload::None)
    }
}

impl Vm {
    /// Walk the live frame chain into trace frames, innermost first.
    ///
    /// The top frame is attributed to the instruction the panic interrupted
    /// by looking up `pc + instruction length`; caller frames use their
    /// saved return pcs.
    pub fn build_stack_trace(&self) -> Vec<TraceFrame> {
        let mut frames: SmallVec<[TraceFrame; 8]> = SmallVec::new();
        let mut pc = {
            let at = self.pc.min(self.program.ops.len().saturating_sub(1));
            (at + inst_len(&self.program.ops, at)) as u32
        };
        let mut fp = self.fp;
        loop {
            if let Some(sym) = self.program.debug.lookup(pc) {
                let (line, col) = line_col(&self.program.src, sym.src_pos);
                frames.push(TraceFrame {
                    name: self.program.frame_name(sym.frame_name_id),
                    line,
                    col,
                });
            }
            if fp == self.stack {
                break;
            }
            // SAFETY: fp lies within the active stack and its header slots
            // were written by the call that pushed the frame.
            unsafe {
                pc = (*fp.add(FRAME_RET_PC)).raw() as u32;
                fp = (*fp.add(FRAME_RET_FP)).raw() as *mut Value;
            }
        }
        frames.into_vec()
    }

    /// Consume the panic slot into the embedder-facing error.
    pub(crate) fn take_panic_error(&mut self) -> VesperError {
        let trace = self.build_stack_trace();
        let payload = std::mem::replace(&mut self.panic, PanicPayload::None);
        let msg = match payload {
            PanicPayload::Msg(msg) => msg,
            PanicPayload::Err(err) => {
                let mut text = format!("unhandled error: #{}", self.syms.tag_lit_name(err.error_tag()));
                if !err.is_error() {
                    text = "unhandled error".to_string();
                }
                self.release(err);
                text
            }
            PanicPayload::None => "panic".to_string(),
        };
        VesperError::Panic { msg, trace }
    }
}
