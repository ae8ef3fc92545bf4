//! Low-level program assembly.
//!
//! The real compiler is an external collaborator; this builder is the
//! surface embedders and the integration tests use to assemble programs
//! byte by byte. It offers raw emission, constant/static-string/name
//! registration, u16 patching for forward jumps, and debug-entry
//! recording.

use crate::debug::{DebugSym, DebugTable};
use crate::op::OpCode;
use crate::program::{Program, UstringHeader, USTRING_HEADER_LEN};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use vesper_core::{Value, NULL_ID};

#[derive(Default)]
pub struct ProgramBuilder {
    ops: Vec<u8>,
    consts: Vec<u64>,
    strbuf: Vec<u8>,
    names: Vec<Arc<str>>,
    name_ids: FxHashMap<Arc<str>, u32>,
    debug_syms: Vec<DebugSym>,
    src: String,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Emission ───────────────────────────────────────────────────────

    /// Current pc (next byte to be emitted).
    #[inline]
    pub fn pos(&self) -> u32 {
        self.ops.len() as u32
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.ops.push(op as u8);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.ops.push(v);
        self
    }

    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.ops.push(v as u8);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.ops.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    /// Overwrite a previously emitted u16 (forward-jump patching).
    pub fn patch_u16(&mut self, at: u32, v: u16) {
        let at = at as usize;
        self.ops[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite a previously emitted byte.
    pub fn patch_u8(&mut self, at: u32, v: u8) {
        self.ops[at as usize] = v;
    }

    // ── Pools ──────────────────────────────────────────────────────────

    /// Register a constant word, returning its 8-bit pool index.
    pub fn const_value(&mut self, v: Value) -> u8 {
        let idx = self.consts.len();
        assert!(idx < 256, "constant pool overflow");
        self.consts.push(v.raw());
        idx as u8
    }

    pub fn const_number(&mut self, n: f64) -> u8 {
        self.const_value(Value::number(n))
    }

    /// Append an ASCII literal to the string buffer and return its
    /// static-astring slice value.
    pub fn static_astring(&mut self, s: &str) -> Value {
        assert!(s.is_ascii(), "astring literal must be ASCII");
        let start = self.strbuf.len() as u32;
        self.strbuf.extend_from_slice(s.as_bytes());
        Value::static_astring(start, s.len() as u16)
    }

    /// Append a UTF-8 literal with its 12-byte header and return its
    /// static-ustring slice value.
    pub fn static_ustring(&mut self, s: &str) -> Value {
        let header_at = self.strbuf.len() as u32;
        self.strbuf
            .extend_from_slice(&[0u8; USTRING_HEADER_LEN as usize]);
        let start = header_at + USTRING_HEADER_LEN;
        self.strbuf.extend_from_slice(s.as_bytes());
        UstringHeader::new(s.chars().count() as u32).store(&mut self.strbuf, start);
        Value::static_ustring(start, s.len() as u16)
    }

    /// Intern a function name for the debug table.
    pub fn name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.name_ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        let arc: Arc<str> = Arc::from(name);
        self.names.push(arc.clone());
        self.name_ids.insert(arc, id);
        id
    }

    // ── Debug info ─────────────────────────────────────────────────────

    /// Record a debug entry starting at the current pc.
    pub fn debug_here(&mut self, src_pos: u32, frame_name_id: u32) -> &mut Self {
        self.debug_syms
            .push(DebugSym::new(self.pos(), src_pos, frame_name_id));
        self
    }

    /// Record a debug entry with an end-locals pc (filled later via
    /// [`ProgramBuilder::patch_end_locals`] when the pc is not yet known).
    pub fn debug_with_end_locals(
        &mut self,
        src_pos: u32,
        frame_name_id: u32,
        end_locals_pc: u32,
    ) -> &mut Self {
        self.debug_syms.push(DebugSym {
            pc: self.pos(),
            src_pos,
            frame_name_id,
            end_locals_pc,
        });
        self
    }

    /// Set the end-locals pc on the most recent debug entry.
    pub fn patch_end_locals(&mut self, end_locals_pc: u32) {
        let sym = self
            .debug_syms
            .last_mut()
            .expect("no debug entry to patch");
        sym.end_locals_pc = end_locals_pc;
    }

    /// Attach the source text traces cite.
    pub fn source(&mut self, src: &str) -> &mut Self {
        self.src = src.to_owned();
        self
    }

    // ── Build ──────────────────────────────────────────────────────────

    pub fn build(self) -> Program {
        Program {
            ops: self.ops,
            consts: self.consts,
            strbuf: self.strbuf,
            names: self.names,
            debug: Arc::new(DebugTable::new(self.debug_syms)),
            src: Arc::from(self.src.as_str()),
        }
    }
}

/// Shorthand for a program whose debug table attributes everything to
/// top-level code at offset zero.
pub fn minimal_program(emit: impl FnOnce(&mut ProgramBuilder)) -> Program {
    let mut b = ProgramBuilder::new();
    b.debug_here(0, NULL_ID);
    emit(&mut b);
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_patch() {
        let mut b = ProgramBuilder::new();
        b.op(OpCode::Jump);
        let at = b.pos();
        b.u16(0);
        b.op(OpCode::End);
        b.patch_u16(at, 3);
        let prog = b.build();
        assert_eq!(prog.ops, vec![OpCode::Jump as u8, 3, 0, OpCode::End as u8]);
    }

    #[test]
    fn test_static_ustring_header() {
        let mut b = ProgramBuilder::new();
        let v = b.static_ustring("héllo");
        let prog = b.build();
        let (start, len) = v.static_string_parts();
        assert_eq!(len as usize, "héllo".len());
        let h = UstringHeader::load(&prog.strbuf, start);
        assert_eq!(h.char_len, 5);
        assert_eq!(prog.static_str_bytes(start, len), "héllo".as_bytes());
    }

    #[test]
    fn test_name_dedup() {
        let mut b = ProgramBuilder::new();
        let a = b.name("fact");
        let c = b.name("fact");
        assert_eq!(a, c);
        let d = b.name("main_loop");
        assert_ne!(a, d);
    }
}
