//! The program container: code stream, constants, static strings, names.

use crate::debug::DebugTable;
use std::sync::Arc;

/// Byte length of the header preceding every static UTF-8 string in the
/// string buffer.
pub const USTRING_HEADER_LEN: u32 = 12;

/// Header stored in the string buffer immediately before each static UTF-8
/// string: the pre-computed code-point length plus an MRU
/// (byte-index, char-index) pair giving O(1) amortized random access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UstringHeader {
    pub char_len: u32,
    pub mru_byte_idx: u32,
    pub mru_char_idx: u32,
}

impl UstringHeader {
    pub fn new(char_len: u32) -> Self {
        UstringHeader {
            char_len,
            mru_byte_idx: 0,
            mru_char_idx: 0,
        }
    }

    /// Decode from the 12 bytes ending at `start` (the string's offset).
    pub fn load(strbuf: &[u8], start: u32) -> Self {
        let base = (start - USTRING_HEADER_LEN) as usize;
        let word = |o: usize| {
            u32::from_le_bytes([
                strbuf[base + o],
                strbuf[base + o + 1],
                strbuf[base + o + 2],
                strbuf[base + o + 3],
            ])
        };
        UstringHeader {
            char_len: word(0),
            mru_byte_idx: word(4),
            mru_char_idx: word(8),
        }
    }

    /// Encode back into the buffer. Only the MRU words ever change after
    /// build time.
    pub fn store(self, strbuf: &mut [u8], start: u32) {
        let base = (start - USTRING_HEADER_LEN) as usize;
        strbuf[base..base + 4].copy_from_slice(&self.char_len.to_le_bytes());
        strbuf[base + 4..base + 8].copy_from_slice(&self.mru_byte_idx.to_le_bytes());
        strbuf[base + 8..base + 12].copy_from_slice(&self.mru_char_idx.to_le_bytes());
    }
}

/// A complete executable program.
///
/// `ops` and `strbuf` are mutable at run time: inline caches rewrite
/// instruction bytes, and static-ustring MRU headers update on random
/// access. Neither ever changes length during execution, so raw pointers
/// into `ops` taken by the dispatch loop stay valid.
pub struct Program {
    /// Packed instruction stream.
    pub ops: Vec<u8>,
    /// Constant pool: raw 64-bit value words (numbers and static slices).
    pub consts: Vec<u64>,
    /// All static string bytes, ustring headers included.
    pub strbuf: Vec<u8>,
    /// Function names referenced by debug entries.
    pub names: Vec<Arc<str>>,
    /// Pc-sorted debug entries. Shared with fiber unwinding.
    pub debug: Arc<DebugTable>,
    /// Source text, for line/column computation in traces.
    pub src: Arc<str>,
}

impl Program {
    /// Read an unaligned little-endian u16 operand.
    #[inline(always)]
    pub fn read_u16(&self, pc: usize) -> u16 {
        u16::from_le_bytes([self.ops[pc], self.ops[pc + 1]])
    }

    /// Bytes of a static string slice.
    #[inline]
    pub fn static_str_bytes(&self, start: u32, len: u32) -> &[u8] {
        &self.strbuf[start as usize..(start + len) as usize]
    }

    /// Name-table lookup, defaulting to `"main"` for the null id.
    pub fn frame_name(&self, name_id: u32) -> Arc<str> {
        if name_id == vesper_core::NULL_ID {
            Arc::from("main")
        } else {
            self.names[name_id as usize].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ustring_header_round_trip() {
        let mut buf = vec![0u8; 20];
        let start = USTRING_HEADER_LEN;
        let mut h = UstringHeader::new(5);
        h.mru_byte_idx = 7;
        h.mru_char_idx = 3;
        h.store(&mut buf, start);
        assert_eq!(UstringHeader::load(&buf, start), h);
    }

    #[test]
    fn test_read_u16_unaligned() {
        let prog = Program {
            ops: vec![0xff, 0x34, 0x12, 0x00],
            consts: Vec::new(),
            strbuf: Vec::new(),
            names: Vec::new(),
            debug: Arc::new(DebugTable::default()),
            src: Arc::from(""),
        };
        assert_eq!(prog.read_u16(1), 0x1234);
    }
}
