//! Symbol tables: fields, methods, functions, variables, tags, shapes.
//!
//! Each dispatch-relevant table pairs per-entry MRU caches with an
//! `FxHashMap` fallback. The MRU stores the last successful
//! `(type_id → offset)` or `(type_id → method)` pair so the repeated-shape
//! hot path skips the hashmap entirely; a miss consults the fallback and
//! refreshes the MRU.

use crate::modules::{NativeFn, NativeObjFn, NativeObjFn2};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use vesper_core::Value;
use vesper_runtime::object::TypeId;
use vesper_runtime::FIRST_USER_TYPE;

/// Sentinel meaning "MRU never filled".
const MRU_EMPTY: TypeId = u32::MAX;

// ── Fields ─────────────────────────────────────────────────────────────

/// A named field with its most-recently-resolved shape.
pub struct FieldSymbol {
    pub name: Arc<str>,
    mru_type: TypeId,
    mru_offset: u8,
}

// ── Methods ────────────────────────────────────────────────────────────

/// Resolved method target.
#[derive(Clone, Copy)]
pub enum MethodEntry {
    None,
    /// Bytecode method.
    Func {
        pc: u32,
        num_params: u8,
        num_locals: u8,
    },
    /// Native method producing one result.
    Native1(NativeObjFn),
    /// Native method producing two results.
    Native2(NativeObjFn2),
}

/// A named method with its most-recently-resolved receiver type.
pub struct MethodSymbol {
    pub name: Arc<str>,
    mru_type: TypeId,
    mru_entry: MethodEntry,
}

// ── Functions and variables ────────────────────────────────────────────

/// Global function table entry.
#[derive(Clone, Copy)]
pub enum FuncSymbol {
    None,
    Native {
        func: NativeFn,
        num_params: u8,
    },
    Func {
        pc: u32,
        num_params: u8,
        num_locals: u8,
    },
    /// A closure value bound as a static function.
    Closure(Value),
}

// ── Tags and shapes ────────────────────────────────────────────────────

pub struct TagType {
    pub name: Arc<str>,
    pub num_members: u32,
}

/// User object shape: name plus field count.
pub struct StructShape {
    pub name: Arc<str>,
    pub num_fields: u32,
}

// ── The tables ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SymbolTables {
    field_syms: Vec<FieldSymbol>,
    field_ids: FxHashMap<Arc<str>, u32>,
    /// Fallback `(type, field_sym) → field offset`.
    field_table: FxHashMap<(TypeId, u32), u8>,

    method_syms: Vec<MethodSymbol>,
    method_ids: FxHashMap<Arc<str>, u32>,
    /// Fallback `(type, method_sym) → entry`.
    method_table: FxHashMap<(TypeId, u32), MethodEntry>,

    func_syms: Vec<FuncSymbol>,
    func_ids: FxHashMap<(Arc<str>, u8), u32>,

    var_syms: Vec<Value>,
    var_ids: FxHashMap<Arc<str>, u32>,

    tag_lits: Vec<Arc<str>>,
    tag_lit_ids: FxHashMap<Arc<str>, u32>,
    tag_types: Vec<TagType>,

    structs: Vec<StructShape>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Field symbols ──────────────────────────────────────────────────

    pub fn ensure_field_sym(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.field_ids.get(name) {
            return id;
        }
        let id = self.field_syms.len() as u32;
        let name: Arc<str> = Arc::from(name);
        self.field_syms.push(FieldSymbol {
            name: name.clone(),
            mru_type: MRU_EMPTY,
            mru_offset: 0,
        });
        self.field_ids.insert(name, id);
        id
    }

    pub fn field_name(&self, sym: u32) -> &str {
        &self.field_syms[sym as usize].name
    }

    /// Declare that `type_id` stores field `sym` at `offset`.
    pub fn set_field_offset(&mut self, type_id: TypeId, sym: u32, offset: u8) {
        self.field_table.insert((type_id, sym), offset);
    }

    /// Resolve a field offset: MRU first, fallback map on miss (which
    /// refreshes the MRU).
    #[inline]
    pub fn field_offset(&mut self, type_id: TypeId, sym: u32) -> Option<u8> {
        let entry = &mut self.field_syms[sym as usize];
        if entry.mru_type == type_id {
            return Some(entry.mru_offset);
        }
        let offset = *self.field_table.get(&(type_id, sym))?;
        entry.mru_type = type_id;
        entry.mru_offset = offset;
        Some(offset)
    }

    // ── Method symbols ─────────────────────────────────────────────────

    pub fn ensure_method_sym(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.method_ids.get(name) {
            return id;
        }
        let id = self.method_syms.len() as u32;
        let name: Arc<str> = Arc::from(name);
        self.method_syms.push(MethodSymbol {
            name: name.clone(),
            mru_type: MRU_EMPTY,
            mru_entry: MethodEntry::None,
        });
        self.method_ids.insert(name, id);
        id
    }

    pub fn method_name(&self, sym: u32) -> &str {
        &self.method_syms[sym as usize].name
    }

    pub fn bind_method(&mut self, type_id: TypeId, sym: u32, entry: MethodEntry) {
        self.method_table.insert((type_id, sym), entry);
    }

    /// Resolve a method: MRU first, fallback map on miss.
    #[inline]
    pub fn method_entry(&mut self, type_id: TypeId, sym: u32) -> Option<MethodEntry> {
        let entry = &mut self.method_syms[sym as usize];
        if entry.mru_type == type_id {
            return Some(entry.mru_entry);
        }
        let resolved = *self.method_table.get(&(type_id, sym))?;
        entry.mru_type = type_id;
        entry.mru_entry = resolved;
        Some(resolved)
    }

    // ── Function symbols ───────────────────────────────────────────────

    pub fn ensure_func_sym(&mut self, name: &str, num_params: u8) -> u32 {
        let key = (Arc::from(name), num_params);
        if let Some(&id) = self.func_ids.get(&key) {
            return id;
        }
        let id = self.func_syms.len() as u32;
        self.func_syms.push(FuncSymbol::None);
        self.func_ids.insert(key, id);
        id
    }

    pub fn bind_func(&mut self, sym: u32, entry: FuncSymbol) {
        self.func_syms[sym as usize] = entry;
    }

    #[inline]
    pub fn func_entry(&self, sym: u32) -> FuncSymbol {
        self.func_syms[sym as usize]
    }

    pub fn func_count(&self) -> usize {
        self.func_syms.len()
    }

    // ── Variable symbols ───────────────────────────────────────────────

    pub fn ensure_var_sym(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.var_ids.get(name) {
            return id;
        }
        let id = self.var_syms.len() as u32;
        self.var_syms.push(Value::NONE);
        self.var_ids.insert(Arc::from(name), id);
        id
    }

    #[inline]
    pub fn var_value(&self, sym: u32) -> Value {
        self.var_syms[sym as usize]
    }

    #[inline]
    pub fn set_var_value(&mut self, sym: u32, v: Value) -> Value {
        std::mem::replace(&mut self.var_syms[sym as usize], v)
    }

    pub fn var_values(&self) -> &[Value] {
        &self.var_syms
    }

    // ── Tag types and literals ─────────────────────────────────────────

    pub fn ensure_tag_lit(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.tag_lit_ids.get(name) {
            return id;
        }
        let id = self.tag_lits.len() as u32;
        let name: Arc<str> = Arc::from(name);
        self.tag_lits.push(name.clone());
        self.tag_lit_ids.insert(name, id);
        id
    }

    pub fn tag_lit_name(&self, id: u32) -> &str {
        self.tag_lits
            .get(id as usize)
            .map(|n| n.as_ref())
            .unwrap_or("?")
    }

    pub fn add_tag_type(&mut self, name: &str, num_members: u32) -> u32 {
        let id = self.tag_types.len() as u32;
        self.tag_types.push(TagType {
            name: Arc::from(name),
            num_members,
        });
        id
    }

    // ── Object shapes ──────────────────────────────────────────────────

    /// Register a shape; returns its runtime type id.
    pub fn add_struct(&mut self, name: &str, num_fields: u32) -> TypeId {
        let type_id = FIRST_USER_TYPE + self.structs.len() as u32;
        self.structs.push(StructShape {
            name: Arc::from(name),
            num_fields,
        });
        type_id
    }

    pub fn struct_shape(&self, type_id: TypeId) -> &StructShape {
        &self.structs[(type_id - FIRST_USER_TYPE) as usize]
    }

    /// Field count of a user type id.
    #[inline]
    pub fn struct_num_fields(&self, type_id: TypeId) -> u32 {
        self.struct_shape(type_id).num_fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_mru_refresh() {
        let mut syms = SymbolTables::new();
        let width = syms.ensure_field_sym("width");
        let t1 = syms.add_struct("Rect", 2);
        let t2 = syms.add_struct("Sprite", 3);
        syms.set_field_offset(t1, width, 0);
        syms.set_field_offset(t2, width, 2);

        assert_eq!(syms.field_offset(t1, width), Some(0));
        // Different shape: MRU misses, fallback resolves, MRU refreshes.
        assert_eq!(syms.field_offset(t2, width), Some(2));
        assert_eq!(syms.field_offset(t2, width), Some(2));
        assert_eq!(syms.field_offset(t1, width), Some(0));
    }

    #[test]
    fn test_field_missing_is_none() {
        let mut syms = SymbolTables::new();
        let sym = syms.ensure_field_sym("ghost");
        let t = syms.add_struct("Empty", 0);
        assert_eq!(syms.field_offset(t, sym), None);
    }

    #[test]
    fn test_sym_ids_dedup() {
        let mut syms = SymbolTables::new();
        assert_eq!(syms.ensure_field_sym("x"), syms.ensure_field_sym("x"));
        assert_eq!(syms.ensure_method_sym("len"), syms.ensure_method_sym("len"));
        assert_eq!(syms.ensure_tag_lit("ok"), syms.ensure_tag_lit("ok"));
        // Function symbols key on (name, arity).
        let f1 = syms.ensure_func_sym("go", 1);
        let f2 = syms.ensure_func_sym("go", 2);
        assert_ne!(f1, f2);
        assert_eq!(syms.ensure_func_sym("go", 1), f1);
    }

    #[test]
    fn test_var_cells() {
        let mut syms = SymbolTables::new();
        let v = syms.ensure_var_sym("counter");
        assert!(syms.var_value(v).is_none());
        let old = syms.set_var_value(v, Value::number(9.0));
        assert!(old.is_none());
        assert_eq!(syms.var_value(v).as_f64(), 9.0);
    }

    #[test]
    fn test_struct_shape() {
        let mut syms = SymbolTables::new();
        let t = syms.add_struct("Point", 2);
        assert!(t >= FIRST_USER_TYPE);
        assert_eq!(syms.struct_num_fields(t), 2);
        assert_eq!(&*syms.struct_shape(t).name, "Point");
    }
}
