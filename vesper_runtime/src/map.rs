//! Open-addressed value map.
//!
//! Power-of-two capacity, one control byte per slot (empty / tombstone /
//! low seven hash bits), linear probing. Key equality is supplied by the
//! caller because string keys compare by bytes, and only the VM can read
//! string bytes (heap objects and the static string buffer); every entry
//! stores its full hash so growth never re-derives one.
//!
//! Entry order is insertion-agnostic; iteration walks slots by index,
//! which is what the map-iterator object snapshots.

use vesper_core::Value;

const CTRL_EMPTY: u8 = 0x80;
const CTRL_TOMBSTONE: u8 = 0xfe;

#[derive(Clone, Copy)]
struct Entry {
    hash: u64,
    key: Value,
    val: Value,
}

pub struct ValueMap {
    ctrl: Box<[u8]>,
    entries: Box<[Entry]>,
    len: usize,
    /// Live entries plus tombstones; drives growth.
    used: usize,
}

#[inline]
fn h2(hash: u64) -> u8 {
    (hash >> 57) as u8 & 0x7f
}

impl ValueMap {
    pub fn new() -> Self {
        ValueMap {
            ctrl: Box::from([]),
            entries: Box::from([]),
            len: 0,
            used: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        let mut map = ValueMap::new();
        if cap > 0 {
            map.grow(cap.next_power_of_two().max(8));
        }
        map
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn cap(&self) -> usize {
        self.ctrl.len()
    }

    /// Find the slot holding a key with `hash` satisfying `eq`.
    fn find(&self, hash: u64, mut eq: impl FnMut(Value) -> bool) -> Option<usize> {
        if self.cap() == 0 {
            return None;
        }
        let mask = self.cap() - 1;
        let tag = h2(hash);
        let mut idx = hash as usize & mask;
        loop {
            let ctrl = self.ctrl[idx];
            if ctrl == CTRL_EMPTY {
                return None;
            }
            if ctrl == tag {
                let entry = &self.entries[idx];
                if entry.hash == hash && eq(entry.key) {
                    return Some(idx);
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, hash: u64, eq: impl FnMut(Value) -> bool) -> Option<Value> {
        self.find(hash, eq).map(|i| self.entries[i].val)
    }

    pub fn get_key(&self, hash: u64, eq: impl FnMut(Value) -> bool) -> Option<Value> {
        self.find(hash, eq).map(|i| self.entries[i].key)
    }

    /// Insert or overwrite. Returns the previous value when the key was
    /// present (the caller decides whether to release it); the stored key
    /// is not replaced on overwrite.
    pub fn insert(
        &mut self,
        hash: u64,
        key: Value,
        val: Value,
        eq: impl FnMut(Value) -> bool,
    ) -> Option<Value> {
        if let Some(idx) = self.find(hash, eq) {
            let old = self.entries[idx].val;
            self.entries[idx].val = val;
            return Some(old);
        }
        if self.cap() == 0 || (self.used + 1) * 8 > self.cap() * 7 {
            self.grow(std::cmp::max(8, self.cap() * 2));
        }
        let mask = self.cap() - 1;
        let mut idx = hash as usize & mask;
        loop {
            let ctrl = self.ctrl[idx];
            if ctrl == CTRL_EMPTY || ctrl == CTRL_TOMBSTONE {
                if ctrl == CTRL_EMPTY {
                    self.used += 1;
                }
                self.ctrl[idx] = h2(hash);
                self.entries[idx] = Entry { hash, key, val };
                self.len += 1;
                return None;
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Remove a key, returning `(key, value)` for the caller to release.
    pub fn remove(
        &mut self,
        hash: u64,
        eq: impl FnMut(Value) -> bool,
    ) -> Option<(Value, Value)> {
        let idx = self.find(hash, eq)?;
        self.ctrl[idx] = CTRL_TOMBSTONE;
        self.len -= 1;
        let entry = self.entries[idx];
        Some((entry.key, entry.val))
    }

    /// Next live entry at or after `idx`, as `(next_idx, key, val)`.
    /// Drives map iterators: call with the iterator's cursor, resume at
    /// `next_idx + 1`.
    pub fn next_entry(&self, idx: usize) -> Option<(usize, Value, Value)> {
        for i in idx..self.cap() {
            let ctrl = self.ctrl[i];
            if ctrl != CTRL_EMPTY && ctrl != CTRL_TOMBSTONE {
                let entry = &self.entries[i];
                return Some((i, entry.key, entry.val));
            }
        }
        None
    }

    fn grow(&mut self, new_cap: usize) {
        debug_assert!(new_cap.is_power_of_two());
        let old_ctrl = std::mem::replace(&mut self.ctrl, vec![CTRL_EMPTY; new_cap].into());
        let old_entries = std::mem::replace(
            &mut self.entries,
            vec![
                Entry {
                    hash: 0,
                    key: Value::NONE,
                    val: Value::NONE,
                };
                new_cap
            ]
            .into(),
        );
        self.used = self.len;
        let mask = new_cap - 1;
        for (i, ctrl) in old_ctrl.iter().enumerate() {
            if *ctrl == CTRL_EMPTY || *ctrl == CTRL_TOMBSTONE {
                continue;
            }
            let entry = old_entries[i];
            let mut idx = entry.hash as usize & mask;
            while self.ctrl[idx] != CTRL_EMPTY {
                idx = (idx + 1) & mask;
            }
            self.ctrl[idx] = h2(entry.hash);
            self.entries[idx] = entry;
        }
    }
}

impl Default for ValueMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_eq(key: Value) -> impl FnMut(Value) -> bool {
        move |k| k.raw() == key.raw()
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut map = ValueMap::new();
        let k = Value::number(1.0);
        assert_eq!(map.insert(10, k, Value::number(2.0), bits_eq(k)), None);
        assert_eq!(map.get(10, bits_eq(k)).unwrap().as_f64(), 2.0);
        let old = map.insert(10, k, Value::number(3.0), bits_eq(k)).unwrap();
        assert_eq!(old.as_f64(), 2.0);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_colliding_hashes() {
        let mut map = ValueMap::new();
        // Same hash, different keys: eq distinguishes them.
        let a = Value::integer(1);
        let b = Value::integer(2);
        map.insert(42, a, Value::number(1.0), bits_eq(a));
        map.insert(42, b, Value::number(2.0), bits_eq(b));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(42, bits_eq(a)).unwrap().as_f64(), 1.0);
        assert_eq!(map.get(42, bits_eq(b)).unwrap().as_f64(), 2.0);
    }

    #[test]
    fn test_remove_and_tombstone_reuse() {
        let mut map = ValueMap::new();
        let a = Value::integer(1);
        let b = Value::integer(2);
        map.insert(42, a, Value::number(1.0), bits_eq(a));
        map.insert(42, b, Value::number(2.0), bits_eq(b));
        let (key, val) = map.remove(42, bits_eq(a)).unwrap();
        assert_eq!(key.raw(), a.raw());
        assert_eq!(val.as_f64(), 1.0);
        // b still reachable across the tombstone.
        assert_eq!(map.get(42, bits_eq(b)).unwrap().as_f64(), 2.0);
        assert_eq!(map.len(), 1);
        // Reinsertion reuses the tombstone without growing.
        map.insert(42, a, Value::number(9.0), bits_eq(a));
        assert_eq!(map.get(42, bits_eq(a)).unwrap().as_f64(), 9.0);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut map = ValueMap::new();
        for i in 0..100 {
            let k = Value::integer(i);
            map.insert(i as u64 * 0x9e37_79b9, k, Value::number(i as f64), bits_eq(k));
        }
        assert_eq!(map.len(), 100);
        for i in 0..100 {
            let k = Value::integer(i);
            assert_eq!(
                map.get(i as u64 * 0x9e37_79b9, bits_eq(k)).unwrap().as_f64(),
                i as f64
            );
        }
    }

    #[test]
    fn test_iteration_visits_every_entry() {
        let mut map = ValueMap::new();
        for i in 0..10 {
            let k = Value::integer(i);
            map.insert(i as u64, k, Value::number(i as f64), bits_eq(k));
        }
        let mut seen = 0;
        let mut idx = 0;
        while let Some((at, _k, _v)) = map.next_entry(idx) {
            seen += 1;
            idx = at + 1;
        }
        assert_eq!(seen, 10);
    }
}
