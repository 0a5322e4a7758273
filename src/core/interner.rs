//! Deduplicating string pool, shared by the bytecode module's constant and
//! string tables.
//!
//! Reference: `lib/nw/smalls/BytecodeModule.hpp` `add_string` — same
//! dedup-by-content contract.

use std::collections::HashMap;

/// Index into an [`Interner`]'s string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(pub u32);

#[derive(Debug, Default)]
pub struct Interner {
    map: HashMap<Vec<u8>, StringId>,
    vec: Vec<Vec<u8>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        let bytes = s.as_bytes();
        if let Some(&id) = self.map.get(bytes) {
            return id;
        }
        let id = StringId(self.vec.len() as u32);
        self.vec.push(bytes.to_vec());
        self.map.insert(bytes.to_vec(), id);
        id
    }

    pub fn find(&self, s: &str) -> Option<StringId> {
        self.map.get(s.as_bytes()).copied()
    }

    pub fn lookup(&self, id: StringId) -> Option<&str> {
        self.vec
            .get(id.0 as usize)
            .map(|v| std::str::from_utf8(v).unwrap_or(""))
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_string_twice_dedups() {
        let mut pool = Interner::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let mut pool = Interner::new();
        let a = pool.intern("one");
        let b = pool.intern("two");
        assert_ne!(a, b);
    }

    #[test]
    fn lookup_roundtrips() {
        let mut pool = Interner::new();
        let id = pool.intern("roundtrip");
        assert_eq!(pool.lookup(id), Some("roundtrip"));
    }
}
