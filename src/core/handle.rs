//! Generation-tagged handle allocation.
//!
//! A free-list plus a per-slot generation counter over a single growable
//! `Vec`, in place of fixed-size chunked blocks (see DESIGN.md, Handle Pool
//! entry).

use log::debug;

/// A raw generation-tagged reference into a [`HandlePool`].
///
/// Generation `0` is never issued by `insert()` and is reserved as the
/// permanently-invalid sentinel (a default-constructed `RawHandle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub generation: u32,
    pub index: u32,
}

impl Default for RawHandle {
    fn default() -> Self {
        Self {
            generation: 0,
            index: 0,
        }
    }
}

impl RawHandle {
    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }
}

/// Increments a generation counter modulo 2^24 (the width packed into
/// [`crate::core::value::TypedHandle`]), skipping 0.
fn bump_generation(gen: u32) -> u32 {
    let next = gen.wrapping_add(1) & 0x00FF_FFFF;
    if next == 0 { 1 } else { next }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
    free_list_next: Option<u32>,
}

/// Generation-tagged handle allocator over a chunked (here: contiguous)
/// vector of slots. See spec §4.1.
pub struct HandlePool<T> {
    storage: Vec<Slot<T>>,
    free_list_head: Option<u32>,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlePool<T> {
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            free_list_head: None,
        }
    }

    /// Allocate a slot for `value`, returning a handle whose generation is
    /// the slot's current generation and whose index is the slot index.
    pub fn insert(&mut self, value: T) -> RawHandle {
        if let Some(idx) = self.free_list_head {
            let slot = &mut self.storage[idx as usize];
            self.free_list_head = slot.free_list_next.take();
            slot.value = Some(value);
            return RawHandle {
                generation: slot.generation,
                index: idx,
            };
        }

        let idx = self.storage.len() as u32;
        self.storage.push(Slot {
            value: Some(value),
            generation: 1,
            free_list_next: None,
        });
        RawHandle {
            generation: 1,
            index: idx,
        }
    }

    pub fn valid(&self, h: RawHandle) -> bool {
        if h.generation == 0 {
            return false;
        }
        match self.storage.get(h.index as usize) {
            Some(slot) => slot.generation == h.generation && slot.value.is_some(),
            None => false,
        }
    }

    pub fn get(&self, h: RawHandle) -> Option<&T> {
        if !self.valid(h) {
            return None;
        }
        self.storage[h.index as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, h: RawHandle) -> Option<&mut T> {
        if !self.valid(h) {
            return None;
        }
        self.storage[h.index as usize].value.as_mut()
    }

    /// Unconditionally pre-validated: invalid handles are logged and
    /// ignored, never dereferenced. Increments the slot generation
    /// (skipping 0, wrapping at 2^24 to match [`crate::core::value::TypedHandle`]'s
    /// packed width) and returns the slot to the free list.
    pub fn destroy(&mut self, h: RawHandle) -> Option<T> {
        if !self.valid(h) {
            debug!("HandlePool::destroy on invalid handle {:?}", h);
            return None;
        }
        let idx = h.index as usize;
        let taken = self.storage[idx].value.take();
        self.storage[idx].generation = bump_generation(self.storage[idx].generation);
        self.storage[idx].free_list_next = self.free_list_head;
        self.free_list_head = Some(idx as u32);
        taken
    }

    pub fn len(&self) -> usize {
        self.storage.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_get_roundtrip() {
        let mut pool = HandlePool::new();
        let h = pool.insert(42);
        assert_eq!(*pool.get(h).unwrap(), 42);
        assert!(pool.valid(h));
    }

    #[test]
    fn destroy_invalidates_and_bumps_generation() {
        let mut pool: HandlePool<i32> = HandlePool::new();
        let h = pool.insert(1);
        assert_eq!(pool.destroy(h), Some(1));
        assert!(!pool.valid(h));
        assert!(pool.get(h).is_none());
    }

    #[test]
    fn slot_reuse_yields_same_index_next_generation() {
        let mut pool: HandlePool<i32> = HandlePool::new();
        let h1 = pool.insert(1);
        pool.destroy(h1);
        let h2 = pool.insert(2);
        assert_eq!(h1.index, h2.index);
        assert_eq!(h2.generation, h1.generation + 1);
    }

    #[test]
    fn generation_wraps_skipping_zero() {
        assert_eq!(bump_generation(0x00FF_FFFF), 1);
        assert_eq!(bump_generation(5), 6);
    }

    #[test]
    fn operations_on_invalid_handle_never_panic() {
        let mut pool: HandlePool<i32> = HandlePool::new();
        let bogus = RawHandle {
            generation: 5,
            index: 99,
        };
        assert!(!pool.valid(bogus));
        assert!(pool.get(bogus).is_none());
        assert!(pool.get_mut(bogus).is_none());
        assert!(pool.destroy(bogus).is_none());
    }
}
