//! Slab-allocated script structs bound to engine objects.
//!
//! Each slot stores its fields as a `Vec<TaggedValue>` indexed by field,
//! rather than a raw `[u8; N]` byte blob addressed by offset: the idiomatic
//! generalization of C++-style raw-pointer field access, while keeping the
//! slab/slot/dirty-bit shape.

use crate::core::value::{HeapPtr, ObjectHandle, TaggedValue, TypeId, Value};
use std::collections::HashMap;

/// `slots_per_slab` pinned by `PropsetPoolManager::slots_per_slab`.
pub const SLOTS_PER_SLAB: u32 = 256;
/// `slots_per_card` pinned by `PropsetPoolManager::slots_per_card`.
pub const SLOTS_PER_CARD: u32 = 64;

/// Per propset-type metadata, parallel to [`crate::core::value::TypeInfo`]
/// but scoped to what the pool needs to manage slot fields.
#[derive(Debug, Clone)]
pub struct PropsetTypeInfo {
    pub type_id: TypeId,
    pub field_count: u32,
    /// Field indices whose value is backed by an unmanaged array handle
    /// rather than a plain scalar/heap field.
    pub unmanaged_array_fields: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotRef {
    slab: u32,
    index: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    alive: bool,
    aggregate_dirty: bool,
    has_live_heap_refs: bool,
    is_static: bool,
    has_unmanaged_arrays: bool,
    dirty_field_bits: u64,
    owner: ObjectHandle,
    fields: Vec<TaggedValue>,
}

impl Slot {
    fn new_zeroed(type_info: &PropsetTypeInfo, type_table: &crate::core::value::TypeTable) -> Self {
        Self {
            alive: false,
            aggregate_dirty: false,
            has_live_heap_refs: false,
            is_static: true,
            has_unmanaged_arrays: !type_info.unmanaged_array_fields.is_empty(),
            dirty_field_bits: 0,
            owner: ObjectHandle::INVALID,
            fields: (0..type_info.field_count)
                .map(|_| TaggedValue::nil(type_table.int_type()))
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Slab {
    slots: Vec<Slot>,
    /// `slots_per_card`-sized bitmap over dirty heap-field slots in this slab.
    dirty_cards: Vec<bool>,
}

struct Pool {
    info: PropsetTypeInfo,
    slabs: Vec<Slab>,
    free_slots: Vec<SlotRef>,
    object_slots: HashMap<u32, SlotRef>,
}

impl Pool {
    fn new(info: PropsetTypeInfo) -> Self {
        Self {
            info,
            slabs: Vec::new(),
            free_slots: Vec::new(),
            object_slots: HashMap::new(),
        }
    }

    fn allocate_slot(&mut self, type_table: &crate::core::value::TypeTable) -> SlotRef {
        if let Some(r) = self.free_slots.pop() {
            return r;
        }
        if self.slabs.is_empty() || self.slabs.last().unwrap().slots.len() as u32 >= SLOTS_PER_SLAB
        {
            self.slabs.push(Slab {
                slots: Vec::with_capacity(SLOTS_PER_SLAB as usize),
                dirty_cards: vec![false; (SLOTS_PER_SLAB / SLOTS_PER_CARD) as usize],
            });
        }
        let slab_idx = (self.slabs.len() - 1) as u32;
        let slab = self.slabs.last_mut().unwrap();
        let index = slab.slots.len() as u32;
        slab.slots.push(Slot::new_zeroed(&self.info, type_table));
        SlotRef {
            slab: slab_idx,
            index,
        }
    }

    fn slot(&self, r: SlotRef) -> &Slot {
        &self.slabs[r.slab as usize].slots[r.index as usize]
    }

    fn slot_mut(&mut self, r: SlotRef) -> &mut Slot {
        &mut self.slabs[r.slab as usize].slots[r.index as usize]
    }

    fn mark_card_dirty(&mut self, r: SlotRef) {
        let card = r.index / SLOTS_PER_CARD;
        if let Some(slab) = self.slabs.get_mut(r.slab as usize) {
            if let Some(bit) = slab.dirty_cards.get_mut(card as usize) {
                *bit = true;
            }
        }
    }
}

/// Owner side-table entry: which propset slot a heap cell is embedded in.
#[derive(Debug, Clone, Copy)]
struct HeapOwner {
    propset_type: TypeId,
    object_id: u32,
    field_index: u32,
}

/// Validated handle into a live propset slot, returned by `get_or_create`
/// and threaded back through `read_field`/`write_field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropsetRef {
    pub type_id: TypeId,
    pub object_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropsetError {
    UnknownType,
    DanglingReference,
    FieldIndexOutOfRange,
    UnmanagedArrayFieldIsReadOnly,
}

impl std::fmt::Display for PropsetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropsetError::UnknownType => write!(f, "unknown propset type"),
            PropsetError::DanglingReference => write!(f, "dangling propset reference"),
            PropsetError::FieldIndexOutOfRange => write!(f, "propset field offset out of bounds"),
            PropsetError::UnmanagedArrayFieldIsReadOnly => {
                write!(f, "unmanaged array fields must be mutated via the array API")
            }
        }
    }
}

impl std::error::Error for PropsetError {}

/// Slab-allocated per-object script struct storage.
#[derive(Default)]
pub struct PropsetPool {
    pools: HashMap<TypeId, Pool>,
    heap_owners: HashMap<u32, HeapOwner>,
}

impl PropsetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, info: PropsetTypeInfo) {
        self.pools.entry(info.type_id).or_insert_with(|| Pool::new(info));
    }

    pub fn is_propset_type(&self, type_id: TypeId) -> bool {
        self.pools.contains_key(&type_id)
    }

    /// Returns the slot for `(propset_type, obj)`, allocating and
    /// zero-initializing it on first use.
    pub fn get_or_create(
        &mut self,
        type_table: &crate::core::value::TypeTable,
        propset_type: TypeId,
        obj: ObjectHandle,
    ) -> Result<PropsetRef, PropsetError> {
        let pool = self.pools.get_mut(&propset_type).ok_or(PropsetError::UnknownType)?;
        let slot_ref = match pool.object_slots.get(&obj.id).copied() {
            Some(slot_ref) if pool.slot(slot_ref).alive => slot_ref,
            _ => {
                let slot_ref = pool.allocate_slot(type_table);
                let slot = pool.slot_mut(slot_ref);
                slot.alive = true;
                slot.owner = obj;
                pool.object_slots.insert(obj.id, slot_ref);
                slot_ref
            }
        };
        // Re-register heap owners for any fields that already hold a heap
        // pointer, so `mark_heap_mutation` can find this slot regardless of
        // whether the binding happened on a prior `get_or_create` or via a
        // `write_field` call in between.
        let heap_fields: Vec<(u32, HeapPtr)> = pool
            .slot(slot_ref)
            .fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.value.heap_ptr().map(|ptr| (i as u32, ptr)))
            .collect();
        for (field_index, ptr) in heap_fields {
            self.bind_heap_owner(ptr, propset_type, obj.id, field_index);
        }
        Ok(PropsetRef {
            type_id: propset_type,
            object_id: obj.id,
        })
    }

    fn validate(&self, rf: PropsetRef) -> Result<(&Pool, SlotRef), PropsetError> {
        let pool = self.pools.get(&rf.type_id).ok_or(PropsetError::UnknownType)?;
        let slot_ref = *pool
            .object_slots
            .get(&rf.object_id)
            .ok_or(PropsetError::DanglingReference)?;
        let slot = pool.slot(slot_ref);
        if !slot.alive || slot.owner.id != rf.object_id {
            return Err(PropsetError::DanglingReference);
        }
        Ok((pool, slot_ref))
    }

    /// Reads `field_index`. If the field is an unmanaged array, the
    /// returned value simply carries the array's handle (no copy). When
    /// `mark_dirty` is set (the caller intends a mutable reference), the
    /// slot's dirty bookkeeping is updated as if a write had occurred.
    pub fn read_field(
        &mut self,
        rf: PropsetRef,
        field_index: u32,
        mark_dirty: bool,
    ) -> Result<Value, PropsetError> {
        let (_pool, slot_ref) = self.validate(rf)?;
        let pool = self.pools.get_mut(&rf.type_id).unwrap();
        let value = {
            let slot = pool.slot(slot_ref);
            let field = slot
                .fields
                .get(field_index as usize)
                .ok_or(PropsetError::FieldIndexOutOfRange)?;
            field.value
        };
        if mark_dirty {
            self.mark_field_dirty(rf, field_index, value.is_heap())?;
        }
        Ok(value)
    }

    /// Writes `field_index`. Rejects writes to unmanaged-array fields; those
    /// must go through the array API.
    pub fn write_field(
        &mut self,
        rf: PropsetRef,
        field_index: u32,
        value: Value,
    ) -> Result<(), PropsetError> {
        let (_pool, slot_ref) = self.validate(rf)?;
        let pool = self.pools.get_mut(&rf.type_id).unwrap();
        if pool.info.unmanaged_array_fields.contains(&field_index) {
            return Err(PropsetError::UnmanagedArrayFieldIsReadOnly);
        }
        let is_heap = value.is_heap();
        {
            let slot = pool.slot_mut(slot_ref);
            let field = slot
                .fields
                .get_mut(field_index as usize)
                .ok_or(PropsetError::FieldIndexOutOfRange)?;
            field.value = value;
            slot.is_static = false;
        }
        self.mark_field_dirty(rf, field_index, is_heap)?;
        if let Some(ptr) = value.heap_ptr() {
            self.bind_heap_owner(ptr, rf.type_id, rf.object_id, field_index);
        }
        Ok(())
    }

    fn mark_field_dirty(
        &mut self,
        rf: PropsetRef,
        field_index: u32,
        is_heap_field: bool,
    ) -> Result<(), PropsetError> {
        let pool = self.pools.get_mut(&rf.type_id).ok_or(PropsetError::UnknownType)?;
        let slot_ref = *pool
            .object_slots
            .get(&rf.object_id)
            .ok_or(PropsetError::DanglingReference)?;
        {
            let slot = pool.slot_mut(slot_ref);
            slot.aggregate_dirty = true;
            slot.dirty_field_bits |= 1u64 << (field_index % 64);
            slot.is_static = false;
            if is_heap_field {
                slot.has_live_heap_refs = true;
            }
        }
        if is_heap_field {
            pool.mark_card_dirty(slot_ref);
        }
        Ok(())
    }

    /// Records that `ptr` (owned by a propset field) was mutated by the
    /// engine directly, via the `heap_owners` side table.
    pub fn mark_heap_mutation(&mut self, ptr: HeapPtr) {
        if let Some(owner) = self.heap_owners.get(&ptr.0).copied() {
            if let Some(pool) = self.pools.get_mut(&owner.propset_type) {
                if let Some(&slot_ref) = pool.object_slots.get(&owner.object_id) {
                    pool.mark_card_dirty(slot_ref);
                    let slot = pool.slot_mut(slot_ref);
                    slot.aggregate_dirty = true;
                    slot.dirty_field_bits |= 1u64 << (owner.field_index % 64);
                }
            }
        }
    }

    pub fn bind_heap_owner(
        &mut self,
        ptr: HeapPtr,
        propset_type: TypeId,
        object_id: u32,
        field_index: u32,
    ) {
        self.heap_owners.insert(
            ptr.0,
            HeapOwner {
                propset_type,
                object_id,
                field_index,
            },
        );
    }

    /// Sweeps slots whose owning engine object handle is no longer valid.
    /// `object_is_alive` is supplied by the caller (the object manager is
    /// out of scope here); returns the object ids whose slots were freed.
    pub fn prune_invalid_owners(&mut self, object_is_alive: impl Fn(u32) -> bool) -> Vec<u32> {
        let mut pruned = Vec::new();
        for pool in self.pools.values_mut() {
            let stale: Vec<u32> = pool
                .object_slots
                .keys()
                .copied()
                .filter(|id| !object_is_alive(*id))
                .collect();
            for id in stale {
                if let Some(slot_ref) = pool.object_slots.remove(&id) {
                    let slot = pool.slot_mut(slot_ref);
                    slot.alive = false;
                    slot.owner = ObjectHandle::INVALID;
                    pool.free_slots.push(slot_ref);
                    pruned.push(id);
                }
            }
        }
        pruned
    }

    /// True if the slot for `(type_id, object_id)` was static (never
    /// written) and not dirty — the minor GC may skip root-scanning it.
    pub fn is_static_and_clean(&self, rf: PropsetRef) -> bool {
        self.validate(rf)
            .map(|(pool, slot_ref)| {
                let slot = pool.slot(slot_ref);
                slot.is_static && !slot.aggregate_dirty
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TypeTable;

    fn make_pool() -> (PropsetPool, TypeTable, TypeId) {
        let mut pool = PropsetPool::new();
        let types = TypeTable::new();
        let type_id = TypeId(42);
        pool.register_type(PropsetTypeInfo {
            type_id,
            field_count: 2,
            unmanaged_array_fields: vec![1],
        });
        (pool, types, type_id)
    }

    #[test]
    fn get_or_create_allocates_and_reuses_slot() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let a = pool.get_or_create(&types, type_id, obj).unwrap();
        let b = pool.get_or_create(&types, type_id, obj).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn write_then_read_field_roundtrips() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();

        pool.write_field(rf, 0, Value::Int(42)).unwrap();
        let v = pool.read_field(rf, 0, false).unwrap();
        assert_eq!(v, Value::Int(42));
    }

    #[test]
    fn write_clears_static_flag() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();
        assert!(pool.is_static_and_clean(rf));

        pool.write_field(rf, 0, Value::Int(1)).unwrap();
        assert!(!pool.is_static_and_clean(rf));
    }

    #[test]
    fn writes_to_unmanaged_array_field_are_rejected() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();

        let err = pool.write_field(rf, 1, Value::Int(1)).unwrap_err();
        assert_eq!(err, PropsetError::UnmanagedArrayFieldIsReadOnly);
    }

    #[test]
    fn dangling_reference_after_prune_is_rejected() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();

        let pruned = pool.prune_invalid_owners(|_| false);
        assert_eq!(pruned, vec![7]);
        assert_eq!(
            pool.read_field(rf, 0, false).unwrap_err(),
            PropsetError::DanglingReference
        );
    }

    #[test]
    fn field_index_out_of_range_is_rejected() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();

        let err = pool.read_field(rf, 99, false).unwrap_err();
        assert_eq!(err, PropsetError::FieldIndexOutOfRange);
    }

    #[test]
    fn writing_a_heap_field_binds_its_owner_for_mark_heap_mutation() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();

        pool.write_field(rf, 0, Value::Heap(HeapPtr(55))).unwrap();

        // Simulate the engine mutating the pointed-to cell directly, the
        // way `RuntimeHost::write_barrier` does.
        pool.mark_heap_mutation(HeapPtr(55));
        let (p, slot_ref) = pool.validate(rf).unwrap();
        assert!(p.slot(slot_ref).dirty_field_bits & (1 << 0) != 0);
    }

    #[test]
    fn re_fetching_a_slot_rebinds_its_heap_field_owners() {
        let (mut pool, types, type_id) = make_pool();
        let obj = ObjectHandle { generation: 1, id: 7 };
        let rf = pool.get_or_create(&types, type_id, obj).unwrap();
        pool.write_field(rf, 0, Value::Heap(HeapPtr(55))).unwrap();

        // A second `get_or_create` for the same owner should re-derive the
        // same binding rather than leaving it to chance.
        pool.get_or_create(&types, type_id, obj).unwrap();
        pool.mark_heap_mutation(HeapPtr(55));
        let (p, slot_ref) = pool.validate(rf).unwrap();
        assert!(p.slot(slot_ref).dirty_field_bits & (1 << 0) != 0);
    }
}
