//! The scripting runtime's type table and tagged value model.
//!
//! Reference: `lib/nw/smalls/runtime.hpp` (`Value`, `TypeID`) and
//! `lib/nw/util/HandlePool.hpp` (`TypedHandle`). A fixed, statically-typed
//! value set rather than a dynamically-typed one.

use std::fmt;

/// 32-bit index into the per-process [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sentinel returned when a type name has no corresponding [`TypeId`].
pub const INVALID_TYPE_ID: TypeId = TypeId(u32::MAX);

/// Tagged index into the [`crate::core::heap::ScriptHeap`]. Zero is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HeapPtr(pub u32);

impl HeapPtr {
    pub const NULL: HeapPtr = HeapPtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// An engine-object identity, generation-tagged the same way as
/// [`TypedHandle`] but scoped to objects owned by the hosting game rather
/// than the script runtime (propset owners reference objects this way).
/// Reference: `lib/nw/objects/ObjectHandle.hpp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectHandle {
    pub generation: u32,
    pub id: u32,
}

impl ObjectHandle {
    pub const INVALID: ObjectHandle = ObjectHandle {
        generation: 0,
        id: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }
}

/// 64-bit engine handle: `{ generation: 24, type: 8, id: 32 }`, packed.
/// Field widths and the "generation 0 is invalid" rule are pinned by
/// `lib/nw/util/HandlePool.hpp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypedHandle {
    pub generation: u32, // low 24 bits significant
    pub kind: u8,
    pub id: u32,
}

impl TypedHandle {
    pub const INVALID: TypedHandle = TypedHandle {
        generation: 0,
        kind: 0,
        id: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    pub fn pack(&self) -> u64 {
        ((self.generation as u64 & 0x00FF_FFFF) << 40)
            | ((self.kind as u64) << 32)
            | (self.id as u64)
    }

    pub fn unpack(bits: u64) -> Self {
        Self {
            generation: ((bits >> 40) & 0x00FF_FFFF) as u32,
            kind: ((bits >> 32) & 0xFF) as u8,
            id: (bits & 0xFFFF_FFFF) as u32,
        }
    }
}

/// Lifetime policy for a [`TypedHandle`] registered with the runtime's
/// handle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipMode {
    /// The GC may finalize this handle by calling its registered destructor.
    VmOwned,
    /// The engine owns the backing resource; the GC must preserve it.
    EngineOwned,
    /// Temporary; the GC must preserve it for the scope that created it.
    Borrowed,
}

/// Discriminant of [`Value`]'s payload, folded into one enum rather than a
/// separate storage-kind field plus a raw data union: the storage kind is
/// always recoverable from the variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Bool(bool),
    /// `storage = heap`: payload lives behind a [`HeapPtr`] on the script heap.
    Heap(HeapPtr),
    /// `storage = handle`, engine-object identity (e.g. a propset owner).
    Object(ObjectHandle),
    /// `storage = handle`, typed engine handle (unmanaged arrays, VM_OWNED
    /// resources, etc).
    Typed(TypedHandle),
    /// No value has been assigned; distinct from any script-observable nil.
    Uninitialized,
}

impl Value {
    pub fn heap_ptr(&self) -> Option<HeapPtr> {
        match self {
            Value::Heap(p) => Some(*p),
            _ => None,
        }
    }

    pub fn is_heap(&self) -> bool {
        matches!(self, Value::Heap(_))
    }

    /// Packs this value into a fixed-width struct field slot: one tag byte
    /// followed by up to 9 payload bytes (wide enough for a packed
    /// [`TypedHandle`]). `out` must be at least [`FIELD_SLOT_SIZE`] long.
    pub fn encode_field(&self, out: &mut [u8]) {
        for b in out.iter_mut() {
            *b = 0;
        }
        match self {
            Value::Uninitialized => out[0] = 0,
            Value::Int(v) => {
                out[0] = 1;
                out[1..5].copy_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out[0] = 2;
                out[1..5].copy_from_slice(&v.to_le_bytes());
            }
            Value::Bool(v) => {
                out[0] = 3;
                out[1] = *v as u8;
            }
            Value::Heap(p) => {
                out[0] = 4;
                out[1..5].copy_from_slice(&p.0.to_le_bytes());
            }
            Value::Object(h) => {
                out[0] = 5;
                out[1..5].copy_from_slice(&h.generation.to_le_bytes());
                out[5..9].copy_from_slice(&h.id.to_le_bytes());
            }
            Value::Typed(h) => {
                out[0] = 6;
                out[1..9].copy_from_slice(&h.pack().to_le_bytes());
            }
        }
    }

    /// Inverse of [`Value::encode_field`].
    pub fn decode_field(bytes: &[u8]) -> Value {
        match bytes[0] {
            1 => Value::Int(i32::from_le_bytes(bytes[1..5].try_into().unwrap())),
            2 => Value::Float(f32::from_le_bytes(bytes[1..5].try_into().unwrap())),
            3 => Value::Bool(bytes[1] != 0),
            4 => Value::Heap(HeapPtr(u32::from_le_bytes(bytes[1..5].try_into().unwrap()))),
            5 => Value::Object(ObjectHandle {
                generation: u32::from_le_bytes(bytes[1..5].try_into().unwrap()),
                id: u32::from_le_bytes(bytes[5..9].try_into().unwrap()),
            }),
            6 => Value::Typed(TypedHandle::unpack(u64::from_le_bytes(
                bytes[1..9].try_into().unwrap(),
            ))),
            _ => Value::Uninitialized,
        }
    }
}

/// Byte width of one struct field slot (see [`Value::encode_field`]).
pub const FIELD_SLOT_SIZE: u32 = 10;

/// A tagged [`Value`] plus the static type it was declared with. Keeping
/// `TypeId` and the payload as separate fields (rather than baked into the
/// `Value` enum) lets propset fields and VM registers share one struct shape
/// regardless of payload kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaggedValue {
    pub type_id: TypeId,
    pub value: Value,
}

impl TaggedValue {
    pub fn new(type_id: TypeId, value: Value) -> Self {
        Self { type_id, value }
    }

    pub fn nil(type_id: TypeId) -> Self {
        Self {
            type_id,
            value: Value::Uninitialized,
        }
    }
}

/// Kind of a runtime type, recorded per-entry in the [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Primitive,
    Struct,
    Array,
    Function,
    Handle,
    Object,
}

/// A single field within a struct [`TypeInfo`].
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub offset: u32,
    pub type_id: TypeId,
    pub is_unmanaged_array: bool,
}

/// Per-type metadata, the Rust analogue of `lib/nw/smalls/runtime.hpp`'s
/// `Type`/`StructDef` pair.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
    pub heap_resident: bool,
    pub fields: Vec<FieldInfo>,
    /// True when this struct type carries the `propset` annotation.
    /// Reference: `lib/nw/smalls/PropsetPool.cpp::has_annotation`.
    pub is_propset: bool,
}

impl TypeInfo {
    pub fn primitive(name: &str, size: u32, align: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: TypeKind::Primitive,
            size,
            align,
            heap_resident: false,
            fields: Vec::new(),
            is_propset: false,
        }
    }

    /// A struct type whose fields are packed one per [`FIELD_SLOT_SIZE`]-byte
    /// slot, in declaration order. `fields` is `(name, type_id,
    /// is_unmanaged_array)` per field.
    pub fn struct_layout(name: &str, fields: &[(&str, TypeId, bool)]) -> Self {
        let mut field_infos = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        for &(field_name, type_id, is_unmanaged_array) in fields {
            field_infos.push(FieldInfo {
                name: field_name.to_string(),
                offset,
                type_id,
                is_unmanaged_array,
            });
            offset += FIELD_SLOT_SIZE;
        }
        Self {
            name: name.to_string(),
            kind: TypeKind::Struct,
            size: offset.max(FIELD_SLOT_SIZE),
            align: 4,
            heap_resident: true,
            fields: field_infos,
            is_propset: false,
        }
    }
}

/// Per-process type table: indexes [`TypeInfo`] by [`TypeId`] and by name.
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeInfo>,
    by_name: std::collections::HashMap<String, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table.register(TypeInfo::primitive("int", 4, 4));
        table.register(TypeInfo::primitive("float", 4, 4));
        table.register(TypeInfo::primitive("bool", 1, 1));
        table
    }

    pub fn register(&mut self, info: TypeInfo) -> TypeId {
        if let Some(&existing) = self.by_name.get(&info.name) {
            return existing;
        }
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(info.name.clone(), id);
        self.types.push(info);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut TypeInfo> {
        self.types.get_mut(id.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn int_type(&self) -> TypeId {
        self.find("int").unwrap()
    }

    pub fn float_type(&self) -> TypeId {
        self.find("float").unwrap()
    }

    pub fn bool_type(&self) -> TypeId {
        self.find("bool").unwrap()
    }

    pub fn is_heap_type(&self, id: TypeId) -> bool {
        self.get(id).map(|t| t.heap_resident).unwrap_or(false)
    }

    pub fn is_propset_type(&self, id: TypeId) -> bool {
        self.get(id)
            .map(|t| t.kind == TypeKind::Struct && t.is_propset)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_handle_pack_roundtrip() {
        let h = TypedHandle {
            generation: 0x00AB_CDEF,
            kind: 7,
            id: 0xDEAD_BEEF,
        };
        let bits = h.pack();
        assert_eq!(TypedHandle::unpack(bits), h);
    }

    #[test]
    fn invalid_handle_has_zero_generation() {
        assert!(!TypedHandle::INVALID.is_valid());
        assert!(!ObjectHandle::INVALID.is_valid());
    }

    #[test]
    fn type_table_dedups_by_name() {
        let mut table = TypeTable::new();
        let a = table.register(TypeInfo::primitive("widget", 8, 8));
        let b = table.register(TypeInfo::primitive("widget", 8, 8));
        assert_eq!(a, b);
    }

    #[test]
    fn builtin_primitives_registered() {
        let table = TypeTable::new();
        assert!(table.find("int").is_some());
        assert!(table.find("float").is_some());
        assert!(table.find("bool").is_some());
    }

    #[test]
    fn field_slot_roundtrips_every_variant() {
        let values = [
            Value::Uninitialized,
            Value::Int(-42),
            Value::Float(3.5),
            Value::Bool(true),
            Value::Heap(HeapPtr(7)),
            Value::Object(ObjectHandle { generation: 3, id: 9 }),
            Value::Typed(TypedHandle { generation: 1, kind: 2, id: 3 }),
        ];
        let mut slot = [0u8; FIELD_SLOT_SIZE as usize];
        for v in values {
            v.encode_field(&mut slot);
            assert_eq!(Value::decode_field(&slot), v);
        }
    }

    #[test]
    fn struct_layout_packs_fields_into_fixed_slots() {
        let info = TypeInfo::struct_layout(
            "widget",
            &[("hp", TypeId(0), false), ("inventory", TypeId(1), true)],
        );
        assert_eq!(info.fields[0].offset, 0);
        assert_eq!(info.fields[1].offset, FIELD_SLOT_SIZE);
        assert_eq!(info.size, FIELD_SLOT_SIZE * 2);
        assert!(info.fields[1].is_unmanaged_array);
    }
}
