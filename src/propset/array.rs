//! Unmanaged arrays: dynamic arrays owned outside the GC heap, referenced
//! from scripts via a [`TypedHandle`].
//!
//! Reference: `lib/nw/smalls/UnmanagedArray.hpp`, `lib/nw/smalls/Array.hpp`,
//! and `tests/test_unmanaged_array.cpp`. The C++ `IArray` virtual interface
//! becomes a `dyn UnmanagedArray` trait object.

use crate::core::handle::HandlePool;
use crate::core::value::{TypeId, TypedHandle, Value};

/// Reserved `TypeInfo::kind` tag identifying a [`TypedHandle`] as an
/// unmanaged array rather than any other VM-owned resource.
pub const TYPE_UNMANAGED_ARRAY: u8 = 0xFE;

/// Operations common to every unmanaged array element type. Reference:
/// `IArray` in `lib/nw/smalls/UnmanagedArray.hpp`.
pub trait UnmanagedArray {
    fn size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn append_value(&mut self, value: Value) -> Result<(), ArrayError>;
    fn get_value(&self, index: usize) -> Result<Value, ArrayError>;
    fn set_value(&mut self, index: usize, value: Value) -> Result<(), ArrayError>;
    fn clear(&mut self);
    fn resize(&mut self, new_len: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayError {
    IndexOutOfRange,
    TypeMismatch,
    InvalidHandle,
}

impl std::fmt::Display for ArrayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayError::IndexOutOfRange => write!(f, "unmanaged array index out of range"),
            ArrayError::TypeMismatch => write!(f, "unmanaged array element type mismatch"),
            ArrayError::InvalidHandle => write!(f, "invalid or destroyed unmanaged array handle"),
        }
    }
}

impl std::error::Error for ArrayError {}

/// A homogeneous unmanaged array of scalar/handle `Value`s, type-checked on
/// every element access against `element_type`.
pub struct TypedArray {
    element_type: TypeId,
    values: Vec<Value>,
}

impl TypedArray {
    pub fn new(element_type: TypeId, capacity: usize) -> Self {
        Self {
            element_type,
            values: Vec::with_capacity(capacity),
        }
    }

    fn check_type(&self, value: &Value, expect_heap: bool) -> Result<(), ArrayError> {
        // The element type table lookup happens at the caller (runtime)
        // boundary; here we only enforce storage-kind consistency, which is
        // what `IArray::append_value` validates before the cast in the
        // original.
        if value.is_heap() != expect_heap {
            return Err(ArrayError::TypeMismatch);
        }
        Ok(())
    }

    pub fn element_type(&self) -> TypeId {
        self.element_type
    }
}

impl UnmanagedArray for TypedArray {
    fn size(&self) -> usize {
        self.values.len()
    }

    fn capacity(&self) -> usize {
        self.values.capacity()
    }

    fn append_value(&mut self, value: Value) -> Result<(), ArrayError> {
        let expect_heap = self.values.first().map(|v| v.is_heap()).unwrap_or(value.is_heap());
        self.check_type(&value, expect_heap)?;
        self.values.push(value);
        Ok(())
    }

    fn get_value(&self, index: usize) -> Result<Value, ArrayError> {
        self.values.get(index).copied().ok_or(ArrayError::IndexOutOfRange)
    }

    fn set_value(&mut self, index: usize, value: Value) -> Result<(), ArrayError> {
        let slot = self.values.get_mut(index).ok_or(ArrayError::IndexOutOfRange)?;
        *slot = value;
        Ok(())
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn resize(&mut self, new_len: usize) {
        self.values.resize(new_len, Value::Uninitialized);
    }
}

/// Owns every live unmanaged array and hands out generation-tagged
/// [`TypedHandle`]s to the VM. Reference: `RuntimeObjectPool` in
/// `tests/test_unmanaged_array.cpp`.
#[derive(Default)]
pub struct RuntimeObjectPool {
    arrays: HandlePool<Box<dyn UnmanagedArray>>,
}

impl RuntimeObjectPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_unmanaged_array(&mut self, element_type: TypeId, capacity: usize) -> TypedHandle {
        let raw = self.arrays.insert(Box::new(TypedArray::new(element_type, capacity)));
        TypedHandle {
            generation: raw.generation,
            kind: TYPE_UNMANAGED_ARRAY,
            id: raw.index,
        }
    }

    fn to_raw(handle: TypedHandle) -> crate::core::handle::RawHandle {
        crate::core::handle::RawHandle {
            generation: handle.generation,
            index: handle.id,
        }
    }

    pub fn get_unmanaged_array(&self, handle: TypedHandle) -> Option<&dyn UnmanagedArray> {
        self.arrays.get(Self::to_raw(handle)).map(|b| b.as_ref())
    }

    pub fn get_unmanaged_array_mut(&mut self, handle: TypedHandle) -> Option<&mut (dyn UnmanagedArray + '_)> {
        self.arrays.get_mut(Self::to_raw(handle)).map(|b| b.as_mut() as &mut (dyn UnmanagedArray + '_))
    }

    pub fn destroy_unmanaged_array(&mut self, handle: TypedHandle) {
        self.arrays.destroy(Self::to_raw(handle));
    }

    pub fn valid_unmanaged_array(&self, handle: TypedHandle) -> bool {
        handle.kind == TYPE_UNMANAGED_ARRAY && self.arrays.valid(Self::to_raw(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TypeId;

    #[test]
    fn allocate_then_append_and_read_back() {
        let mut pool = RuntimeObjectPool::new();
        let handle = pool.allocate_unmanaged_array(TypeId(0), 4);

        let arr = pool.get_unmanaged_array_mut(handle).unwrap();
        arr.append_value(Value::Int(1)).unwrap();
        arr.append_value(Value::Int(2)).unwrap();

        let arr = pool.get_unmanaged_array(handle).unwrap();
        assert_eq!(arr.size(), 2);
        assert_eq!(arr.get_value(1).unwrap(), Value::Int(2));
    }

    #[test]
    fn destroyed_handle_is_no_longer_valid() {
        let mut pool = RuntimeObjectPool::new();
        let handle = pool.allocate_unmanaged_array(TypeId(0), 2);
        assert!(pool.valid_unmanaged_array(handle));

        pool.destroy_unmanaged_array(handle);
        assert!(!pool.valid_unmanaged_array(handle));
        assert!(pool.get_unmanaged_array(handle).is_none());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut pool = RuntimeObjectPool::new();
        let handle = pool.allocate_unmanaged_array(TypeId(0), 2);
        let arr = pool.get_unmanaged_array(handle).unwrap();
        assert_eq!(arr.get_value(0).unwrap_err(), ArrayError::IndexOutOfRange);
    }

    #[test]
    fn type_mismatch_append_is_rejected() {
        let mut pool = RuntimeObjectPool::new();
        let handle = pool.allocate_unmanaged_array(TypeId(0), 2);
        let arr = pool.get_unmanaged_array_mut(handle).unwrap();
        arr.append_value(Value::Int(1)).unwrap();
        let err = arr.append_value(Value::Heap(crate::core::value::HeapPtr(3))).unwrap_err();
        assert_eq!(err, ArrayError::TypeMismatch);
    }

    #[test]
    fn resize_fills_with_uninitialized() {
        let mut pool = RuntimeObjectPool::new();
        let handle = pool.allocate_unmanaged_array(TypeId(0), 2);
        let arr = pool.get_unmanaged_array_mut(handle).unwrap();
        arr.resize(3);
        assert_eq!(arr.size(), 3);
        assert_eq!(arr.get_value(2).unwrap(), Value::Uninitialized);
    }
}
