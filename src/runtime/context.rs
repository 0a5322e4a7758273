//! The runtime: owns every piece of process-wide state and is the single
//! entry point the host game loop calls into.
//!
//! The runtime mediates all access; the host must not read or write heap,
//! GC, or propset state directly except through the methods below. One
//! owned struct holds everything that would otherwise live in global
//! mutable statics.

use crate::bytecode::module::BytecodeModule;
use crate::core::gc::GarbageCollector;
use crate::core::heap::ScriptHeap;
use crate::core::value::{
    FIELD_SLOT_SIZE, HeapPtr, ObjectHandle, OwnershipMode, TypeId, TypeTable, TypedHandle, Value,
};
use crate::propset::array::RuntimeObjectPool;
use crate::propset::pool::PropsetPool;
use crate::runtime::config::RuntimeConfig;
use crate::vm::engine::{Vm, VmHost};
use crate::vm::error::{ExecutionResult, VmError};
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;

/// A loaded-but-not-yet-compiled script's provenance. Producing a
/// [`BytecodeModule`] from source is the job of an external compiler (out
/// of scope here); a `Script` is what the host has to hand it to that
/// compiler, and what carries back its diagnostics.
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub source_path: Option<PathBuf>,
    pub source_text: Option<String>,
    pub diagnostics: Vec<String>,
}

type NativeFn = Box<dyn FnMut(&[Value]) -> Result<Value, VmError>>;

struct HandleEntry {
    ptr: HeapPtr,
    mode: OwnershipMode,
}

/// Owns the script heap, GC, propset pools, unmanaged-array pool, type
/// table, loaded modules, and the VM.
pub struct Runtime {
    config: RuntimeConfig,
    types: TypeTable,
    heap: ScriptHeap,
    gc: GarbageCollector,
    propsets: PropsetPool,
    arrays: RuntimeObjectPool,
    vm: Vm,
    module_paths: Vec<PathBuf>,
    modules: HashMap<String, BytecodeModule>,
    handle_registry: HashMap<u64, HandleEntry>,
    destructors: HashMap<u8, Box<dyn FnMut(HeapPtr)>>,
    natives: IndexMap<String, NativeFn>,
}

impl Runtime {
    pub fn initialize(config: RuntimeConfig) -> Self {
        debug!("initializing runtime, gc config = {:?}", config.gc);
        Self {
            gc: GarbageCollector::new(config.gc),
            config,
            types: TypeTable::new(),
            heap: ScriptHeap::new(),
            propsets: PropsetPool::new(),
            arrays: RuntimeObjectPool::new(),
            vm: Vm::new(),
            module_paths: Vec::new(),
            modules: HashMap::new(),
            handle_registry: HashMap::new(),
            destructors: HashMap::new(),
            natives: IndexMap::new(),
        }
    }

    /// Runs every still-live `VM_OWNED` destructor so native resources are
    /// not leaked when the host tears the runtime down outside of a GC
    /// cycle.
    pub fn shutdown(&mut self) {
        let owned: Vec<(u64, HeapPtr, u8)> = self
            .handle_registry
            .iter()
            .filter(|(_, e)| e.mode == OwnershipMode::VmOwned)
            .map(|(&bits, e)| (bits, e.ptr, TypedHandle::unpack(bits).kind))
            .collect();
        for (bits, ptr, kind) in owned {
            if let Some(destructor) = self.destructors.get_mut(&kind) {
                destructor(ptr);
            }
            self.handle_registry.remove(&bits);
        }
        debug!("runtime shutdown complete");
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    pub fn heap(&self) -> &ScriptHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ScriptHeap {
        &mut self.heap
    }

    pub fn propsets_mut(&mut self) -> &mut PropsetPool {
        &mut self.propsets
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn gc_mut(&mut self) -> &mut GarbageCollector {
        &mut self.gc
    }

    pub fn add_module_path(&mut self, dir: impl Into<PathBuf>) {
        self.module_paths.push(dir.into());
    }

    /// Locates `name` under a registered module path and returns a `Script`
    /// carrying its source text, ready to hand to an external compiler.
    pub fn load_module(&self, name: &str) -> Result<Script, RuntimeError> {
        for dir in &self.module_paths {
            let candidate = dir.join(format!("{name}.smalls"));
            if candidate.is_file() {
                let text = std::fs::read_to_string(&candidate)
                    .map_err(|e| RuntimeError::Io(format!("{}: {e}", candidate.display())))?;
                return Ok(Script {
                    name: name.to_string(),
                    source_path: Some(candidate),
                    source_text: Some(text),
                    diagnostics: Vec::new(),
                });
            }
        }
        Err(RuntimeError::ModuleNotFound(name.to_string()))
    }

    pub fn load_module_from_source(&self, name: &str, text: &str) -> Script {
        Script {
            name: name.to_string(),
            source_path: None,
            source_text: Some(text.to_string()),
            diagnostics: Vec::new(),
        }
    }

    /// Registers an already-compiled module (compilation itself is an
    /// external-compiler responsibility; see [`Script`]).
    pub fn register_module(&mut self, module: BytecodeModule) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn get_or_compile_module(&self, script: &Script) -> Result<&BytecodeModule, RuntimeError> {
        self.modules
            .get(&script.name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(script.name.clone()))
    }

    pub fn execute_script(
        &mut self,
        module_name: &str,
        entry: &str,
        args: &[Value],
        gas_limit: u64,
    ) -> ExecutionResult {
        let Some(module) = self.modules.get_mut(module_name) else {
            return ExecutionResult::failure(
                VmError::type_mismatch(format!("no such module: {module_name}")),
                &[],
                0,
            );
        };
        let mut host = RuntimeHost {
            types: &self.types,
            heap: &mut self.heap,
            gc: &mut self.gc,
            propsets: &mut self.propsets,
            arrays: &mut self.arrays,
            natives: &mut self.natives,
        };
        self.vm.execute_script(&mut host, module, entry, args, gas_limit)
    }

    pub fn alloc_string(&mut self, text: &str) -> HeapPtr {
        let bytes = text.as_bytes();
        let type_id = self.types.find("string").unwrap_or(TypeId(0));
        let ptr = self.heap.allocate(bytes.len().max(1) as u32, 1, type_id);
        if let Some(cell) = self.heap.get_ptr_mut(ptr) {
            cell[..bytes.len()].copy_from_slice(bytes);
        }
        ptr
    }

    /// A `VmOwned` handle's backing cell is marked finalizable so the minor
    /// collector's sweep calls the registered destructor once the cell
    /// becomes unreachable (see `collect_minor` below).
    pub fn intern_handle(&mut self, th: TypedHandle, mode: OwnershipMode, ptr: HeapPtr) {
        if mode == OwnershipMode::VmOwned {
            if let Some(header) = self.heap.try_get_header_mut(ptr) {
                header.finalizable = true;
            }
        }
        self.handle_registry.insert(th.pack(), HandleEntry { ptr, mode });
    }

    pub fn lookup_handle(&self, th: TypedHandle) -> Option<HeapPtr> {
        self.handle_registry.get(&th.pack()).map(|e| e.ptr)
    }

    pub fn register_handle_destructor(&mut self, kind: u8, destructor: impl FnMut(HeapPtr) + 'static) {
        self.destructors.insert(kind, Box::new(destructor));
    }

    /// Builder entry point for registering a native function module.
    pub fn module(&mut self, _name: &str) -> ModuleBuilder<'_> {
        ModuleBuilder { runtime: self }
    }

    /// Runs a full minor collection over the script heap, rooted at every
    /// non-`VmOwned` handle registration. A `VmOwned` cell survives only if
    /// something else keeps it reachable; otherwise its registered
    /// destructor fires exactly once and its registry entry is dropped.
    ///
    /// Traces out-edges via [`trace_heap_cell`], so a young cell reachable
    /// only through a live struct field survives the collection.
    pub fn collect_minor(&mut self) {
        let roots: Vec<HeapPtr> = self
            .handle_registry
            .values()
            .filter(|e| e.mode != OwnershipMode::VmOwned)
            .map(|e| e.ptr)
            .collect();
        let types = &self.types;
        let handle_registry = &mut self.handle_registry;
        let destructors = &mut self.destructors;
        self.gc.collect_minor(
            &mut self.heap,
            &roots,
            |heap, ptr, visit| trace_heap_cell(types, heap, ptr, visit),
            |ptr| {
                let stale = handle_registry
                    .iter()
                    .find(|(_, e)| e.mode == OwnershipMode::VmOwned && e.ptr == ptr)
                    .map(|(&bits, _)| bits);
                let Some(bits) = stale else { return };
                let kind = TypedHandle::unpack(bits).kind;
                if let Some(destructor) = destructors.get_mut(&kind) {
                    destructor(ptr);
                }
                handle_registry.remove(&bits);
            },
        );
    }

    /// Drops any propset slots owned by objects the host reports as no
    /// longer alive.
    pub fn prune_propset_owners(&mut self, object_is_alive: impl Fn(u32) -> bool) {
        let pruned = self.propsets.prune_invalid_owners(object_is_alive);
        if !pruned.is_empty() {
            warn!("pruned {} dangling propset owner(s)", pruned.len());
        }
    }
}

/// Walks a struct cell's declared fields, calling `visit` with every one
/// whose current value is a heap pointer. Cells whose type is unregistered
/// or has no fields (primitives, or a type not found at all) contribute no
/// out-edges.
fn trace_heap_cell(types: &TypeTable, heap: &ScriptHeap, ptr: HeapPtr, visit: &mut dyn FnMut(HeapPtr)) {
    let Some(header) = heap.try_get_header(ptr) else { return };
    let Some(type_info) = types.get(header.type_id) else { return };
    let Some(cell) = heap.get_ptr(ptr) else { return };
    for field in &type_info.fields {
        let start = field.offset as usize;
        let Some(slot) = cell.get(start..start + FIELD_SLOT_SIZE as usize) else { continue };
        if let Value::Heap(child) = Value::decode_field(slot) {
            visit(child);
        }
    }
}

/// Borrowed view of everything the VM dispatch loop needs besides the
/// register file and frame stack it owns itself.
struct RuntimeHost<'a> {
    types: &'a TypeTable,
    heap: &'a mut ScriptHeap,
    gc: &'a mut GarbageCollector,
    propsets: &'a mut PropsetPool,
    arrays: &'a mut RuntimeObjectPool,
    natives: &'a mut IndexMap<String, NativeFn>,
}

impl VmHost for RuntimeHost<'_> {
    fn alloc_struct(&mut self, type_id: TypeId) -> Result<HeapPtr, VmError> {
        let field_count = self.types.get(type_id).map(|t| t.fields.len()).unwrap_or(0);
        let size = (field_count as u32 * FIELD_SLOT_SIZE).max(FIELD_SLOT_SIZE);
        let ptr = self.heap.allocate(size, 4, type_id);
        if let Some(cell) = self.heap.get_ptr_mut(ptr) {
            for slot in cell.chunks_mut(FIELD_SLOT_SIZE as usize) {
                Value::Uninitialized.encode_field(slot);
            }
        }
        Ok(ptr)
    }

    fn alloc_array(&mut self, element_type: TypeId, capacity: u32) -> Result<HeapPtr, VmError> {
        let handle = self.arrays.allocate_unmanaged_array(element_type, capacity as usize);
        // Arrays are VM-visible as unmanaged-array typed handles, not raw
        // heap cells; wrap the handle bits in a heap cell so existing
        // GETINDEX/SETINDEX call sites (which expect a HeapPtr) keep working
        // uniformly. See DESIGN.md, "Unmanaged arrays as heap cells".
        let ptr = self.heap.allocate(8, 8, element_type);
        if let Some(cell) = self.heap.get_ptr_mut(ptr) {
            cell[..8].copy_from_slice(&handle.pack().to_le_bytes());
        }
        Ok(ptr)
    }

    fn alloc_string(&mut self, text: &str) -> Result<HeapPtr, VmError> {
        let bytes = text.as_bytes();
        let ptr = self.heap.allocate(bytes.len().max(1) as u32, 1, TypeId(0));
        if let Some(cell) = self.heap.get_ptr_mut(ptr) {
            cell[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(ptr)
    }

    fn get_field(&self, obj: HeapPtr, field_index: u32) -> Result<Value, VmError> {
        let offset = self.field_offset(obj, field_index)?;
        let cell = self
            .heap
            .get_ptr(obj)
            .ok_or_else(|| VmError::bounds("dereferenced a dead heap cell"))?;
        let slot = cell
            .get(offset..offset + FIELD_SLOT_SIZE as usize)
            .ok_or_else(|| VmError::bounds("field slot out of bounds"))?;
        Ok(Value::decode_field(slot))
    }

    fn set_field(&mut self, obj: HeapPtr, field_index: u32, value: Value) -> Result<(), VmError> {
        let offset = self.field_offset(obj, field_index)?;
        let cell = self
            .heap
            .get_ptr_mut(obj)
            .ok_or_else(|| VmError::bounds("wrote through a dead heap cell"))?;
        let slot = cell
            .get_mut(offset..offset + FIELD_SLOT_SIZE as usize)
            .ok_or_else(|| VmError::bounds("field slot out of bounds"))?;
        value.encode_field(slot);
        Ok(())
    }

    fn get_index(&self, array: HeapPtr, index: i32) -> Result<Value, VmError> {
        let handle = self.array_handle_of(array)?;
        let arr = self
            .arrays
            .get_unmanaged_array(handle)
            .ok_or_else(|| VmError::bounds("dangling unmanaged array handle"))?;
        if index < 0 {
            return Err(VmError::bounds("negative array index"));
        }
        arr.get_value(index as usize)
            .map_err(|e| VmError::bounds(e.to_string()))
    }

    fn set_index(&mut self, array: HeapPtr, index: i32, value: Value) -> Result<(), VmError> {
        let handle = self.array_handle_of(array)?;
        let arr = self
            .arrays
            .get_unmanaged_array_mut(handle)
            .ok_or_else(|| VmError::bounds("dangling unmanaged array handle"))?;
        if index < 0 {
            return Err(VmError::bounds("negative array index"));
        }
        arr.set_value(index as usize, value)
            .map_err(|e| VmError::bounds(e.to_string()))
    }

    fn get_propset(&mut self, owner: Value, propset_type: TypeId) -> Result<Value, VmError> {
        let Value::Object(obj) = owner else {
            return Err(VmError::type_mismatch("GETPROPSET owner is not an object handle"));
        };
        let rf = self
            .propsets
            .get_or_create(self.types, propset_type, obj)
            .map_err(|e| VmError::type_mismatch(e.to_string()))?;
        Ok(Value::Object(ObjectHandle {
            generation: rf.type_id.0,
            id: rf.object_id,
        }))
    }

    fn get_propset_field(&mut self, propset: Value, field_index: u32) -> Result<Value, VmError> {
        let rf = self.propset_ref_of(propset)?;
        self.propsets
            .read_field(rf, field_index, false)
            .map_err(|e| VmError::bounds(e.to_string()))
    }

    fn set_propset_field(
        &mut self,
        propset: Value,
        field_index: u32,
        value: Value,
    ) -> Result<(), VmError> {
        let rf = self.propset_ref_of(propset)?;
        self.propsets
            .write_field(rf, field_index, value)
            .map_err(|e| VmError::bounds(e.to_string()))
    }

    fn call_native(&mut self, native_index: u32, args: &[Value]) -> Result<Value, VmError> {
        let Some((_, f)) = self.natives.iter_mut().nth(native_index as usize) else {
            return Err(VmError::type_mismatch("native function index out of range"));
        };
        f(args)
    }

    fn write_barrier(&mut self, dst: HeapPtr, src: Value) {
        if let Some(src_ptr) = src.heap_ptr() {
            self.gc.write_barrier(self.heap, dst, src_ptr);
        }
        self.propsets.mark_heap_mutation(dst);
    }
}

impl RuntimeHost<'_> {
    /// Resolves `field_index` on `obj` to a byte offset into its heap cell,
    /// validating both that the cell is live and that the field exists on
    /// the cell's registered type.
    fn field_offset(&self, obj: HeapPtr, field_index: u32) -> Result<usize, VmError> {
        if !self.heap.is_live(obj) {
            return Err(VmError::bounds("dereferenced a dead heap cell"));
        }
        let type_id = self
            .heap
            .try_get_header(obj)
            .map(|h| h.type_id)
            .ok_or_else(|| VmError::bounds("dereferenced a dead heap cell"))?;
        let field = self
            .types
            .get(type_id)
            .and_then(|t| t.fields.get(field_index as usize))
            .ok_or_else(|| VmError::bounds(format!("field index {field_index} out of range")))?;
        Ok(field.offset as usize)
    }

    fn array_handle_of(&self, ptr: HeapPtr) -> Result<TypedHandle, VmError> {
        let bytes = self
            .heap
            .get_ptr(ptr)
            .ok_or_else(|| VmError::bounds("dangling array heap pointer"))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        Ok(TypedHandle::unpack(u64::from_le_bytes(buf)))
    }

    /// `Value::Object` carries a propset reference packed as
    /// `{generation: type_id, id: object_id}` per [`VmHost::get_propset`].
    fn propset_ref_of(&self, v: Value) -> Result<crate::propset::pool::PropsetRef, VmError> {
        match v {
            Value::Object(h) => Ok(crate::propset::pool::PropsetRef {
                type_id: TypeId(h.generation),
                object_id: h.id,
            }),
            _ => Err(VmError::type_mismatch("expected a propset reference")),
        }
    }
}

/// Builder returned by [`Runtime::module`] for registering native
/// functions: `module(name).function(name, fn).finalize()`.
pub struct ModuleBuilder<'a> {
    runtime: &'a mut Runtime,
}

impl<'a> ModuleBuilder<'a> {
    pub fn function(
        self,
        name: &str,
        f: impl FnMut(&[Value]) -> Result<Value, VmError> + 'static,
    ) -> FunctionBuilder<'a> {
        self.runtime.natives.insert(name.to_string(), Box::new(f));
        FunctionBuilder { runtime: self.runtime }
    }
}

pub struct FunctionBuilder<'a> {
    runtime: &'a mut Runtime,
}

impl FunctionBuilder<'_> {
    pub fn finalize(self) {
        let _ = self.runtime;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    ModuleNotFound(String),
    Io(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::ModuleNotFound(name) => write!(f, "module not found: {name}"),
            RuntimeError::Io(msg) => write!(f, "io error loading module: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TypeInfo;

    fn runtime_with_struct_type() -> (Runtime, TypeId) {
        let mut runtime = Runtime::initialize(RuntimeConfig::default());
        let type_id = runtime.types_mut().register(TypeInfo::struct_layout(
            "widget",
            &[("hp", TypeId(0), false), ("owner", TypeId(0), false)],
        ));
        (runtime, type_id)
    }

    #[test]
    fn struct_field_write_then_read_round_trips() {
        let (mut runtime, type_id) = runtime_with_struct_type();
        let mut host = RuntimeHost {
            types: &runtime.types,
            heap: &mut runtime.heap,
            gc: &mut runtime.gc,
            propsets: &mut runtime.propsets,
            arrays: &mut runtime.arrays,
            natives: &mut runtime.natives,
        };
        let ptr = host.alloc_struct(type_id).unwrap();
        host.set_field(ptr, 0, Value::Int(42)).unwrap();
        assert_eq!(host.get_field(ptr, 0).unwrap(), Value::Int(42));
        assert_eq!(host.get_field(ptr, 1).unwrap(), Value::Uninitialized);
    }

    #[test]
    fn struct_field_index_out_of_range_is_rejected() {
        let (mut runtime, type_id) = runtime_with_struct_type();
        let mut host = RuntimeHost {
            types: &runtime.types,
            heap: &mut runtime.heap,
            gc: &mut runtime.gc,
            propsets: &mut runtime.propsets,
            arrays: &mut runtime.arrays,
            natives: &mut runtime.natives,
        };
        let ptr = host.alloc_struct(type_id).unwrap();
        assert!(host.get_field(ptr, 5).is_err());
    }

    #[test]
    fn minor_gc_traces_a_heap_pointer_embedded_in_a_struct_field() {
        let (mut runtime, type_id) = runtime_with_struct_type();
        let child;
        let parent;
        {
            let mut host = RuntimeHost {
                types: &runtime.types,
                heap: &mut runtime.heap,
                gc: &mut runtime.gc,
                propsets: &mut runtime.propsets,
                arrays: &mut runtime.arrays,
                natives: &mut runtime.natives,
            };
            child = host.alloc_string("hi").unwrap();
            parent = host.alloc_struct(type_id).unwrap();
            host.set_field(parent, 0, Value::Heap(child)).unwrap();
        }

        let th = TypedHandle { generation: 1, kind: 9, id: 1 };
        runtime.intern_handle(th, OwnershipMode::EngineOwned, parent);
        runtime.collect_minor();
        assert!(
            runtime.heap().is_live(child),
            "child reachable only via a struct field should survive minor GC"
        );
    }

    #[test]
    fn get_propset_zero_initializes_from_the_runtime_type_table() {
        let mut runtime = Runtime::initialize(RuntimeConfig::default());
        let propset_type = TypeId(77);
        runtime.propsets_mut().register_type(crate::propset::pool::PropsetTypeInfo {
            type_id: propset_type,
            field_count: 1,
            unmanaged_array_fields: vec![],
        });
        let mut host = RuntimeHost {
            types: &runtime.types,
            heap: &mut runtime.heap,
            gc: &mut runtime.gc,
            propsets: &mut runtime.propsets,
            arrays: &mut runtime.arrays,
            natives: &mut runtime.natives,
        };
        let owner = Value::Object(ObjectHandle { generation: 1, id: 3 });
        let rf = host.get_propset(owner, propset_type).unwrap();
        let field = host.get_propset_field(rf, 0).unwrap();
        assert_eq!(field, Value::Uninitialized);
    }
}
