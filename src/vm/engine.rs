//! Register-based fetch-decode-dispatch loop.
//!
//! One register-window dispatch loop per call. Native calls, heap
//! allocation, and propset access are delegated to a [`VmHost`]
//! implementation (owned by `crate::runtime::Runtime`) the same way
//! `crate::core::gc::GarbageCollector` takes `roots`/`trace`/`finalize`
//! closures instead of reaching into runtime state directly.

use crate::bytecode::instruction::{Instruction, Opcode, UpvalueDescriptor};
use crate::bytecode::module::{BytecodeModule, CompiledFunction, Constant};
use crate::core::handle::HandlePool;
use crate::core::value::{HeapPtr, TypeId, Value};
use crate::vm::error::{ExecutionResult, StackFrame, VmError};
use crate::vm::frame::{ClosureObject, Frame, UpvalueCell};
use crate::vm::gas::gas_cost;
use log::{debug, error};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Everything the dispatch loop needs from the owning runtime but does not
/// own itself: the script heap, propset pools, and the native-call bridge.
/// Native calls marshal registers through a typed bridge rather than
/// reaching into host state directly.
pub trait VmHost {
    fn alloc_struct(&mut self, type_id: TypeId) -> Result<HeapPtr, VmError>;
    fn alloc_array(&mut self, element_type: TypeId, capacity: u32) -> Result<HeapPtr, VmError>;
    fn alloc_string(&mut self, text: &str) -> Result<HeapPtr, VmError>;

    fn get_field(&self, obj: HeapPtr, field_index: u32) -> Result<Value, VmError>;
    fn set_field(&mut self, obj: HeapPtr, field_index: u32, value: Value) -> Result<(), VmError>;

    fn get_index(&self, array: HeapPtr, index: i32) -> Result<Value, VmError>;
    fn set_index(&mut self, array: HeapPtr, index: i32, value: Value) -> Result<(), VmError>;

    fn get_propset(&mut self, owner: Value, propset_type: TypeId) -> Result<Value, VmError>;
    fn get_propset_field(&mut self, propset: Value, field_index: u32) -> Result<Value, VmError>;
    fn set_propset_field(
        &mut self,
        propset: Value,
        field_index: u32,
        value: Value,
    ) -> Result<(), VmError>;

    fn call_native(&mut self, native_index: u32, args: &[Value]) -> Result<Value, VmError>;

    /// Called for every store that may create an old→young edge. No-op when
    /// `src` is not heap-resident.
    fn write_barrier(&mut self, dst: HeapPtr, src: Value);
}

/// Execution-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle,
    Running,
    SuspendedOnGcStep,
    Failed,
}

/// The register-based interpreter. Holds the process-wide register file,
/// frame stack, and the closure side table; everything heap/propset-shaped
/// is reached through a [`VmHost`].
pub struct Vm {
    registers: Vec<Value>,
    frames: Vec<Frame>,
    closures: HandlePool<ClosureObject>,
    string_constant_cache: HashMap<u32, HeapPtr>,
    state: VmState,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            registers: Vec::new(),
            frames: Vec::new(),
            closures: HandlePool::new(),
            string_constant_cache: HashMap::new(),
            state: VmState::Idle,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Runs `module`'s `entry` function to completion (or failure), with
    /// `gas_limit` as the starting gas counter.
    pub fn execute_script(
        &mut self,
        host: &mut dyn VmHost,
        module: &mut BytecodeModule,
        entry: &str,
        args: &[Value],
        gas_limit: u64,
    ) -> ExecutionResult {
        self.registers.clear();
        self.frames.clear();
        self.string_constant_cache.clear();
        self.state = VmState::Running;

        let entry_idx = module.get_function_index(entry);
        let Some(func) = module.functions.get(entry_idx as usize) else {
            self.state = VmState::Failed;
            return ExecutionResult::failure(
                VmError::type_mismatch(format!("no such entry point: {entry}")),
                &[],
                0,
            );
        };

        let register_base = 0usize;
        self.registers
            .resize(register_base + func.register_count as usize, Value::Uninitialized);
        for (i, a) in args.iter().take(func.param_count as usize).enumerate() {
            self.registers[register_base + i] = *a;
        }
        self.frames.push(Frame::new(
            entry_idx,
            func.name.clone(),
            register_base,
            0,
            0,
            Vec::new(),
        ));

        let mut gas_remaining = gas_limit;
        let result = self.run(host, module, &mut gas_remaining);
        let gas_used = gas_limit.saturating_sub(gas_remaining);

        match result {
            Ok(value) => {
                self.state = VmState::Idle;
                ExecutionResult::success(value, gas_used)
            }
            Err(err) => {
                self.state = VmState::Failed;
                let trace: Vec<StackFrame> = self
                    .frames
                    .iter()
                    .rev()
                    .map(|f| StackFrame {
                        function_name: f.function_name.clone(),
                        source_line: f.source_line,
                    })
                    .collect();
                error!("script execution failed: {err}");
                ExecutionResult::failure(err, &trace, gas_used)
            }
        }
    }

    fn current_func<'m>(&self, module: &'m BytecodeModule) -> &'m CompiledFunction {
        let idx = self.frames.last().unwrap().function_index;
        &module.functions[idx as usize]
    }

    fn reg(&self, r: u8) -> Value {
        let base = self.frames.last().unwrap().register_base;
        self.registers[base + r as usize]
    }

    fn set_reg(&mut self, r: u8, v: Value) {
        let base = self.frames.last().unwrap().register_base;
        self.registers[base + r as usize] = v;
    }

    /// Main fetch-decode-dispatch loop. Runs until the initial frame
    /// returns or an error unwinds every frame.
    fn run(
        &mut self,
        host: &mut dyn VmHost,
        module: &mut BytecodeModule,
        gas: &mut u64,
    ) -> Result<Value, VmError> {
        loop {
            let (func_idx, ip) = {
                let frame = self.frames.last().unwrap();
                (frame.function_index, frame.ip)
            };
            let func = &module.functions[func_idx as usize];

            let Some(&instr) = func.instructions.get(ip) else {
                // Fell off the end without an explicit RET/RETVOID.
                if let Some(v) = self.pop_frame_returning(Value::Uninitialized) {
                    return Ok(v);
                }
                continue;
            };

            let Some(op) = instr.opcode() else {
                self.frames.last_mut().unwrap().ip += 1;
                continue;
            };

            let cost = gas_cost(op);
            if *gas < cost {
                return Err(VmError::gas_exhausted());
            }
            *gas -= cost;

            debug!("{} {}", self.current_func(module).name, op.mnemonic());

            match self.step(host, module, op, instr)? {
                StepOutcome::Continue => {
                    self.frames.last_mut().unwrap().ip += 1;
                }
                StepOutcome::Jump(target) => {
                    self.frames.last_mut().unwrap().ip = target;
                }
                StepOutcome::Return(value) => {
                    if let Some(v) = self.pop_frame_returning(value) {
                        return Ok(v);
                    }
                }
            }
        }
    }

    /// Pops the current frame, placing `value` into the caller's return
    /// register window. Returns `Some(value)` when the frame popped was the
    /// outermost one (execution is complete).
    fn pop_frame_returning(&mut self, value: Value) -> Option<Value> {
        let finished = self.frames.pop().unwrap();
        if self.frames.is_empty() {
            return Some(value);
        }
        if finished.return_count > 0 {
            self.registers[finished.return_base] = value;
        }
        None
    }

    fn step(
        &mut self,
        host: &mut dyn VmHost,
        module: &mut BytecodeModule,
        op: Opcode,
        instr: Instruction,
    ) -> Result<StepOutcome, VmError> {
        use Opcode::*;
        match op {
            Add | Sub | Mul | Div | Mod => self.arith(op, instr),
            Neg => {
                let v = self.reg(instr.arg_b());
                self.set_reg(instr.arg_a(), negate(v)?);
                Ok(StepOutcome::Continue)
            }
            IsEq | IsLt | IsLe => self.compare(op, instr),
            And | Or | Xor | Shl | Shr | Usr => self.bitwise(op, instr),
            Not => {
                let v = as_bool(self.reg(instr.arg_b()))?;
                self.set_reg(instr.arg_a(), Value::Bool(!v));
                Ok(StepOutcome::Continue)
            }
            Move => {
                let v = self.reg(instr.arg_b());
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            LoadI => {
                self.set_reg(instr.arg_a(), Value::Int(instr.arg_sbx() as i32));
                Ok(StepOutcome::Continue)
            }
            LoadK => {
                let v = self.load_constant(host, module, instr.arg_bx() as u32)?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            LoadNil => {
                self.set_reg(instr.arg_a(), Value::Uninitialized);
                Ok(StepOutcome::Continue)
            }
            GetGlobal => {
                let idx = instr.arg_bx() as usize;
                let v = *module
                    .globals
                    .get(idx)
                    .ok_or_else(|| VmError::bounds(format!("global slot {idx} out of range")))?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            SetGlobal => {
                let idx = instr.arg_bx() as usize;
                let v = self.reg(instr.arg_a());
                if idx >= module.globals.len() {
                    return Err(VmError::bounds(format!("global slot {idx} out of range")));
                }
                // Globals are scanned as roots every minor collection, so
                // unlike SETFIELD/SETINDEX/SETPROPSETFIELD this store needs
                // no card-marking barrier: there is no old heap cell whose
                // card would need to be dirtied.
                module.globals[idx] = v;
                Ok(StepOutcome::Continue)
            }
            Closure => self.make_closure(host, module, instr),
            GetUpval => {
                let cell = self.frames.last().unwrap().upvalues[instr.arg_b() as usize].clone();
                let v = cell.borrow().clone();
                self.set_reg(instr.arg_a(), v.value);
                Ok(StepOutcome::Continue)
            }
            SetUpval => {
                let v = self.reg(instr.arg_a());
                let cell = self.frames.last().unwrap().upvalues[instr.arg_b() as usize].clone();
                cell.borrow_mut().value = v;
                Ok(StepOutcome::Continue)
            }
            NewStruct => {
                let type_id = TypeId(instr.arg_bx() as u32);
                let ptr = host.alloc_struct(type_id)?;
                self.set_reg(instr.arg_a(), Value::Heap(ptr));
                Ok(StepOutcome::Continue)
            }
            GetField => {
                let obj = heap_ptr_of(self.reg(instr.arg_b()))?;
                let v = host.get_field(obj, instr.arg_c() as u32)?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            SetField => {
                let obj = heap_ptr_of(self.reg(instr.arg_a()))?;
                let v = self.reg(instr.arg_c());
                host.set_field(obj, instr.arg_b() as u32, v)?;
                host.write_barrier(obj, v);
                Ok(StepOutcome::Continue)
            }
            NewArray => {
                // The element type is established by the declared static
                // type of the destination register, not an operand here;
                // the VM allocates an untyped backing store and leaves
                // element type-checking to the compiler/verifier.
                let ptr = host.alloc_array(TypeId(0), instr.arg_bx() as u32)?;
                self.set_reg(instr.arg_a(), Value::Heap(ptr));
                Ok(StepOutcome::Continue)
            }
            GetIndex => {
                let array = heap_ptr_of(self.reg(instr.arg_b()))?;
                let index = as_int(self.reg(instr.arg_c()))?;
                let v = host.get_index(array, index)?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            SetIndex => {
                let array = heap_ptr_of(self.reg(instr.arg_a()))?;
                let index = as_int(self.reg(instr.arg_b()))?;
                let v = self.reg(instr.arg_c());
                host.set_index(array, index, v)?;
                host.write_barrier(array, v);
                Ok(StepOutcome::Continue)
            }
            Jmp => {
                let target = (self.frames.last().unwrap().ip as i64 + 1 + instr.arg_jump() as i64) as usize;
                Ok(StepOutcome::Jump(target))
            }
            JmpT | JmpF => {
                // AsBx encoding: `a` is the condition register, `sbx` the
                // displacement (a narrower range than JMP's 24-bit disp, but
                // conditional branches don't need JMP's full span).
                let cond = as_bool(self.reg(instr.arg_a()))?;
                let taken = if op == JmpT { cond } else { !cond };
                if taken {
                    let target =
                        (self.frames.last().unwrap().ip as i64 + 1 + instr.arg_sbx() as i64) as usize;
                    Ok(StepOutcome::Jump(target))
                } else {
                    Ok(StepOutcome::Continue)
                }
            }
            Call => self.call(module, instr),
            NativeCall => {
                let a = instr.arg_a();
                let native_idx = instr.arg_bx() as u32;
                let arity = module
                    .native_bindings
                    .get(native_idx as usize)
                    .map(|n| n.arity)
                    .unwrap_or(0);
                let base = self.frames.last().unwrap().register_base;
                let args: SmallVec<[Value; 4]> = (0..arity as usize)
                    .map(|i| self.registers[base + a as usize + 1 + i])
                    .collect();
                let result = host.call_native(native_idx, &args)?;
                self.set_reg(a, result);
                Ok(StepOutcome::Continue)
            }
            Ret => {
                let v = self.reg(instr.arg_a());
                Ok(StepOutcome::Return(v))
            }
            RetVoid => Ok(StepOutcome::Return(Value::Uninitialized)),
            GetPropset => {
                let owner = self.reg(instr.arg_b());
                let propset_type = TypeId(instr.arg_c() as u32);
                let v = host.get_propset(owner, propset_type)?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            GetPropsetField => {
                let propset = self.reg(instr.arg_b());
                let v = host.get_propset_field(propset, instr.arg_c() as u32)?;
                self.set_reg(instr.arg_a(), v);
                Ok(StepOutcome::Continue)
            }
            SetPropsetField => {
                let propset = self.reg(instr.arg_a());
                let v = self.reg(instr.arg_c());
                host.set_propset_field(propset, instr.arg_b() as u32, v)?;
                if let Value::Heap(dst) = propset {
                    host.write_barrier(dst, v);
                }
                Ok(StepOutcome::Continue)
            }
        }
    }

    fn arith(&mut self, op: Opcode, instr: Instruction) -> Result<StepOutcome, VmError> {
        let lhs = self.reg(instr.arg_b());
        let rhs = self.reg(instr.arg_c());
        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Opcode::Add => Value::Int(a.wrapping_add(b)),
                Opcode::Sub => Value::Int(a.wrapping_sub(b)),
                Opcode::Mul => Value::Int(a.wrapping_mul(b)),
                Opcode::Div => {
                    if b == 0 {
                        return Err(VmError::division_by_zero());
                    }
                    Value::Int(a.wrapping_div(b))
                }
                Opcode::Mod => {
                    if b == 0 {
                        return Err(VmError::division_by_zero());
                    }
                    Value::Int(a.wrapping_rem(b))
                }
                _ => unreachable!(),
            },
            (Value::Float(a), Value::Float(b)) => match op {
                Opcode::Add => Value::Float(a + b),
                Opcode::Sub => Value::Float(a - b),
                Opcode::Mul => Value::Float(a * b),
                Opcode::Div => Value::Float(a / b),
                Opcode::Mod => Value::Float(a % b),
                _ => unreachable!(),
            },
            _ => return Err(VmError::type_mismatch("arithmetic operand is not numeric")),
        };
        self.set_reg(instr.arg_a(), result);
        Ok(StepOutcome::Continue)
    }

    fn compare(&mut self, op: Opcode, instr: Instruction) -> Result<StepOutcome, VmError> {
        let lhs = self.reg(instr.arg_b());
        let rhs = self.reg(instr.arg_c());
        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Opcode::IsEq => a == b,
                Opcode::IsLt => a < b,
                Opcode::IsLe => a <= b,
                _ => unreachable!(),
            },
            (Value::Float(a), Value::Float(b)) => match op {
                Opcode::IsEq => a == b,
                Opcode::IsLt => a < b,
                Opcode::IsLe => a <= b,
                _ => unreachable!(),
            },
            (Value::Bool(a), Value::Bool(b)) if op == Opcode::IsEq => a == b,
            _ => return Err(VmError::type_mismatch("comparison operand type mismatch")),
        };
        self.set_reg(instr.arg_a(), Value::Bool(result));
        Ok(StepOutcome::Continue)
    }

    fn bitwise(&mut self, op: Opcode, instr: Instruction) -> Result<StepOutcome, VmError> {
        let lhs = as_int(self.reg(instr.arg_b()))?;
        let rhs = as_int(self.reg(instr.arg_c()))?;
        let result = match op {
            Opcode::And => lhs & rhs,
            Opcode::Or => lhs | rhs,
            Opcode::Xor => lhs ^ rhs,
            Opcode::Shl => lhs.wrapping_shl(rhs as u32),
            Opcode::Shr => lhs.wrapping_shr(rhs as u32),
            Opcode::Usr => ((lhs as u32).wrapping_shr(rhs as u32)) as i32,
            _ => unreachable!(),
        };
        self.set_reg(instr.arg_a(), Value::Int(result));
        Ok(StepOutcome::Continue)
    }

    fn load_constant(
        &mut self,
        host: &mut dyn VmHost,
        module: &mut BytecodeModule,
        idx: u32,
    ) -> Result<Value, VmError> {
        let constant = *module
            .constants
            .get(idx as usize)
            .ok_or_else(|| VmError::bounds(format!("constant index {idx} out of range")))?;
        Ok(match constant {
            Constant::Int(i) => Value::Int(i),
            Constant::Float(f) => Value::Float(f),
            Constant::Bool(b) => Value::Bool(b),
            Constant::String(sid) => {
                if let Some(&ptr) = self.string_constant_cache.get(&idx) {
                    Value::Heap(ptr)
                } else {
                    let text = module.lookup_string(sid).unwrap_or("");
                    let ptr = host.alloc_string(text)?;
                    self.string_constant_cache.insert(idx, ptr);
                    Value::Heap(ptr)
                }
            }
        })
    }

    fn make_closure(
        &mut self,
        _host: &mut dyn VmHost,
        module: &mut BytecodeModule,
        instr: Instruction,
    ) -> Result<StepOutcome, VmError> {
        let callee_idx = instr.arg_bx() as u32;
        let callee = module
            .functions
            .get(callee_idx as usize)
            .ok_or_else(|| VmError::bounds("closure target function index out of range"))?;

        let mut upvalues: Vec<UpvalueCell> = Vec::with_capacity(callee.upvalue_count as usize);
        let func_idx = self.frames.last().unwrap().function_index;
        let caller_func = &module.functions[func_idx as usize];
        let caller_upvalues = self.frames.last().unwrap().upvalues.clone();

        for d in 0..callee.upvalue_count {
            self.frames.last_mut().unwrap().ip += 1;
            let ip = self.frames.last().unwrap().ip;
            let desc_word = caller_func
                .instructions
                .get(ip)
                .copied()
                .map(|w| w.0 as u8)
                .unwrap_or(0);
            let desc = UpvalueDescriptor::unpack(desc_word);
            let cell = if desc.is_local {
                Rc::new(RefCell::new(crate::core::value::TaggedValue::new(
                    TypeId(0),
                    self.reg(desc.index),
                )))
            } else {
                caller_upvalues
                    .get(desc.index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::bounds("closure captures non-local upvalue out of range"))?
            };
            upvalues.push(cell);
            let _ = d;
        }

        let handle = self.closures.insert(ClosureObject {
            function_index: callee_idx,
            upvalues,
        });
        self.set_reg(
            instr.arg_a(),
            Value::Typed(crate::core::value::TypedHandle {
                generation: handle.generation,
                kind: crate::vm::frame::TYPE_CLOSURE,
                id: handle.index,
            }),
        );
        Ok(StepOutcome::Continue)
    }

    fn call(&mut self, module: &mut BytecodeModule, instr: Instruction) -> Result<StepOutcome, VmError> {
        let a = instr.arg_a();
        let n_args = instr.arg_b();
        let n_returns = instr.arg_c();
        let callee_value = self.reg(a);

        let (function_index, upvalues) = match callee_value {
            Value::Typed(th) if th.kind == crate::vm::frame::TYPE_CLOSURE => {
                let raw = crate::core::handle::RawHandle {
                    generation: th.generation,
                    index: th.id,
                };
                let closure = self
                    .closures
                    .get(raw)
                    .ok_or_else(|| VmError::type_mismatch("stale closure handle"))?;
                (closure.function_index, closure.upvalues.clone())
            }
            _ => return Err(VmError::type_mismatch("CALL target is not callable")),
        };

        let callee = module
            .functions
            .get(function_index as usize)
            .ok_or_else(|| VmError::bounds("call target function index out of range"))?;

        if n_args != callee.param_count {
            return Err(VmError::type_mismatch(format!(
                "CALL passed {n_args} argument(s), {} expects {}",
                callee.name, callee.param_count
            )));
        }

        let caller_base = self.frames.last().unwrap().register_base;
        let new_base = self.registers.len();
        self.registers
            .resize(new_base + callee.register_count as usize, Value::Uninitialized);
        for i in 0..n_args as usize {
            self.registers[new_base + i] = self.registers[caller_base + a as usize + 1 + i];
        }

        self.frames.push(Frame::new(
            function_index,
            callee.name.clone(),
            new_base,
            caller_base + a as usize,
            n_returns,
            upvalues,
        ));
        Ok(StepOutcome::Continue)
    }
}

enum StepOutcome {
    Continue,
    Jump(usize),
    Return(Value),
}

fn heap_ptr_of(v: Value) -> Result<HeapPtr, VmError> {
    v.heap_ptr()
        .ok_or_else(|| VmError::type_mismatch("expected a heap-resident value"))
}

fn as_int(v: Value) -> Result<i32, VmError> {
    match v {
        Value::Int(i) => Ok(i),
        _ => Err(VmError::type_mismatch("expected an int")),
    }
}

fn as_bool(v: Value) -> Result<bool, VmError> {
    match v {
        Value::Bool(b) => Ok(b),
        _ => Err(VmError::type_mismatch("expected a bool")),
    }
}

fn negate(v: Value) -> Result<Value, VmError> {
    match v {
        Value::Int(i) => Ok(Value::Int(-i)),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(VmError::type_mismatch("NEG operand is not numeric")),
    }
}
