//! Bytecode verifier: a one-shot static check run on module load.
//!
//! All verification failures are fatal to module loading. Error message
//! substrings below are part of the contract: `tests/smalls_bytecode_verifier.cpp`
//! greps for them, so wording here is pinned exactly.

use crate::bytecode::instruction::{Opcode, UpvalueDescriptor};
use crate::bytecode::module::BytecodeModule;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    RegisterOutOfRange { function: String, index: usize },
    ConstantIndexOutOfRange { function: String, index: usize },
    JumpTargetOutOfRange { function: String, index: usize },
    GlobalSlotOutOfRange { function: String, index: usize },
    ClosureLocalUpvalueRegOutOfRange { function: String, index: usize },
    CapturesNonLocalUpvalue { function: String, index: usize },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::RegisterOutOfRange { function, index } => {
                write!(f, "{function}[{index}]: register out of range")
            }
            VerifyError::ConstantIndexOutOfRange { function, index } => {
                write!(f, "{function}[{index}]: constant index out of range")
            }
            VerifyError::JumpTargetOutOfRange { function, index } => {
                write!(f, "{function}[{index}]: jump target out of range")
            }
            VerifyError::GlobalSlotOutOfRange { function, index } => {
                write!(f, "{function}[{index}]: global slot out of range")
            }
            VerifyError::ClosureLocalUpvalueRegOutOfRange { function, index } => {
                write!(
                    f,
                    "{function}[{index}]: closure local upvalue reg out of range"
                )
            }
            VerifyError::CapturesNonLocalUpvalue { function, index } => {
                write!(f, "{function}[{index}]: captures non-local upvalue")
            }
        }
    }
}

impl std::error::Error for VerifyError {}

/// Checks every instruction's operands against its function's register
/// count, the module's constant/global pools, and jump targets against the
/// instruction array length. Closure descriptor words (which follow a
/// `CLOSURE` instruction and are never themselves decoded as opcodes) are
/// checked against the *callee* function's `upvalue_count` (for local
/// captures, the *caller*'s register count).
pub fn verify_bytecode_module(module: &BytecodeModule) -> Result<(), VerifyError> {
    for func in &module.functions {
        let mut i = 0usize;
        while i < func.instructions.len() {
            let instr = func.instructions[i];
            let Some(op) = instr.opcode() else {
                i += 1;
                continue;
            };

            match op {
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::IsEq
                | Opcode::IsLt
                | Opcode::IsLe
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Usr
                | Opcode::GetField
                | Opcode::SetField
                | Opcode::GetIndex
                | Opcode::SetIndex
                | Opcode::Call
                | Opcode::GetPropsetField
                | Opcode::SetPropsetField => {
                    check_register(func, instr.arg_a(), i)?;
                    check_register(func, instr.arg_b(), i)?;
                    check_register(func, instr.arg_c(), i)?;
                }
                Opcode::GetPropset => {
                    check_register(func, instr.arg_a(), i)?;
                    check_register(func, instr.arg_b(), i)?;
                }
                Opcode::Neg
                | Opcode::Not
                | Opcode::Move
                | Opcode::GetUpval
                | Opcode::SetUpval
                | Opcode::NewStruct
                | Opcode::LoadI
                | Opcode::LoadNil
                | Opcode::RetVoid
                | Opcode::Ret => {
                    check_register(func, instr.arg_a(), i)?;
                }
                Opcode::LoadK => {
                    check_register(func, instr.arg_a(), i)?;
                    if instr.arg_bx() as usize >= module.constants.len() {
                        return Err(VerifyError::ConstantIndexOutOfRange {
                            function: func.name.clone(),
                            index: i,
                        });
                    }
                }
                Opcode::GetGlobal | Opcode::SetGlobal => {
                    check_register(func, instr.arg_a(), i)?;
                    if instr.arg_bx() as u32 >= module.global_count {
                        return Err(VerifyError::GlobalSlotOutOfRange {
                            function: func.name.clone(),
                            index: i,
                        });
                    }
                }
                Opcode::NewArray => {
                    check_register(func, instr.arg_a(), i)?;
                }
                Opcode::Jmp => {
                    let target = i as i64 + 1 + instr.arg_jump() as i64;
                    if target < 0 || target as usize > func.instructions.len() {
                        return Err(VerifyError::JumpTargetOutOfRange {
                            function: func.name.clone(),
                            index: i,
                        });
                    }
                }
                Opcode::JmpT | Opcode::JmpF => {
                    // AsBx encoding: `a` is the condition register, `sbx` the
                    // displacement. See vm::engine's JmpT/JmpF handling.
                    check_register(func, instr.arg_a(), i)?;
                    let target = i as i64 + 1 + instr.arg_sbx() as i64;
                    if target < 0 || target as usize > func.instructions.len() {
                        return Err(VerifyError::JumpTargetOutOfRange {
                            function: func.name.clone(),
                            index: i,
                        });
                    }
                }
                Opcode::NativeCall => {
                    check_register(func, instr.arg_a(), i)?;
                }
                Opcode::Closure => {
                    check_register(func, instr.arg_a(), i)?;
                    let callee_idx = instr.arg_bx() as usize;
                    let n_upvalues = module
                        .functions
                        .get(callee_idx)
                        .map(|f| f.upvalue_count)
                        .unwrap_or(0);
                    for d in 0..n_upvalues {
                        i += 1;
                        let desc_word = func
                            .instructions
                            .get(i)
                            .copied()
                            .map(|w| w.0 as u8)
                            .unwrap_or(0);
                        let desc = UpvalueDescriptor::unpack(desc_word);
                        if desc.is_local {
                            if desc.index >= func.register_count {
                                return Err(VerifyError::ClosureLocalUpvalueRegOutOfRange {
                                    function: func.name.clone(),
                                    index: i,
                                });
                            }
                        } else if desc.index >= func.upvalue_count {
                            return Err(VerifyError::CapturesNonLocalUpvalue {
                                function: func.name.clone(),
                                index: i,
                            });
                        }
                        let _ = d;
                    }
                }
            }
            i += 1;
        }
    }
    Ok(())
}

fn check_register(
    func: &crate::bytecode::module::CompiledFunction,
    reg: u8,
    index: usize,
) -> Result<(), VerifyError> {
    if reg >= func.register_count {
        Err(VerifyError::RegisterOutOfRange {
            function: func.name.clone(),
            index,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::Instruction;
    use crate::bytecode::module::CompiledFunction;

    #[test]
    fn accepts_valid_module() {
        let mut module = BytecodeModule::new("m");
        let mut f = CompiledFunction::new("main");
        f.register_count = 1;
        f.instructions.push(Instruction::make_asbx(Opcode::LoadI, 0, 42));
        f.instructions.push(Instruction::make_abc(Opcode::Ret, 0, 0, 0));
        module.add_function(f);

        assert!(verify_bytecode_module(&module).is_ok());
    }

    #[test]
    fn rejects_register_out_of_range() {
        let mut module = BytecodeModule::new("m");
        let mut f = CompiledFunction::new("f");
        f.register_count = 1;
        f.instructions.push(Instruction::make_abc(Opcode::Add, 1, 0, 0));
        f.instructions.push(Instruction::make_abc(Opcode::Ret, 0, 0, 0));
        module.add_function(f);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.to_string().contains("register out of range"));
    }

    #[test]
    fn rejects_constant_index_out_of_range() {
        let mut module = BytecodeModule::new("m");
        let mut f = CompiledFunction::new("f");
        f.register_count = 1;
        f.instructions.push(Instruction::make_abx(Opcode::LoadK, 0, 1234));
        f.instructions.push(Instruction::make_abc(Opcode::Ret, 0, 0, 0));
        module.add_function(f);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.to_string().contains("constant index out of range"));
    }

    #[test]
    fn rejects_jump_target_out_of_range() {
        let mut module = BytecodeModule::new("m");
        let mut f = CompiledFunction::new("f");
        f.register_count = 1;
        f.instructions.push(Instruction::make_jump(Opcode::Jmp, 1000));
        module.add_function(f);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.to_string().contains("target out of range"));
    }

    #[test]
    fn rejects_global_slot_out_of_range() {
        let mut module = BytecodeModule::new("m");
        module.global_count = 1;
        module.globals.resize(1, crate::core::value::Value::Uninitialized);
        let mut f = CompiledFunction::new("f");
        f.register_count = 1;
        f.instructions.push(Instruction::make_abx(Opcode::GetGlobal, 0, 7));
        f.instructions.push(Instruction::make_abc(Opcode::Ret, 0, 0, 0));
        module.add_function(f);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.to_string().contains("global slot out of range"));
    }

    #[test]
    fn rejects_closure_descriptor_reg_out_of_range() {
        let mut module = BytecodeModule::new("m");
        let mut callee = CompiledFunction::new("$lambda");
        callee.register_count = 1;
        callee.upvalue_count = 1;
        module.add_function(callee);

        let mut outer = CompiledFunction::new("outer");
        outer.register_count = 1;
        outer.instructions.push(Instruction::make_abx(Opcode::Closure, 0, 0));
        let desc = UpvalueDescriptor {
            is_local: true,
            index: 3,
        };
        outer.instructions.push(Instruction(desc.pack() as u32));
        outer.instructions.push(Instruction::make_abc(Opcode::RetVoid, 0, 0, 0));
        module.add_function(outer);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err
            .to_string()
            .contains("closure local upvalue reg out of range"));
    }

    #[test]
    fn rejects_closure_capturing_nonlocal_upvalue_without_upvalues() {
        let mut module = BytecodeModule::new("m");
        let mut callee = CompiledFunction::new("$lambda");
        callee.register_count = 1;
        callee.upvalue_count = 1;
        module.add_function(callee);

        let mut outer = CompiledFunction::new("outer");
        outer.register_count = 1;
        outer.upvalue_count = 0;
        outer.instructions.push(Instruction::make_abx(Opcode::Closure, 0, 0));
        let desc = UpvalueDescriptor {
            is_local: false,
            index: 0,
        };
        outer.instructions.push(Instruction(desc.pack() as u32));
        outer.instructions.push(Instruction::make_abc(Opcode::RetVoid, 0, 0, 0));
        module.add_function(outer);

        let err = verify_bytecode_module(&module).unwrap_err();
        assert!(err.to_string().contains("captures non-local upvalue"));
    }
}
