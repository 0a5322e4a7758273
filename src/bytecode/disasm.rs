//! Human-readable bytecode listings, used for diagnostics.
//!
//! Reference: `tests/smalls_bytecode.cpp::Disassemble` pins the exact
//! substrings a listing must contain (`"Module: test_mod"`,
//! `"Function: test_func"`, `"r1, 10"`, `"r2, r0, r1"`).

use crate::bytecode::instruction::Opcode;
use crate::bytecode::module::BytecodeModule;
use std::fmt::Write;

/// Renders the operand portion of one instruction line, e.g. `"r1, 10"` for
/// an `AsBx` load or `"r2, r0, r1"` for an `ABC` arithmetic op.
fn render_operands(op: Opcode, instr: crate::bytecode::instruction::Instruction) -> String {
    use Opcode::*;
    match op {
        Add | Sub | Mul | Div | Mod | IsEq | IsLt | IsLe | And | Or | Xor | Shl | Shr | Usr
        | GetField | SetField | GetIndex | SetIndex | GetPropsetField | SetPropsetField => {
            format!("r{}, r{}, r{}", instr.arg_a(), instr.arg_b(), instr.arg_c())
        }
        Neg | Not | Move | GetUpval | SetUpval => {
            format!("r{}, r{}", instr.arg_a(), instr.arg_b())
        }
        LoadI => format!("r{}, {}", instr.arg_a(), instr.arg_sbx()),
        LoadK | GetGlobal | SetGlobal | Closure | NewArray | NewStruct => {
            format!("r{}, {}", instr.arg_a(), instr.arg_bx())
        }
        GetPropset => format!("r{}, r{}, {}", instr.arg_a(), instr.arg_b(), instr.arg_c()),
        LoadNil | RetVoid => format!("r{}", instr.arg_a()),
        Jmp | JmpT | JmpF => format!("{}", instr.arg_jump()),
        Call => format!("r{}, {}, {}", instr.arg_a(), instr.arg_b(), instr.arg_c()),
        NativeCall => format!("r{}, {}, {}", instr.arg_a(), instr.arg_bx(), 0),
        Ret => format!("r{}", instr.arg_a()),
    }
}

/// Produces a human-readable listing of every function in `module`.
pub fn disassemble(module: &BytecodeModule) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Module: {}", module.name);

    for func in &module.functions {
        let _ = writeln!(out, "Function: {}", func.name);
        for (idx, instr) in func.instructions.iter().enumerate() {
            let Some(op) = instr.opcode() else {
                let _ = writeln!(out, "  {idx:>4}: <descriptor {:02x}>", instr.0 & 0xFF);
                continue;
            };
            let operands = render_operands(op, *instr);
            let _ = writeln!(out, "  {idx:>4}: {} {}", op.mnemonic(), operands);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::{Instruction, Opcode};
    use crate::bytecode::module::CompiledFunction;

    #[test]
    fn disassembly_contains_expected_substrings() {
        let mut module = BytecodeModule::new("test_mod");
        module.add_string("hello");

        let mut func = CompiledFunction::new("test_func");
        func.param_count = 1;
        func.register_count = 3;
        func.instructions.push(Instruction::make_asbx(Opcode::LoadI, 1, 10));
        func.instructions.push(Instruction::make_abc(Opcode::Add, 2, 0, 1));
        func.instructions.push(Instruction::make_abc(Opcode::Ret, 2, 0, 0));
        module.add_function(func);

        let disasm = disassemble(&module);
        assert!(disasm.contains("Module: test_mod"));
        assert!(disasm.contains("Function: test_func"));
        assert!(disasm.contains("LOADI"));
        assert!(disasm.contains("ADD"));
        assert!(disasm.contains("RET"));
        assert!(disasm.contains("r1, 10"));
        assert!(disasm.contains("r2, r0, r1"));
    }
}
