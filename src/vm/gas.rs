//! Per-opcode gas costs.
//!
//! Default cost is 1; calls and allocations cost more. The exact
//! per-opcode table (`CALL`/`NATIVECALL` = 10, `NEWSTRUCT`/`NEWARRAY` = 5)
//! is chosen to be proportionate to the relative cost of a call/allocation
//! versus an arithmetic step.

use crate::bytecode::instruction::Opcode;

pub fn gas_cost(op: Opcode) -> u64 {
    match op {
        Opcode::Call | Opcode::NativeCall => 10,
        Opcode::NewStruct | Opcode::NewArray => 5,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_cost_more_than_arithmetic() {
        assert!(gas_cost(Opcode::Call) > gas_cost(Opcode::Add));
        assert!(gas_cost(Opcode::NewStruct) > gas_cost(Opcode::Move));
    }
}
