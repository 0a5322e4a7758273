//! VM-level error model.
//!
//! Hand-rolled enum + `Display` rather than pulling in `thiserror` for a
//! crate this small.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeMismatch,
    Bounds,
    DanglingPropsetReference,
    AllocationFailure,
    GasExhausted,
    DivisionByZero,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::Bounds => "bounds",
            ErrorKind::DanglingPropsetReference => "dangling propset reference",
            ErrorKind::AllocationFailure => "allocation failure",
            ErrorKind::GasExhausted => "gas exhausted",
            ErrorKind::DivisionByZero => "division by zero",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: ErrorKind,
    pub message: String,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn gas_exhausted() -> Self {
        Self::new(ErrorKind::GasExhausted, "gas exhausted")
    }

    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }

    pub fn bounds(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bounds, msg)
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, msg)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VmError {}

/// One `(function_name, source_line)` entry in an unwound stack trace.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub source_line: u32,
}

/// Result of a complete `execute_script` call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub ok: bool,
    pub value: crate::core::value::Value,
    pub error_kind: Option<ErrorKind>,
    pub error_message: String,
    pub stack_trace: String,
    pub gas_used: u64,
}

impl ExecutionResult {
    pub fn success(value: crate::core::value::Value, gas_used: u64) -> Self {
        Self {
            ok: true,
            value,
            error_kind: None,
            error_message: String::new(),
            stack_trace: String::new(),
            gas_used,
        }
    }

    pub fn failure(err: VmError, trace: &[StackFrame], gas_used: u64) -> Self {
        let stack_trace = trace
            .iter()
            .map(|f| format!("  at {} (line {})", f.function_name, f.source_line))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            ok: false,
            value: crate::core::value::Value::Uninitialized,
            error_kind: Some(err.kind),
            error_message: err.message,
            stack_trace,
            gas_used,
        }
    }
}
