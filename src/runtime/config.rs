//! Runtime-wide configuration.

use crate::core::gc::GCConfig;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub gc: GCConfig,
    /// Instruction budget handed to `execute_script` callers that don't
    /// pick their own.
    pub default_gas_limit: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc: GCConfig::default(),
            default_gas_limit: 100_000,
        }
    }
}
