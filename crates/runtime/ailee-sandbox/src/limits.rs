use serde::{Deserialize, Serialize};

/// Host capabilities a guest may be granted. Everything defaults to off
/// except `crypto`; the host ABI only materializes imports for granted
/// capabilities, so a guest asking for more fails instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub filesystem: bool,
    pub network: bool,
    pub system: bool,
    pub threads: bool,
    pub crypto: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            filesystem: false,
            network: false,
            system: false,
            threads: false,
            crypto: true,
        }
    }
}

/// Hard ceilings enforced on every call. Exceeding any of them terminates
/// the execution with the matching overflow flag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_bytes: u64,
    pub stack_bytes: u64,
    pub timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub capabilities: Capabilities,
    pub max_instructions: u64,
    pub max_function_calls: u64,
    pub max_table_size: u32,
    pub max_memory_pages: u64,
    pub enable_gas_metering: bool,
    pub gas_limit: u64,
    pub gas_price_per_instruction: f64,
}

impl SandboxLimits {
    /// Effective linear-memory ceiling: the byte limit or the page limit,
    /// whichever is lower.
    pub fn effective_memory_bytes(&self) -> u64 {
        self.memory_bytes.min(self.max_memory_pages * 64 * 1024)
    }

    /// Fuel budget for one call: the gas ceiling or the instruction
    /// ceiling, whichever binds first. Fuel is charged per instruction.
    pub fn fuel_budget(&self) -> u64 {
        self.gas_limit.min(self.max_instructions)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            stack_bytes: 1024 * 1024,
            timeout_ms: 30_000,
            startup_timeout_ms: 5_000,
            capabilities: Capabilities::default(),
            max_instructions: 10_000_000_000,
            max_function_calls: 1_000_000,
            max_table_size: 10_000,
            max_memory_pages: 8_192,
            enable_gas_metering: true,
            gas_limit: 1_000_000_000,
            gas_price_per_instruction: 0.001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(limits.max_memory_pages, 8_192);
        assert_eq!(limits.timeout_ms, 30_000);
        assert_eq!(limits.gas_limit, 1_000_000_000);
        assert!(limits.capabilities.crypto);
        assert!(!limits.capabilities.network);
    }

    #[test]
    fn effective_memory_takes_the_lower_ceiling() {
        let mut limits = SandboxLimits::default();
        limits.max_memory_pages = 2; // 128 KiB
        assert_eq!(limits.effective_memory_bytes(), 128 * 1024);
        limits.max_memory_pages = 8_192;
        limits.memory_bytes = 1024;
        assert_eq!(limits.effective_memory_bytes(), 1024);
    }

    #[test]
    fn fuel_budget_is_min_of_gas_and_instructions() {
        let mut limits = SandboxLimits::default();
        limits.gas_limit = 100;
        limits.max_instructions = 1_000;
        assert_eq!(limits.fuel_budget(), 100);
        limits.max_instructions = 50;
        assert_eq!(limits.fuel_budget(), 50);
    }
}
