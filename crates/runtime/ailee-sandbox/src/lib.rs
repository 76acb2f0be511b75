//! Sandboxed WebAssembly execution for the AILEE mesh.
//!
//! The sandbox is the determinism anchor of the whole proof system: a
//! guest sees nothing but the closed host ABI (input transfer, output
//! transfer, logging, a clock frozen at instantiation, and capability-
//! gated SHA-256), runs under fuel metering and epoch-based wall-clock
//! deadlines, and cannot grow memory or tables past the configured
//! ceilings. Identical (module, input) pairs therefore produce identical
//! outputs, which is what the execution hash attests.

mod call;
mod host;
mod limits;
mod sandbox;

pub use call::{
    execution_hash, sha256_hex, ExecutionMetrics, OverflowFlags, TraceStep, WasmCall, WasmResult,
};
pub use host::HOST_MODULE;
pub use limits::{Capabilities, SandboxLimits};
pub use sandbox::{
    SandboxError, SandboxStatsSnapshot, WasmSandbox, DEFAULT_ENTRYPOINT, RUNTIME_VERSION,
};

use anyhow::Result;
use std::sync::Arc;

/// Closed set of execution backends a factory can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmRuntimeKind {
    Wasmtime,
}

/// Capability interface the rest of the mesh programs against; concrete
/// runtimes plug in behind it.
pub trait ExecutionBackend: Send + Sync {
    fn load_module(&self, bytes: &[u8], expected_hash: &str) -> Result<(), SandboxError>;
    fn unload_module(&self, module_hash: &str) -> bool;
    fn execute(&self, call: &WasmCall) -> WasmResult;
    fn execute_with_trace(&self, call: &WasmCall) -> WasmResult;
    fn verify_determinism(&self, module_hash: &str, input: &[u8], iterations: u32) -> bool;
    fn statistics(&self) -> SandboxStatsSnapshot;
}

impl ExecutionBackend for WasmSandbox {
    fn load_module(&self, bytes: &[u8], expected_hash: &str) -> Result<(), SandboxError> {
        WasmSandbox::load_module(self, bytes, expected_hash)
    }

    fn unload_module(&self, module_hash: &str) -> bool {
        WasmSandbox::unload_module(self, module_hash)
    }

    fn execute(&self, call: &WasmCall) -> WasmResult {
        WasmSandbox::execute(self, call)
    }

    fn execute_with_trace(&self, call: &WasmCall) -> WasmResult {
        WasmSandbox::execute_with_trace(self, call)
    }

    fn verify_determinism(&self, module_hash: &str, input: &[u8], iterations: u32) -> bool {
        WasmSandbox::verify_determinism(self, module_hash, input, iterations)
    }

    fn statistics(&self) -> SandboxStatsSnapshot {
        WasmSandbox::statistics(self)
    }
}

/// Build a backend for the given runtime kind.
pub fn create_backend(
    kind: WasmRuntimeKind,
    limits: SandboxLimits,
) -> Result<Arc<dyn ExecutionBackend>> {
    match kind {
        WasmRuntimeKind::Wasmtime => Ok(Arc::new(WasmSandbox::new(limits)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailee_types::ErrorCode;

    const ECHO_WAT: &str = r#"
        (module
          (import "ailee" "input_read" (func $input_read (param i32) (result i32)))
          (import "ailee" "output_write" (func $output_write (param i32 i32)))
          (memory (export "memory") 1)
          (func (export "run")
            (local $len i32)
            (local.set $len (call $input_read (i32.const 0)))
            (call $output_write (i32.const 0) (local.get $len))))
    "#;

    const SPIN_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "run")
            (loop $l (br $l))))
    "#;

    fn load(sandbox: &WasmSandbox, wat: &str) -> String {
        let bytes = wat::parse_str(wat).unwrap();
        let hash = sha256_hex(&bytes);
        sandbox.load_module(&bytes, &hash).unwrap();
        hash
    }

    #[test]
    fn load_rejects_wrong_hash() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let bytes = wat::parse_str(ECHO_WAT).unwrap();
        let err = sandbox.load_module(&bytes, "not-the-hash").unwrap_err();
        assert!(matches!(err, SandboxError::ModuleHashMismatch { .. }));
        assert!(!sandbox.is_loaded(&sha256_hex(&bytes)));
    }

    #[test]
    fn echo_roundtrip_populates_result() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let hash = load(&sandbox, ECHO_WAT);
        let call = WasmCall::new(&hash, "run", b"hello mesh".to_vec());
        let result = sandbox.execute(&call);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output_bytes, b"hello mesh");
        assert_eq!(result.output_hash, sha256_hex(b"hello mesh"));
        assert_eq!(
            result.execution_hash,
            execution_hash(&hash, &call.input_hash, &result.output_hash)
        );
        assert_eq!(result.error_code, ErrorCode::Success);
        assert_eq!(result.metrics.host_call_count, 2);
        assert_eq!(result.metrics.runtime_version, RUNTIME_VERSION);
        assert!(result.metrics.instructions_executed > 0);
    }

    #[test]
    fn input_hash_mismatch_fails_before_execution() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let hash = load(&sandbox, ECHO_WAT);
        let mut call = WasmCall::new(&hash, "run", b"payload".to_vec());
        call.input_hash = "deadbeef".to_string();
        let result = sandbox.execute(&call);
        assert!(!result.success);
        assert_eq!(result.error_code, ErrorCode::InvalidInput);
    }

    #[test]
    fn missing_module_and_missing_function() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let call = WasmCall::new("unknown", "run", vec![]);
        assert_eq!(
            sandbox.execute(&call).error_code,
            ErrorCode::ModuleLoadFailed
        );

        let hash = load(&sandbox, ECHO_WAT);
        let call = WasmCall::new(&hash, "no_such_export", vec![]);
        assert_eq!(
            sandbox.execute(&call).error_code,
            ErrorCode::FunctionNotFound
        );
        // Failures do not evict the cached module.
        assert!(sandbox.is_loaded(&hash));
    }

    #[test]
    fn denied_import_is_a_security_violation() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "run")))
        "#;
        let hash = load(&sandbox, wat);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", vec![]));
        assert!(!result.success);
        assert_eq!(result.error_code, ErrorCode::SecurityViolation);
    }

    #[test]
    fn crypto_capability_gates_sha256_import() {
        let mut limits = SandboxLimits::default();
        limits.capabilities.crypto = false;
        let sandbox = WasmSandbox::new(limits).unwrap();
        let wat = r#"
            (module
              (import "ailee" "sha256" (func $sha (param i32 i32 i32)))
              (memory (export "memory") 1)
              (func (export "run")))
        "#;
        let hash = load(&sandbox, wat);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", vec![]));
        assert_eq!(result.error_code, ErrorCode::SecurityViolation);
    }

    #[test]
    fn gas_exhaustion_sets_overflow_flag() {
        let mut limits = SandboxLimits::default();
        limits.gas_limit = 10_000;
        let sandbox = WasmSandbox::new(limits).unwrap();
        let hash = load(&sandbox, SPIN_WAT);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", vec![]));
        assert!(!result.success);
        assert_eq!(result.error_code, ErrorCode::GasLimitExceeded);
        assert!(result.metrics.overflow.gas);
        assert!(!result.metrics.overflow.timeout);
    }

    #[test]
    fn wall_clock_timeout_interrupts_execution() {
        let mut limits = SandboxLimits::default();
        limits.enable_gas_metering = false;
        limits.timeout_ms = 100;
        let sandbox = WasmSandbox::new(limits).unwrap();
        let hash = load(&sandbox, SPIN_WAT);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", vec![]));
        assert!(!result.success);
        assert_eq!(result.error_code, ErrorCode::ExecutionTimeout);
        assert!(result.metrics.overflow.timeout);
        // The instance survives for the next call.
        assert!(sandbox.is_loaded(&hash));
    }

    #[test]
    fn memory_growth_past_limit_is_denied() {
        let mut limits = SandboxLimits::default();
        limits.memory_bytes = 2 * 64 * 1024; // two pages
        let sandbox = WasmSandbox::new(limits).unwrap();
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (func (export "run")
                (if (i32.eq (memory.grow (i32.const 100)) (i32.const -1))
                  (then unreachable))))
        "#;
        let hash = load(&sandbox, wat);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", vec![]));
        assert!(!result.success);
        assert_eq!(result.error_code, ErrorCode::MemoryLimitExceeded);
        assert!(result.metrics.overflow.memory);
    }

    #[test]
    fn host_call_budget_is_enforced() {
        let mut limits = SandboxLimits::default();
        limits.max_function_calls = 1;
        let sandbox = WasmSandbox::new(limits).unwrap();
        let hash = load(&sandbox, ECHO_WAT);
        let result = sandbox.execute(&WasmCall::new(&hash, "run", b"x".to_vec()));
        assert!(!result.success);
        assert!(result.metrics.overflow.function_calls);
    }

    #[test]
    fn repeated_execution_is_deterministic() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let hash = load(&sandbox, ECHO_WAT);
        assert!(sandbox.verify_determinism(&hash, b"same input", 3));

        let call = WasmCall::new(&hash, "run", b"same input".to_vec());
        let first = sandbox.execute(&call);
        let second = sandbox.execute(&call);
        assert_eq!(first.output_hash, second.output_hash);
        assert_eq!(first.execution_hash, second.execution_hash);
    }

    #[test]
    fn clock_dependent_module_fails_determinism_check() {
        // The frozen clock differs between instantiations, so a module
        // that folds it into its output is detectably nondeterministic.
        // The busy loop keeps each run well past a millisecond.
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let wat = r#"
            (module
              (import "ailee" "now_ms" (func $now (result i64)))
              (import "ailee" "output_write" (func $ow (param i32 i32)))
              (memory (export "memory") 1)
              (func (export "run")
                (local $i i32)
                (local.set $i (i32.const 20000000))
                (block $done
                  (loop $l
                    (br_if $done (i32.eqz (local.get $i)))
                    (local.set $i (i32.sub (local.get $i) (i32.const 1)))
                    (br $l)))
                (i64.store (i32.const 16) (call $now))
                (call $ow (i32.const 16) (i32.const 8))))
        "#;
        let hash = load(&sandbox, wat);
        assert!(!sandbox.verify_determinism(&hash, b"", 2));
    }

    #[test]
    fn trace_records_host_crossings() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let hash = load(&sandbox, ECHO_WAT);
        let result = sandbox.execute_with_trace(&WasmCall::new(&hash, "run", b"abc".to_vec()));
        assert!(result.success);
        let trace = result.trace.expect("trace requested");
        assert!(trace.len() >= 4); // enter + 2 host calls + return
        assert_eq!(trace.first().unwrap().opcode, "enter.run");
        assert_eq!(trace.last().unwrap().opcode, "return");
        // Steps are ordered by pc.
        for (i, step) in trace.iter().enumerate() {
            assert_eq!(step.pc, i as u64);
        }
        // Plain execute records no trace.
        assert!(sandbox
            .execute(&WasmCall::new(&hash, "run", b"abc".to_vec()))
            .trace
            .is_none());
    }

    #[test]
    fn module_cache_tracks_usage() {
        let sandbox = WasmSandbox::new(SandboxLimits::default()).unwrap();
        let bytes = wat::parse_str(ECHO_WAT).unwrap();
        let hash = sha256_hex(&bytes);
        sandbox.load_module(&bytes, &hash).unwrap();
        sandbox.execute(&WasmCall::new(&hash, "run", b"a".to_vec()));
        sandbox.execute(&WasmCall::new(&hash, "run", b"b".to_vec()));

        let modules = sandbox.loaded_modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].0, hash);
        assert_eq!(modules[0].1, bytes.len());
        assert_eq!(modules[0].2, 2);

        sandbox.unload_module(&hash);
        assert!(sandbox.loaded_modules().is_empty());
    }

    #[test]
    fn statistics_track_outcomes() {
        let mut limits = SandboxLimits::default();
        limits.gas_limit = 10_000;
        let sandbox = WasmSandbox::new(limits).unwrap();
        let echo = load(&sandbox, ECHO_WAT);
        let spin = load(&sandbox, SPIN_WAT);

        sandbox.execute(&WasmCall::new(&echo, "run", b"a".to_vec()));
        sandbox.execute(&WasmCall::new(&spin, "run", vec![]));

        let stats = sandbox.statistics();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.other_errors, 1); // gas exhaustion counts as other

        sandbox.reset_statistics();
        assert_eq!(sandbox.statistics().total_executions, 0);
    }

    #[test]
    fn factory_builds_a_working_backend() {
        let backend =
            create_backend(WasmRuntimeKind::Wasmtime, SandboxLimits::default()).unwrap();
        let bytes = wat::parse_str(ECHO_WAT).unwrap();
        let hash = sha256_hex(&bytes);
        backend.load_module(&bytes, &hash).unwrap();
        let result = backend.execute(&WasmCall::new(&hash, "run", b"via trait".to_vec()));
        assert!(result.success);
        assert!(backend.unload_module(&hash));
    }
}
