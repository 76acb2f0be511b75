use crate::call::{
    execution_hash, sha256_hex, ExecutionMetrics, TraceStep, WasmCall, WasmResult,
};
use crate::host::{add_host_functions, import_allowed, HostState, HOST_MODULE};
use crate::limits::SandboxLimits;
use ailee_types::ErrorCode;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, OptLevel, Store, Trap};

/// Version tag reported in execution metrics and attached to proofs.
pub const RUNTIME_VERSION: &str = "wasmtime/12.0";

/// Entry export used when a caller names no function (determinism probes).
pub const DEFAULT_ENTRYPOINT: &str = "run";

const WATCHDOG_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("module hash mismatch: claimed {claimed}, computed {computed}")]
    ModuleHashMismatch { claimed: String, computed: String },

    #[error("module failed to compile: {0}")]
    ModuleCompile(String),

    #[error("module not loaded: {0}")]
    ModuleNotLoaded(String),
}

/// Aggregate counters since engine creation. All atomics; failures update
/// them without poisoning anything.
#[derive(Debug, Default)]
pub struct SandboxStats {
    pub total_executions: AtomicU64,
    pub successful_executions: AtomicU64,
    pub timeout_errors: AtomicU64,
    pub memory_errors: AtomicU64,
    pub other_errors: AtomicU64,
    pub total_execution_us: AtomicU64,
}

/// Point-in-time copy of [`SandboxStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SandboxStatsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub timeout_errors: u64,
    pub memory_errors: u64,
    pub other_errors: u64,
    pub total_execution_us: u64,
    pub average_execution_us: u64,
}

struct CachedModule {
    module: Module,
    bytecode_len: usize,
    execution_count: u64,
}

/// Deterministic, resource-limited WebAssembly host.
///
/// One sandbox wraps one wasmtime engine with fuel metering and epoch
/// interruption enabled. Executions on a single sandbox serialize; run a
/// pool of sandboxes for parallelism. Failures are never fatal to the
/// instance and cached modules stay loaded.
pub struct WasmSandbox {
    engine: Engine,
    limits: Mutex<SandboxLimits>,
    modules: Mutex<HashMap<String, CachedModule>>,
    exec_guard: Mutex<()>,
    stats: SandboxStats,
}

impl WasmSandbox {
    pub fn new(limits: SandboxLimits) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.max_wasm_stack(limits.stack_bytes as usize);
        config.cranelift_opt_level(OptLevel::Speed);
        // IEEE-754 without platform variance: canonicalize NaNs so float
        // bit patterns cannot leak host differences into output hashes.
        config.cranelift_nan_canonicalization(true);
        config.wasm_threads(false);

        let engine = Engine::new(&config)?;
        Ok(Self {
            engine,
            limits: Mutex::new(limits),
            modules: Mutex::new(HashMap::new()),
            exec_guard: Mutex::new(()),
            stats: SandboxStats::default(),
        })
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the limits; affects future executions only.
    pub fn set_limits(&self, limits: SandboxLimits) {
        *self.limits.lock().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    /// Compile and cache a module after checking the caller's claimed
    /// hash against the recomputed one.
    pub fn load_module(&self, bytes: &[u8], expected_hash: &str) -> Result<(), SandboxError> {
        let computed = sha256_hex(bytes);
        if computed != expected_hash {
            return Err(SandboxError::ModuleHashMismatch {
                claimed: expected_hash.to_string(),
                computed,
            });
        }
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| SandboxError::ModuleCompile(e.to_string()))?;
        let mut cache = self.modules.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            computed.clone(),
            CachedModule {
                module,
                bytecode_len: bytes.len(),
                execution_count: 0,
            },
        );
        debug!(module = %computed, bytes = bytes.len(), "module loaded");
        Ok(())
    }

    pub fn unload_module(&self, module_hash: &str) -> bool {
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(module_hash)
            .is_some()
    }

    pub fn is_loaded(&self, module_hash: &str) -> bool {
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(module_hash)
    }

    /// Cache contents: (module hash, bytecode size, executions served),
    /// hash-ordered.
    pub fn loaded_modules(&self) -> Vec<(String, usize, u64)> {
        let mut modules: Vec<(String, usize, u64)> = self
            .modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(hash, cached)| (hash.clone(), cached.bytecode_len, cached.execution_count))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        modules
    }

    /// Execute a call against a cached module.
    pub fn execute(&self, call: &WasmCall) -> WasmResult {
        self.execute_internal(call, false)
    }

    /// Execute and record the trace used for Merkle proof construction.
    pub fn execute_with_trace(&self, call: &WasmCall) -> WasmResult {
        self.execute_internal(call, true)
    }

    /// Run the same input `iterations` times and check that every run
    /// produced the identical output hash. Non-deterministic modules (or
    /// any failing run) return false.
    pub fn verify_determinism(&self, module_hash: &str, input: &[u8], iterations: u32) -> bool {
        let call = WasmCall::new(module_hash, DEFAULT_ENTRYPOINT, input.to_vec());
        let mut first_hash: Option<String> = None;
        for _ in 0..iterations.max(1) {
            let result = self.execute(&call);
            if !result.success {
                return false;
            }
            match &first_hash {
                None => first_hash = Some(result.output_hash),
                Some(expected) if *expected != result.output_hash => return false,
                Some(_) => {}
            }
        }
        first_hash.is_some()
    }

    pub fn statistics(&self) -> SandboxStatsSnapshot {
        let total = self.stats.total_executions.load(Ordering::Relaxed);
        let total_us = self.stats.total_execution_us.load(Ordering::Relaxed);
        SandboxStatsSnapshot {
            total_executions: total,
            successful_executions: self.stats.successful_executions.load(Ordering::Relaxed),
            timeout_errors: self.stats.timeout_errors.load(Ordering::Relaxed),
            memory_errors: self.stats.memory_errors.load(Ordering::Relaxed),
            other_errors: self.stats.other_errors.load(Ordering::Relaxed),
            total_execution_us: total_us,
            average_execution_us: if total == 0 { 0 } else { total_us / total },
        }
    }

    pub fn reset_statistics(&self) {
        self.stats.total_executions.store(0, Ordering::Relaxed);
        self.stats.successful_executions.store(0, Ordering::Relaxed);
        self.stats.timeout_errors.store(0, Ordering::Relaxed);
        self.stats.memory_errors.store(0, Ordering::Relaxed);
        self.stats.other_errors.store(0, Ordering::Relaxed);
        self.stats.total_execution_us.store(0, Ordering::Relaxed);
    }

    fn record_outcome(&self, result: &WasmResult, elapsed: Duration) {
        self.stats.total_executions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_execution_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if result.success {
            self.stats
                .successful_executions
                .fetch_add(1, Ordering::Relaxed);
        } else {
            match result.error_code {
                ErrorCode::ExecutionTimeout => {
                    self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                }
                ErrorCode::MemoryLimitExceeded => {
                    self.stats.memory_errors.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.stats.other_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn execute_internal(&self, call: &WasmCall, record_trace: bool) -> WasmResult {
        let started = Instant::now();
        let result = self.execute_once(call, record_trace);
        self.record_outcome(&result, started.elapsed());
        result
    }

    fn execute_once(&self, call: &WasmCall, record_trace: bool) -> WasmResult {
        // Input binding comes first: a call whose claimed input hash does
        // not match its bytes can never produce a valid proof.
        let computed_input = sha256_hex(&call.input_bytes);
        if computed_input != call.input_hash {
            return WasmResult::failure(
                &call.module_hash,
                &call.input_hash,
                ErrorCode::InvalidInput,
                format!(
                    "input hash mismatch: claimed {}, computed {}",
                    call.input_hash, computed_input
                ),
            );
        }

        let module = {
            let cache = self.modules.lock().unwrap_or_else(|e| e.into_inner());
            match cache.get(&call.module_hash) {
                Some(cached) => cached.module.clone(),
                None => {
                    return WasmResult::failure(
                        &call.module_hash,
                        &call.input_hash,
                        ErrorCode::ModuleLoadFailed,
                        format!("module not loaded: {}", call.module_hash),
                    )
                }
            }
        };

        let mut limits = self.limits();
        if let Some(gas) = call.custom_gas_limit {
            limits.gas_limit = gas;
        }
        if let Some(timeout) = call.custom_timeout_ms {
            limits.timeout_ms = timeout;
        }

        // The import surface is the determinism boundary: anything beyond
        // the host ABI (or a capability-gated name without the capability)
        // is refused outright.
        for import in module.imports() {
            let denied = import.module() != HOST_MODULE
                || !import_allowed(import.name(), limits.capabilities.crypto);
            if denied {
                return WasmResult::failure(
                    &call.module_hash,
                    &call.input_hash,
                    ErrorCode::SecurityViolation,
                    format!(
                        "denied import {}::{}",
                        import.module(),
                        import.name()
                    ),
                );
            }
        }

        // Executions on one sandbox serialize so the epoch watchdog only
        // ever interrupts the store it was armed for.
        let _exec = self.exec_guard.lock().unwrap_or_else(|e| e.into_inner());

        let frozen_now_ms = Utc::now().timestamp_millis();
        let state = HostState::new(call.input_bytes.clone(), &limits, frozen_now_ms, record_trace);
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limiter);
        // The engine always runs with fuel accounting on (it feeds the
        // instruction metric); without gas metering the budget is
        // effectively unbounded.
        let fuel = if limits.enable_gas_metering {
            limits.fuel_budget()
        } else {
            u64::MAX / 2
        };
        if let Err(e) = store.add_fuel(fuel) {
            return WasmResult::failure(
                &call.module_hash,
                &call.input_hash,
                ErrorCode::Unknown,
                format!("failed to add fuel: {e}"),
            );
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        if let Err(e) = add_host_functions(&mut linker, limits.capabilities.crypto) {
            return WasmResult::failure(
                &call.module_hash,
                &call.input_hash,
                ErrorCode::Unknown,
                format!("host ABI setup failed: {e}"),
            );
        }

        // Instantiation runs guest code (start sections), so it gets its
        // own, shorter deadline.
        store.set_epoch_deadline(1);
        let instantiate_started = Instant::now();
        let watchdog = Watchdog::arm(
            &self.engine,
            Duration::from_millis(limits.startup_timeout_ms),
        );
        let instance = linker.instantiate(&mut store, &module);
        watchdog.disarm();
        let instantiation_us = instantiate_started.elapsed().as_micros() as u64;

        let instance = match instance {
            Ok(instance) => instance,
            Err(e) => {
                let code = if Self::is_interrupt(&e) {
                    ErrorCode::ExecutionTimeout
                } else {
                    ErrorCode::InstantiationFailed
                };
                let mut result = WasmResult::failure(
                    &call.module_hash,
                    &call.input_hash,
                    code,
                    format!("instantiation failed: {e}"),
                );
                result.metrics.instantiation_time_us = instantiation_us;
                result.metrics.overflow.timeout = code == ErrorCode::ExecutionTimeout;
                result.metrics.runtime_version = RUNTIME_VERSION.to_string();
                return result;
            }
        };

        let func = match instance.get_typed_func::<(), ()>(&mut store, &call.function_name) {
            Ok(func) => func,
            Err(_) => {
                let mut result = WasmResult::failure(
                    &call.module_hash,
                    &call.input_hash,
                    ErrorCode::FunctionNotFound,
                    format!("export not found or wrong signature: {}", call.function_name),
                );
                result.metrics.instantiation_time_us = instantiation_us;
                result.metrics.runtime_version = RUNTIME_VERSION.to_string();
                return result;
            }
        };

        let initial_memory = instance
            .get_memory(&mut store, "memory")
            .map(|m| m.data_size(&store) as u64)
            .unwrap_or(0);
        if let Some(trace) = store.data_mut().trace.as_mut() {
            trace.push(TraceStep {
                opcode: format!("enter.{}", call.function_name),
                gas_used: 0,
                pc: 0,
            });
        }

        store.set_epoch_deadline(1);
        let exec_started = Instant::now();
        let watchdog = Watchdog::arm(&self.engine, Duration::from_millis(limits.timeout_ms));
        let call_result = func.call(&mut store, ());
        watchdog.disarm();
        let execution_us = exec_started.elapsed().as_micros() as u64;

        let fuel_used = store.fuel_consumed().unwrap_or(0);
        let end_memory = instance
            .get_memory(&mut store, "memory")
            .map(|m| m.data_size(&store) as u64)
            .unwrap_or(0);
        let state = store.data_mut();
        if let Some(trace) = state.trace.as_mut() {
            let pc = trace.len() as u64;
            trace.push(TraceStep {
                opcode: "return".to_string(),
                gas_used: fuel_used,
                pc,
            });
        }

        let peak_memory = (state.limiter.peak_memory_bytes as u64)
            .max(end_memory)
            .max(initial_memory);
        let mut metrics = ExecutionMetrics {
            execution_time_us: execution_us,
            instantiation_time_us: instantiation_us,
            peak_memory_bytes: peak_memory,
            avg_memory_bytes: (initial_memory + peak_memory) / 2,
            instructions_executed: fuel_used,
            gas_consumed: fuel_used,
            host_call_count: state.host_calls,
            overflow: Default::default(),
            runtime_version: RUNTIME_VERSION.to_string(),
        };
        metrics.overflow.memory = state.limiter.memory_denied;
        metrics.overflow.function_calls = state.call_budget_exceeded;

        match call_result {
            Ok(()) => {
                let output = std::mem::take(&mut state.output);
                let trace = state.trace.take();
                let output_hash = sha256_hex(&output);
                let exec_hash = execution_hash(&call.module_hash, &call.input_hash, &output_hash);
                if let Some(cached) = self
                    .modules
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(&call.module_hash)
                {
                    cached.execution_count += 1;
                }
                WasmResult {
                    success: true,
                    output_bytes: output,
                    output_hash,
                    module_hash: call.module_hash.clone(),
                    input_hash: call.input_hash.clone(),
                    execution_hash: exec_hash,
                    error: None,
                    error_code: ErrorCode::Success,
                    metrics,
                    trace,
                    zk_proof: None,
                    zk_verified: false,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                let (code, detail) = self.classify_failure(&e, &metrics, &limits);
                match code {
                    ErrorCode::ExecutionTimeout => metrics.overflow.timeout = true,
                    ErrorCode::GasLimitExceeded => {
                        metrics.overflow.gas = true;
                        // Which ceiling actually bound the fuel budget.
                        metrics.overflow.instructions =
                            limits.max_instructions <= limits.gas_limit;
                    }
                    ErrorCode::MemoryLimitExceeded => metrics.overflow.memory = true,
                    _ => {}
                }
                warn!(
                    module = %call.module_hash,
                    function = %call.function_name,
                    code = ?code,
                    "execution failed: {detail}"
                );
                let mut result = WasmResult::failure(
                    &call.module_hash,
                    &call.input_hash,
                    code,
                    detail,
                );
                result.metrics = metrics;
                result
            }
        }
    }

    fn is_interrupt(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<Trap>(), Some(Trap::Interrupt))
    }

    fn classify_failure(
        &self,
        error: &anyhow::Error,
        metrics: &ExecutionMetrics,
        _limits: &SandboxLimits,
    ) -> (ErrorCode, String) {
        if metrics.overflow.function_calls {
            return (
                ErrorCode::TrapOccurred,
                "host call budget exceeded".to_string(),
            );
        }
        if let Some(trap) = error.downcast_ref::<Trap>() {
            let code = match trap {
                Trap::OutOfFuel => ErrorCode::GasLimitExceeded,
                Trap::Interrupt => ErrorCode::ExecutionTimeout,
                Trap::UnreachableCodeReached if metrics.overflow.memory => {
                    // Growth was denied and the guest gave up; report the
                    // cause, not the symptom.
                    ErrorCode::MemoryLimitExceeded
                }
                _ => ErrorCode::TrapOccurred,
            };
            return (code, format!("trap: {trap}"));
        }
        if metrics.overflow.memory {
            return (
                ErrorCode::MemoryLimitExceeded,
                "memory growth denied".to_string(),
            );
        }
        (ErrorCode::TrapOccurred, error.to_string())
    }
}

/// One-shot timer that interrupts the engine's running store when it
/// fires. Disarming joins the thread, so a disarmed watchdog can never
/// touch a later execution.
struct Watchdog {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(engine: &Engine, timeout: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let engine = engine.clone();
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if flag.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(WATCHDOG_POLL.min(timeout));
            }
            if !flag.load(Ordering::Relaxed) {
                engine.increment_epoch();
            }
        });
        Self {
            done,
            handle: Some(handle),
        }
    }

    fn disarm(mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
