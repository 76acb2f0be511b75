use crate::call::TraceStep;
use crate::limits::SandboxLimits;
use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};
use wasmtime::{AsContext, Caller, Linker, ResourceLimiter};

/// Maximum bytes a guest may emit through `output_write` in one call.
const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Name of the single import module exposed to guests.
pub const HOST_MODULE: &str = "ailee";

/// Growth arbiter for guest memories and tables. Denials are recorded so
/// the execution layer can classify the eventual failure.
#[derive(Debug, Default)]
pub struct SandboxLimiter {
    pub memory_limit_bytes: usize,
    pub table_limit: u32,
    pub peak_memory_bytes: usize,
    pub memory_denied: bool,
    pub table_denied: bool,
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> Result<bool> {
        if desired > self.memory_limit_bytes {
            self.memory_denied = true;
            return Ok(false);
        }
        self.peak_memory_bytes = self.peak_memory_bytes.max(desired);
        Ok(true)
    }

    fn table_growing(&mut self, _current: u32, desired: u32, _maximum: Option<u32>) -> Result<bool> {
        if desired > self.table_limit {
            self.table_denied = true;
            return Ok(false);
        }
        Ok(true)
    }
}

/// Per-execution store data: the call's input, the guest's output, the
/// frozen clock, the host-call budget, and the optional trace.
pub struct HostState {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub logs: Vec<String>,
    pub host_calls: u64,
    pub max_host_calls: u64,
    pub call_budget_exceeded: bool,
    /// Wall clock frozen at instantiation; the only time a guest can see.
    pub frozen_now_ms: i64,
    pub trace: Option<Vec<TraceStep>>,
    pub limiter: SandboxLimiter,
}

impl HostState {
    pub fn new(input: Vec<u8>, limits: &SandboxLimits, frozen_now_ms: i64, record_trace: bool) -> Self {
        Self {
            input,
            output: Vec::new(),
            logs: Vec::new(),
            host_calls: 0,
            max_host_calls: limits.max_function_calls,
            call_budget_exceeded: false,
            frozen_now_ms,
            trace: if record_trace { Some(Vec::new()) } else { None },
            limiter: SandboxLimiter {
                memory_limit_bytes: limits.effective_memory_bytes() as usize,
                table_limit: limits.max_table_size,
                ..SandboxLimiter::default()
            },
        }
    }
}

fn charge_host_call(caller: &mut Caller<'_, HostState>, opcode: &str) -> Result<()> {
    let gas_used = caller.as_context().fuel_consumed().unwrap_or(0);
    let state = caller.data_mut();
    state.host_calls += 1;
    if state.host_calls > state.max_host_calls {
        state.call_budget_exceeded = true;
        bail!("host call budget exceeded");
    }
    if let Some(trace) = state.trace.as_mut() {
        let pc = trace.len() as u64;
        trace.push(TraceStep {
            opcode: opcode.to_string(),
            gas_used,
            pc,
        });
    }
    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<wasmtime::Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("guest does not export memory"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buf)
        .map_err(|_| anyhow!("guest read out of bounds"))?;
    Ok(buf)
}

/// Install the closed host ABI on a linker. This is the entire surface a
/// guest can reach: input transfer, output transfer, logging, a frozen
/// clock, and (capability-gated) SHA-256. Determinism of the proof system
/// rests on nothing else being importable.
pub fn add_host_functions(linker: &mut Linker<HostState>, crypto: bool) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "input_len",
        |mut caller: Caller<'_, HostState>| -> Result<u32> {
            charge_host_call(&mut caller, "host.input_len")?;
            Ok(caller.data().input.len() as u32)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "input_read",
        |mut caller: Caller<'_, HostState>, dst_ptr: u32| -> Result<u32> {
            charge_host_call(&mut caller, "host.input_read")?;
            let input = caller.data().input.clone();
            let memory = guest_memory(&mut caller)?;
            memory
                .write(&mut caller, dst_ptr as usize, &input)
                .map_err(|_| anyhow!("guest write out of bounds"))?;
            Ok(input.len() as u32)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "output_write",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<()> {
            charge_host_call(&mut caller, "host.output_write")?;
            if caller.data().output.len() + len as usize > MAX_OUTPUT_BYTES {
                bail!("guest output exceeds {} bytes", MAX_OUTPUT_BYTES);
            }
            let chunk = read_guest(&mut caller, ptr, len)?;
            caller.data_mut().output.extend_from_slice(&chunk);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> Result<()> {
            charge_host_call(&mut caller, "host.log")?;
            let bytes = read_guest(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&bytes).into_owned();
            tracing::debug!(target: "guest", "{message}");
            caller.data_mut().logs.push(message);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "now_ms",
        |mut caller: Caller<'_, HostState>| -> Result<i64> {
            charge_host_call(&mut caller, "host.now_ms")?;
            Ok(caller.data().frozen_now_ms)
        },
    )?;

    if crypto {
        linker.func_wrap(
            HOST_MODULE,
            "sha256",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32, dst_ptr: u32| -> Result<()> {
                charge_host_call(&mut caller, "host.sha256")?;
                let bytes = read_guest(&mut caller, ptr, len)?;
                let digest = Sha256::digest(&bytes);
                let memory = guest_memory(&mut caller)?;
                memory
                    .write(&mut caller, dst_ptr as usize, &digest)
                    .map_err(|_| anyhow!("guest write out of bounds"))?;
                Ok(())
            },
        )?;
    }

    Ok(())
}

/// Import names the ABI can ever provide, per capability gate.
pub fn import_allowed(name: &str, crypto: bool) -> bool {
    match name {
        "input_len" | "input_read" | "output_write" | "log" | "now_ms" => true,
        "sha256" => crypto,
        _ => false,
    }
}
