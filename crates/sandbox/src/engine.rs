//! Sandboxed script execution engine.
//!
//! `idle → running → {completed | timed-out | quota-exceeded | errored |
//! cancelled}`. Every invocation gets a fresh [`Store`] and instance; no
//! state (memory, counters, cached host results) survives between runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{ExecutionQuota, ProgressReporter, QuotaKind, ToolError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Instance, Linker, Module, Store, Trap, UpdateDeadline};

use crate::host::{self, HostMode, HostServices, HostState};
use crate::limits::check_depth;
use crate::watchdog::{Watchdog, WatchdogState};

/// Lifecycle of a single script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Running,
    Completed,
    TimedOut,
    QuotaExceeded,
    Errored,
    Cancelled,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed-out",
            ExecutionState::QuotaExceeded => "quota-exceeded",
            ExecutionState::Errored => "errored",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a script run did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("script exceeded its {timeout_ms}ms time budget")]
    Timeout { timeout_ms: u64 },

    #[error("quota exceeded: {kind} ({detail})")]
    QuotaExceeded { kind: QuotaKind, detail: String },

    #[error("script cancelled")]
    Cancelled,

    #[error("invalid script module: {0}")]
    InvalidModule(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// The terminal state this error corresponds to.
    pub fn state(&self) -> ExecutionState {
        match self {
            SandboxError::Timeout { .. } => ExecutionState::TimedOut,
            SandboxError::QuotaExceeded { .. } => ExecutionState::QuotaExceeded,
            SandboxError::Cancelled => ExecutionState::Cancelled,
            SandboxError::InvalidModule(_) | SandboxError::Script(_) | SandboxError::Internal(_) => {
                ExecutionState::Errored
            }
        }
    }

    pub fn into_tool_error(self, tool_name: &str) -> ToolError {
        let tool_name = tool_name.to_string();
        match self {
            SandboxError::Timeout { timeout_ms } => ToolError::Timeout {
                tool_name,
                timeout_ms,
            },
            SandboxError::QuotaExceeded { kind, detail } => ToolError::QuotaExceeded {
                tool_name,
                quota: kind,
                detail,
            },
            SandboxError::Cancelled => ToolError::Cancelled { tool_name },
            other => ToolError::ExecutionFailed {
                tool_name,
                reason: other.to_string(),
            },
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Parsed JSON result, or the raw text when the script did not return JSON
    pub result: Value,
    pub custom_raw: Option<String>,
    pub http_calls: u32,
    pub sleep_calls: u32,
    /// Pure script time as accounted by the watchdog
    pub script_time: Duration,
}

/// One full invocation request.
pub struct Invocation {
    pub params: Value,
    pub quota: ExecutionQuota,
    pub services: HostServices,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryPoint {
    Invoke,
    PartialInvoke,
}

impl EntryPoint {
    fn export(self) -> &'static str {
        match self {
            EntryPoint::Invoke => "invoke",
            EntryPoint::PartialInvoke => "partial_invoke",
        }
    }
}

/// A compiled script, ready to be run any number of times.
///
/// Cloning is cheap; the compiled module is shared.
#[derive(Clone)]
pub struct ScriptEngine {
    name: Arc<str>,
    engine: Engine,
    module: Module,
    poll_interval: Duration,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("name", &self.name)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ScriptEngine {
    /// Compile a script from WebAssembly bytes.
    pub fn new(name: &str, wasm: &[u8], poll_interval: Duration) -> Result<Self, SandboxError> {
        let engine = build_engine()?;
        let module = Module::new(&engine, wasm)
            .map_err(|e| SandboxError::InvalidModule(format!("failed to compile: {e}")))?;
        Self::with_module(name, engine, module, poll_interval)
    }

    /// Compile a script from a `.wasm` file.
    pub fn from_file(
        name: &str,
        path: &Path,
        poll_interval: Duration,
    ) -> Result<Self, SandboxError> {
        let engine = build_engine()?;
        let module = Module::from_file(&engine, path).map_err(|e| {
            SandboxError::InvalidModule(format!("failed to load '{}': {e}", path.display()))
        })?;
        Self::with_module(name, engine, module, poll_interval)
    }

    fn with_module(
        name: &str,
        engine: Engine,
        module: Module,
        poll_interval: Duration,
    ) -> Result<Self, SandboxError> {
        for required in ["memory", "alloc", "invoke"] {
            if module.get_export(required).is_none() {
                return Err(SandboxError::InvalidModule(format!(
                    "module must export '{required}'"
                )));
            }
        }
        Ok(Self {
            name: Arc::from(name),
            engine,
            module,
            poll_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the module can render partial tool calls.
    pub fn has_partial_invoke(&self) -> bool {
        self.module.get_export("partial_invoke").is_some()
    }

    /// Run the script's `invoke` entry point.
    pub async fn invoke(&self, invocation: Invocation) -> Result<ScriptOutput, SandboxError> {
        let Invocation {
            params,
            quota,
            services,
            progress,
            cancel,
        } = invocation;
        self.run(
            EntryPoint::Invoke,
            HostMode::Invoke(services),
            params,
            quota,
            progress,
            cancel,
        )
        .await
    }

    /// Run the script's `partial_invoke` entry point to render progress.
    ///
    /// Host calls are disabled for the run, so rendering never has side
    /// effects. Returns `None` if the module has no such export or rendered
    /// nothing.
    pub async fn partial_invoke(
        &self,
        params: Value,
        quota: ExecutionQuota,
    ) -> Result<Option<String>, SandboxError> {
        if !self.has_partial_invoke() {
            return Ok(None);
        }
        let output = self
            .run(
                EntryPoint::PartialInvoke,
                HostMode::Render,
                params,
                quota,
                ProgressReporter::noop(),
                CancellationToken::new(),
            )
            .await?;
        let rendered = match output.result {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok((!rendered.is_empty()).then_some(rendered))
    }

    async fn run(
        &self,
        entry: EntryPoint,
        mode: HostMode,
        params: Value,
        quota: ExecutionQuota,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<ScriptOutput, SandboxError> {
        let runtime = tokio::runtime::Handle::current();
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.run_blocking(entry, mode, params, quota, progress, cancel, runtime)
        })
        .await
        .map_err(|e| SandboxError::Internal(format!("script task failed: {e}")))?
    }

    #[allow(clippy::too_many_arguments)]
    fn run_blocking(
        &self,
        entry: EntryPoint,
        mode: HostMode,
        params: Value,
        quota: ExecutionQuota,
        progress: ProgressReporter,
        cancel: CancellationToken,
        runtime: tokio::runtime::Handle,
    ) -> Result<ScriptOutput, SandboxError> {
        debug!(script = %self.name, entry = entry.export(), state = %ExecutionState::Idle, "Script run requested");

        let result = self.execute(entry, mode, params, &quota, progress, cancel, runtime);
        match &result {
            Ok(output) => debug!(
                script = %self.name,
                state = %ExecutionState::Completed,
                http_calls = output.http_calls,
                sleep_calls = output.sleep_calls,
                script_ms = output.script_time.as_millis() as u64,
                "Script finished"
            ),
            Err(e @ (SandboxError::Timeout { .. } | SandboxError::QuotaExceeded { .. })) => {
                warn!(script = %self.name, state = %e.state(), error = %e, "Script terminated")
            }
            Err(e) => debug!(script = %self.name, state = %e.state(), error = %e, "Script failed"),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        entry: EntryPoint,
        mode: HostMode,
        params: Value,
        quota: &ExecutionQuota,
        progress: ProgressReporter,
        cancel: CancellationToken,
        runtime: tokio::runtime::Handle,
    ) -> Result<ScriptOutput, SandboxError> {
        check_depth(&params, quota.max_marshal_depth, "tool parameters")?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let input = params.to_string();

        let watchdog_state = WatchdogState::new();
        let mut store = Store::new(
            &self.engine,
            HostState::new(
                mode,
                quota.clone(),
                watchdog_state.clone(),
                runtime,
                cancel,
                progress,
            ),
        );
        store.limiter(|state| &mut state.limiter);
        let fuel = if quota.max_fuel > 0 {
            quota.max_fuel
        } else {
            u64::MAX
        };
        store
            .set_fuel(fuel)
            .map_err(|e| SandboxError::Internal(format!("failed to set fuel: {e}")))?;
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|ctx| {
            if ctx.data().watchdog.timed_out() {
                anyhow::bail!("script time budget exhausted");
            }
            // Another store on this engine timed out; keep going.
            Ok(UpdateDeadline::Continue(1))
        });

        let mut linker = Linker::new(&self.engine);
        host::link(&mut linker)
            .map_err(|e| SandboxError::Internal(format!("failed to link host calls: {e}")))?;

        debug!(script = %self.name, state = %ExecutionState::Running, "Script running");
        let watchdog = if quota.timeout_ms > 0 {
            let engine = self.engine.clone();
            let watchdog = Watchdog::spawn(
                watchdog_state.clone(),
                Duration::from_millis(quota.timeout_ms),
                self.poll_interval,
                move || engine.increment_epoch(),
            )
            .map_err(|e| SandboxError::Internal(format!("failed to start watchdog: {e}")))?;
            Some(watchdog)
        } else {
            None
        };

        let outcome = self.call_entry(&mut store, &linker, entry, &input);
        let script_time = match watchdog {
            Some(watchdog) => watchdog.finish(),
            None => watchdog_state.script_time(),
        };

        let raw = match outcome {
            Ok(raw) => raw,
            Err(CallError::Invalid(reason)) => return Err(SandboxError::InvalidModule(reason)),
            Err(CallError::Instantiate(err)) => {
                return Err(match classify(&mut store, quota, err) {
                    SandboxError::Script(reason) => SandboxError::InvalidModule(reason),
                    other => other,
                });
            }
            Err(CallError::Trap(err)) => return Err(classify(&mut store, quota, err)),
        };

        let result = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        check_depth(&result, quota.max_marshal_depth, "script result")?;

        let state = store.into_data();
        Ok(ScriptOutput {
            result,
            custom_raw: state.custom_raw,
            http_calls: state.http_calls,
            sleep_calls: state.sleep_calls,
            script_time,
        })
    }

    /// Instantiate the module, copy the input in, call the entry point and
    /// read back the NUL-terminated output.
    fn call_entry(
        &self,
        store: &mut Store<HostState>,
        linker: &Linker<HostState>,
        entry: EntryPoint,
        input: &str,
    ) -> Result<String, CallError> {
        let instance: Instance = linker
            .instantiate(&mut *store, &self.module)
            .map_err(CallError::Instantiate)?;

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| CallError::Invalid("module must export 'memory'".into()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, "alloc")
            .map_err(|e| CallError::Invalid(format!("'alloc(i32) -> i32' is required: {e}")))?;
        let func = instance
            .get_typed_func::<(i32, i32), i32>(&mut *store, entry.export())
            .map_err(|e| {
                CallError::Invalid(format!(
                    "'{}(i32, i32) -> i32' is required: {e}",
                    entry.export()
                ))
            })?;

        let input_len = input.len() as i32;
        let input_ptr = alloc.call(&mut *store, input_len).map_err(CallError::Trap)?;
        memory
            .write(&mut *store, input_ptr as u32 as usize, input.as_bytes())
            .map_err(|_| CallError::Invalid("alloc returned a buffer outside memory".into()))?;

        let result_ptr = func
            .call(&mut *store, (input_ptr, input_len))
            .map_err(CallError::Trap)?;

        let data = memory.data(&*store);
        let start = result_ptr as u32 as usize;
        if start >= data.len() {
            return Err(CallError::Invalid("invalid result pointer".into()));
        }
        let end = data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|pos| start + pos)
            .unwrap_or(data.len());
        std::str::from_utf8(&data[start..end])
            .map(str::to_string)
            .map_err(|e| CallError::Invalid(format!("invalid UTF-8 in output: {e}")))
    }
}

enum CallError {
    Invalid(String),
    Instantiate(anyhow::Error),
    Trap(anyhow::Error),
}

fn build_engine() -> Result<Engine, SandboxError> {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    Engine::new(&config)
        .map_err(|e| SandboxError::Internal(format!("failed to create engine: {e}")))
}

/// Map a trap to the violation that caused it.
///
/// Violations recorded by host calls win, then the watchdog, then the
/// memory limiter, then fuel; anything else is a script error.
fn classify(
    store: &mut Store<HostState>,
    quota: &ExecutionQuota,
    err: anyhow::Error,
) -> SandboxError {
    let state = store.data_mut();
    if let Some(violation) = state.violation.take() {
        return violation;
    }
    if state.watchdog.timed_out() {
        return SandboxError::Timeout {
            timeout_ms: quota.timeout_ms,
        };
    }
    if let Some(requested) = state.limiter.exceeded() {
        return SandboxError::QuotaExceeded {
            kind: QuotaKind::Memory,
            detail: format!(
                "{requested} bytes requested, ceiling is {} bytes",
                state.limiter.max_bytes()
            ),
        };
    }
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return SandboxError::QuotaExceeded {
            kind: QuotaKind::Fuel,
            detail: format!("fuel limit of {} exhausted", quota.max_fuel),
        };
    }
    SandboxError::Script(format!("{err:#}"))
}
