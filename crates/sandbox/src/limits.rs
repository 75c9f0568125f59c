//! Memory ceiling and marshal-depth checks.

use agora_core::QuotaKind;
use serde_json::Value;
use wasmtime::ResourceLimiter;

use crate::engine::SandboxError;

/// Upper bound on table elements a script may allocate.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Resource limiter enforcing a fixed linear-memory ceiling.
///
/// Growth past the ceiling traps the script; the request that crossed it
/// is recorded so the engine can report a memory quota violation.
#[derive(Debug)]
pub struct MemoryCeiling {
    max_bytes: usize,
    exceeded: Option<usize>,
}

impl MemoryCeiling {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            exceeded: None,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// The size of the growth request that crossed the ceiling, if any.
    pub fn exceeded(&self) -> Option<usize> {
        self.exceeded
    }
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_bytes {
            self.exceeded = Some(desired);
            anyhow::bail!(
                "memory ceiling of {} bytes exceeded ({} bytes requested)",
                self.max_bytes,
                desired
            );
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// Nesting depth of a JSON value. Scalars are depth 0.
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Reject values nested deeper than `max_depth`.
pub fn check_depth(value: &Value, max_depth: usize, what: &str) -> Result<(), SandboxError> {
    let depth = json_depth(value);
    if depth > max_depth {
        return Err(SandboxError::QuotaExceeded {
            kind: QuotaKind::MarshalDepth,
            detail: format!("{what} nested {depth} levels deep, limit is {max_depth}"),
        });
    }
    Ok(())
}
