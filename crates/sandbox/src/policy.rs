//! Security policy for script tool loading and execution.

use std::collections::HashSet;
use std::time::Duration;

use agora_config::SandboxConfig;
use agora_core::{ExecutionQuota, HostCapability};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Controls which capabilities script tools may be granted and the upper
/// bound of any tool's quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Capabilities that may be granted to script tools.
    #[serde(default)]
    pub allowed_capabilities: Vec<HostCapability>,

    /// Per-field maximums applied to every tool quota.
    #[serde(default = "default_ceiling")]
    pub ceiling: ExecutionQuota,

    /// Whether to reject tools that request capabilities not in the allow list.
    #[serde(default = "default_strict")]
    pub strict: bool,

    /// Watchdog polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_ceiling() -> ExecutionQuota {
    SandboxConfig::default().ceiling
}

fn default_strict() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    10
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_capabilities: vec![], // fully sandboxed by default
            ceiling: default_ceiling(),
            strict: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SandboxPolicy {
    /// Create a permissive policy that allows all capabilities.
    pub fn permissive() -> Self {
        Self {
            allowed_capabilities: vec![
                HostCapability::Http,
                HostCapability::Llm,
                HostCapability::Search,
                HostCapability::ForumRead,
                HostCapability::ForumWrite,
                HostCapability::Upload,
            ],
            strict: false,
            ..Default::default()
        }
    }

    /// Build the policy described by the `[sandbox]` config section.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            allowed_capabilities: config.allowed_capabilities.clone(),
            ceiling: config.ceiling.clone(),
            strict: config.strict,
            poll_interval_ms: config.poll_interval_ms.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Check whether a set of requested capabilities is allowed.
    pub fn validate_capabilities(&self, requested: &[HostCapability]) -> Result<(), String> {
        if !self.strict {
            return Ok(());
        }
        for cap in requested {
            if !self.allowed_capabilities.contains(cap) {
                return Err(format!(
                    "Capability '{}' is not allowed by the sandbox policy",
                    cap
                ));
            }
        }
        Ok(())
    }

    /// The requested capabilities this policy actually grants.
    ///
    /// A lenient policy loads tools that ask for more than it allows;
    /// host calls needing the rest are rejected at call time.
    pub fn grant(&self, requested: &[HostCapability]) -> HashSet<HostCapability> {
        requested
            .iter()
            .copied()
            .filter(|cap| self.allowed_capabilities.contains(cap))
            .collect()
    }

    /// Clamp a tool's quota to the policy ceiling.
    pub fn clamp(&self, tool: &str, quota: &mut ExecutionQuota) {
        let ceiling = &self.ceiling;
        if quota.max_memory_bytes > ceiling.max_memory_bytes {
            warn!(
                tool = %tool,
                requested = quota.max_memory_bytes,
                allowed = ceiling.max_memory_bytes,
                "Clamping script memory limit to policy maximum"
            );
            quota.max_memory_bytes = ceiling.max_memory_bytes;
        }
        if ceiling.timeout_ms > 0 && (quota.timeout_ms == 0 || quota.timeout_ms > ceiling.timeout_ms)
        {
            quota.timeout_ms = ceiling.timeout_ms;
        }
        if ceiling.max_fuel > 0 && (quota.max_fuel == 0 || quota.max_fuel > ceiling.max_fuel) {
            quota.max_fuel = ceiling.max_fuel;
        }
        quota.max_http_calls = quota.max_http_calls.min(ceiling.max_http_calls);
        quota.max_sleep_calls = quota.max_sleep_calls.min(ceiling.max_sleep_calls);
        quota.max_sleep_ms = quota.max_sleep_ms.min(ceiling.max_sleep_ms);
        quota.max_marshal_depth = quota.max_marshal_depth.min(ceiling.max_marshal_depth);
    }
}
