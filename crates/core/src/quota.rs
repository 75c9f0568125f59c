//! Per-invocation execution quotas and host capabilities for script tools.

use serde::{Deserialize, Serialize};

/// The resource a quota violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    HttpCalls,
    SleepCalls,
    SleepDuration,
    Memory,
    Timeout,
    MarshalDepth,
    Fuel,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QuotaKind::HttpCalls => "http_calls",
            QuotaKind::SleepCalls => "sleep_calls",
            QuotaKind::SleepDuration => "sleep_duration",
            QuotaKind::Memory => "memory",
            QuotaKind::Timeout => "timeout",
            QuotaKind::MarshalDepth => "marshal_depth",
            QuotaKind::Fuel => "fuel",
        };
        f.write_str(name)
    }
}

/// Limits applied to a single script invocation.
///
/// A fresh copy is consulted for every invocation; counters measured
/// against it are never shared between tools or between calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionQuota {
    /// Budget of pure script time in milliseconds (0 = no watchdog).
    /// Time spent inside host calls is not counted.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Linear memory ceiling in bytes.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Maximum outbound HTTP calls.
    #[serde(default = "default_max_http_calls")]
    pub max_http_calls: u32,

    /// Maximum number of `sleep` calls.
    #[serde(default = "default_max_sleep_calls")]
    pub max_sleep_calls: u32,

    /// Maximum duration of a single `sleep` call in milliseconds.
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,

    /// Maximum nesting depth of JSON values crossing the sandbox boundary.
    #[serde(default = "default_max_marshal_depth")]
    pub max_marshal_depth: usize,

    /// Instruction fuel (0 = unlimited).
    #[serde(default)]
    pub max_fuel: u64,
}

fn default_timeout_ms() -> u64 {
    2_000
}
fn default_max_memory_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}
fn default_max_http_calls() -> u32 {
    20
}
fn default_max_sleep_calls() -> u32 {
    30
}
fn default_max_sleep_ms() -> u64 {
    1_000
}
fn default_max_marshal_depth() -> usize {
    20
}

impl Default for ExecutionQuota {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_http_calls: default_max_http_calls(),
            max_sleep_calls: default_max_sleep_calls(),
            max_sleep_ms: default_max_sleep_ms(),
            max_marshal_depth: default_max_marshal_depth(),
            max_fuel: 0,
        }
    }
}

/// Host services a script tool may request.
///
/// Script tools declare the capabilities they need; a sandbox policy
/// decides which ones are granted. Host calls for ungranted capabilities
/// are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostCapability {
    /// Outbound HTTP requests.
    Http,
    /// Sub-completions through the bot's LLM.
    Llm,
    /// Forum full-text search.
    Search,
    /// Read posts, topics and users.
    ForumRead,
    /// Create or edit posts and topics.
    ForumWrite,
    /// Read and create uploads.
    Upload,
}

impl std::fmt::Display for HostCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostCapability::Http => write!(f, "http"),
            HostCapability::Llm => write!(f, "llm"),
            HostCapability::Search => write!(f, "search"),
            HostCapability::ForumRead => write!(f, "forum_read"),
            HostCapability::ForumWrite => write!(f, "forum_write"),
            HostCapability::Upload => write!(f, "upload"),
        }
    }
}
