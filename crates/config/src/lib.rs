//! Configuration loading, validation, and management for Agora.
//!
//! Loads configuration from `~/.agora/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use agora_core::{ExecutionQuota, HostCapability};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.agora/config.toml`. Every section and field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Generation defaults passed to the LLM client
    #[serde(default)]
    pub llm: LlmConfig,

    /// Conversation orchestrator limits
    #[serde(default)]
    pub bot: BotConfig,

    /// Prompt assembly budgets
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Script sandbox quotas and policy
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Completion requests allowed per reply
    #[serde(default = "default_max_completions")]
    pub max_completions: u32,

    /// Finalized tool calls executed per completion; extras are dropped
    #[serde(default = "default_max_tools_per_completion")]
    pub max_tools_per_completion: u32,
}

fn default_max_completions() -> u32 {
    5
}
fn default_max_tools_per_completion() -> u32 {
    5
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            max_completions: default_max_completions(),
            max_tools_per_completion: default_max_tools_per_completion(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,

    /// Fragments requested from similarity search
    #[serde(default = "default_guidance_fragment_limit")]
    pub guidance_fragment_limit: usize,

    #[serde(default = "default_guidance_token_budget")]
    pub guidance_token_budget: usize,
}

fn default_max_prompt_tokens() -> usize {
    32_000
}
fn default_guidance_fragment_limit() -> usize {
    10
}
fn default_guidance_token_budget() -> usize {
    2_000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: default_max_prompt_tokens(),
            guidance_fragment_limit: default_guidance_fragment_limit(),
            guidance_token_budget: default_guidance_token_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Quota applied to script tools that declare none
    #[serde(default)]
    pub default_quota: ExecutionQuota,

    /// Upper bound for any tool's declared quota
    #[serde(default = "default_ceiling")]
    pub ceiling: ExecutionQuota,

    /// Host capabilities script tools may be granted
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<HostCapability>,

    /// Reject tools that request capabilities outside the allowed set
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Watchdog polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory scanned for `*.tool.json` manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_dir: Option<PathBuf>,

    /// Per-request timeout for outbound HTTP host calls
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Response bodies larger than this are truncated
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_ceiling() -> ExecutionQuota {
    ExecutionQuota {
        timeout_ms: 10_000,
        max_memory_bytes: 64 * 1024 * 1024,
        max_http_calls: 50,
        max_sleep_calls: 100,
        max_sleep_ms: 5_000,
        max_marshal_depth: 64,
        max_fuel: 0,
    }
}
fn default_allowed_capabilities() -> Vec<HostCapability> {
    vec![
        HostCapability::Http,
        HostCapability::Llm,
        HostCapability::Search,
        HostCapability::ForumRead,
    ]
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_max_response_bytes() -> usize {
    1024 * 1024
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_quota: ExecutionQuota::default(),
            ceiling: default_ceiling(),
            allowed_capabilities: default_allowed_capabilities(),
            strict: true,
            poll_interval_ms: default_poll_interval_ms(),
            tools_dir: None,
            http_timeout_secs: default_http_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.agora/config.toml),
    /// then apply environment overrides:
    /// - `AGORA_LOG_LEVEL`
    /// - `AGORA_MAX_COMPLETIONS`
    /// - `AGORA_SCRIPT_TIMEOUT_MS`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_path())
    }

    /// Load from `path`, then apply process environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(level) = lookup("AGORA_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(raw) = lookup("AGORA_MAX_COMPLETIONS") {
            self.bot.max_completions = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "AGORA_MAX_COMPLETIONS must be a positive integer, got '{raw}'"
                ))
            })?;
        }

        if let Some(raw) = lookup("AGORA_SCRIPT_TIMEOUT_MS") {
            self.sandbox.default_quota.timeout_ms = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "AGORA_SCRIPT_TIMEOUT_MS must be an integer, got '{raw}'"
                ))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agora")
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationError(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.bot.max_completions == 0 {
            return Err(ConfigError::ValidationError(
                "bot.max_completions must be at least 1".into(),
            ));
        }

        if self.bot.max_tools_per_completion == 0 {
            return Err(ConfigError::ValidationError(
                "bot.max_tools_per_completion must be at least 1".into(),
            ));
        }

        if self.sandbox.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sandbox.poll_interval_ms must be > 0".into(),
            ));
        }

        let quota = &self.sandbox.default_quota;
        let ceiling = &self.sandbox.ceiling;
        if quota.timeout_ms > ceiling.timeout_ms
            || quota.max_memory_bytes > ceiling.max_memory_bytes
            || quota.max_http_calls > ceiling.max_http_calls
            || quota.max_sleep_calls > ceiling.max_sleep_calls
            || quota.max_sleep_ms > ceiling.max_sleep_ms
            || quota.max_marshal_depth > ceiling.max_marshal_depth
        {
            return Err(ConfigError::ValidationError(
                "sandbox.default_quota exceeds sandbox.ceiling".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config show`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
