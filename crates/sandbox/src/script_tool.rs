//! Script tools: WebAssembly modules exposed through the [`Tool`] contract.
//!
//! Each tool lives in a tools directory as a pair of files:
//!
//! - `<name>.wasm`: the compiled module
//! - `<name>.tool.json`: a manifest matching [`ScriptToolConfig`]
//!
//! The script receives `{"parameters": {...}, "options": {...}}` as input.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agora_core::{
    ExecutionQuota, HostCapability, Tool, ToolContext, ToolError, ToolOption, ToolOutput,
    ToolParameter, ToolParams, ToolSignature,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::engine::{Invocation, ScriptEngine};
use crate::host::HostServices;
use crate::http::HttpClient;
use crate::policy::SandboxPolicy;

/// Manifest describing a script tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptToolConfig {
    /// Tool name offered to the model.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
    /// Options a persona may configure.
    #[serde(default)]
    pub options: Vec<ToolOption>,
    /// Path to the `.wasm` file, relative to the manifest.
    pub script_path: PathBuf,
    /// Host capabilities this tool requests.
    #[serde(default)]
    pub capabilities: Vec<HostCapability>,
    /// Quota override; the configured default quota applies when absent.
    #[serde(default)]
    pub quota: Option<ExecutionQuota>,
    #[serde(default = "default_chain")]
    pub chain_next_response: bool,
    #[serde(default)]
    pub allow_partial_tool_calls: bool,
}

fn default_chain() -> bool {
    true
}

/// A [`Tool`] backed by a sandboxed script.
pub struct ScriptTool {
    signature: ToolSignature,
    options: Vec<ToolOption>,
    engine: ScriptEngine,
    quota: ExecutionQuota,
    capabilities: Vec<HostCapability>,
    granted: HashSet<HostCapability>,
    chain: bool,
    allow_partial: bool,
    http: Option<Arc<dyn HttpClient>>,
}

impl std::fmt::Debug for ScriptTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTool")
            .field("name", &self.signature.name)
            .field("capabilities", &self.capabilities)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl ScriptTool {
    /// Load a script tool from its manifest, validating it against `policy`.
    ///
    /// `default_quota` applies when the manifest carries no quota of its own.
    pub fn from_config_with_policy(
        config: ScriptToolConfig,
        policy: &SandboxPolicy,
        default_quota: &ExecutionQuota,
    ) -> Result<Self, ToolError> {
        let wasm = std::fs::read(&config.script_path).map_err(|e| ToolError::ExecutionFailed {
            tool_name: config.name.clone(),
            reason: format!(
                "failed to read script '{}': {e}",
                config.script_path.display()
            ),
        })?;
        let path = config.script_path.display().to_string();
        let tool = Self::from_bytes_with_policy(config, &wasm, policy, default_quota)?;
        info!(name = %tool.signature.name, path = %path, "Loaded script tool");
        Ok(tool)
    }

    /// Build a script tool from raw module bytes.
    pub fn from_bytes_with_policy(
        config: ScriptToolConfig,
        wasm: &[u8],
        policy: &SandboxPolicy,
        default_quota: &ExecutionQuota,
    ) -> Result<Self, ToolError> {
        policy
            .validate_capabilities(&config.capabilities)
            .map_err(|reason| ToolError::PermissionDenied {
                tool_name: config.name.clone(),
                reason,
            })?;

        let mut quota = config.quota.clone().unwrap_or_else(|| default_quota.clone());
        policy.clamp(&config.name, &mut quota);

        let engine = ScriptEngine::new(&config.name, wasm, policy.poll_interval())
            .map_err(|e| e.into_tool_error(&config.name))?;

        if config.allow_partial_tool_calls && !engine.has_partial_invoke() {
            warn!(
                tool = %config.name,
                "allow_partial_tool_calls is set but the script exports no partial_invoke"
            );
        }

        let granted = policy.grant(&config.capabilities);
        debug!(
            tool = %config.name,
            requested = ?config.capabilities,
            granted = ?granted,
            timeout_ms = quota.timeout_ms,
            max_memory_bytes = quota.max_memory_bytes,
            "Script tool sandbox prepared"
        );

        let mut signature = ToolSignature::new(config.name, config.description);
        signature.parameters = config.parameters;

        Ok(Self {
            signature,
            options: config.options,
            engine,
            quota,
            capabilities: config.capabilities,
            granted,
            chain: config.chain_next_response,
            allow_partial: config.allow_partial_tool_calls,
            http: None,
        })
    }

    /// Attach the client used for `http.*` host calls.
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn capabilities(&self) -> &[HostCapability] {
        &self.capabilities
    }

    /// The quota after clamping to the policy ceiling.
    pub fn quota(&self) -> &ExecutionQuota {
        &self.quota
    }

    fn input(params: &ToolParams, ctx: &ToolContext) -> Value {
        json!({
            "parameters": params,
            "options": ctx.options,
        })
    }

    fn services(&self, ctx: &ToolContext) -> HostServices {
        HostServices {
            http: self.http.clone(),
            llm: ctx.llm.clone(),
            forum: ctx.forum.clone(),
            acting_user: ctx.acting_user.clone(),
            capabilities: self.granted.clone(),
            feature_name: ctx.feature_name.clone(),
        }
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    fn options(&self) -> &[ToolOption] {
        &self.options
    }

    fn allow_partial_tool_calls(&self) -> bool {
        self.allow_partial
    }

    fn chain_next_response(&self, _params: &ToolParams, _output: &ToolOutput) -> bool {
        self.chain
    }

    async fn invoke(&self, params: &ToolParams, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let output = self
            .engine
            .invoke(Invocation {
                params: Self::input(params, ctx),
                quota: self.quota.clone(),
                services: self.services(ctx),
                progress: ctx.progress.clone(),
                cancel: ctx.cancel.clone(),
            })
            .await
            .map_err(|e| e.into_tool_error(self.name()))?;

        Ok(ToolOutput {
            result: output.result,
            custom_raw: output.custom_raw,
        })
    }

    async fn partial_invoke(&self, params: &ToolParams, ctx: &ToolContext) -> Option<String> {
        match self
            .engine
            .partial_invoke(Self::input(params, ctx), self.quota.clone())
            .await
        {
            Ok(rendered) => rendered,
            Err(e) => {
                debug!(tool = %self.name(), error = %e, "Partial render failed");
                None
            }
        }
    }
}

/// Load every `*.tool.json` manifest in `dir`.
///
/// Tools that fail to load are logged and skipped. `http`, when given, is
/// attached to every tool.
pub fn load_script_tools_from_dir(
    dir: &Path,
    policy: &SandboxPolicy,
    default_quota: &ExecutionQuota,
    http: Option<Arc<dyn HttpClient>>,
) -> Vec<ScriptTool> {
    let mut tools = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read script tools directory");
            return tools;
        }
    };

    let mut manifests: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tool.json"))
        })
        .collect();
    manifests.sort();

    for path in manifests {
        match load_manifest(&path).and_then(|config| {
            ScriptTool::from_config_with_policy(config, policy, default_quota)
        }) {
            Ok(tool) => {
                let tool = match &http {
                    Some(http) => tool.with_http_client(http.clone()),
                    None => tool,
                };
                tools.push(tool);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to load script tool"),
        }
    }

    tools
}

/// Parse a manifest, resolving a relative script path against its directory.
pub fn load_manifest(path: &Path) -> Result<ScriptToolConfig, ToolError> {
    let content = std::fs::read_to_string(path).map_err(|e| ToolError::ExecutionFailed {
        tool_name: path.display().to_string(),
        reason: format!("failed to read manifest: {e}"),
    })?;
    let mut config: ScriptToolConfig = serde_json::from_str(&content)
        .map_err(|e| ToolError::InvalidArguments(format!("invalid tool manifest: {e}")))?;

    if config.script_path.is_relative() {
        if let Some(dir) = path.parent() {
            config.script_path = dir.join(&config.script_path);
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{ParameterType, QuotaKind, ToolCall, ToolRegistry};

    const ECHO: &str = r#"(module
        (import "agora" "set_custom_raw" (func $set_custom_raw (param i32 i32)))
        (memory (export "memory") 1)
        (global $next (mut i32) (i32.const 4096))
        (data (i32.const 1024) "echoed")
        (func (export "alloc") (param $n i32) (result i32)
            (local $p i32)
            (local.set $p (global.get $next))
            (global.set $next (i32.add (global.get $next) (local.get $n)))
            (local.get $p))
        (func (export "invoke") (param i32 i32) (result i32)
            (call $set_custom_raw (i32.const 1024) (i32.const 6))
            (local.get 0))
        (func (export "partial_invoke") (param i32 i32) (result i32)
            (local.get 0)))"#;

    const SPIN: &str = r#"(module
        (memory (export "memory") 1)
        (func (export "alloc") (param i32) (result i32) (i32.const 4096))
        (func (export "invoke") (param i32 i32) (result i32)
            (loop $forever (br $forever))
            (i32.const 0)))"#;

    fn config(name: &str) -> ScriptToolConfig {
        serde_json::from_value(json!({
            "name": name,
            "description": "Echo the input back",
            "parameters": [
                {"name": "query", "type": "string", "required": true}
            ],
            "script_path": format!("{name}.wasm"),
        }))
        .unwrap()
    }

    #[test]
    fn manifest_defaults() {
        let config = config("echo");
        assert!(config.chain_next_response);
        assert!(!config.allow_partial_tool_calls);
        assert!(config.capabilities.is_empty());
        assert!(config.quota.is_none());
        assert_eq!(config.parameters[0].param_type, ParameterType::String);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invoke_passes_parameters_and_options() {
        let wasm = wat::parse_str(ECHO).unwrap();
        let tool = ScriptTool::from_bytes_with_policy(
            config("echo"),
            &wasm,
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
        )
        .unwrap();

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));
        let call = ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: json!({"query": "rust"}).as_object().cloned().unwrap(),
            partial: false,
        };
        let mut instance = registry
            .resolve(&call, &ToolContext::default(), None)
            .unwrap();
        let result = instance.invoke().await.unwrap();
        assert_eq!(result["parameters"]["query"], "rust");
        assert_eq!(instance.custom_raw(), Some("echoed"));
        assert!(instance.chain_next_response());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_rendering_follows_manifest_flag() {
        let wasm = wat::parse_str(ECHO).unwrap();
        let mut cfg = config("echo");
        cfg.allow_partial_tool_calls = true;
        cfg.chain_next_response = false;
        let tool = ScriptTool::from_bytes_with_policy(
            cfg,
            &wasm,
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
        )
        .unwrap();
        assert!(tool.allow_partial_tool_calls());
        assert!(!tool.chain_next_response(&ToolParams::new(), &ToolOutput::new(Value::Null)));

        let params = json!({"query": "ru"}).as_object().cloned().unwrap();
        let rendered = tool
            .partial_invoke(&params, &ToolContext::default())
            .await
            .unwrap();
        assert!(rendered.contains("\"ru\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_surfaces_as_tool_error() {
        let wasm = wat::parse_str(SPIN).unwrap();
        let mut cfg = config("spin");
        cfg.quota = Some(ExecutionQuota {
            timeout_ms: 30,
            ..Default::default()
        });
        let tool = ScriptTool::from_bytes_with_policy(
            cfg,
            &wasm,
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
        )
        .unwrap();
        let err = tool
            .invoke(&ToolParams::new(), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_ms: 30, .. }));
    }

    #[test]
    fn strict_policy_rejects_ungranted_capabilities() {
        let wasm = wat::parse_str(ECHO).unwrap();
        let mut cfg = config("fetcher");
        cfg.capabilities = vec![HostCapability::Http];
        let err = ScriptTool::from_bytes_with_policy(
            cfg,
            &wasm,
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn quota_is_clamped_to_ceiling() {
        let wasm = wat::parse_str(ECHO).unwrap();
        let mut cfg = config("greedy");
        cfg.quota = Some(ExecutionQuota {
            timeout_ms: 600_000,
            max_http_calls: 10_000,
            ..Default::default()
        });
        let policy = SandboxPolicy::default();
        let tool = ScriptTool::from_bytes_with_policy(
            cfg,
            &wasm,
            &policy,
            &ExecutionQuota::default(),
        )
        .unwrap();
        assert_eq!(tool.quota().timeout_ms, policy.ceiling.timeout_ms);
        assert_eq!(tool.quota().max_http_calls, policy.ceiling.max_http_calls);
    }

    #[test]
    fn invalid_module_is_rejected() {
        let err = ScriptTool::from_bytes_with_policy(
            config("broken"),
            b"not wasm",
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[test]
    fn loads_tools_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.wasm"), wat::parse_str(ECHO).unwrap()).unwrap();
        std::fs::write(
            dir.path().join("echo.tool.json"),
            serde_json::to_string(&config("echo")).unwrap(),
        )
        .unwrap();
        // Missing module: logged and skipped.
        std::fs::write(
            dir.path().join("ghost.tool.json"),
            serde_json::to_string(&config("ghost")).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let tools = load_script_tools_from_dir(
            dir.path(),
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
            None,
        );
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "echo");
    }

    #[test]
    fn missing_directory_yields_no_tools() {
        let tools = load_script_tools_from_dir(
            Path::new("/nonexistent/agora/tools"),
            &SandboxPolicy::default(),
            &ExecutionQuota::default(),
            None,
        );
        assert!(tools.is_empty());
    }

    #[test]
    fn errors_carry_quota_kind() {
        let err = crate::engine::SandboxError::QuotaExceeded {
            kind: QuotaKind::HttpCalls,
            detail: "21 > 20".into(),
        }
        .into_tool_error("fetcher");
        assert!(err.to_string().contains("fetcher"));
    }
}
