//! `agora tool`: run and inspect script tools outside a conversation.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_config::AppConfig;
use agora_core::{ProgressReporter, Tool, ToolCall, ToolContext, ToolParams, ToolRegistry};
use agora_sandbox::{
    HttpClient, ReqwestHttpClient, SandboxPolicy, ScriptTool, ScriptToolConfig, load_manifest,
    load_script_tools_from_dir,
};

fn http_client(config: &AppConfig) -> Result<Arc<dyn HttpClient>, Box<dyn std::error::Error>> {
    let client = ReqwestHttpClient::new(
        Duration::from_secs(config.sandbox.http_timeout_secs),
        config.sandbox.max_response_bytes,
    )?;
    Ok(Arc::new(client))
}

fn load(
    config: &AppConfig,
    manifest: &Path,
) -> Result<(ScriptToolConfig, ScriptTool), Box<dyn std::error::Error>> {
    let policy = SandboxPolicy::from_config(&config.sandbox);
    let tool_config = load_manifest(manifest)?;
    let tool = ScriptTool::from_config_with_policy(
        tool_config.clone(),
        &policy,
        &config.sandbox.default_quota,
    )?
    .with_http_client(http_client(config)?);
    Ok((tool_config, tool))
}

/// Parse `--args`; absent means no arguments.
fn parse_args(raw: Option<&str>) -> Result<ToolParams, Box<dyn std::error::Error>> {
    match raw {
        None => Ok(ToolParams::new()),
        Some(raw) => match serde_json::from_str(raw)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(format!("--args must be a JSON object, got {other}").into()),
        },
    }
}

pub async fn run(
    config: &AppConfig,
    manifest: &Path,
    args: Option<&str>,
    partial: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, tool) = load(config, manifest)?;
    let call = ToolCall {
        id: "cli".into(),
        name: tool.name().to_string(),
        arguments: parse_args(args)?,
        partial,
    };

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(tool));
    let ctx = ToolContext {
        feature_name: "cli".into(),
        progress: ProgressReporter::new(|text| eprintln!("   … {text}")),
        ..Default::default()
    };
    let mut instance = registry.resolve(&call, &ctx, None)?;

    if partial {
        match instance.render_partial().await {
            Some(rendered) => println!("{rendered}"),
            None => println!("(no partial rendering)"),
        }
        return Ok(());
    }

    let started = Instant::now();
    match instance.invoke().await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(raw) = instance.custom_raw() {
                println!();
                println!("{raw}");
            }
            eprintln!(
                "✅ {} completed in {}ms (chain: {})",
                call.name,
                started.elapsed().as_millis(),
                instance.chain_next_response()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {e}");
            Err(e.into())
        }
    }
}

pub fn inspect(config: &AppConfig, manifest: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (tool_config, tool) = load(config, manifest)?;

    println!("🔧 {}", tool.name());
    println!("   {}", tool.signature().description);
    println!();
    println!("   Script:        {}", tool_config.script_path.display());
    let capabilities: Vec<String> = tool.capabilities().iter().map(|c| c.to_string()).collect();
    println!(
        "   Capabilities:  {}",
        if capabilities.is_empty() {
            "(none)".to_string()
        } else {
            capabilities.join(", ")
        }
    );
    println!("   Chains:        {}", tool_config.chain_next_response);
    println!("   Partial calls: {}", tool.allow_partial_tool_calls());

    let quota = tool.quota();
    println!();
    println!("   Quota:");
    println!("     timeout:       {}ms", quota.timeout_ms);
    println!("     memory:        {} bytes", quota.max_memory_bytes);
    println!("     http calls:    {}", quota.max_http_calls);
    println!(
        "     sleep:         {} calls, {}ms each",
        quota.max_sleep_calls, quota.max_sleep_ms
    );
    println!("     marshal depth: {}", quota.max_marshal_depth);
    if quota.max_fuel > 0 {
        println!("     fuel:          {}", quota.max_fuel);
    }

    println!();
    println!("   Parameters:");
    println!(
        "{}",
        serde_json::to_string_pretty(&tool.signature().json_schema())?
    );
    if !tool.options().is_empty() {
        println!();
        println!("   Options:");
        for option in tool.options() {
            println!("     {}: {}", option.name, option.description);
        }
    }
    Ok(())
}

pub fn list(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = &config.sandbox.tools_dir else {
        println!("No sandbox.tools_dir configured");
        return Ok(());
    };
    let policy = SandboxPolicy::from_config(&config.sandbox);
    let tools = load_script_tools_from_dir(
        dir,
        &policy,
        &config.sandbox.default_quota,
        Some(http_client(config)?),
    );

    println!("🔧 {} script tool(s) in {}", tools.len(), dir.display());
    for tool in &tools {
        println!("   {:<20} {}", tool.name(), tool.signature().description);
    }
    Ok(())
}
