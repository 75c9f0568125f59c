//! `agora config`: configuration management commands.

use std::path::Path;

use agora_config::{AppConfig, ConfigError};

pub fn validate(
    path: &Path,
    loaded: Result<AppConfig, ConfigError>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating {}...", path.display());

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let mut warnings = Vec::new();
    if !path.exists() {
        warnings.push("No config file found, using defaults".to_string());
    }
    if !config.sandbox.strict {
        warnings.push(
            "sandbox.strict = false: tools requesting ungranted capabilities still load"
                .to_string(),
        );
    }
    if config.sandbox.default_quota.timeout_ms == 0 {
        warnings.push("sandbox.default_quota.timeout_ms = 0 disables the watchdog".to_string());
    }
    if let Some(dir) = &config.sandbox.tools_dir {
        if !dir.is_dir() {
            warnings.push(format!("sandbox.tools_dir {} is not a directory", dir.display()));
        }
    }

    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    let quota = &config.sandbox.default_quota;
    println!();
    println!("   Completions:  {}", config.bot.max_completions);
    println!("   Temperature:  {}", config.llm.temperature);
    println!(
        "   Script quota: {}ms, {} HTTP calls, {} bytes",
        quota.timeout_ms, quota.max_http_calls, quota.max_memory_bytes
    );
    println!("   Log level:    {}", config.logging.level);

    Ok(())
}

pub fn show(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(path: &Path) {
    println!("{}", path.display());
}
