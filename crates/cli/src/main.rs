//! Agora CLI, the operator entry point.
//!
//! Commands:
//! - `tool run`       : run a script tool once under its quota
//! - `tool inspect`   : show a script tool's schema, capabilities and quota
//! - `tool list`      : list the tools in the configured tools directory
//! - `config show`    : print the effective configuration
//! - `config validate`: check the configuration file
//! - `config path`    : print the configuration file path

use std::path::PathBuf;

use agora_config::AppConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "agora",
    about = "Agora: conversational agent runtime with sandboxed script tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ~/.agora/config.toml)
    #[arg(short, long, global = true, env = "AGORA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect script tools
    Tool {
        #[command(subcommand)]
        action: ToolAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ToolAction {
    /// Invoke a script tool once
    Run {
        /// Path to the `<name>.tool.json` manifest
        manifest: PathBuf,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,

        /// Render the call as partial instead of invoking it
        #[arg(long)]
        partial: bool,
    },

    /// Show a script tool's schema, capabilities and effective quota
    Inspect {
        /// Path to the `<name>.tool.json` manifest
        manifest: PathBuf,
    },

    /// List script tools in the configured tools directory
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

fn init_tracing(level: &str, json: bool, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::config_path);
    let loaded = AppConfig::load_with_env(&config_path);
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging.level, logging.json, cli.verbose);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(loaded?)?,
            ConfigAction::Validate => commands::config_cmd::validate(&config_path, loaded)?,
            ConfigAction::Path => commands::config_cmd::path(&config_path),
        },
        Commands::Tool { action } => {
            let config = loaded?;
            match action {
                ToolAction::Run {
                    manifest,
                    args,
                    partial,
                } => commands::tool::run(&config, &manifest, args.as_deref(), partial).await?,
                ToolAction::Inspect { manifest } => commands::tool::inspect(&config, &manifest)?,
                ToolAction::List => commands::tool::list(&config)?,
            }
        }
    }

    Ok(())
}
