// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # autobuild CLI
//!
//! The `autobuild` binary drives a project's feature backlog with parallel
//! session runner processes.
//!
//! ## Commands
//!
//! - `autobuild run` - Orchestrate workers until the backlog is done
//! - `autobuild feature add|import|list|show|next|claim|pass|fail|skip|...` - Work item store
//! - `autobuild authorize -- <command>` - Command policy hook for session runners
//! - `autobuild config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use autobuild_cli::commands::{
    self, AuthorizeCommand, ConfigCommand, FeatureCommand, ProjectContext, RunCommand,
};
use autobuild_core::domain::node_config::OrchestratorConfigManifest;

/// autobuild - parallel feature backlog orchestrator
#[derive(Parser)]
#[command(name = "autobuild")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AUTOBUILD_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Project directory the backlog belongs to
    #[arg(
        short,
        long,
        global = true,
        env = "AUTOBUILD_PROJECT_DIR",
        default_value = ".",
        value_name = "DIR"
    )]
    project_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long, global = true, env = "AUTOBUILD_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until the backlog is finished or blocked
    #[command(name = "run")]
    Run(RunCommand),

    /// Work item store operations
    #[command(name = "feature")]
    Feature {
        #[command(subcommand)]
        command: FeatureCommand,
    },

    /// Check a shell command against the command policy
    #[command(name = "authorize")]
    Authorize(AuthorizeCommand),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        eprintln!("{}", "No command specified. Use --help for usage.".yellow());
        std::process::exit(1);
    };

    if let Commands::Config { command } = command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
        return commands::config::handle_command(command, cli.config, cli.project_dir).await;
    }

    let config = OrchestratorConfigManifest::load_or_default(cli.config)
        .context("Failed to load configuration")?;
    let logging = &config.spec.observability.logging;
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format)?;

    let context = ProjectContext::new(config, &cli.project_dir)?;
    let code = match command {
        Commands::Run(command) => commands::run::execute(command, context).await?,
        Commands::Feature { command } => {
            commands::feature::handle_command(command, &context).await?;
            0
        }
        Commands::Authorize(command) => commands::authorize::execute(command, &context)?,
        Commands::Config { .. } => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
