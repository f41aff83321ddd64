// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use autobuild_core::domain::node_config::OrchestratorConfigManifest;
use autobuild_core::infrastructure::policy_loader::PolicyLoader;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration and command policy files
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./autobuild-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
    project_dir: PathBuf,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override), project_dir),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AUTOBUILD_CONFIG_PATH: {}",
            std::env::var("AUTOBUILD_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./autobuild-config.yaml");
        println!("  4. ~/.autobuild/config.yaml");
        println!("  5. /etc/autobuild/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let sched = &config.spec.orchestrator;
    println!("{}", "Scheduling:".bold());
    println!("  Parallel agents: {}", sched.max_parallel_agents);
    println!("  Total agents: {}", sched.max_total_agents);
    println!(
        "  Verification: {}",
        if sched.fast_path { "off (fast path)".yellow() } else { "on".green() }
    );
    println!("  Regression sample: {}", sched.regression_sample_size);
    println!("  Max attempts: {}", sched.max_attempts);
    println!("  Poll interval: {}ms", sched.poll_interval_ms);
    println!("  Shutdown grace: {}ms", sched.shutdown_grace_ms);
    println!();

    let runner = &config.spec.runner;
    println!("{}", "Session runner:".bold());
    println!("  Command: {} {}", runner.program, runner.args.join(" "));
    if !runner.env.is_empty() {
        println!("  Env: {} variable(s)", runner.env.len());
    }
    println!();

    println!("{}", "Database:".bold());
    println!("  Path: {}", config.spec.database.path.display());
    println!();

    println!("{}", "Logging:".bold());
    println!("  Level: {}", config.spec.observability.logging.level);
    println!("  Format: {}", config.spec.observability.logging.format);

    Ok(())
}

fn validate(config_path: Option<PathBuf>, project_dir: PathBuf) -> Result<()> {
    println!("Validating configuration...");

    let config = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    println!("{}", "✓ Configuration is valid".green());

    PolicyLoader::from_config(&config.spec.policy, &project_dir)
        .load()
        .context("Command policy validation failed")?;
    println!("{}", "✓ Command policy is valid".green());

    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    OrchestratorConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
