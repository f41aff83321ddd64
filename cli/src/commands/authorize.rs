// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pre-execution hook for session runners.
//!
//! `autobuild authorize -- <command line>` exits 0 when the command may run
//! and 1 when it is denied, printing the reason on stderr.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::debug;

use autobuild_core::domain::command_policy::{authorize, Decision};
use autobuild_core::infrastructure::policy_loader::PolicyLoader;

use super::ProjectContext;

#[derive(Args)]
pub struct AuthorizeCommand {
    /// Print the decision as JSON
    #[arg(long)]
    json: bool,

    /// Command line to check; quote it or pass it after `--`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Returns the process exit code.
pub fn execute(command: AuthorizeCommand, context: &ProjectContext) -> Result<i32> {
    let bundle = PolicyLoader::from_config(&context.config.spec.policy, &context.project_dir)
        .load()
        .context("Failed to load command policy")?;

    let line = command.command.join(" ");
    let decision = authorize(&line, &bundle);
    debug!(command = %line, allowed = decision.is_allowed(), "authorization decision");

    if command.json {
        println!("{}", serde_json::to_string(&decision)?);
    } else if let Decision::Deny(reason) = &decision {
        eprintln!("{} {}", "denied:".red().bold(), reason);
    }

    Ok(if decision.is_allowed() { 0 } else { 1 })
}
