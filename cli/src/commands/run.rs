// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `autobuild run` - drive the backlog to completion with parallel workers.
//!
//! Ctrl+C or SIGTERM stops new claims, terminates running workers and
//! releases their claims before exiting.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autobuild_core::application::{
    Orchestrator, RunOutcome, RunReport, Supervisor, SupervisorConfig,
};
use autobuild_core::domain::events::{ObservationMessage, StatusKind};
use autobuild_core::domain::node_config::PARALLEL_AGENTS_CEILING;
use autobuild_core::infrastructure::event_bus::{EventBus, EventBusError, EventReceiver};

use super::ProjectContext;

#[derive(Args)]
pub struct RunCommand {
    /// Override spec.orchestrator.max_parallel_agents
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=PARALLEL_AGENTS_CEILING as i64))]
    max_parallel: Option<u8>,

    /// Skip verification passes
    #[arg(long)]
    fast_path: bool,

    /// Print observation messages as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Only print the final summary
    #[arg(short, long)]
    quiet: bool,
}

/// Returns the process exit code: 0 when everything passes.
pub async fn execute(command: RunCommand, mut context: ProjectContext) -> Result<i32> {
    let sched = &mut context.config.spec.orchestrator;
    if let Some(n) = command.max_parallel {
        sched.max_parallel_agents = usize::from(n);
    }
    if command.fast_path {
        sched.fast_path = true;
    }
    context.config.validate().context("Invalid configuration")?;

    let spec = &context.config.spec;
    let store = context.open_store().await?;
    let events = EventBus::new(spec.observability.event_capacity);
    let supervisor = Supervisor::new(
        SupervisorConfig::from_spec(spec, &context.project_dir),
        events.clone(),
    );
    let orchestrator =
        Orchestrator::new(store, supervisor, events.clone(), spec.orchestrator.clone())?;

    info!(
        run_id = orchestrator.run_id(),
        project = %context.project_dir.display(),
        "starting run"
    );

    let printer = (!command.quiet).then(|| {
        tokio::spawn(print_observations(events.subscribe(), command.json))
    });

    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(cancel.clone()));

    let report = orchestrator.run(cancel).await?;
    drop(events);
    if let Some(printer) = printer {
        // the printer ends once every sender is gone
        let _ = printer.await;
    }

    print_report(&report, command.json)?;
    Ok(match report.outcome {
        RunOutcome::AllPassing => 0,
        RunOutcome::Stopped => 130,
        RunOutcome::Blocked | RunOutcome::SpawnCapacityExhausted => 1,
    })
}

async fn stop_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal, stopping"),
        _ = terminate => info!("Received SIGTERM signal, stopping"),
    }
    cancel.cancel();
}

async fn print_observations(mut receiver: EventReceiver, json: bool) {
    loop {
        let message = match receiver.recv().await {
            Ok(message) => message,
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => return,
        };

        if json {
            if let Ok(line) = serde_json::to_string(&message) {
                println!("{}", line);
            }
            continue;
        }

        match message {
            ObservationMessage::AgentStatus { worker, status, line, .. } => {
                let tag = match status {
                    StatusKind::Success => "success".green(),
                    StatusKind::Error => "error".red(),
                    StatusKind::Testing => "testing".cyan(),
                    StatusKind::Working => "working".blue(),
                    StatusKind::Thinking => "thinking".dimmed(),
                };
                println!("{} {:<8} {}", worker.to_string().bold(), tag, line);
            }
            ObservationMessage::Log { worker, line, .. } => {
                println!("{} {}", worker.to_string().dimmed(), line);
            }
            ObservationMessage::FeatureUpdate { item_id, status, worker } => {
                let by = worker.map(|w| format!(" ({})", w)).unwrap_or_default();
                println!("{} {} -> {}{}", "item".magenta(), item_id, status, by);
            }
            ObservationMessage::AgentUpdate { worker, role, state, item_id, exit } => {
                let item = item_id.map(|id| format!(" {}", id)).unwrap_or_default();
                let exit = exit.map(|e| format!(" [{}]", e)).unwrap_or_default();
                println!("{} {} {}{}{}", worker.to_string().bold(), role, state, item, exit);
            }
            ObservationMessage::Progress(progress) => {
                println!(
                    "{} {}/{} passing ({:.1}%)",
                    "progress".bold(),
                    progress.stats.passing,
                    progress.stats.total,
                    progress.percentage
                );
            }
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!();
    let headline = match report.outcome {
        RunOutcome::AllPassing => "✓ All work items passing".green(),
        RunOutcome::Blocked => "Run finished with blocked or abandoned items".yellow(),
        RunOutcome::Stopped => "Run stopped".yellow(),
        RunOutcome::SpawnCapacityExhausted => "Run halted: could not spawn workers".red(),
    };
    println!("{}", headline.bold());

    let s = &report.summary;
    println!(
        "  {}/{} passing, {} pending, {} skipped",
        report.stats.passing, report.stats.total, report.stats.pending, report.stats.skipped
    );
    println!(
        "  workers: {} coding, {} verification",
        s.coding_spawned, s.verification_spawned
    );
    println!(
        "  outcomes: {} completed, {} failed, {} crashed, {} abandoned",
        s.completed, s.failed, s.crashed, s.abandoned
    );
    if s.regressions_reported > 0 {
        println!("  verification problems: {}", s.regressions_reported);
    }
    if s.recovered_claims > 0 {
        println!("  recovered orphaned claims: {}", s.recovered_claims);
    }
    if let Some(error) = &s.spawn_error {
        println!("  {} {}", "spawn error:".red(), error);
    }
    Ok(())
}
