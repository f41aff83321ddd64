// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Work item store commands
//!
//! Commands: add, import, list, show, next, claim, pass, fail, skip,
//! release, depend, undepend, stats, regression, recover
//!
//! Session runners use `claim`, `pass` and `fail` to report progress on
//! their own; operators use the rest.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;

use autobuild_core::domain::repository::WorkItemRepository;
use autobuild_core::domain::work_item::{
    ClaimOutcome, DependencyRef, NewWorkItem, NextItem, WorkItem, WorkItemId, WorkItemStatus,
};

use super::ProjectContext;

#[derive(Subcommand)]
pub enum FeatureCommand {
    /// Add a single work item
    Add {
        #[arg(long)]
        category: String,

        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Execution step (repeatable, kept in order)
        #[arg(long = "step", value_name = "STEP")]
        steps: Vec<String>,

        /// Lower runs first (default: after everything else)
        #[arg(long)]
        priority: Option<i64>,

        /// Existing prerequisite id (repeatable)
        #[arg(long = "depends-on", value_name = "ID")]
        depends_on: Vec<i64>,
    },

    /// Import a JSON array of work items in one transaction ("-" for stdin)
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List work items in scheduling order
    List {
        #[arg(long)]
        status: Option<WorkItemStatus>,

        #[arg(long)]
        json: bool,
    },

    /// Show one work item with its prerequisites
    Show {
        id: i64,

        #[arg(long)]
        json: bool,
    },

    /// Show the next ready item without claiming it
    Next {
        #[arg(long)]
        json: bool,
    },

    /// Claim the next ready item
    Claim {
        /// Claimant identity (default: $AUTOBUILD_WORKER_ID)
        #[arg(long, env = "AUTOBUILD_WORKER_ID")]
        worker: String,

        #[arg(long)]
        json: bool,
    },

    /// Mark a claimed item passing
    Pass { id: i64 },

    /// Return a passing item to pending after a failed re-verification
    Fail { id: i64 },

    /// Move an item to the back of the queue, releasing its claim
    Skip { id: i64 },

    /// Release a claim held under TOKEN
    Release {
        id: i64,

        #[arg(long)]
        token: i64,
    },

    /// Add a dependency edge: DEPENDENT waits for PREREQUISITE
    Depend { dependent: i64, prerequisite: i64 },

    /// Remove a dependency edge
    Undepend { dependent: i64, prerequisite: i64 },

    /// Counts by status
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Sample passing items for re-verification
    Regression {
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,

        #[arg(long)]
        json: bool,
    },

    /// Reset orphaned claims to pending
    Recover,
}

pub async fn handle_command(command: FeatureCommand, context: &ProjectContext) -> Result<()> {
    let store = context.open_store().await?;
    let store = store.as_ref();

    match command {
        FeatureCommand::Add { category, name, description, steps, priority, depends_on } => {
            let mut item = NewWorkItem::new(category, name)
                .with_description(description)
                .with_steps(steps);
            item.priority = priority;
            for id in depends_on {
                item = item.depends_on(DependencyRef::Existing(WorkItemId(id)));
            }
            let created = store.create_bulk(vec![item]).await?;
            for item in &created {
                println!("{}", format!("✓ Added {} {}", item.id, item.name).green());
            }
        }
        FeatureCommand::Import { file } => {
            let items = read_batch(&file)?;
            let created = store.create_bulk(items).await?;
            println!("{}", format!("✓ Imported {} work item(s)", created.len()).green());
        }
        FeatureCommand::List { status, json } => {
            let items: Vec<WorkItem> = store
                .list()
                .await?
                .into_iter()
                .filter(|item| status.is_none_or(|s| item.status == s))
                .collect();
            if json {
                return print_json(&items);
            }
            if items.is_empty() {
                println!("{}", "No work items".dimmed());
            }
            for item in &items {
                print_row(item);
            }
        }
        FeatureCommand::Show { id, json } => show(store, WorkItemId(id), json).await?,
        FeatureCommand::Next { json } => {
            let next = store.get_next().await?;
            if json {
                return print_json(&next);
            }
            match next {
                NextItem::Ready { item } => print_row(&item),
                NextItem::Blocked { pending } => println!(
                    "{}",
                    format!("No ready items: {} pending, all waiting on prerequisites", pending)
                        .yellow()
                ),
                NextItem::Exhausted => println!("{}", "No pending items".green()),
            }
        }
        FeatureCommand::Claim { worker, json } => {
            let outcome = store.claim_next(&worker).await?;
            if json {
                return print_json(&outcome);
            }
            match outcome {
                ClaimOutcome::Claimed(claim) => {
                    println!("{}", format!("✓ Claimed {} (token {})", claim.item.id, claim.token).green());
                    print_row(&claim.item);
                }
                ClaimOutcome::NoneAvailable { reason } => {
                    println!("{}", format!("Nothing to claim ({:?})", reason).yellow())
                }
            }
        }
        FeatureCommand::Pass { id } => {
            let item = store.mark_passing(WorkItemId(id)).await?;
            println!("{}", format!("✓ {} is passing", item.id).green());
        }
        FeatureCommand::Fail { id } => {
            let item = store.mark_failing(WorkItemId(id)).await?;
            println!("{}", format!("{} returned to pending", item.id).yellow());
        }
        FeatureCommand::Skip { id } => {
            let item = store.skip(WorkItemId(id)).await?;
            println!("{} moved to the back of the queue (priority {})", item.id, item.priority);
        }
        FeatureCommand::Release { id, token } => {
            if store.release_claim(WorkItemId(id), token).await? {
                println!("{}", format!("✓ Released claim on #{}", id).green());
            } else {
                println!("{}", format!("No live claim on #{} with token {}", id, token).yellow());
            }
        }
        FeatureCommand::Depend { dependent, prerequisite } => {
            store
                .add_dependency(WorkItemId(dependent), WorkItemId(prerequisite))
                .await?;
            println!("{}", format!("✓ #{} now depends on #{}", dependent, prerequisite).green());
        }
        FeatureCommand::Undepend { dependent, prerequisite } => {
            let removed = store
                .remove_dependency(WorkItemId(dependent), WorkItemId(prerequisite))
                .await?;
            if removed {
                println!("{}", format!("✓ Removed #{} -> #{}", dependent, prerequisite).green());
            } else {
                println!("{}", "No such dependency".yellow());
            }
        }
        FeatureCommand::Stats { json } => {
            let stats = store.get_stats().await?;
            if json {
                return print_json(&stats);
            }
            println!(
                "{}/{} passing ({:.1}%)",
                stats.passing,
                stats.total,
                stats.percentage()
            );
            println!("  pending: {}", stats.pending);
            println!("  claimed: {}", stats.claimed);
            println!("  skipped: {}", stats.skipped);
        }
        FeatureCommand::Regression { count, json } => {
            let sample = store.get_for_regression(count).await?;
            if json {
                return print_json(&sample);
            }
            for item in &sample {
                print_row(item);
            }
        }
        FeatureCommand::Recover => {
            let count = store.recover_orphaned_claims().await?;
            println!("Reset {} orphaned claim(s)", count);
        }
    }
    Ok(())
}

async fn show(store: &dyn WorkItemRepository, id: WorkItemId, json: bool) -> Result<()> {
    let item = store.get(id).await?;
    let prerequisites: Vec<WorkItemId> = store
        .edges()
        .await?
        .into_iter()
        .filter(|edge| edge.dependent == id)
        .map(|edge| edge.prerequisite)
        .collect();

    if json {
        #[derive(Serialize)]
        struct Detail<'a> {
            #[serde(flatten)]
            item: &'a WorkItem,
            depends_on: &'a [WorkItemId],
        }
        return print_json(&Detail { item: &item, depends_on: &prerequisites });
    }

    print_row(&item);
    if !item.description.is_empty() {
        println!("  {}", item.description);
    }
    for (n, step) in item.steps.iter().enumerate() {
        println!("  {}. {}", n + 1, step);
    }
    if !prerequisites.is_empty() {
        let ids: Vec<String> = prerequisites.iter().map(|p| p.to_string()).collect();
        println!("  depends on: {}", ids.join(", "));
    }
    if let Some(worker) = &item.claimed_by {
        println!("  claimed by: {}", worker);
    }
    Ok(())
}

fn read_batch(file: &PathBuf) -> Result<Vec<NewWorkItem>> {
    let content = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?
    };
    serde_json::from_str(&content).context("Expected a JSON array of work items")
}

fn status_label(status: WorkItemStatus) -> ColoredString {
    match status {
        WorkItemStatus::Pending => status.as_str().normal(),
        WorkItemStatus::Claimed => status.as_str().cyan(),
        WorkItemStatus::Passing => status.as_str().green(),
        WorkItemStatus::Skipped => status.as_str().yellow(),
    }
}

fn print_row(item: &WorkItem) {
    println!(
        "{:>5}  {:<8} p{:<4} [{}] {}",
        item.id.to_string(),
        status_label(item.status),
        item.priority,
        item.category.dimmed(),
        item.name.bold()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
