// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestrator scenarios driven by real `/bin/sh` workers.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use autobuild_core::application::{
    Orchestrator, OrchestratorError, RunOutcome, RunReport, Supervisor, SupervisorConfig,
};
use autobuild_core::domain::events::ObservationMessage;
use autobuild_core::domain::node_config::{RunnerConfig, SchedulingConfig};
use autobuild_core::domain::repository::WorkItemRepository;
use autobuild_core::domain::work_item::{DependencyRef, NewWorkItem, WorkItemStatus};
use autobuild_core::domain::worker::{RoleKind, WorkerState};
use autobuild_core::infrastructure::repositories::InMemoryWorkItemRepository;
use autobuild_core::infrastructure::{EventBus, EventReceiver};
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: tempfile::TempDir,
    repository: Arc<InMemoryWorkItemRepository>,
    events: EventBus,
    scheduling: SchedulingConfig,
    program: String,
}

impl Harness {
    fn new(max_parallel_agents: usize) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            repository: Arc::new(InMemoryWorkItemRepository::new()),
            events: EventBus::new(4096),
            scheduling: SchedulingConfig {
                max_parallel_agents,
                max_total_agents: 10,
                fast_path: true,
                poll_interval_ms: 20,
                shutdown_grace_ms: 500,
                ..SchedulingConfig::default()
            },
            program: "sh".to_string(),
        }
    }

    async fn items(&self, items: Vec<NewWorkItem>) {
        self.repository.create_bulk(items).await.unwrap();
    }

    fn orchestrator(&self, script: &str) -> Result<Orchestrator, OrchestratorError> {
        let supervisor = Supervisor::new(
            SupervisorConfig {
                runner: RunnerConfig {
                    program: self.program.clone(),
                    args: vec!["-c".to_string(), script.to_string()],
                    env: Default::default(),
                },
                project_dir: self.dir.path().to_path_buf(),
                database_path: self.dir.path().join("features.db"),
                failure_codes: self.scheduling.reported_failure_codes.clone(),
                shutdown_grace: Duration::from_millis(self.scheduling.shutdown_grace_ms),
            },
            self.events.clone(),
        );
        Orchestrator::new(
            self.repository.clone(),
            supervisor,
            self.events.clone(),
            self.scheduling.clone(),
        )
    }

    async fn run(&self, script: &str) -> (RunReport, Vec<ObservationMessage>) {
        let mut rx: EventReceiver = self.events.subscribe();
        let report = tokio::time::timeout(
            Duration::from_secs(30),
            self.orchestrator(script).unwrap().run(CancellationToken::new()),
        )
        .await
        .expect("run did not finish")
        .unwrap();
        (report, rx.drain())
    }
}

fn backlog(n: usize) -> Vec<NewWorkItem> {
    (0..n).map(|i| NewWorkItem::new("functional", format!("feature {}", i))).collect()
}

/// Highest number of simultaneously running workers of `role`, replayed
/// from lifecycle updates.
fn peak_live(messages: &[ObservationMessage], role: Option<RoleKind>) -> usize {
    let (mut live, mut peak) = (0usize, 0usize);
    for message in messages {
        if let ObservationMessage::AgentUpdate { role: r, state, .. } = message {
            if role.is_some_and(|wanted| wanted != *r) {
                continue;
            }
            match state {
                WorkerState::Running => live += 1,
                s if s.is_terminal() => live -= 1,
                _ => {}
            }
            peak = peak.max(live);
        }
    }
    peak
}

#[tokio::test]
async fn test_concurrency_limit_holds_third_claim_until_slot_frees() {
    let harness = Harness::new(2);
    harness.items(backlog(3)).await;

    let (report, messages) = harness.run("sleep 0.3; exit 0").await;

    assert_eq!(report.outcome, RunOutcome::AllPassing);
    assert_eq!(report.stats.passing, 3);
    assert_eq!(report.summary.coding_spawned, 3);
    assert_eq!(peak_live(&messages, Some(RoleKind::Coding)), 2);

    let claims: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            matches!(m, ObservationMessage::FeatureUpdate { status: WorkItemStatus::Claimed, .. })
        })
        .map(|(i, _)| i)
        .collect();
    let first_completion = messages
        .iter()
        .position(|m| {
            matches!(m, ObservationMessage::AgentUpdate { state: WorkerState::Completed, .. })
        })
        .unwrap();
    assert_eq!(claims.len(), 3);
    assert!(claims[1] < first_completion);
    assert!(claims[2] > first_completion);
}

#[tokio::test]
async fn test_total_ceiling_bounds_mixed_roles() {
    let mut harness = Harness::new(2);
    harness.scheduling.max_total_agents = 2;
    harness.scheduling.fast_path = false;
    harness.scheduling.regression_sample_size = 2;
    harness.items(backlog(4)).await;

    let (report, messages) = harness.run("sleep 0.2").await;

    assert_eq!(report.outcome, RunOutcome::AllPassing);
    assert!(report.summary.verification_spawned >= 1);
    assert!(peak_live(&messages, None) <= 2);
}

#[tokio::test]
async fn test_crash_releases_claim_for_retry() {
    let harness = Harness::new(1);
    harness.items(backlog(1)).await;

    // first attempt dies by signal, the retry succeeds
    let (report, messages) = harness
        .run("if [ -f crashed ]; then exit 0; fi; touch crashed; kill -9 $$")
        .await;

    assert_eq!(report.outcome, RunOutcome::AllPassing);
    assert_eq!(report.summary.crashed, 1);
    assert_eq!(report.summary.completed, 1);

    let statuses: Vec<WorkItemStatus> = messages
        .iter()
        .filter_map(|m| match m {
            ObservationMessage::FeatureUpdate { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            WorkItemStatus::Claimed,
            WorkItemStatus::Pending,
            WorkItemStatus::Claimed,
            WorkItemStatus::Passing,
        ]
    );

    let item = harness.repository.list().await.unwrap().remove(0);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.claimed_by, None);
}

#[tokio::test]
async fn test_repeated_failures_abandon_item_and_block_dependents() {
    let mut harness = Harness::new(2);
    harness.scheduling.max_attempts = 2;
    harness
        .items(vec![
            NewWorkItem::new("functional", "A"),
            NewWorkItem::new("functional", "B").depends_on(DependencyRef::Batch(0)),
        ])
        .await;

    let (report, _) = harness.run("exit 2").await;

    assert_eq!(report.outcome, RunOutcome::Blocked);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.summary.abandoned, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.pending, 1);
}

#[tokio::test]
async fn test_stop_terminates_workers_and_releases_claims() {
    let harness = Harness::new(2);
    harness.items(backlog(2)).await;
    let orchestrator = harness.orchestrator("exec sleep 30").unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert_eq!(report.summary.released_on_shutdown, 2);
    assert_eq!(report.stats.claimed, 0);
    assert_eq!(report.stats.pending, 2);
}

#[tokio::test]
async fn test_clean_exit_after_stop_releases_instead_of_passing() {
    let harness = Harness::new(1);
    harness.items(backlog(1)).await;
    let orchestrator = harness.orchestrator("trap 'exit 0' TERM; sleep 30 & wait").unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert_eq!(report.summary.completed, 0);
    assert_eq!(report.summary.released_on_shutdown, 1);
    assert_eq!(report.stats.passing, 0);
    assert_eq!(report.stats.pending, 1);
}

#[tokio::test]
async fn test_spawn_failure_halts_and_releases_claim() {
    let mut harness = Harness::new(2);
    harness.program = harness.dir.path().join("no-such-runner").display().to_string();
    harness.items(backlog(2)).await;

    let (report, _) = harness.run("exit 0").await;

    assert_eq!(report.outcome, RunOutcome::SpawnCapacityExhausted);
    assert!(report.summary.spawn_error.is_some());
    assert_eq!(report.summary.coding_spawned, 0);
    assert_eq!(report.stats.pending, 2);
    assert_eq!(report.stats.claimed, 0);
}

#[tokio::test]
async fn test_orphaned_claims_recovered_before_scheduling() {
    let harness = Harness::new(1);
    harness.items(backlog(1)).await;
    harness.repository.claim_next("previous-run").await.unwrap();

    let (report, _) = harness.run("exit 0").await;

    assert_eq!(report.summary.recovered_claims, 1);
    assert_eq!(report.outcome, RunOutcome::AllPassing);
}

#[test]
fn test_bounds_rejected_at_construction() {
    let mut harness = Harness::new(4);
    harness.scheduling.max_total_agents = 3;
    assert!(matches!(
        harness.orchestrator("exit 0"),
        Err(OrchestratorError::InvalidBounds(_))
    ));
}
