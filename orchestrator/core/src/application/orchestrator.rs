// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Orchestrator Control Loop
//!
//! One cooperative loop per project run. Each iteration:
//!
//! 1. counts live workers by role and fills free slots, coding first
//!    (`claim_next` then spawn), then queued verification passes
//! 2. decides whether the run is finished
//! 3. suspends until a worker exits, the poll interval elapses, or the
//!    cancellation token fires
//!
//! Bounds are re-checked before every single spawn: at most
//! `max_parallel_agents` coding workers, at most `max_parallel_agents`
//! verification workers, and at most `max_total_agents` workers overall.
//!
//! A spawn failure halts further spawning; workers already running are
//! drained normally. Store errors other than `NotFound` and
//! `InvalidTransition` end the run, and live workers are still terminated
//! with their claims released.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::supervisor::{ReapedWorker, Supervisor, SupervisorError};
use crate::domain::events::ObservationMessage;
use crate::domain::node_config::SchedulingConfig;
use crate::domain::repository::{StoreError, WorkItemRepository};
use crate::domain::work_item::{
    FailureDisposition, NextItem, QueueStats, WorkItemId, WorkItemStatus,
};
use crate::domain::worker::{RoleKind, WorkerId, WorkerRole, WorkerState};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("invalid scheduling bounds: {0}")]
    InvalidBounds(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every work item is passing.
    AllPassing,
    /// Nothing is running and nothing is ready: remaining items wait on
    /// prerequisites or were abandoned after exhausting their attempts.
    Blocked,
    /// Cancelled from outside.
    Stopped,
    /// A worker could not be spawned; the run drained and halted.
    SpawnCapacityExhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub recovered_claims: usize,
    pub coding_spawned: usize,
    pub verification_spawned: usize,
    pub completed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub abandoned: usize,
    pub regressions_reported: usize,
    pub released_on_shutdown: usize,
    pub spawn_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    pub stats: QueueStats,
}

pub struct Orchestrator {
    repository: Arc<dyn WorkItemRepository>,
    supervisor: Supervisor,
    events: EventBus,
    config: SchedulingConfig,
    run_id: String,
    queued_verifications: usize,
    spawn_halted: bool,
    summary: RunSummary,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn WorkItemRepository>,
        supervisor: Supervisor,
        events: EventBus,
        config: SchedulingConfig,
    ) -> Result<Self, OrchestratorError> {
        if config.max_parallel_agents == 0 {
            return Err(OrchestratorError::InvalidBounds(
                "max_parallel_agents must be at least 1".to_string(),
            ));
        }
        if config.max_parallel_agents > config.max_total_agents {
            return Err(OrchestratorError::InvalidBounds(format!(
                "max_parallel_agents ({}) exceeds max_total_agents ({})",
                config.max_parallel_agents, config.max_total_agents
            )));
        }

        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Ok(Self {
            repository,
            supervisor,
            events,
            config,
            run_id,
            queued_verifications: 0,
            spawn_halted: false,
            summary: RunSummary::default(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Claim identity recorded in the store for `worker`.
    fn claim_identity(&self, worker: WorkerId) -> String {
        format!("{}-{}", self.run_id, worker)
    }

    /// Runs until the backlog is finished, blocked, halted, or `cancel`
    /// fires. Live workers are always terminated before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunReport, OrchestratorError> {
        info!(
            run_id = %self.run_id,
            max_parallel_agents = self.config.max_parallel_agents,
            max_total_agents = self.config.max_total_agents,
            fast_path = self.config.fast_path,
            "orchestrator starting"
        );

        let driven = self.drive(&cancel).await;
        let drained = self.shutdown().await;

        let outcome = match (driven, drained) {
            (Ok(outcome), Ok(())) => outcome,
            (Err(e), _) | (Ok(_), Err(e)) => {
                error!(run_id = %self.run_id, "orchestrator failed: {}", e);
                return Err(e);
            }
        };

        let stats = self.repository.get_stats().await?;
        self.publish_progress(stats);
        info!(
            run_id = %self.run_id,
            outcome = ?outcome,
            passing = stats.passing,
            total = stats.total,
            "orchestrator finished"
        );
        Ok(RunReport { outcome, summary: self.summary, stats })
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<RunOutcome, OrchestratorError> {
        self.summary.recovered_claims = self.repository.recover_orphaned_claims().await?;
        if self.summary.recovered_claims > 0 {
            warn!(count = self.summary.recovered_claims, "reset orphaned claims to pending");
        }
        self.publish_progress(self.repository.get_stats().await?);

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Stopped);
            }

            self.fill_slots().await?;

            if self.supervisor.is_empty() {
                if let Some(outcome) = self.finished().await? {
                    return Ok(outcome);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(RunOutcome::Stopped),
                Some(reaped) = self.supervisor.next_exit() => self.reconcile(reaped).await?,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Called with no live workers.
    async fn finished(&self) -> Result<Option<RunOutcome>, OrchestratorError> {
        if self.spawn_halted {
            return Ok(Some(RunOutcome::SpawnCapacityExhausted));
        }
        if self.queued_verifications > 0 {
            return Ok(None);
        }
        match self.repository.get_next().await? {
            NextItem::Ready { .. } => {
                // lost a claim race to another process; try again next tick
                debug!("ready item exists but was not claimed");
                Ok(None)
            }
            NextItem::Blocked { pending } => {
                warn!(pending, "no ready work items and no running workers");
                Ok(Some(RunOutcome::Blocked))
            }
            NextItem::Exhausted => {
                let stats = self.repository.get_stats().await?;
                if stats.passing == stats.total {
                    Ok(Some(RunOutcome::AllPassing))
                } else {
                    Ok(Some(RunOutcome::Blocked))
                }
            }
        }
    }

    fn has_slot(&self, kind: RoleKind) -> bool {
        let counts = self.supervisor.counts();
        let role_count = match kind {
            RoleKind::Coding => counts.coding,
            RoleKind::Verification => counts.verification,
        };
        role_count < self.config.max_parallel_agents
            && counts.total() < self.config.max_total_agents
    }

    async fn fill_slots(&mut self) -> Result<(), OrchestratorError> {
        while !self.spawn_halted && self.has_slot(RoleKind::Coding) {
            let worker = self.supervisor.next_worker_id();
            let identity = self.claim_identity(worker);
            let Some(claim) = self.repository.claim_next(&identity).await?.claimed() else {
                break;
            };
            metrics::counter!("autobuild_claims_granted_total").increment(1);
            self.publish_item(claim.item.id, WorkItemStatus::Claimed, Some(worker));

            let role = WorkerRole::Coding { item_id: claim.item.id, claim_token: claim.token };
            match self.supervisor.spawn(worker, &identity, role) {
                Ok(_) => {
                    self.summary.coding_spawned += 1;
                    info!(worker = %worker, item = %claim.item.id, name = %claim.item.name, "coding worker started");
                }
                Err(e) => {
                    self.halt_spawning(&e);
                    if self.repository.release_claim(claim.item.id, claim.token).await? {
                        self.publish_item(claim.item.id, WorkItemStatus::Pending, None);
                    }
                }
            }
        }

        while !self.spawn_halted
            && self.queued_verifications > 0
            && self.has_slot(RoleKind::Verification)
        {
            self.queued_verifications -= 1;
            let sample: Vec<WorkItemId> = self
                .repository
                .get_for_regression(self.config.regression_sample_size)
                .await?
                .into_iter()
                .map(|item| item.id)
                .collect();
            if sample.is_empty() {
                continue;
            }

            let worker = self.supervisor.next_worker_id();
            let identity = self.claim_identity(worker);
            let count = sample.len();
            match self.supervisor.spawn(worker, &identity, WorkerRole::Verification { sample }) {
                Ok(_) => {
                    self.summary.verification_spawned += 1;
                    info!(worker = %worker, sample = count, "verification worker started");
                }
                Err(e) => self.halt_spawning(&e),
            }
        }
        Ok(())
    }

    fn halt_spawning(&mut self, e: &SupervisorError) {
        error!("{}; no further workers will be spawned", e);
        self.spawn_halted = true;
        self.summary.spawn_error = Some(e.to_string());
    }

    async fn reconcile(&mut self, reaped: ReapedWorker) -> Result<(), OrchestratorError> {
        let worker = reaped.process.id;
        match (&reaped.process.role, reaped.outcome) {
            (WorkerRole::Coding { item_id, .. }, WorkerState::Completed) => {
                self.summary.completed += 1;
                if tolerate(self.repository.mark_passing(*item_id).await)?.is_some() {
                    self.publish_item(*item_id, WorkItemStatus::Passing, Some(worker));
                    if !self.config.fast_path {
                        self.queued_verifications += 1;
                    }
                }
            }
            (WorkerRole::Coding { item_id, claim_token }, outcome) => {
                if outcome == WorkerState::Failed {
                    self.summary.failed += 1;
                } else {
                    self.summary.crashed += 1;
                }
                self.record_failure(*item_id, *claim_token, outcome == WorkerState::Failed)
                    .await?;
            }
            (WorkerRole::Verification { sample }, WorkerState::Completed) => {
                debug!(worker = %worker, sample = sample.len(), "verification pass clean");
            }
            (WorkerRole::Verification { sample }, outcome) => {
                self.summary.regressions_reported += 1;
                warn!(
                    worker = %worker,
                    outcome = %outcome,
                    sample = ?sample,
                    "verification worker did not complete cleanly"
                );
            }
        }

        self.publish_progress(self.repository.get_stats().await?);
        Ok(())
    }

    /// A failed item also goes to the back of the queue.
    async fn record_failure(
        &mut self,
        item: WorkItemId,
        token: i64,
        requeue_last: bool,
    ) -> Result<(), OrchestratorError> {
        let disposition = self
            .repository
            .record_failure(item, token, self.config.max_attempts)
            .await;
        match tolerate(disposition)? {
            Some(FailureDisposition::Released { attempts }) => {
                info!(item = %item, attempts, "claim released for retry");
                if requeue_last {
                    tolerate(self.repository.skip(item).await)?;
                }
                self.publish_item(item, WorkItemStatus::Pending, None);
            }
            Some(FailureDisposition::Abandoned { attempts }) => {
                warn!(item = %item, attempts, "work item abandoned after repeated failures");
                self.summary.abandoned += 1;
                self.publish_item(item, WorkItemStatus::Skipped, None);
            }
            Some(FailureDisposition::Stale) | None => {
                debug!(item = %item, token, "stale claim, nothing to release");
            }
        }
        Ok(())
    }

    /// Terminates every live worker and releases the claims of coding
    /// workers. An exit after termination never marks an item passing, even
    /// a clean one; a worker that finished reports `pass` itself.
    async fn shutdown(&mut self) -> Result<(), OrchestratorError> {
        let mut result = Ok(());
        for reaped in self.supervisor.shutdown().await {
            let step = match reaped.process.role {
                WorkerRole::Coding { item_id, claim_token } => {
                    self.release_interrupted(item_id, claim_token).await
                }
                WorkerRole::Verification { .. } => Ok(()),
            };
            // keep releasing the remaining claims even if one fails
            if let Err(e) = step {
                error!("failed to reconcile worker during shutdown: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    async fn release_interrupted(
        &mut self,
        item: WorkItemId,
        token: i64,
    ) -> Result<(), OrchestratorError> {
        if self.repository.release_claim(item, token).await? {
            self.summary.released_on_shutdown += 1;
            self.publish_item(item, WorkItemStatus::Pending, None);
        }
        Ok(())
    }

    fn publish_item(&self, item_id: WorkItemId, status: WorkItemStatus, worker: Option<WorkerId>) {
        self.events.publish(ObservationMessage::FeatureUpdate { item_id, status, worker });
    }

    fn publish_progress(&self, stats: QueueStats) {
        metrics::gauge!("autobuild_items_passing").set(stats.passing as f64);
        self.events.publish(ObservationMessage::Progress(stats.into()));
    }
}

/// `NotFound` and `InvalidTransition` during reconciliation mean an
/// operator or the worker itself changed the item; log and carry on.
fn tolerate<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ (StoreError::NotFound(_) | StoreError::InvalidTransition { .. })) => {
            warn!("reconciliation skipped: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
