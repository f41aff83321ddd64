// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work Item Store Interface
//!
//! Persistence contract for the `WorkItem` aggregate and its dependency
//! edges, following the Repository pattern: the trait lives in the domain
//! layer, implementations live in `crate::infrastructure::repositories`.
//!
//! | Implementation | Backing | Cross-process safe |
//! |----------------|---------|--------------------|
//! | `InMemoryWorkItemRepository` | `Mutex<State>` | no (tests, dry runs) |
//! | `SqliteWorkItemRepository` | SQLite via `sqlx` | yes |
//!
//! ## Claim Protocol
//!
//! `claim_next` is a single compare-and-set on `status` inside one
//! transaction boundary. Claimants may live in separate OS processes, so
//! implementations must rely on the store's isolation rather than on an
//! in-process lock. A lost race is never surfaced to callers: they receive
//! `ClaimOutcome::NoneAvailable` instead.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::dependency_graph::GraphError;
use crate::domain::work_item::{
    ClaimOutcome, DependencyEdge, DependencyRef, FailureDisposition, NewWorkItem, NextItem,
    QueueStats, WorkItem, WorkItemId, WorkItemStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("work item {0} not found")]
    NotFound(WorkItemId),

    #[error("batch item {index} depends on batch index {reference}, which does not exist")]
    InvalidBatchReference { index: usize, reference: usize },

    #[error("work item {id} cannot move from {from} via {operation}")]
    InvalidTransition {
        id: WorkItemId,
        from: WorkItemStatus,
        operation: &'static str,
    },

    /// Lost compare-and-set or busy database. Internal to claim handling.
    #[error("claim conflict: {0}")]
    ClaimConflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, StoreError::Graph(GraphError::Cycle { .. }))
    }
}

#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Inserts a batch with its declared edges in one transaction. The
    /// resulting graph is validated before commit; on failure nothing is
    /// written. Returns the new items in batch order.
    async fn create_bulk(&self, items: Vec<NewWorkItem>) -> Result<Vec<WorkItem>, StoreError>;

    async fn get(&self, id: WorkItemId) -> Result<WorkItem, StoreError>;

    /// All items in scheduling order.
    async fn list(&self) -> Result<Vec<WorkItem>, StoreError>;

    async fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError>;

    /// Highest-priority ready item, without side effects.
    async fn get_next(&self) -> Result<NextItem, StoreError>;

    /// Atomically claims the item `get_next` would return.
    async fn claim_next(&self, worker_id: &str) -> Result<ClaimOutcome, StoreError>;

    /// `claimed -> passing`; idempotent for passing items.
    async fn mark_passing(&self, id: WorkItemId) -> Result<WorkItem, StoreError>;

    /// `passing -> pending` after a failed re-verification.
    async fn mark_failing(&self, id: WorkItemId) -> Result<WorkItem, StoreError>;

    /// Moves the item to the back of the ordering and releases its claim.
    async fn skip(&self, id: WorkItemId) -> Result<WorkItem, StoreError>;

    /// `claimed -> pending` if `token` is the live claim. Returns whether
    /// anything changed.
    async fn release_claim(&self, id: WorkItemId, token: i64) -> Result<bool, StoreError>;

    /// Releases the claim held under `token` and counts a failed attempt.
    async fn record_failure(
        &self,
        id: WorkItemId,
        token: i64,
        max_attempts: u32,
    ) -> Result<FailureDisposition, StoreError>;

    async fn add_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<(), StoreError>;

    /// Returns whether the edge existed.
    async fn remove_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<bool, StoreError>;

    async fn get_stats(&self) -> Result<QueueStats, StoreError>;

    /// Up to `n` passing items sampled uniformly without replacement.
    async fn get_for_regression(&self, n: usize) -> Result<Vec<WorkItem>, StoreError>;

    /// Startup recovery: every `claimed` item goes back to `pending`.
    async fn recover_orphaned_claims(&self) -> Result<usize, StoreError>;
}

/// Priorities for a new batch. Explicit priorities are kept; the rest get
/// one past the highest priority seen so far, in batch order.
pub fn assign_priorities(current_max: Option<i64>, items: &[NewWorkItem]) -> Vec<i64> {
    let mut max = current_max;
    items
        .iter()
        .map(|item| {
            let priority = item
                .priority
                .unwrap_or_else(|| max.map_or(1, |m| m.saturating_add(1)));
            max = Some(max.map_or(priority, |m| m.max(priority)));
            priority
        })
        .collect()
}

/// Resolves one declared dependency of batch item `index` to an edge,
/// given the ids allocated to the batch. Existence of `Existing` targets is
/// checked by the caller.
pub fn resolve_dependency(
    index: usize,
    dependency: DependencyRef,
    batch_ids: &[WorkItemId],
) -> Result<DependencyEdge, StoreError> {
    let dependent = batch_ids[index];
    let prerequisite = match dependency {
        DependencyRef::Existing(id) => id,
        DependencyRef::Batch(reference) => *batch_ids
            .get(reference)
            .ok_or(StoreError::InvalidBatchReference { index, reference })?,
    };
    if prerequisite == dependent {
        return Err(GraphError::SelfDependency(dependent).into());
    }
    Ok(DependencyEdge::new(dependent, prerequisite))
}
