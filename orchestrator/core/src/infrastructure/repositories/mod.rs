// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of `WorkItemRepository`, following the
//! Repository pattern from DDD.
//!
//! # Available Implementations
//!
//! - **SqliteWorkItemRepository** - durable store shared by every worker
//!   process; the claim is a single conditional `UPDATE`.
//! - **InMemoryWorkItemRepository** - single-process store for tests and
//!   dry runs. Same semantics, serialized by an in-process lock.
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use autobuild_core::domain::node_config::DatabaseConfig;
//! use autobuild_core::domain::repository::WorkItemRepository;
//! use autobuild_core::infrastructure::db::Database;
//! use autobuild_core::infrastructure::repositories::SqliteWorkItemRepository;
//!
//! let db = Database::open("features.db".as_ref(), &DatabaseConfig::default()).await?;
//! let repo = SqliteWorkItemRepository::new(db.get_pool().clone());
//! let next = repo.get_next().await?;
//! # Ok(())
//! # }
//! ```

pub mod sqlite_work_item;

pub use sqlite_work_item::SqliteWorkItemRepository;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::dependency_graph::DependencyGraph;
use crate::domain::repository::{
    assign_priorities, resolve_dependency, StoreError, WorkItemRepository,
};
use crate::domain::work_item::{
    Claim, ClaimOutcome, DependencyEdge, FailureDisposition, NewWorkItem, NextItem, QueueStats,
    Unavailable, WorkItem, WorkItemId, WorkItemStatus,
};

#[derive(Default)]
struct State {
    items: BTreeMap<WorkItemId, WorkItem>,
    graph: DependencyGraph,
    next_id: i64,
    next_seq: i64,
    next_token: i64,
}

impl State {
    fn item_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem, StoreError> {
        self.items.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn is_ready(&self, item: &WorkItem) -> bool {
        item.status == WorkItemStatus::Pending
            && self.graph.prerequisites(item.id).all(|prerequisite| {
                self.items
                    .get(&prerequisite)
                    .is_some_and(|p| p.status == WorkItemStatus::Passing)
            })
    }

    fn next(&self) -> NextItem {
        let ready = self
            .items
            .values()
            .filter(|item| self.is_ready(item))
            .min_by_key(|item| item.ordering_key());
        match ready {
            Some(item) => NextItem::Ready { item: item.clone() },
            None => {
                let pending = self
                    .items
                    .values()
                    .filter(|item| item.status == WorkItemStatus::Pending)
                    .count();
                if pending == 0 {
                    NextItem::Exhausted
                } else {
                    NextItem::Blocked { pending }
                }
            }
        }
    }
}

fn clear_claim(item: &mut WorkItem) {
    item.claimed_by = None;
    item.claim_token = None;
}

#[derive(Clone, Default)]
pub struct InMemoryWorkItemRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryWorkItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Database("work item state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Database("work item state lock poisoned".to_string()))
    }
}

#[async_trait]
impl WorkItemRepository for InMemoryWorkItemRepository {
    async fn create_bulk(&self, items: Vec<NewWorkItem>) -> Result<Vec<WorkItem>, StoreError> {
        let mut state = self.write()?;

        let current_max = state.items.values().map(|item| item.priority).max();
        let priorities = assign_priorities(current_max, &items);
        let batch_ids: Vec<WorkItemId> = (0..items.len())
            .map(|offset| WorkItemId(state.next_id + 1 + offset as i64))
            .collect();

        // Validate against a candidate graph before touching state.
        let mut graph = state.graph.clone();
        for id in &batch_ids {
            graph.add_node(*id);
        }
        for (index, item) in items.iter().enumerate() {
            for dependency in &item.depends_on {
                let edge = resolve_dependency(index, *dependency, &batch_ids)?;
                if !graph.contains(edge.prerequisite) {
                    return Err(StoreError::NotFound(edge.prerequisite));
                }
                graph.add_edge(edge)?;
            }
        }
        graph.validate()?;

        let now = Utc::now();
        let mut created = Vec::with_capacity(items.len());
        for ((item, id), priority) in items.into_iter().zip(&batch_ids).zip(priorities) {
            state.next_seq += 1;
            let work_item = WorkItem {
                id: *id,
                priority,
                seq: state.next_seq,
                category: item.category,
                name: item.name,
                description: item.description,
                steps: item.steps,
                passing: false,
                claimed_by: None,
                claim_token: None,
                status: WorkItemStatus::Pending,
                attempts: 0,
                created_at: now,
                updated_at: now,
            };
            state.items.insert(*id, work_item.clone());
            created.push(work_item);
        }
        state.next_id += batch_ids.len() as i64;
        state.graph = graph;

        Ok(created)
    }

    async fn get(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        self.read()?.items.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut items: Vec<WorkItem> = self.read()?.items.values().cloned().collect();
        items.sort_by_key(|item| item.ordering_key());
        Ok(items)
    }

    async fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        Ok(self.read()?.graph.edges())
    }

    async fn get_next(&self) -> Result<NextItem, StoreError> {
        Ok(self.read()?.next())
    }

    async fn claim_next(&self, worker_id: &str) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.write()?;
        let id = match state.next() {
            NextItem::Ready { item } => item.id,
            NextItem::Blocked { .. } => {
                return Ok(ClaimOutcome::NoneAvailable { reason: Unavailable::Blocked })
            }
            NextItem::Exhausted => {
                return Ok(ClaimOutcome::NoneAvailable { reason: Unavailable::Exhausted })
            }
        };

        state.next_token += 1;
        let token = state.next_token;
        let item = state.item_mut(id)?;
        item.status = WorkItemStatus::Claimed;
        item.claimed_by = Some(worker_id.to_string());
        item.claim_token = Some(token);
        item.updated_at = Utc::now();

        Ok(ClaimOutcome::Claimed(Claim {
            item: item.clone(),
            worker_id: worker_id.to_string(),
            token,
        }))
    }

    async fn mark_passing(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let mut state = self.write()?;
        let item = state.item_mut(id)?;
        match item.status {
            WorkItemStatus::Passing => {}
            WorkItemStatus::Claimed => {
                item.status = WorkItemStatus::Passing;
                item.passing = true;
                clear_claim(item);
                item.updated_at = Utc::now();
            }
            from => {
                return Err(StoreError::InvalidTransition { id, from, operation: "mark_passing" })
            }
        }
        Ok(item.clone())
    }

    async fn mark_failing(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let mut state = self.write()?;
        let item = state.item_mut(id)?;
        if item.status != WorkItemStatus::Passing {
            return Err(StoreError::InvalidTransition {
                id,
                from: item.status,
                operation: "mark_failing",
            });
        }
        item.status = WorkItemStatus::Pending;
        item.passing = false;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn skip(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let mut state = self.write()?;
        let lowest_tier = state.items.values().map(|item| item.priority).max().unwrap_or(0);
        state.next_seq += 1;
        let seq = state.next_seq;

        let item = state.item_mut(id)?;
        match item.status {
            WorkItemStatus::Pending | WorkItemStatus::Claimed => {
                item.status = WorkItemStatus::Pending;
                item.priority = lowest_tier;
                item.seq = seq;
                clear_claim(item);
                item.updated_at = Utc::now();
                Ok(item.clone())
            }
            from => Err(StoreError::InvalidTransition { id, from, operation: "skip" }),
        }
    }

    async fn release_claim(&self, id: WorkItemId, token: i64) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let item = state.item_mut(id)?;
        if item.status != WorkItemStatus::Claimed || item.claim_token != Some(token) {
            return Ok(false);
        }
        item.status = WorkItemStatus::Pending;
        clear_claim(item);
        item.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: WorkItemId,
        token: i64,
        max_attempts: u32,
    ) -> Result<FailureDisposition, StoreError> {
        let mut state = self.write()?;
        let item = state.item_mut(id)?;
        if item.status != WorkItemStatus::Claimed || item.claim_token != Some(token) {
            return Ok(FailureDisposition::Stale);
        }
        item.attempts += 1;
        clear_claim(item);
        item.updated_at = Utc::now();
        if item.attempts >= max_attempts {
            item.status = WorkItemStatus::Skipped;
            Ok(FailureDisposition::Abandoned { attempts: item.attempts })
        } else {
            item.status = WorkItemStatus::Pending;
            Ok(FailureDisposition::Released { attempts: item.attempts })
        }
    }

    async fn add_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for id in [dependent, prerequisite] {
            if !state.items.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
        }
        let edge = DependencyEdge::new(dependent, prerequisite);
        state.graph.check_insert(edge)?;
        state.graph.add_edge(edge)?;
        Ok(())
    }

    async fn remove_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        Ok(state.graph.remove_edge(DependencyEdge::new(dependent, prerequisite)))
    }

    async fn get_stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.read()?;
        let mut stats = QueueStats { total: state.items.len(), ..QueueStats::default() };
        for item in state.items.values() {
            match item.status {
                WorkItemStatus::Pending => stats.pending += 1,
                WorkItemStatus::Claimed => stats.claimed += 1,
                WorkItemStatus::Passing => stats.passing += 1,
                WorkItemStatus::Skipped => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    async fn get_for_regression(&self, n: usize) -> Result<Vec<WorkItem>, StoreError> {
        let state = self.read()?;
        let passing: Vec<&WorkItem> = state.items.values().filter(|item| item.is_passing()).collect();
        let mut rng = rand::rng();
        Ok(passing
            .choose_multiple(&mut rng, n)
            .map(|item| (*item).clone())
            .collect())
    }

    async fn recover_orphaned_claims(&self) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let now = Utc::now();
        let mut recovered = 0;
        for item in state.items.values_mut() {
            if item.status == WorkItemStatus::Claimed {
                item.status = WorkItemStatus::Pending;
                clear_claim(item);
                item.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dependency_graph::GraphError;
    use crate::domain::work_item::DependencyRef;

    async fn seeded(items: Vec<NewWorkItem>) -> (InMemoryWorkItemRepository, Vec<WorkItem>) {
        let repo = InMemoryWorkItemRepository::new();
        let created = repo.create_bulk(items).await.unwrap();
        (repo, created)
    }

    #[tokio::test]
    async fn test_dependency_gates_readiness() {
        let (repo, created) = seeded(vec![
            NewWorkItem::new("core", "A"),
            NewWorkItem::new("core", "B").depends_on(DependencyRef::Batch(0)),
        ])
        .await;
        let (a, b) = (created[0].id, created[1].id);

        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().id, a);

        let claim = repo.claim_next("w1").await.unwrap().claimed().unwrap();
        assert_eq!(claim.item.id, a);
        assert_eq!(repo.get_next().await.unwrap(), NextItem::Blocked { pending: 1 });

        repo.mark_passing(a).await.unwrap();
        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().id, b);
    }

    #[tokio::test]
    async fn test_bulk_cycle_leaves_store_untouched() {
        let (repo, _) = seeded(vec![NewWorkItem::new("core", "seed")]).await;

        let err = repo
            .create_bulk(vec![
                NewWorkItem::new("core", "X").depends_on(DependencyRef::Batch(1)),
                NewWorkItem::new("core", "Y").depends_on(DependencyRef::Batch(0)),
            ])
            .await
            .unwrap_err();
        assert!(err.is_cycle());
        assert_eq!(repo.list().await.unwrap().len(), 1);
        assert!(repo.edges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_dependency_cycle_rejected_without_mutation() {
        let (repo, created) = seeded(vec![
            NewWorkItem::new("c", "A"),
            NewWorkItem::new("c", "B").depends_on(DependencyRef::Batch(0)),
        ])
        .await;
        let before = repo.edges().await.unwrap();

        let err = repo.add_dependency(created[0].id, created[1].id).await.unwrap_err();
        assert!(err.is_cycle());
        assert_eq!(repo.edges().await.unwrap(), before);

        let err = repo.add_dependency(created[0].id, created[0].id).await.unwrap_err();
        assert!(matches!(err, StoreError::Graph(GraphError::SelfDependency(_))));

        let err = repo.add_dependency(created[0].id, WorkItemId(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(WorkItemId(99))));
    }

    #[tokio::test]
    async fn test_skip_moves_item_behind_other_ready_items() {
        let (repo, created) = seeded(vec![
            NewWorkItem::new("c", "A").with_priority(1),
            NewWorkItem::new("c", "B").with_priority(1),
            NewWorkItem::new("c", "C").with_priority(5),
        ])
        .await;

        let skipped = repo.skip(created[0].id).await.unwrap();
        assert_eq!(skipped.priority, 5);
        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().id, created[1].id);

        repo.claim_next("w").await.unwrap();
        // C precedes the skipped A in the lowest tier
        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().id, created[2].id);
    }

    #[tokio::test]
    async fn test_skip_releases_claim_and_rejects_passing() {
        let (repo, created) = seeded(vec![NewWorkItem::new("c", "A")]).await;
        let id = created[0].id;
        repo.claim_next("w").await.unwrap();

        let item = repo.skip(id).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert!(item.claimed_by.is_none());

        repo.claim_next("w").await.unwrap();
        repo.mark_passing(id).await.unwrap();
        assert!(matches!(
            repo.skip(id).await,
            Err(StoreError::InvalidTransition { operation: "skip", .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_passing_transitions() {
        let (repo, created) = seeded(vec![NewWorkItem::new("c", "A")]).await;
        let id = created[0].id;

        assert!(matches!(
            repo.mark_passing(id).await,
            Err(StoreError::InvalidTransition { from: WorkItemStatus::Pending, .. })
        ));
        assert!(matches!(
            repo.mark_passing(WorkItemId(42)).await,
            Err(StoreError::NotFound(WorkItemId(42)))
        ));

        repo.claim_next("w").await.unwrap();
        let item = repo.mark_passing(id).await.unwrap();
        assert!(item.passing);
        assert!(item.claimed_by.is_none());
        // idempotent
        assert_eq!(repo.mark_passing(id).await.unwrap().status, WorkItemStatus::Passing);

        let item = repo.mark_failing(id).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Pending);
        assert!(!item.passing);
    }

    #[tokio::test]
    async fn test_record_failure_bounds_retries() {
        let (repo, created) = seeded(vec![NewWorkItem::new("c", "A")]).await;
        let id = created[0].id;

        let first = repo.claim_next("w").await.unwrap().claimed().unwrap();
        assert_eq!(
            repo.record_failure(id, first.token, 2).await.unwrap(),
            FailureDisposition::Released { attempts: 1 }
        );
        // stale token after release
        assert_eq!(
            repo.record_failure(id, first.token, 2).await.unwrap(),
            FailureDisposition::Stale
        );

        let second = repo.claim_next("w").await.unwrap().claimed().unwrap();
        assert!(second.token > first.token);
        assert_eq!(
            repo.record_failure(id, second.token, 2).await.unwrap(),
            FailureDisposition::Abandoned { attempts: 2 }
        );
        assert_eq!(repo.get(id).await.unwrap().status, WorkItemStatus::Skipped);
        assert_eq!(repo.get_next().await.unwrap(), NextItem::Exhausted);
    }

    #[tokio::test]
    async fn test_release_claim_requires_live_token() {
        let (repo, created) = seeded(vec![NewWorkItem::new("c", "A")]).await;
        let claim = repo.claim_next("w").await.unwrap().claimed().unwrap();

        assert!(!repo.release_claim(created[0].id, claim.token + 1).await.unwrap());
        assert!(repo.release_claim(created[0].id, claim.token).await.unwrap());
        assert!(!repo.release_claim(created[0].id, claim.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let (repo, _) = seeded((0..5).map(|i| NewWorkItem::new("c", format!("item {}", i))).collect())
            .await;

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.claim_next(&format!("w{}", w)).await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(claim) = handle.await.unwrap().claimed() {
                claimed.push(claim.item.id);
            }
        }
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 5);
    }

    #[tokio::test]
    async fn test_regression_sample_and_recovery() {
        let (repo, created) =
            seeded((0..4).map(|i| NewWorkItem::new("c", format!("item {}", i))).collect()).await;
        for _ in 0..3 {
            let claim = repo.claim_next("w").await.unwrap().claimed().unwrap();
            repo.mark_passing(claim.item.id).await.unwrap();
        }
        repo.claim_next("w").await.unwrap();

        let sample = repo.get_for_regression(2).await.unwrap();
        assert_eq!(sample.len(), 2);
        assert_ne!(sample[0].id, sample[1].id);
        assert!(sample.iter().all(WorkItem::is_passing));
        assert_eq!(repo.get_for_regression(10).await.unwrap().len(), 3);

        assert_eq!(repo.recover_orphaned_claims().await.unwrap(), 1);
        let last = repo.get(created[3].id).await.unwrap();
        assert_eq!(last.status, WorkItemStatus::Pending);

        let stats = repo.get_stats().await.unwrap();
        assert_eq!((stats.passing, stats.pending, stats.total), (3, 1, 4));
    }
}
