// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # SQLite Work Item Repository
//!
//! Durable `WorkItemRepository` backed by the `work_items` and
//! `work_item_dependencies` tables. Every worker process opens the same
//! database file, so all cross-process coordination happens here.
//!
//! Mutations that read before they write (`create_bulk`, `add_dependency`,
//! `claim_next`) run inside `BEGIN IMMEDIATE`, which takes the database
//! write lock up front. Competing writers wait out the busy timeout; a
//! writer that still cannot get the lock sees `SQLITE_BUSY`, which the claim
//! path retries a bounded number of times before reporting "none available".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use std::time::Duration;

use crate::domain::dependency_graph::DependencyGraph;
use crate::domain::repository::{
    assign_priorities, resolve_dependency, StoreError, WorkItemRepository,
};
use crate::domain::work_item::{
    Claim, ClaimOutcome, DependencyEdge, FailureDisposition, NewWorkItem, NextItem, QueueStats,
    Unavailable, WorkItem, WorkItemId, WorkItemStatus,
};

const COLUMNS: &str = "id, priority, seq, category, name, description, steps, status, \
                       claimed_by, claim_token, attempts, created_at, updated_at";

/// Pending items with every prerequisite passing, in scheduling order.
const READY_IDS: &str = "SELECT w.id FROM work_items w \
     WHERE w.status = 'pending' AND NOT EXISTS ( \
         SELECT 1 FROM work_item_dependencies d \
         JOIN work_items p ON p.id = d.prerequisite_id \
         WHERE d.dependent_id = w.id AND p.status <> 'passing') \
     ORDER BY w.priority, w.seq";

const CLAIM_ATTEMPTS: u32 = 5;
const CLAIM_BACKOFF_MS: u64 = 20;

pub struct SqliteWorkItemRepository {
    pool: SqlitePool,
}

impl SqliteWorkItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM work_items WHERE id = ?", COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn fetch_existing(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn unavailable_reason(&self) -> Result<Unavailable, StoreError> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM work_items WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(if pending == 0 { Unavailable::Exhausted } else { Unavailable::Blocked })
    }

    /// One claim attempt under an immediate transaction.
    async fn try_claim(&self, worker_id: &str) -> Result<Option<Claim>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        begin_immediate(&mut conn).await?;
        let result = claim_locked(&mut conn, worker_id).await;
        if matches!(result, Ok(None)) {
            // nothing ready; drop the token bump
            rollback(&mut conn).await;
            return Ok(None);
        }
        finish(&mut conn, result).await
    }
}

#[async_trait]
impl WorkItemRepository for SqliteWorkItemRepository {
    async fn create_bulk(&self, items: Vec<NewWorkItem>) -> Result<Vec<WorkItem>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        begin_immediate(&mut conn).await?;
        let result = create_bulk_locked(&mut conn, items).await;
        let created = finish(&mut conn, result).await?;
        tracing::debug!(count = created.len(), "work items created");
        Ok(created)
    }

    async fn get(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        self.fetch_existing(id).await
    }

    async fn list(&self) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM work_items ORDER BY priority, seq",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        load_edges(&self.pool).await
    }

    async fn get_next(&self) -> Result<NextItem, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM work_items WHERE id = ({} LIMIT 1)",
            COLUMNS, READY_IDS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            return Ok(NextItem::Ready { item: row_to_item(&row)? });
        }
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM work_items WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(if pending == 0 {
            NextItem::Exhausted
        } else {
            NextItem::Blocked { pending: pending as usize }
        })
    }

    async fn claim_next(&self, worker_id: &str) -> Result<ClaimOutcome, StoreError> {
        let mut contended = false;
        for attempt in 1..=CLAIM_ATTEMPTS {
            match self.try_claim(worker_id).await {
                Ok(Some(claim)) => {
                    tracing::debug!(
                        item_id = claim.item.id.0,
                        worker_id,
                        token = claim.token,
                        "work item claimed"
                    );
                    return Ok(ClaimOutcome::Claimed(claim));
                }
                Ok(None) => {
                    contended = false;
                    break;
                }
                Err(StoreError::ClaimConflict(reason)) => {
                    contended = true;
                    tracing::debug!(attempt, worker_id, %reason, "claim contended, retrying");
                    tokio::time::sleep(Duration::from_millis(CLAIM_BACKOFF_MS * attempt as u64))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        if contended {
            return Ok(ClaimOutcome::NoneAvailable { reason: Unavailable::Contended });
        }
        let reason = match self.unavailable_reason().await {
            Ok(reason) => reason,
            Err(StoreError::ClaimConflict(reason)) => {
                tracing::debug!(worker_id, %reason, "store locked while counting pending items");
                Unavailable::Contended
            }
            Err(e) => return Err(e),
        };
        Ok(ClaimOutcome::NoneAvailable { reason })
    }

    async fn mark_passing(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE work_items SET status = 'passing', claimed_by = NULL, claim_token = NULL, \
             updated_at = ? WHERE id = ? AND status = 'claimed' RETURNING {}",
            COLUMNS
        ))
        .bind(Utc::now())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_item(&row),
            None => {
                let item = self.fetch_existing(id).await?;
                if item.is_passing() {
                    Ok(item)
                } else {
                    Err(StoreError::InvalidTransition {
                        id,
                        from: item.status,
                        operation: "mark_passing",
                    })
                }
            }
        }
    }

    async fn mark_failing(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE work_items SET status = 'pending', updated_at = ? \
             WHERE id = ? AND status = 'passing' RETURNING {}",
            COLUMNS
        ))
        .bind(Utc::now())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_item(&row),
            None => {
                let item = self.fetch_existing(id).await?;
                Err(StoreError::InvalidTransition { id, from: item.status, operation: "mark_failing" })
            }
        }
    }

    async fn skip(&self, id: WorkItemId) -> Result<WorkItem, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE work_items SET status = 'pending', claimed_by = NULL, claim_token = NULL, \
             priority = (SELECT MAX(priority) FROM work_items), \
             seq = (SELECT MAX(seq) FROM work_items) + 1, updated_at = ? \
             WHERE id = ? AND status IN ('pending', 'claimed') RETURNING {}",
            COLUMNS
        ))
        .bind(Utc::now())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => row_to_item(&row),
            None => {
                let item = self.fetch_existing(id).await?;
                Err(StoreError::InvalidTransition { id, from: item.status, operation: "skip" })
            }
        }
    }

    async fn release_claim(&self, id: WorkItemId, token: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'pending', claimed_by = NULL, claim_token = NULL, \
             updated_at = ? WHERE id = ? AND status = 'claimed' AND claim_token = ?",
        )
        .bind(Utc::now())
        .bind(id.0)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            self.fetch_existing(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: WorkItemId,
        token: i64,
        max_attempts: u32,
    ) -> Result<FailureDisposition, StoreError> {
        let row = sqlx::query(
            "UPDATE work_items SET attempts = attempts + 1, \
             status = CASE WHEN attempts + 1 >= ? THEN 'skipped' ELSE 'pending' END, \
             claimed_by = NULL, claim_token = NULL, updated_at = ? \
             WHERE id = ? AND status = 'claimed' AND claim_token = ? \
             RETURNING attempts, status",
        )
        .bind(i64::from(max_attempts))
        .bind(Utc::now())
        .bind(id.0)
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            self.fetch_existing(id).await?;
            return Ok(FailureDisposition::Stale);
        };
        let attempts = attempts_from(row.try_get("attempts").map_err(db_err)?)?;
        let status: String = row.try_get("status").map_err(db_err)?;
        Ok(if status == WorkItemStatus::Skipped.as_str() {
            FailureDisposition::Abandoned { attempts }
        } else {
            FailureDisposition::Released { attempts }
        })
    }

    async fn add_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        begin_immediate(&mut conn).await?;
        let result = add_dependency_locked(&mut conn, DependencyEdge::new(dependent, prerequisite)).await;
        finish(&mut conn, result).await
    }

    async fn remove_dependency(
        &self,
        dependent: WorkItemId,
        prerequisite: WorkItemId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM work_item_dependencies WHERE dependent_id = ? AND prerequisite_id = ?",
        )
        .bind(dependent.0)
        .bind(prerequisite.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM work_items GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(db_err)?;
            let n: i64 = row.try_get("n").map_err(db_err)?;
            let n = n as usize;
            match parse_status(&status)? {
                WorkItemStatus::Pending => stats.pending = n,
                WorkItemStatus::Claimed => stats.claimed = n,
                WorkItemStatus::Passing => stats.passing = n,
                WorkItemStatus::Skipped => stats.skipped = n,
            }
            stats.total += n;
        }
        Ok(stats)
    }

    async fn get_for_regression(&self, n: usize) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM work_items WHERE status = 'passing' ORDER BY RANDOM() LIMIT ?",
            COLUMNS
        ))
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn recover_orphaned_claims(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'pending', claimed_by = NULL, claim_token = NULL, \
             updated_at = ? WHERE status = 'claimed'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }
}

async fn begin_immediate(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Commits on success, rolls back on error.
async fn finish<T>(
    conn: &mut SqliteConnection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await.map_err(db_err)?;
            Ok(value)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

async fn claim_locked(
    conn: &mut SqliteConnection,
    worker_id: &str,
) -> Result<Option<Claim>, StoreError> {
    let token: i64 =
        sqlx::query_scalar("UPDATE claim_sequence SET value = value + 1 WHERE id = 1 RETURNING value")
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;

    // Compare-and-set: the status guard makes a lost race a no-op.
    let row = sqlx::query(&format!(
        "UPDATE work_items SET status = 'claimed', claimed_by = ?, claim_token = ?, updated_at = ? \
         WHERE id = ({} LIMIT 1) AND status = 'pending' RETURNING {}",
        READY_IDS, COLUMNS
    ))
    .bind(worker_id)
    .bind(token)
    .bind(Utc::now())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    row.map(|row| {
        Ok(Claim {
            item: row_to_item(&row)?,
            worker_id: worker_id.to_string(),
            token,
        })
    })
    .transpose()
}

async fn load_graph(conn: &mut SqliteConnection) -> Result<DependencyGraph, StoreError> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM work_items")
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let edges = load_edges(&mut *conn).await?;
    Ok(DependencyGraph::from_parts(ids.into_iter().map(WorkItemId), edges)?)
}

async fn load_edges<'e, E>(executor: E) -> Result<Vec<DependencyEdge>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows = sqlx::query(
        "SELECT dependent_id, prerequisite_id FROM work_item_dependencies \
         ORDER BY dependent_id, prerequisite_id",
    )
    .fetch_all(executor)
    .await
    .map_err(db_err)?;

    rows.iter()
        .map(|row| {
            Ok(DependencyEdge::new(
                WorkItemId(row.try_get("dependent_id").map_err(db_err)?),
                WorkItemId(row.try_get("prerequisite_id").map_err(db_err)?),
            ))
        })
        .collect()
}

async fn insert_edge(conn: &mut SqliteConnection, edge: DependencyEdge) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO work_item_dependencies (dependent_id, prerequisite_id) VALUES (?, ?)",
    )
    .bind(edge.dependent.0)
    .bind(edge.prerequisite.0)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn add_dependency_locked(
    conn: &mut SqliteConnection,
    edge: DependencyEdge,
) -> Result<(), StoreError> {
    let graph = load_graph(conn).await?;
    for id in [edge.dependent, edge.prerequisite] {
        if !graph.contains(id) {
            return Err(StoreError::NotFound(id));
        }
    }
    graph.check_insert(edge)?;
    insert_edge(conn, edge).await
}

async fn create_bulk_locked(
    conn: &mut SqliteConnection,
    items: Vec<NewWorkItem>,
) -> Result<Vec<WorkItem>, StoreError> {
    let current_max: Option<i64> = sqlx::query_scalar("SELECT MAX(priority) FROM work_items")
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    let mut seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM work_items")
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;
    let priorities = assign_priorities(current_max, &items);
    let now = Utc::now();

    let mut created = Vec::with_capacity(items.len());
    for (item, priority) in items.iter().zip(priorities) {
        seq += 1;
        let steps = serde_json::to_string(&item.steps)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO work_items (priority, seq, category, name, description, steps, status, \
             attempts, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?) \
             RETURNING id",
        )
        .bind(priority)
        .bind(seq)
        .bind(&item.category)
        .bind(&item.name)
        .bind(&item.description)
        .bind(steps)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;

        created.push(WorkItem {
            id: WorkItemId(id),
            priority,
            seq,
            category: item.category.clone(),
            name: item.name.clone(),
            description: item.description.clone(),
            steps: item.steps.clone(),
            passing: false,
            claimed_by: None,
            claim_token: None,
            status: WorkItemStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        });
    }

    let batch_ids: Vec<WorkItemId> = created.iter().map(|item| item.id).collect();
    let mut graph = load_graph(conn).await?;
    let mut new_edges = Vec::new();
    for (index, item) in items.iter().enumerate() {
        for dependency in &item.depends_on {
            let edge = resolve_dependency(index, *dependency, &batch_ids)?;
            if !graph.contains(edge.prerequisite) {
                return Err(StoreError::NotFound(edge.prerequisite));
            }
            graph.add_edge(edge)?;
            new_edges.push(edge);
        }
    }
    graph.validate()?;

    for edge in new_edges {
        insert_edge(conn, edge).await?;
    }
    Ok(created)
}

fn row_to_item(row: &SqliteRow) -> Result<WorkItem, StoreError> {
    let steps: String = row.try_get("steps").map_err(db_err)?;
    let status = parse_status(&row.try_get::<String, _>("status").map_err(db_err)?)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_err)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(db_err)?;

    Ok(WorkItem {
        id: WorkItemId(row.try_get("id").map_err(db_err)?),
        priority: row.try_get("priority").map_err(db_err)?,
        seq: row.try_get("seq").map_err(db_err)?,
        category: row.try_get("category").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        steps: serde_json::from_str(&steps)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        passing: status == WorkItemStatus::Passing,
        claimed_by: row.try_get("claimed_by").map_err(db_err)?,
        claim_token: row.try_get("claim_token").map_err(db_err)?,
        status,
        attempts: attempts_from(row.try_get("attempts").map_err(db_err)?)?,
        created_at,
        updated_at,
    })
}

fn parse_status(raw: &str) -> Result<WorkItemStatus, StoreError> {
    raw.parse().map_err(StoreError::Serialization)
}

fn attempts_from(raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::Serialization(format!("attempts out of range: {}", raw)))
}

/// Busy and locked databases are contention, not failure.
fn db_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let busy = db
            .code()
            .map(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517"))
            .unwrap_or(false);
        if busy {
            return StoreError::ClaimConflict(db.message().to_string());
        }
    }
    StoreError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_item::DependencyRef;
    use crate::infrastructure::db::Database;

    async fn repo() -> SqliteWorkItemRepository {
        let db = Database::in_memory().await.unwrap();
        SqliteWorkItemRepository::new(db.get_pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_claim_in_priority_order() {
        let repo = repo().await;
        let created = repo
            .create_bulk(vec![
                NewWorkItem::new("ui", "low").with_priority(9),
                NewWorkItem::new("ui", "high").with_priority(1).with_steps(vec!["open page".into()]),
                NewWorkItem::new("ui", "dependent").depends_on(DependencyRef::Batch(1)),
            ])
            .await
            .unwrap();
        assert_eq!(created[2].priority, 10);

        let first = repo.claim_next("w1").await.unwrap().claimed().unwrap();
        assert_eq!(first.item.name, "high");
        assert_eq!(first.item.steps, vec!["open page".to_string()]);
        assert_eq!(first.item.claimed_by.as_deref(), Some("w1"));

        let second = repo.claim_next("w2").await.unwrap().claimed().unwrap();
        assert_eq!(second.item.name, "low");
        assert!(second.token > first.token);

        assert_eq!(
            repo.claim_next("w3").await.unwrap(),
            ClaimOutcome::NoneAvailable { reason: Unavailable::Blocked }
        );

        repo.mark_passing(first.item.id).await.unwrap();
        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().name, "dependent");
    }

    #[tokio::test]
    async fn test_bulk_rollback_on_unknown_reference() {
        let repo = repo().await;
        let err = repo
            .create_bulk(vec![
                NewWorkItem::new("c", "A"),
                NewWorkItem::new("c", "B").depends_on(DependencyRef::Existing(WorkItemId(77))),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(WorkItemId(77))));
        assert!(repo.list().await.unwrap().is_empty());
        assert_eq!(repo.get_next().await.unwrap(), NextItem::Exhausted);
    }

    #[tokio::test]
    async fn test_cycle_via_add_dependency() {
        let repo = repo().await;
        let created = repo
            .create_bulk(vec![
                NewWorkItem::new("c", "A"),
                NewWorkItem::new("c", "B").depends_on(DependencyRef::Batch(0)),
                NewWorkItem::new("c", "C").depends_on(DependencyRef::Batch(1)),
            ])
            .await
            .unwrap();
        let before = repo.edges().await.unwrap();

        let err = repo.add_dependency(created[0].id, created[2].id).await.unwrap_err();
        assert!(err.is_cycle());
        assert!(err.to_string().contains("->"));
        assert_eq!(repo.edges().await.unwrap(), before);

        assert!(repo.remove_dependency(created[2].id, created[1].id).await.unwrap());
        repo.add_dependency(created[0].id, created[2].id).await.unwrap();
        assert_eq!(repo.edges().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_and_release_paths() {
        let repo = repo().await;
        let created = repo.create_bulk(vec![NewWorkItem::new("c", "A")]).await.unwrap();
        let id = created[0].id;

        let claim = repo.claim_next("w").await.unwrap().claimed().unwrap();
        assert!(!repo.release_claim(id, claim.token + 100).await.unwrap());
        assert_eq!(
            repo.record_failure(id, claim.token, 2).await.unwrap(),
            FailureDisposition::Released { attempts: 1 }
        );

        let claim = repo.claim_next("w").await.unwrap().claimed().unwrap();
        assert_eq!(
            repo.record_failure(id, claim.token, 2).await.unwrap(),
            FailureDisposition::Abandoned { attempts: 2 }
        );
        let item = repo.get(id).await.unwrap();
        assert_eq!(item.status, WorkItemStatus::Skipped);
        assert!(matches!(
            repo.skip(id).await,
            Err(StoreError::InvalidTransition { from: WorkItemStatus::Skipped, .. })
        ));

        let stats = repo.get_stats().await.unwrap();
        assert_eq!((stats.skipped, stats.total), (1, 1));
    }

    #[tokio::test]
    async fn test_skip_and_recovery() {
        let repo = repo().await;
        let created = repo
            .create_bulk(vec![NewWorkItem::new("c", "A"), NewWorkItem::new("c", "B")])
            .await
            .unwrap();

        let claim = repo.claim_next("w").await.unwrap().claimed().unwrap();
        assert_eq!(claim.item.id, created[0].id);
        let skipped = repo.skip(created[0].id).await.unwrap();
        assert_eq!(skipped.status, WorkItemStatus::Pending);
        assert!(skipped.claim_token.is_none());
        assert_eq!(repo.get_next().await.unwrap().ready().unwrap().id, created[1].id);

        repo.claim_next("w").await.unwrap();
        repo.claim_next("w").await.unwrap();
        assert_eq!(repo.recover_orphaned_claims().await.unwrap(), 2);
        assert_eq!(repo.get_stats().await.unwrap().pending, 2);
    }
}
