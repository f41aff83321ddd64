// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work Item Aggregate
//!
//! A `WorkItem` is one schedulable unit of implementation work ("feature")
//! in the backlog. Items are owned by the Work Item Store and only change
//! through `WorkItemRepository` operations.
//!
//! ## Status Transitions
//! | From | To | Trigger |
//! |------|----|---------|
//! | `pending` | `claimed` | `claim_next` |
//! | `claimed` | `passing` | `mark_passing` |
//! | `claimed` | `pending` | `skip`, `release_claim`, `record_failure` |
//! | `claimed` | `skipped` | `record_failure` with attempts exhausted |
//! | `passing` | `pending` | `mark_failing` (regression) |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub i64);

impl WorkItemId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Claimed,
    Passing,
    /// Terminal: the retry bound was exhausted. Never claimed again.
    Skipped,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Claimed => "claimed",
            WorkItemStatus::Passing => "passing",
            WorkItemStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkItemStatus::Pending),
            "claimed" => Ok(WorkItemStatus::Claimed),
            "passing" => Ok(WorkItemStatus::Passing),
            "skipped" => Ok(WorkItemStatus::Skipped),
            other => Err(format!("unknown work item status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Lower value is scheduled first.
    pub priority: i64,
    /// Insertion order; breaks priority ties and is bumped by `skip`.
    pub seq: i64,
    pub category: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<String>,
    pub passing: bool,
    pub claimed_by: Option<String>,
    pub claim_token: Option<i64>,
    pub status: WorkItemStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn is_passing(&self) -> bool {
        self.status == WorkItemStatus::Passing
    }

    /// Scheduling key: priority first, then insertion order.
    pub fn ordering_key(&self) -> (i64, i64) {
        (self.priority, self.seq)
    }
}

/// Reference to a prerequisite when creating items in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRef {
    /// An item that already exists in the store.
    Existing(WorkItemId),
    /// Zero-based index of another item in the same batch.
    Batch(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkItem {
    #[serde(default)]
    pub priority: Option<i64>,
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

impl NewWorkItem {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            priority: None,
            category: category.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    pub fn depends_on(mut self, dependency: DependencyRef) -> Self {
        self.depends_on.push(dependency);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependent: WorkItemId,
    pub prerequisite: WorkItemId,
}

impl DependencyEdge {
    pub fn new(dependent: WorkItemId, prerequisite: WorkItemId) -> Self {
        Self { dependent, prerequisite }
    }
}

/// Result of `get_next`.
///
/// `Exhausted` and `Blocked` are both "none available" but mean different
/// things to the orchestrator: the first is done, the second waits on
/// running work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NextItem {
    Ready { item: WorkItem },
    Blocked { pending: usize },
    Exhausted,
}

impl NextItem {
    pub fn ready(self) -> Option<WorkItem> {
        match self {
            NextItem::Ready { item } => Some(item),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailable {
    Exhausted,
    Blocked,
    /// The store stayed locked by other claimants through every retry.
    Contended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub item: WorkItem,
    pub worker_id: String,
    pub token: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed(Claim),
    NoneAvailable { reason: Unavailable },
}

impl ClaimOutcome {
    pub fn claimed(self) -> Option<Claim> {
        match self {
            ClaimOutcome::Claimed(claim) => Some(claim),
            ClaimOutcome::NoneAvailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub passing: usize,
    pub skipped: usize,
    pub total: usize,
}

impl QueueStats {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.passing as f64 / self.total as f64) * 100.0
    }
}

/// Outcome of `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// Claim released, item back to `pending` for another attempt.
    Released { attempts: u32 },
    /// Attempts exhausted, item is now `skipped`.
    Abandoned { attempts: u32 },
    /// Token did not match the live claim; nothing changed.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_through_str() {
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Claimed,
            WorkItemStatus::Passing,
            WorkItemStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<WorkItemStatus>().unwrap(), status);
        }
        assert!("done".parse::<WorkItemStatus>().is_err());
    }

    #[test]
    fn test_stats_percentage() {
        let stats = QueueStats { pending: 1, claimed: 1, passing: 2, skipped: 0, total: 4 };
        assert_eq!(stats.percentage(), 50.0);
        assert_eq!(QueueStats::default().percentage(), 0.0);
    }

    #[test]
    fn test_new_work_item_deserializes_dependency_refs() {
        let json = r#"{
            "category": "auth",
            "name": "Login form",
            "depends_on": [{"existing": 4}, {"batch": 0}]
        }"#;
        let item: NewWorkItem = serde_json::from_str(json).unwrap();
        assert_eq!(
            item.depends_on,
            vec![DependencyRef::Existing(WorkItemId(4)), DependencyRef::Batch(0)]
        );
        assert!(item.priority.is_none());
        assert!(item.steps.is_empty());
    }
}
