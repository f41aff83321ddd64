// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::work_item::{QueueStats, WorkItemId, WorkItemStatus};
use crate::domain::worker::{ExitStatus, RoleKind, WorkerId, WorkerState};

/// Lifecycle phase inferred from one line of worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Thinking,
    Working,
    Testing,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One classified output line. `kind == None` is a raw log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub worker: WorkerId,
    pub stream: OutputStream,
    pub kind: Option<StatusKind>,
    /// From a `[Worker N]` prefix.
    pub worker_index: Option<u32>,
    /// From a `[Feature #N]` prefix.
    pub item_id: Option<WorkItemId>,
    pub line: String,
    pub observed_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn is_raw(&self) -> bool {
        self.kind.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub stats: QueueStats,
    pub percentage: f64,
}

impl From<QueueStats> for ProgressPayload {
    fn from(stats: QueueStats) -> Self {
        Self { percentage: stats.percentage(), stats }
    }
}

/// Messages published on the observation channel.
///
/// Serialized as `{"type": ..., "payload": {...}}`. Delivery is in order per
/// worker; messages from different workers may interleave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ObservationMessage {
    Progress(ProgressPayload),
    AgentStatus {
        worker: WorkerId,
        worker_index: Option<u32>,
        item_id: Option<WorkItemId>,
        status: StatusKind,
        line: String,
        observed_at: DateTime<Utc>,
    },
    Log {
        worker: WorkerId,
        stream: OutputStream,
        line: String,
        observed_at: DateTime<Utc>,
    },
    FeatureUpdate {
        item_id: WorkItemId,
        status: WorkItemStatus,
        worker: Option<WorkerId>,
    },
    AgentUpdate {
        worker: WorkerId,
        role: RoleKind,
        state: WorkerState,
        item_id: Option<WorkItemId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitStatus>,
    },
}

impl ObservationMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ObservationMessage::Progress(_) => "progress",
            ObservationMessage::AgentStatus { .. } => "agent_status",
            ObservationMessage::Log { .. } => "log",
            ObservationMessage::FeatureUpdate { .. } => "feature_update",
            ObservationMessage::AgentUpdate { .. } => "agent_update",
        }
    }

    /// Originating worker, if the message belongs to one.
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            ObservationMessage::AgentStatus { worker, .. }
            | ObservationMessage::Log { worker, .. }
            | ObservationMessage::AgentUpdate { worker, .. } => Some(*worker),
            ObservationMessage::FeatureUpdate { worker, .. } => *worker,
            ObservationMessage::Progress(_) => None,
        }
    }
}

impl From<StatusEvent> for ObservationMessage {
    fn from(event: StatusEvent) -> Self {
        match event.kind {
            Some(status) => ObservationMessage::AgentStatus {
                worker: event.worker,
                worker_index: event.worker_index,
                item_id: event.item_id,
                status,
                line: event.line,
                observed_at: event.observed_at,
            },
            None => ObservationMessage::Log {
                worker: event.worker,
                stream: event.stream,
                line: event.line,
                observed_at: event.observed_at,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_type_and_payload() {
        let msg = ObservationMessage::FeatureUpdate {
            item_id: WorkItemId(3),
            status: WorkItemStatus::Passing,
            worker: Some(WorkerId(1)),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "feature_update");
        assert_eq!(value["payload"]["item_id"], 3);
        assert_eq!(value["payload"]["status"], "passing");
        assert_eq!(msg.message_type(), "feature_update");
    }

    #[test]
    fn test_raw_event_becomes_log() {
        let event = StatusEvent {
            worker: WorkerId(2),
            stream: OutputStream::Stderr,
            kind: None,
            worker_index: None,
            item_id: None,
            line: "hello".to_string(),
            observed_at: Utc::now(),
        };
        let msg = ObservationMessage::from(event);
        assert!(matches!(msg, ObservationMessage::Log { stream: OutputStream::Stderr, .. }));
        assert_eq!(msg.worker(), Some(WorkerId(2)));
    }

    #[test]
    fn test_progress_carries_percentage() {
        let stats = QueueStats { pending: 3, claimed: 0, passing: 1, skipped: 0, total: 4 };
        let value = serde_json::to_value(ObservationMessage::Progress(stats.into())).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["payload"]["percentage"], 25.0);
        assert_eq!(value["payload"]["stats"]["passing"], 1);
    }
}
