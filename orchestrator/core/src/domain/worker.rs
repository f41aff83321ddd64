// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Process Entity
//!
//! A `WorkerProcess` is one OS process running an external session runner
//! in either the coding or the verification role. The Process Supervisor
//! owns every instance; nothing else mutates them.
//!
//! ## Lifecycle
//! ```text
//! idle -> spawning -> running -> completed -> reaped
//!             |           |----> failed    ---^
//!             |           '----> crashed   ---^
//!             '--> crashed (spawn error) -----^
//! ```
//! Terminal states (`completed`, `failed`, `crashed`) only move to
//! `reaped`, and only once the exit result has been collected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::work_item::WorkItemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Coding,
    Verification,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Coding => "coding",
            RoleKind::Verification => "verification",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role-specific assignment. Shared lifecycle fields live on
/// `WorkerProcess`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum WorkerRole {
    Coding { item_id: WorkItemId, claim_token: i64 },
    Verification { sample: Vec<WorkItemId> },
}

impl WorkerRole {
    pub fn kind(&self) -> RoleKind {
        match self {
            WorkerRole::Coding { .. } => RoleKind::Coding,
            WorkerRole::Verification { .. } => RoleKind::Verification,
        }
    }

    pub fn item_id(&self) -> Option<WorkItemId> {
        match self {
            WorkerRole::Coding { item_id, .. } => Some(*item_id),
            WorkerRole::Verification { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Spawning,
    Running,
    Completed,
    Failed,
    Crashed,
    Reaped,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Failed | WorkerState::Crashed)
    }

    /// Counts toward concurrency bounds.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Spawning | WorkerState::Running)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Spawning)
                | (Spawning, Running)
                | (Spawning, Crashed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Crashed)
                | (Completed, Reaped)
                | (Failed, Reaped)
                | (Crashed, Reaped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Spawning => "spawning",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Crashed => "crashed",
            WorkerState::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("worker {worker} cannot move from {from} to {to}")]
pub struct WorkerStateError {
    pub worker: WorkerId,
    pub from: WorkerState,
    pub to: WorkerState,
}

/// How a process ended, as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Code { code: i32 },
    Signal { signal: i32 },
    /// Never started, or the wait itself failed.
    Unknown,
}

impl ExitStatus {
    /// Maps an exit onto the terminal lifecycle state. `failure_codes`
    /// are the exit codes a runner uses to report that it could not finish
    /// its assignment.
    pub fn classify(&self, failure_codes: &[i32]) -> WorkerState {
        match self {
            ExitStatus::Code { code: 0 } => WorkerState::Completed,
            ExitStatus::Code { code } if failure_codes.contains(code) => WorkerState::Failed,
            _ => WorkerState::Crashed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code { code } => write!(f, "exit code {}", code),
            ExitStatus::Signal { signal } => write!(f, "signal {}", signal),
            ExitStatus::Unknown => f.write_str("unknown exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub exit: Option<ExitStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkerProcess {
    pub fn new(id: WorkerId, role: WorkerRole) -> Self {
        Self {
            id,
            role,
            state: WorkerState::Idle,
            pid: None,
            exit: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn transition(&mut self, next: WorkerState) -> Result<(), WorkerStateError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerStateError { worker: self.id, from: self.state, to: next });
        }
        match next {
            WorkerState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn start_spawning(&mut self) -> Result<(), WorkerStateError> {
        self.transition(WorkerState::Spawning)
    }

    pub fn mark_running(&mut self, pid: Option<u32>) -> Result<(), WorkerStateError> {
        self.transition(WorkerState::Running)?;
        self.pid = pid;
        Ok(())
    }

    /// Records the exit and moves to the classified terminal state.
    pub fn finish(
        &mut self,
        exit: ExitStatus,
        failure_codes: &[i32],
    ) -> Result<WorkerState, WorkerStateError> {
        let next = exit.classify(failure_codes);
        self.transition(next)?;
        self.exit = Some(exit);
        Ok(next)
    }

    pub fn reap(&mut self) -> Result<(), WorkerStateError> {
        self.transition(WorkerState::Reaped)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coding() -> WorkerProcess {
        WorkerProcess::new(
            WorkerId(1),
            WorkerRole::Coding { item_id: WorkItemId(7), claim_token: 3 },
        )
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut worker = coding();
        worker.start_spawning().unwrap();
        assert!(worker.state.is_live());
        worker.mark_running(Some(4242)).unwrap();
        assert_eq!(worker.pid, Some(4242));

        let state = worker.finish(ExitStatus::Code { code: 0 }, &[2]).unwrap();
        assert_eq!(state, WorkerState::Completed);
        assert!(!worker.state.is_live());
        assert!(worker.duration_ms().is_some());

        worker.reap().unwrap();
        assert_eq!(worker.state, WorkerState::Reaped);
    }

    #[test]
    fn test_exit_classification() {
        let codes = [2, 3];
        assert_eq!(ExitStatus::Code { code: 0 }.classify(&codes), WorkerState::Completed);
        assert_eq!(ExitStatus::Code { code: 3 }.classify(&codes), WorkerState::Failed);
        assert_eq!(ExitStatus::Code { code: 1 }.classify(&codes), WorkerState::Crashed);
        assert_eq!(ExitStatus::Signal { signal: 9 }.classify(&codes), WorkerState::Crashed);
        assert_eq!(ExitStatus::Unknown.classify(&codes), WorkerState::Crashed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut worker = coding();
        let err = worker.reap().unwrap_err();
        assert_eq!(err.from, WorkerState::Idle);
        assert_eq!(err.to, WorkerState::Reaped);

        worker.start_spawning().unwrap();
        assert!(worker.finish(ExitStatus::Code { code: 0 }, &[]).is_err());
        assert_eq!(worker.state, WorkerState::Spawning);

        // spawn errors go straight to crashed
        worker.transition(WorkerState::Crashed).unwrap();
        assert!(worker.transition(WorkerState::Running).is_err());
    }

    #[test]
    fn test_role_accessors() {
        let verify = WorkerRole::Verification { sample: vec![WorkItemId(1), WorkItemId(2)] };
        assert_eq!(verify.kind(), RoleKind::Verification);
        assert_eq!(verify.item_id(), None);
        assert_eq!(coding().role.item_id(), Some(WorkItemId(7)));
    }
}
