// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod orchestrator;
pub mod status_tracker;
pub mod supervisor;

pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome, RunReport, RunSummary};
pub use status_tracker::{classify, StatusTracker};
pub use supervisor::{ReapedWorker, RoleCounts, Supervisor, SupervisorConfig, SupervisorError};
