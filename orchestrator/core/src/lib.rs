// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! autobuild core
//!
//! Scheduling and orchestration engine for a multi-worker feature backlog:
//! the work item store with its dependency graph and atomic claim, the
//! process supervisor, the orchestrator control loop, command
//! authorization, and output status tracking.
//!
//! # Architecture
//!
//! - **domain:** pure types and rules, no I/O
//! - **application:** supervisor, orchestrator, status tracker
//! - **infrastructure:** SQLite store, event bus, policy files, OS signals

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
