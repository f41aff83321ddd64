// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Work items, their dependency graph, command policy, and worker
//! lifecycle types. No I/O lives here.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Aggregates, value objects, and repository contracts

pub mod command_policy;
pub mod dependency_graph;
pub mod events;
pub mod node_config;
pub mod repository;
pub mod work_item;
pub mod worker;
