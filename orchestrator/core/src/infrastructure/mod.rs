// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod policy_loader;
pub mod process;
pub mod repositories;

pub use event_bus::{EventBus, EventBusError, EventReceiver};
pub use policy_loader::PolicyLoader;
