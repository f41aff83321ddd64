// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Status Tracker
//!
//! Turns a worker's output, one pass over a finite sequence of lines, into
//! ordered `StatusEvent`s. Works on plain iterators (tests, replay of a
//! captured log) and on async streams (live process pipes).
//!
//! ## Classification
//! Keyword groups are checked in this order; the first group with a match
//! decides. Matching is case-insensitive substring search.
//!
//! | Kind | Keywords |
//! |------|----------|
//! | success | `marked passing`, `feature_mark_passing`, `all tests pass` |
//! | error | `error`, `traceback`, `exception`, `failed`, `panicked` |
//! | testing | `running tests`, `playwright`, `cargo test`, `npm test`, `pytest`, `verifying` |
//! | working | `[tool:`, `writing`, `editing`, `creating`, `running` |
//! | thinking | `thinking`, `planning`, `analyzing`, `reading` |
//!
//! Lines matching nothing become raw log events. `[Worker N]` and
//! `[Feature #N]` prefixes set the worker index and item id for that line
//! and every following line of the same stream.

use chrono::Utc;
use futures::{Stream, StreamExt};
use regex::Regex;
use std::sync::LazyLock;

use crate::domain::events::{OutputStream, StatusEvent, StatusKind};
use crate::domain::work_item::WorkItemId;
use crate::domain::worker::WorkerId;

const RULES: &[(StatusKind, &[&str])] = &[
    (StatusKind::Success, &["marked passing", "feature_mark_passing", "all tests pass"]),
    (StatusKind::Error, &["error", "traceback", "exception", "failed", "panicked"]),
    (
        StatusKind::Testing,
        &["running tests", "playwright", "cargo test", "npm test", "pytest", "verifying"],
    ),
    (StatusKind::Working, &["[tool:", "writing", "editing", "creating", "running"]),
    (StatusKind::Thinking, &["thinking", "planning", "analyzing", "reading"]),
];

static WORKER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[worker\s+(\d+)\]").expect("worker prefix regex is valid")
});
static FEATURE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[feature\s+#(\d+)\]").expect("feature prefix regex is valid")
});

pub fn classify(line: &str) -> Option<StatusKind> {
    let lower = line.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| lower.contains(keyword)))
        .map(|(kind, _)| *kind)
}

fn capture<T: std::str::FromStr>(pattern: &Regex, line: &str) -> Option<T> {
    pattern
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Per-stream classifier state.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    worker: WorkerId,
    stream: OutputStream,
    worker_index: Option<u32>,
    item_id: Option<WorkItemId>,
}

impl StatusTracker {
    pub fn new(worker: WorkerId, stream: OutputStream) -> Self {
        Self { worker, stream, worker_index: None, item_id: None }
    }

    /// Item id to report until a `[Feature #N]` prefix says otherwise.
    pub fn with_item(mut self, item_id: Option<WorkItemId>) -> Self {
        self.item_id = item_id;
        self
    }

    pub fn observe(&mut self, line: impl Into<String>) -> StatusEvent {
        let line = line.into();
        if let Some(index) = capture(&WORKER_PREFIX, &line) {
            self.worker_index = Some(index);
        }
        if let Some(id) = capture::<i64>(&FEATURE_PREFIX, &line) {
            self.item_id = Some(WorkItemId(id));
        }
        StatusEvent {
            worker: self.worker,
            stream: self.stream,
            kind: classify(&line),
            worker_index: self.worker_index,
            item_id: self.item_id,
            line,
            observed_at: Utc::now(),
        }
    }

    pub fn track_lines<I>(self, lines: I) -> TrackedLines<I::IntoIter>
    where
        I: IntoIterator<Item = String>,
    {
        TrackedLines { tracker: self, lines: lines.into_iter() }
    }

    pub fn track_stream<S>(mut self, lines: S) -> impl Stream<Item = StatusEvent>
    where
        S: Stream<Item = String>,
    {
        lines.map(move |line| self.observe(line))
    }
}

/// Lazy iterator adaptor returned by `StatusTracker::track_lines`.
pub struct TrackedLines<I> {
    tracker: StatusTracker,
    lines: I,
}

impl<I: Iterator<Item = String>> Iterator for TrackedLines<I> {
    type Item = StatusEvent;

    fn next(&mut self) -> Option<StatusEvent> {
        self.lines.next().map(|line| self.tracker.observe(line))
    }
}
