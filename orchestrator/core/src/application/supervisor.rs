// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Supervisor
//!
//! Owns the process table: spawns session runner processes, monitors them,
//! and reaps them. The supervisor is the table's only mutator; callers hold
//! it by `&mut` from a single control loop.
//!
//! Each running worker gets one monitor task. The monitor owns the
//! `tokio::process::Child`, pumps stdout and stderr through a
//! `StatusTracker` onto the observation channel, and reports the exit on an
//! mpsc channel after both pipes are drained. Every output event of a
//! worker is therefore published before its exit is reported.
//!
//! Each worker leads its own process group. Termination signals go to the
//! whole group, so nothing a session runner started outlives `shutdown`.
//!
//! ## Runner Invocation
//! `<program> <args..> --project-dir <dir> --role <coding|verification>`
//!
//! | Variable | Value |
//! |----------|-------|
//! | `AUTOBUILD_WORKER_ID` | claim identity of the worker |
//! | `AUTOBUILD_ROLE` | `coding` or `verification` |
//! | `AUTOBUILD_ITEM_ID` | assigned item (coding only) |
//! | `AUTOBUILD_REGRESSION_IDS` | comma-separated sample (verification only) |
//! | `AUTOBUILD_PROJECT_DIR` | project directory |
//! | `AUTOBUILD_DATABASE` | work item database path |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::status_tracker::StatusTracker;
use crate::domain::events::{ObservationMessage, OutputStream};
use crate::domain::node_config::{OrchestratorConfigSpec, RunnerConfig};
use crate::domain::worker::{
    ExitStatus, RoleKind, WorkerId, WorkerProcess, WorkerRole, WorkerState, WorkerStateError,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::process::{exit_status_from, force_kill, request_termination};

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// OS-level failure or resource exhaustion while creating the process.
    #[error("failed to spawn {role} worker {worker}: {source}")]
    Spawn {
        worker: WorkerId,
        role: RoleKind,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] WorkerStateError),

    #[error("worker {0} is already in the process table")]
    DuplicateWorker(WorkerId),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runner: RunnerConfig,
    pub project_dir: PathBuf,
    pub database_path: PathBuf,
    /// Exit codes classified as `failed` rather than `crashed`.
    pub failure_codes: Vec<i32>,
    pub shutdown_grace: Duration,
}

impl SupervisorConfig {
    pub fn from_spec(spec: &OrchestratorConfigSpec, project_dir: &Path) -> Self {
        Self {
            runner: spec.runner.clone(),
            project_dir: project_dir.to_path_buf(),
            database_path: spec.database.resolve_path(project_dir),
            failure_codes: spec.orchestrator.reported_failure_codes.clone(),
            shutdown_grace: Duration::from_millis(spec.orchestrator.shutdown_grace_ms),
        }
    }
}

/// Live worker counts by role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub coding: usize,
    pub verification: usize,
}

impl RoleCounts {
    pub fn total(&self) -> usize {
        self.coding + self.verification
    }
}

/// A worker removed from the table, with the terminal state it reached
/// before reaping.
#[derive(Debug, Clone)]
pub struct ReapedWorker {
    pub process: WorkerProcess,
    pub outcome: WorkerState,
}

struct ExitReport {
    worker: WorkerId,
    exit: ExitStatus,
}

struct Entry {
    process: WorkerProcess,
    kill: CancellationToken,
    monitor: JoinHandle<()>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    events: EventBus,
    table: HashMap<WorkerId, Entry>,
    next_id: u64,
    exit_tx: mpsc::UnboundedSender<ExitReport>,
    exit_rx: mpsc::UnboundedReceiver<ExitReport>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, events: EventBus) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            config,
            events,
            table: HashMap::new(),
            next_id: 0,
            exit_tx,
            exit_rx,
        }
    }

    pub fn next_worker_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId(self.next_id)
    }

    pub fn counts(&self) -> RoleCounts {
        self.table
            .values()
            .filter(|entry| entry.process.state.is_live())
            .fold(RoleCounts::default(), |mut counts, entry| {
                match entry.process.kind() {
                    RoleKind::Coding => counts.coding += 1,
                    RoleKind::Verification => counts.verification += 1,
                }
                counts
            })
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Starts a session runner process for `role`. `claim_identity` is the
    /// string the worker's claim was recorded under.
    pub fn spawn(
        &mut self,
        id: WorkerId,
        claim_identity: &str,
        role: WorkerRole,
    ) -> Result<Option<u32>, SupervisorError> {
        if self.table.contains_key(&id) {
            return Err(SupervisorError::DuplicateWorker(id));
        }

        let mut process = WorkerProcess::new(id, role);
        process.start_spawning()?;
        self.publish_update(&process);

        let mut child = match self.command(claim_identity, &process.role).spawn() {
            Ok(child) => child,
            Err(source) => {
                process.transition(WorkerState::Crashed)?;
                self.publish_update(&process);
                process.reap()?;
                self.publish_update(&process);
                metrics::counter!("autobuild_worker_spawn_failures_total").increment(1);
                return Err(SupervisorError::Spawn { worker: id, role: process.kind(), source });
            }
        };

        let pid = child.id();
        process.mark_running(pid)?;
        self.publish_update(&process);
        info!(worker = %id, role = %process.kind(), pid, "worker spawned");
        metrics::counter!("autobuild_workers_spawned_total", "role" => process.kind().as_str())
            .increment(1);

        let item = process.role.item_id();
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let tracker = StatusTracker::new(id, OutputStream::Stdout).with_item(item);
            pumps.push(tokio::spawn(pump(stdout, tracker, self.events.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            let tracker = StatusTracker::new(id, OutputStream::Stderr).with_item(item);
            pumps.push(tokio::spawn(pump(stderr, tracker, self.events.clone())));
        }

        let kill = CancellationToken::new();
        let monitor = tokio::spawn(monitor(id, child, pumps, kill.clone(), self.exit_tx.clone()));
        self.table.insert(id, Entry { process, kill, monitor });
        metrics::gauge!("autobuild_workers_live").set(self.counts().total() as f64);

        Ok(pid)
    }

    fn command(&self, claim_identity: &str, role: &WorkerRole) -> Command {
        let runner = &self.config.runner;
        let mut command = Command::new(&runner.program);
        command
            .args(&runner.args)
            .arg("--project-dir")
            .arg(&self.config.project_dir)
            .arg("--role")
            .arg(role.kind().as_str())
            .envs(&runner.env)
            .env("AUTOBUILD_WORKER_ID", claim_identity)
            .env("AUTOBUILD_ROLE", role.kind().as_str())
            .env("AUTOBUILD_PROJECT_DIR", &self.config.project_dir)
            .env("AUTOBUILD_DATABASE", &self.config.database_path)
            .current_dir(&self.config.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        match role {
            WorkerRole::Coding { item_id, .. } => {
                command.env("AUTOBUILD_ITEM_ID", item_id.0.to_string());
            }
            WorkerRole::Verification { sample } => {
                let ids: Vec<String> = sample.iter().map(|id| id.0.to_string()).collect();
                command.env("AUTOBUILD_REGRESSION_IDS", ids.join(","));
            }
        }
        command
    }

    /// Waits for the next worker exit and reaps it. Pending forever while
    /// the table is empty. Cancel-safe.
    pub async fn next_exit(&mut self) -> Option<ReapedWorker> {
        loop {
            let report = self.exit_rx.recv().await?;
            match self.reap(report) {
                Ok(Some(reaped)) => return Some(reaped),
                Ok(None) => continue,
                Err(e) => warn!("failed to reap worker: {}", e),
            }
        }
    }

    fn reap(&mut self, report: ExitReport) -> Result<Option<ReapedWorker>, SupervisorError> {
        let Some(mut entry) = self.table.remove(&report.worker) else {
            debug!(worker = %report.worker, "exit report for unknown worker ignored");
            return Ok(None);
        };

        let outcome = entry.process.finish(report.exit, &self.config.failure_codes)?;
        self.publish_update(&entry.process);
        entry.process.reap()?;
        self.publish_update(&entry.process);

        info!(
            worker = %entry.process.id,
            role = %entry.process.kind(),
            exit = %report.exit,
            outcome = %outcome,
            "worker reaped"
        );
        metrics::counter!("autobuild_workers_reaped_total", "outcome" => outcome.to_string())
            .increment(1);
        metrics::gauge!("autobuild_workers_live").set(self.counts().total() as f64);

        Ok(Some(ReapedWorker { process: entry.process, outcome }))
    }

    /// SIGTERM to every worker, SIGKILL to those still running after the
    /// grace period. Returns once the table is empty.
    pub async fn shutdown(&mut self) -> Vec<ReapedWorker> {
        let mut reaped = Vec::new();
        if self.table.is_empty() {
            return reaped;
        }

        info!(workers = self.table.len(), "terminating workers");
        for entry in self.table.values() {
            if let Some(pid) = entry.process.pid {
                if let Err(e) = request_termination(pid) {
                    debug!(worker = %entry.process.id, pid, "SIGTERM failed: {}", e);
                    entry.kill.cancel();
                }
            } else {
                entry.kill.cancel();
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.table.is_empty() {
            match tokio::time::timeout_at(deadline, self.next_exit()).await {
                Ok(Some(worker)) => reaped.push(worker),
                Ok(None) => break,
                Err(_) => {
                    warn!(workers = self.table.len(), "grace period elapsed, killing workers");
                    for entry in self.table.values() {
                        entry.kill.cancel();
                    }
                    break;
                }
            }
        }

        while !self.table.is_empty() {
            match self.next_exit().await {
                Some(worker) => reaped.push(worker),
                None => break,
            }
        }

        // descendants that outlived their runner
        for worker in &reaped {
            if let Some(pid) = worker.process.pid {
                if force_kill(pid).is_ok() {
                    debug!(worker = %worker.process.id, pid, "killed leftover process group");
                }
            }
        }
        reaped
    }

    fn publish_update(&self, process: &WorkerProcess) {
        self.events.publish(ObservationMessage::AgentUpdate {
            worker: process.id,
            role: process.kind(),
            state: process.state,
            item_id: process.role.item_id(),
            exit: process.exit,
        });
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // aborting a monitor drops its Child, and kill_on_drop reaps it
        for entry in self.table.values() {
            if let Some(pid) = entry.process.pid {
                let _ = force_kill(pid);
            }
            entry.kill.cancel();
            entry.monitor.abort();
        }
    }
}


/// Longest wait for the output pumps after the process itself has exited.
/// A grandchild holding a pipe open must not stall reaping.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

async fn pump<R>(reader: R, tracker: StatusTracker, events: EventBus)
where
    R: AsyncRead + Unpin,
{
    let mut tracked = std::pin::pin!(tracker.track_stream(output_lines(reader)));
    while let Some(event) = tracked.next().await {
        events.publish(event.into());
    }
}

/// Lines of `reader` with invalid UTF-8 replaced. Ends at EOF or on a read
/// error; a bad byte never stops the pipe from being drained.
fn output_lines<R>(reader: R) -> impl Stream<Item = String>
where
    R: AsyncRead + Unpin,
{
    futures::stream::unfold(
        (BufReader::new(reader), Vec::new()),
        |(mut reader, mut buf)| async move {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => None,
                Ok(_) => {
                    let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    let line = String::from_utf8_lossy(line).into_owned();
                    Some((line, (reader, buf)))
                }
                Err(e) => {
                    debug!("worker output read failed: {}", e);
                    None
                }
            }
        },
    )
}

async fn monitor(
    worker: WorkerId,
    mut child: Child,
    pumps: Vec<JoinHandle<()>>,
    kill: CancellationToken,
    exit_tx: mpsc::UnboundedSender<ExitReport>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Some(pid) = child.id() {
                if let Err(e) = force_kill(pid) {
                    debug!(worker = %worker, pid, "SIGKILL to process group failed: {}", e);
                }
            }
            if let Err(e) = child.start_kill() {
                debug!(worker = %worker, "SIGKILL failed: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => exit_status_from(status),
        Err(e) => {
            warn!(worker = %worker, "failed to wait on worker process: {}", e);
            ExitStatus::Unknown
        }
    };

    for mut pump in pumps {
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            debug!(worker = %worker, "output pipe still open after exit");
            pump.abort();
        }
    }

    // receiver only disappears with the supervisor
    let _ = exit_tx.send(ExitReport { worker, exit });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::work_item::WorkItemId;

    fn supervisor(script: &str, dir: &std::path::Path, events: EventBus) -> Supervisor {
        Supervisor::new(
            SupervisorConfig {
                runner: RunnerConfig {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), script.to_string()],
                    env: Default::default(),
                },
                project_dir: dir.to_path_buf(),
                database_path: dir.join("features.db"),
                failure_codes: vec![2],
                shutdown_grace: Duration::from_millis(500),
            },
            events,
        )
    }

    fn coding(item: i64) -> WorkerRole {
        WorkerRole::Coding { item_id: WorkItemId(item), claim_token: 1 }
    }

    async fn run_one(script: &str) -> ReapedWorker {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(script, dir.path(), EventBus::new(64));
        let id = sup.next_worker_id();
        sup.spawn(id, "test:1", coding(1)).unwrap();
        sup.next_exit().await.unwrap()
    }

    #[tokio::test]
    async fn test_exit_codes_classify_outcome() {
        assert_eq!(run_one("exit 0").await.outcome, WorkerState::Completed);
        assert_eq!(run_one("exit 2").await.outcome, WorkerState::Failed);
        assert_eq!(run_one("exit 7").await.outcome, WorkerState::Crashed);
    }

    #[tokio::test]
    async fn test_output_published_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut sup = supervisor(
            "echo \"item $AUTOBUILD_ITEM_ID as $AUTOBUILD_ROLE\"; echo 'Traceback' >&2",
            dir.path(),
            events,
        );
        let id = sup.next_worker_id();
        sup.spawn(id, "test:1", coding(9)).unwrap();

        let reaped = sup.next_exit().await.unwrap();
        assert_eq!(reaped.process.state, WorkerState::Reaped);
        assert!(sup.is_empty());

        let messages = rx.drain();
        let types: Vec<&str> = messages.iter().map(|m| m.message_type()).collect();
        let last_output = types.iter().rposition(|t| *t == "log" || *t == "agent_status");
        let completed = messages.iter().position(|m| {
            matches!(m, ObservationMessage::AgentUpdate { state: WorkerState::Completed, .. })
        });
        assert!(last_output.unwrap() < completed.unwrap());

        assert!(messages.iter().any(|m| matches!(
            m,
            ObservationMessage::Log { line, .. } if line == "item 9 as coding"
        )));
        assert!(messages.iter().any(|m| matches!(
            m,
            ObservationMessage::AgentStatus { status: crate::domain::events::StatusKind::Error, item_id: Some(WorkItemId(9)), .. }
        )));
    }

    fn output(messages: &[ObservationMessage]) -> Vec<&str> {
        messages
            .iter()
            .filter_map(|m| match m {
                ObservationMessage::Log { line, .. }
                | ObservationMessage::AgentStatus { line, .. } => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_worker_running() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut sup = supervisor(
            r"printf 'caf\351\n'; sleep 0.3; echo after; exit 0",
            dir.path(),
            events,
        );
        let id = sup.next_worker_id();
        sup.spawn(id, "test:1", coding(1)).unwrap();

        let reaped = sup.next_exit().await.unwrap();
        assert_eq!(reaped.outcome, WorkerState::Completed);
        assert_eq!(reaped.process.exit, Some(ExitStatus::Code { code: 0 }));

        let messages = rx.drain();
        let lines = output(&messages);
        assert!(lines.contains(&"caf\u{FFFD}"));
        assert!(lines.contains(&"after"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_processes_started_by_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut sup = supervisor("(sleep 1; touch late) & echo ready; wait", dir.path(), events);
        let id = sup.next_worker_id();
        sup.spawn(id, "test", coding(1)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(ObservationMessage::Log { line, .. })
                    | Ok(ObservationMessage::AgentStatus { line, .. })
                        if line == "ready" =>
                    {
                        break
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .unwrap();

        let reaped = sup.shutdown().await;
        assert_eq!(reaped.len(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn test_counts_track_live_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor("exec sleep 30", dir.path(), EventBus::new(64));
        for _ in 0..2 {
            let id = sup.next_worker_id();
            sup.spawn(id, "test", coding(1)).unwrap();
        }
        let id = sup.next_worker_id();
        sup.spawn(id, "test", WorkerRole::Verification { sample: vec![WorkItemId(1)] })
            .unwrap();

        assert_eq!(sup.counts(), RoleCounts { coding: 2, verification: 1 });
        assert_eq!(sup.counts().total(), 3);

        let reaped = sup.shutdown().await;
        assert_eq!(reaped.len(), 3);
        assert!(reaped.iter().all(|w| w.outcome == WorkerState::Crashed));
        assert_eq!(sup.counts().total(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_kills_workers_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor("trap '' TERM; sleep 30", dir.path(), EventBus::new(64));
        let id = sup.next_worker_id();
        sup.spawn(id, "test", coding(1)).unwrap();

        let started = std::time::Instant::now();
        let reaped = sup.shutdown().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].process.exit, Some(ExitStatus::Signal { signal: libc::SIGKILL }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_table_empty() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut sup = supervisor("exit 0", dir.path(), events);
        sup.config.runner.program = dir.path().join("missing-runner").display().to_string();

        let id = sup.next_worker_id();
        let err = sup.spawn(id, "test", coding(1)).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(sup.is_empty());

        let states: Vec<WorkerState> = rx
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ObservationMessage::AgentUpdate { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![WorkerState::Spawning, WorkerState::Crashed, WorkerState::Reaped]
        );
    }

    #[tokio::test]
    async fn test_duplicate_worker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor("exec sleep 30", dir.path(), EventBus::new(64));
        let id = sup.next_worker_id();
        sup.spawn(id, "test", coding(1)).unwrap();
        assert!(matches!(
            sup.spawn(id, "test", coding(2)),
            Err(SupervisorError::DuplicateWorker(_))
        ));
        sup.shutdown().await;
    }
}
