// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! OS process helpers for the supervisor: process group signalling and
//! exit status translation.
//!
//! Workers run as leaders of their own process group, so signalling the
//! group reaches everything a session runner started.

use crate::domain::worker::ExitStatus;

/// Sends SIGTERM to the process group led by `pid`.
pub fn request_termination(pid: u32) -> std::io::Result<()> {
    signal_group(pid, Signal::Terminate)
}

/// Sends SIGKILL to the process group led by `pid`.
pub fn force_kill(pid: u32) -> std::io::Result<()> {
    signal_group(pid, Signal::Kill)
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|pgid| *pgid > 1)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process group signals require unix",
    ))
}

pub fn exit_status_from(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Code { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signal { signal };
        }
    }
    ExitStatus::Unknown
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_codes_and_signals_translate() {
        let status = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_status_from(status), ExitStatus::Code { code: 3 });

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        request_termination(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_status_from(status), ExitStatus::Signal { signal: libc::SIGTERM });
    }

    #[tokio::test]
    async fn test_force_kill_reaches_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; (sleep 1; touch late) & wait"])
            .current_dir(dir.path())
            .process_group(0)
            .spawn()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        force_kill(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_status_from(status), ExitStatus::Signal { signal: libc::SIGKILL });

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[test]
    fn test_signalling_a_non_leader_fails() {
        // pid 1 never leads a worker group
        assert!(force_kill(1).is_err());
        assert!(request_termination(0).is_err());
    }
}
