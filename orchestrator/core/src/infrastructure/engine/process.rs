// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Owned engine child process.
//!
//! A watcher task owns the `tokio::process::Child`. The handle asks it to
//! terminate with a grace period; the watcher sends SIGTERM, waits at most
//! that long, then kills. Whichever way the process ends, the exit is
//! published once. An exit nobody asked for also fires the `on_exit`
//! callback so the owner can mark the channel as failed.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::domain::runtime::LaunchCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub description: String,
    /// Whether the exit followed a terminate request.
    pub requested: bool,
}

impl ExitReport {
    fn from_status(status: io::Result<ExitStatus>, requested: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                description: status.to_string(),
                requested,
            },
            Err(e) => Self {
                code: None,
                description: format!("wait failed: {e}"),
                requested,
            },
        }
    }

    fn lost() -> Self {
        Self {
            code: None,
            description: "process watcher ended without a report".to_string(),
            requested: false,
        }
    }
}

enum WatchEvent {
    Exited(io::Result<ExitStatus>),
    Terminate(Duration),
}

pub struct EngineProcess {
    channel_id: String,
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl EngineProcess {
    pub fn spawn<F>(command: &LaunchCommand, channel_id: &str, on_exit: F) -> io::Result<Self>
    where
        F: FnOnce(ExitReport) + Send + 'static,
    {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, channel_id.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, channel_id.to_string(), "stderr"));
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_child(child, pid, channel_id.to_string(), terminate_rx, exit_tx, on_exit));

        info!(channel_id, pid = ?pid, program = %command.program.display(), "Engine process spawned");
        Ok(Self {
            channel_id: channel_id.to_string(),
            pid,
            terminate_tx: Some(terminate_tx),
            exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once the process has exited, for whatever reason.
    pub async fn wait_exit(&self) -> ExitReport {
        let mut rx = self.exit_rx.clone();
        let report = match rx.wait_for(|report| report.is_some()).await {
            Ok(report) => report.clone().unwrap_or_else(ExitReport::lost),
            Err(_) => ExitReport::lost(),
        };
        report
    }

    /// Ask for a graceful exit within `grace`, killing afterwards. A zero
    /// grace kills immediately. Returns once the process is gone.
    pub async fn terminate(&mut self, grace: Duration) -> ExitReport {
        if let Some(tx) = self.terminate_tx.take() {
            debug!(channel_id = %self.channel_id, pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Terminating engine");
            let _ = tx.send(grace);
        }
        self.wait_exit().await
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Duration::ZERO);
        }
    }
}

async fn watch_child<F>(
    mut child: Child,
    pid: Option<u32>,
    channel_id: String,
    mut terminate_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    on_exit: F,
) where
    F: FnOnce(ExitReport) + Send + 'static,
{
    let event = tokio::select! {
        status = child.wait() => WatchEvent::Exited(status),
        grace = &mut terminate_rx => WatchEvent::Terminate(grace.unwrap_or(Duration::ZERO)),
    };

    let report = match event {
        WatchEvent::Exited(status) => ExitReport::from_status(status, false),
        WatchEvent::Terminate(grace) => ExitReport::from_status(shutdown(&mut child, pid, grace).await, true),
    };

    if report.requested {
        info!(channel_id = %channel_id, pid = ?pid, status = %report.description, "Engine stopped");
    } else {
        warn!(channel_id = %channel_id, pid = ?pid, status = %report.description, "Engine exited unexpectedly");
    }
    let _ = exit_tx.send(Some(report.clone()));
    if !report.requested {
        on_exit(report);
    }
}

async fn shutdown(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    if !grace.is_zero() && signal_terminate(pid) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        debug!(pid = ?pid, grace_ms = grace.as_millis() as u64, "Drain window elapsed, killing engine");
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn signal_terminate(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return false;
    };
    // SAFETY: pid belongs to a child we have not reaped yet
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: Option<u32>) -> bool {
    false
}

async fn forward_output<R>(stream: R, channel_id: String, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(channel_id = %channel_id, source, "{line}");
    }
}
