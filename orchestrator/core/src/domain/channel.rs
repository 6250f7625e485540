// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent-side channel record and its state machine.
//!
//! | From | To |
//! |------|----|
//! | `stopped` | `starting` (deploy, start) |
//! | `starting` | `running` (ready), `error` (exit, startup window) |
//! | `running` | `draining` (stop, restart, deploy), `error` (exit) |
//! | `draining` | `stopped` (drained), `starting` (restart, deploy) |
//! | `error` | `starting` (restart, deploy) |
//!
//! `starting` and `running` move to `error` when the engine exits on its
//! own or misses the startup window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::integrity::IntegrityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Stopped,
    Starting,
    Running,
    Draining,
    Error,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Draining)
                | (Running, Error)
                | (Draining, Stopped)
                | (Draining, Starting)
                | (Error, Starting)
        )
    }

    /// States in which an engine process may be alive.
    pub fn has_process(self) -> bool {
        matches!(self, ChannelState::Starting | ChannelState::Running | ChannelState::Draining)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Draining => "draining",
            ChannelState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {channel_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        channel_id: String,
        from: ChannelState,
        to: ChannelState,
    },

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {0} has no installed build")]
    NoBuild(String),

    #[error("Bundle integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Failed to materialize bundle for {channel_id}: {message}")]
    Materialize { channel_id: String, message: String },

    #[error("Secret payload rejected: {0}")]
    Secrets(String),

    #[error("No free port available: {0}")]
    PortUnavailable(String),

    #[error("Failed to spawn engine for {channel_id}: {message}")]
    Spawn { channel_id: String, message: String },

    #[error("Engine for {channel_id} not ready within {window_ms}ms")]
    StartupTimeout { channel_id: String, window_ms: u64 },

    #[error("Engine for {channel_id} exited during startup: {status}")]
    ExitedDuringStartup { channel_id: String, status: String },
}

/// Mutable runtime record of one channel, as reported in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub channel_id: String,
    pub state: ChannelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChannelStatus {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            state: ChannelState::Stopped,
            pid: None,
            port: None,
            build_id: None,
            started_at: None,
            cpu_pct: None,
            rss_mb: None,
            last_error: None,
        }
    }

    pub fn transition_to(&mut self, next: ChannelState) -> Result<(), ChannelError> {
        if !self.state.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition {
                channel_id: self.channel_id.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            channel_id = %self.channel_id,
            from = %self.state,
            to = %next,
            "Channel state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Forget everything tied to the previous process.
    pub fn clear_process(&mut self) {
        self.pid = None;
        self.port = None;
        self.started_at = None;
        self.cpu_pct = None;
        self.rss_mb = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelState::*;

    const ALL: [ChannelState; 5] = [Stopped, Starting, Running, Draining, Error];

    #[test]
    fn test_allowed_edges() {
        let allowed = [
            (Stopped, Starting),
            (Starting, Running),
            (Starting, Error),
            (Running, Draining),
            (Running, Error),
            (Draining, Stopped),
            (Draining, Starting),
            (Error, Starting),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_stopped_cannot_run_without_starting() {
        let mut status = ChannelStatus::new("ch-1");
        let err = status.transition_to(Running).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidTransition { from: Stopped, to: Running, .. }));
        assert_eq!(status.state, Stopped);
    }

    #[test]
    fn test_error_left_only_by_starting() {
        let mut status = ChannelStatus::new("ch-1");
        status.transition_to(Starting).unwrap();
        status.transition_to(Error).unwrap();
        assert!(status.transition_to(Draining).is_err());
        assert!(status.transition_to(Stopped).is_err());
        status.transition_to(Starting).unwrap();
    }

    #[test]
    fn test_status_wire_shape() {
        let mut status = ChannelStatus::new("ch-1");
        status.pid = Some(42);
        status.cpu_pct = Some(1.5);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["channelId"], "ch-1");
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["pid"], 42);
        assert_eq!(json["cpuPct"], 1.5);
        assert!(json.get("port").is_none());
    }
}
