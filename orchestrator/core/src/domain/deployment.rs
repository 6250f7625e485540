// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::build::{BuildId, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployId(pub Uuid);

impl DeployId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for DeployId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeployId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Sent,
    Acked,
    Timeout,
    Failed,
}

impl DeploymentStatus {
    /// `TIMEOUT -> SENT` is the single automatic retry; the orchestrator
    /// bounds how often it is taken.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Queued, Sent)
                | (Queued, Failed)
                | (Sent, Acked)
                | (Sent, Timeout)
                | (Sent, Failed)
                | (Timeout, Sent)
                | (Timeout, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Acked | DeploymentStatus::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::Sent => "SENT",
            DeploymentStatus::Acked => "ACKED",
            DeploymentStatus::Timeout => "TIMEOUT",
            DeploymentStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: DeployId,
    pub build_id: BuildId,
    pub runtime_id: String,
    pub channel_id: String,
    pub status: DeploymentStatus,
    /// Number of times the deploy command was sent.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    pub fn new(id: DeployId, build_id: BuildId, runtime_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            build_id,
            runtime_id: runtime_id.into(),
            channel_id: channel_id.into(),
            status: DeploymentStatus::Queued,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(&mut self, next: DeploymentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "deployment",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == DeploymentStatus::Sent {
            self.attempts += 1;
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(DeploymentStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}
