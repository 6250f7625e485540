// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build::{BuildId, BuildStatus};
use crate::domain::deployment::{DeployId, DeploymentStatus};
use crate::domain::policy::PolicyViolation;
use crate::domain::protocol::RuntimeSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BuildEvent {
    BuildQueued {
        build_id: BuildId,
        channel_id: String,
        queued_at: DateTime<Utc>,
    },
    BuildRejected {
        build_id: BuildId,
        channel_id: String,
        violations: Vec<PolicyViolation>,
        rejected_at: DateTime<Utc>,
    },
    BuildStatusChanged {
        build_id: BuildId,
        channel_id: String,
        status: BuildStatus,
        changed_at: DateTime<Utc>,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> BuildId {
        match self {
            BuildEvent::BuildQueued { build_id, .. }
            | BuildEvent::BuildRejected { build_id, .. }
            | BuildEvent::BuildStatusChanged { build_id, .. } => *build_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeploymentEvent {
    DeploymentStatusChanged {
        deploy_id: DeployId,
        build_id: BuildId,
        runtime_id: String,
        channel_id: String,
        status: DeploymentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        changed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentEvent {
    AgentConnected {
        runtime_id: String,
        agent_version: String,
        connected_at: DateTime<Utc>,
    },
    AgentDisconnected {
        runtime_id: String,
        disconnected_at: DateTime<Utc>,
    },
    AgentWentOffline {
        runtime_id: String,
        last_seen_secs: u64,
        detected_at: DateTime<Utc>,
    },
    RuntimeSummaryReceived {
        runtime_id: String,
        summary: RuntimeSummary,
    },
}
