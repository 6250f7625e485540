// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Control Protocol Messages
//!
//! Closed sets of `op`-tagged frames exchanged over the per-agent
//! connection. Field names are camelCase on the wire; op names are
//! kebab-case (`deploy-result`, `update-agent`, ...).
//!
//! Commands that expect a reply carry a `correlationId`. The agent echoes it
//! as `ref` on an `ack`, or as `correlationId` on `status` and
//! `deploy-result`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::bundle::{BuildMode, BundleContent};
use crate::domain::channel::ChannelStatus;

/// Behaviour shared by both directions of the protocol.
pub trait Frame: Serialize + DeserializeOwned + Send + 'static {
    /// Wire name of the op, for logs and metrics.
    fn op(&self) -> &'static str;

    /// Critical frames fail fast when the outbound queue is full; the rest
    /// are dropped and counted.
    fn is_critical(&self) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub mqtt: bool,
    pub http_proxy: bool,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHello {
    pub runtime_id: String,
    pub agent_version: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayInfo>,
    pub capabilities: AgentCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSummary {
    pub runtime_id: String,
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayInfo>,
    pub channels: Vec<ChannelStatus>,
    pub ts: DateTime<Utc>,
}

impl RuntimeSummary {
    pub fn channel(&self, channel_id: &str) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }
}

/// Secret values sealed with AES-256-GCM under a key derived from the
/// agent's bootstrap token. Opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPayload {
    /// Base64 96-bit nonce.
    pub nonce: String,
    /// Base64 ciphertext of a JSON object `{ secretName: value }`.
    pub ciphertext: String,
}

/// Control plane to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Deploy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        build_id: String,
        bundle_content: BundleContent,
        channel_id: String,
        mode: BuildMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_payload: Option<SecretPayload>,
    },
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        channel_id: String,
    },
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain_ms: Option<u64>,
    },
    Restart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        channel_id: String,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    UpdateAgent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        url: String,
        /// Base64 Ed25519 signature over the downloaded artifact.
        signature: String,
    },
    OverlayEnroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        enrollment_code: String,
    },
}

impl ControlMessage {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Deploy { correlation_id, .. }
            | ControlMessage::Start { correlation_id, .. }
            | ControlMessage::Stop { correlation_id, .. }
            | ControlMessage::Restart { correlation_id, .. }
            | ControlMessage::Status { correlation_id }
            | ControlMessage::UpdateAgent { correlation_id, .. }
            | ControlMessage::OverlayEnroll { correlation_id, .. } => correlation_id.as_deref(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        let slot = match &mut self {
            ControlMessage::Deploy { correlation_id, .. }
            | ControlMessage::Start { correlation_id, .. }
            | ControlMessage::Stop { correlation_id, .. }
            | ControlMessage::Restart { correlation_id, .. }
            | ControlMessage::Status { correlation_id }
            | ControlMessage::UpdateAgent { correlation_id, .. }
            | ControlMessage::OverlayEnroll { correlation_id, .. } => correlation_id,
        };
        *slot = Some(id.into());
        self
    }

    /// Channel the command targets, if any.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Deploy { channel_id, .. }
            | ControlMessage::Start { channel_id, .. }
            | ControlMessage::Stop { channel_id, .. }
            | ControlMessage::Restart { channel_id, .. } => Some(channel_id),
            ControlMessage::Status { .. }
            | ControlMessage::UpdateAgent { .. }
            | ControlMessage::OverlayEnroll { .. } => None,
        }
    }

    /// `(channelId, buildId)` used to match a `deploy-result` that lost its
    /// correlation id.
    pub fn deploy_key(&self) -> Option<(String, String)> {
        match self {
            ControlMessage::Deploy { channel_id, build_id, .. } => Some((channel_id.clone(), build_id.clone())),
            _ => None,
        }
    }
}

impl Frame for ControlMessage {
    fn op(&self) -> &'static str {
        match self {
            ControlMessage::Deploy { .. } => "deploy",
            ControlMessage::Start { .. } => "start",
            ControlMessage::Stop { .. } => "stop",
            ControlMessage::Restart { .. } => "restart",
            ControlMessage::Status { .. } => "status",
            ControlMessage::UpdateAgent { .. } => "update-agent",
            ControlMessage::OverlayEnroll { .. } => "overlay-enroll",
        }
    }

    fn is_critical(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn default_true() -> bool {
    true
}

/// Agent to control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    Hello {
        payload: AgentHello,
    },
    Ack {
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default = "default_true")]
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Channel record after the command, for channel commands.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelStatus>,
    },
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        summary: RuntimeSummary,
    },
    DeployResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        channel_id: String,
        build_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        /// Merkle root the agent recomputed before starting the build.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verified_root: Option<String>,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        level: LogLevel,
        msg: String,
    },
    Heartbeat {
        ts: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<RuntimeSummary>,
    },
}

impl AgentMessage {
    pub fn ack(reference: Option<String>) -> Self {
        AgentMessage::Ack {
            reference,
            ok: true,
            error: None,
            channel: None,
        }
    }

    pub fn nack(reference: Option<String>, error: impl Into<String>) -> Self {
        AgentMessage::Ack {
            reference,
            ok: false,
            error: Some(error.into()),
            channel: None,
        }
    }

    /// Token of the request this message answers, if any.
    pub fn correlation_token(&self) -> Option<&str> {
        match self {
            AgentMessage::Ack { reference, .. } => reference.as_deref(),
            AgentMessage::Status { correlation_id, .. } | AgentMessage::DeployResult { correlation_id, .. } => {
                correlation_id.as_deref()
            }
            AgentMessage::Hello { .. } | AgentMessage::Log { .. } | AgentMessage::Heartbeat { .. } => None,
        }
    }
}

impl Frame for AgentMessage {
    fn op(&self) -> &'static str {
        match self {
            AgentMessage::Hello { .. } => "hello",
            AgentMessage::Ack { .. } => "ack",
            AgentMessage::Status { .. } => "status",
            AgentMessage::DeployResult { .. } => "deploy-result",
            AgentMessage::Log { .. } => "log",
            AgentMessage::Heartbeat { .. } => "heartbeat",
        }
    }

    fn is_critical(&self) -> bool {
        !matches!(self, AgentMessage::Log { .. } | AgentMessage::Heartbeat { .. })
    }
}
