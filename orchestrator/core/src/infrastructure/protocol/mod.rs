// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Protocol Layer
//!
//! One long-lived websocket per agent, carrying the op-tagged frames of
//! [`crate::domain::protocol`].
//!
//! | Module | Side | Role |
//! |--------|------|------|
//! | `outbound` | both | bounded send queue with drop/fail-fast backpressure |
//! | `correlation` | both | pending request table keyed by correlation token |
//! | `registry` | control plane | connection per `runtimeId`, liveness, `request()` |
//! | `agent_link` | agent | dial, hello, heartbeat, reconnect |

pub mod agent_link;
pub mod correlation;
pub mod outbound;
pub mod registry;

pub use agent_link::{AgentLink, CommandHandler};
pub use correlation::PendingRequests;
pub use outbound::{Outbound, DEFAULT_OUTBOUND_CAPACITY};
pub use registry::{AgentConnection, AgentInfo, AgentRegistry};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Agent {0} is offline")]
    AgentOffline(String),

    #[error("Agent {0} disconnected")]
    Disconnected(String),

    #[error("Outbound queue for {peer} is full, refusing {op}")]
    QueueFull { peer: String, op: &'static str },

    #[error("No reply to {op} from {peer} within {timeout_ms}ms")]
    Timeout {
        peer: String,
        op: &'static str,
        timeout_ms: u64,
    },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Codec(err.to_string())
    }
}

/// Encode a frame as a websocket text payload.
pub fn encode<M: crate::domain::protocol::Frame>(frame: &M) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode<M: crate::domain::protocol::Frame>(text: &str) -> Result<M, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
