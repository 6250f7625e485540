// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent command dispatch.
//!
//! [`AgentService`] is what the agent link talks to: it turns each
//! [`ControlMessage`] into a call on the [`ChannelManager`] (or one of the
//! agent-level operations below) and shapes the reply frame. It also builds
//! the `hello` and the heartbeat [`RuntimeSummary`].

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::channel_manager::ChannelManager;
use crate::domain::channel::ChannelStatus;
use crate::domain::node_config::AgentConfig;
use crate::domain::protocol::{AgentCapabilities, AgentHello, AgentMessage, ControlMessage, OverlayInfo, RuntimeSummary};
use crate::infrastructure::protocol::CommandHandler;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const UPDATES_DIR: &str = "updates";
const OVERLAY_DIR: &str = "overlay";
const ENROLLMENT_FILE: &str = "enrollment.json";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AgentCommandError {
    #[error("Agent updates are not configured (no update.publicKey)")]
    UpdatesDisabled,

    #[error("Invalid update public key: {0}")]
    InvalidKey(String),

    #[error("Invalid update signature: {0}")]
    InvalidSignature(String),

    #[error("Update signature does not match the downloaded artifact")]
    SignatureMismatch,

    #[error("Update download failed: {0}")]
    Download(String),

    #[error("Overlay networking is disabled on this agent")]
    OverlayDisabled,

    #[error("Enrollment code is empty")]
    EmptyEnrollmentCode,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persisted result of `overlay-enroll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Enrollment {
    enrollment_code: String,
    host_id: String,
    enrolled_at: DateTime<Utc>,
}

pub struct AgentService {
    config: AgentConfig,
    channels: Arc<ChannelManager>,
    http: reqwest::Client,
    overlay: RwLock<Option<OverlayInfo>>,
}

impl AgentService {
    pub fn new(config: AgentConfig, channels: Arc<ChannelManager>) -> Self {
        let overlay = load_enrollment(&config);
        Self {
            config,
            channels,
            http: reqwest::Client::new(),
            overlay: RwLock::new(overlay),
        }
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Download, verify and stage a new agent binary. Replacing the running
    /// binary is up to the host supervisor.
    pub async fn update_agent(&self, url: &str, signature: &str) -> Result<PathBuf, AgentCommandError> {
        let key = self
            .config
            .update
            .as_ref()
            .ok_or(AgentCommandError::UpdatesDisabled)?;
        let key = decode_verifying_key(&key.public_key)?;
        let signature = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|e| AgentCommandError::InvalidSignature(e.to_string()))?;
        let signature =
            Signature::from_slice(&signature).map_err(|e| AgentCommandError::InvalidSignature(e.to_string()))?;

        info!(url, "Downloading agent update");
        let artifact = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentCommandError::Download(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| AgentCommandError::Download(e.to_string()))?;

        key.verify(&artifact, &signature)
            .map_err(|_| AgentCommandError::SignatureMismatch)?;

        let digest = hex::encode(Sha256::digest(&artifact));
        let dir = self.config.work_dir.join(UPDATES_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("gatejet-{}", &digest[..12]));
        tokio::fs::write(&path, &artifact).await?;
        make_executable(&path).await?;

        info!(path = %path.display(), bytes = artifact.len(), "Agent update staged");
        Ok(path)
    }

    /// Record an overlay enrollment; the next `hello` carries the overlay
    /// block.
    pub async fn enroll_overlay(&self, enrollment_code: &str) -> Result<OverlayInfo, AgentCommandError> {
        if !self.config.overlay.enabled {
            return Err(AgentCommandError::OverlayDisabled);
        }
        if enrollment_code.trim().is_empty() {
            return Err(AgentCommandError::EmptyEnrollmentCode);
        }

        let enrollment = Enrollment {
            enrollment_code: enrollment_code.to_string(),
            host_id: self.config.device_id().to_string(),
            enrolled_at: Utc::now(),
        };
        let dir = self.config.work_dir.join(OVERLAY_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(&enrollment).map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join(ENROLLMENT_FILE), json).await?;

        let info = OverlayInfo {
            ip: None,
            host_id: Some(enrollment.host_id),
        };
        *self.overlay.write() = Some(info.clone());
        info!(lighthouses = self.config.overlay.lighthouses.len(), "Overlay enrollment recorded");
        Ok(info)
    }

    fn channel_reply(&self, reference: Option<String>, channel_id: &str, result: Result<ChannelStatus, String>) -> AgentMessage {
        match result {
            Ok(status) => AgentMessage::Ack {
                reference,
                ok: true,
                error: None,
                channel: Some(status),
            },
            Err(error) => {
                warn!(channel_id, error = %error, "Channel command failed");
                AgentMessage::Ack {
                    reference,
                    ok: false,
                    error: Some(error),
                    channel: self.channels.status(channel_id),
                }
            }
        }
    }

    fn build_summary(&self) -> RuntimeSummary {
        RuntimeSummary {
            runtime_id: self.config.runtime_id.clone(),
            agent_version: AGENT_VERSION.to_string(),
            overlay: self.overlay.read().clone(),
            channels: self.channels.summary(),
            ts: Utc::now(),
        }
    }
}

#[async_trait]
impl CommandHandler for AgentService {
    fn hello(&self) -> AgentHello {
        AgentHello {
            runtime_id: self.config.runtime_id.clone(),
            agent_version: AGENT_VERSION.to_string(),
            device_id: self.config.device_id().to_string(),
            overlay: self.overlay.read().clone(),
            capabilities: AgentCapabilities {
                mqtt: self.config.mqtt.enabled,
                http_proxy: ["HTTPS_PROXY", "HTTP_PROXY", "https_proxy", "http_proxy"]
                    .iter()
                    .any(|var| std::env::var_os(var).is_some()),
                platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            },
        }
    }

    async fn handle(&self, command: ControlMessage) -> AgentMessage {
        match command {
            ControlMessage::Deploy {
                correlation_id,
                build_id,
                bundle_content,
                channel_id,
                mode,
                secret_payload,
            } => {
                let result = self
                    .channels
                    .deploy(&channel_id, &build_id, mode, &bundle_content, secret_payload.as_ref())
                    .await;
                match result {
                    Ok(outcome) => AgentMessage::DeployResult {
                        correlation_id,
                        channel_id,
                        build_id,
                        ok: true,
                        details: None,
                        verified_root: Some(outcome.verified_root),
                    },
                    Err(e) => {
                        warn!(channel_id = %channel_id, build_id = %build_id, error = %e, "Deploy failed");
                        AgentMessage::DeployResult {
                            correlation_id,
                            channel_id,
                            build_id,
                            ok: false,
                            details: Some(e.to_string()),
                            verified_root: None,
                        }
                    }
                }
            }
            ControlMessage::Start {
                correlation_id,
                channel_id,
            } => {
                let result = self.channels.start(&channel_id).await.map_err(|e| e.to_string());
                self.channel_reply(correlation_id, &channel_id, result)
            }
            ControlMessage::Stop {
                correlation_id,
                channel_id,
                drain_ms,
            } => {
                let result = self
                    .channels
                    .stop(&channel_id, drain_ms.map(Duration::from_millis))
                    .await
                    .map_err(|e| e.to_string());
                self.channel_reply(correlation_id, &channel_id, result)
            }
            ControlMessage::Restart {
                correlation_id,
                channel_id,
            } => {
                let result = self.channels.restart(&channel_id).await.map_err(|e| e.to_string());
                self.channel_reply(correlation_id, &channel_id, result)
            }
            ControlMessage::Status { correlation_id } => AgentMessage::Status {
                correlation_id,
                summary: self.summary().await,
            },
            ControlMessage::UpdateAgent {
                correlation_id,
                url,
                signature,
            } => match self.update_agent(&url, &signature).await {
                Ok(_) => AgentMessage::ack(correlation_id),
                Err(e) => {
                    warn!(url = %url, error = %e, "Agent update rejected");
                    AgentMessage::nack(correlation_id, e.to_string())
                }
            },
            ControlMessage::OverlayEnroll {
                correlation_id,
                enrollment_code,
            } => match self.enroll_overlay(&enrollment_code).await {
                Ok(_) => AgentMessage::ack(correlation_id),
                Err(e) => AgentMessage::nack(correlation_id, e.to_string()),
            },
        }
    }

    async fn summary(&self) -> RuntimeSummary {
        self.channels.sample_usage();
        self.build_summary()
    }
}

fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, AgentCommandError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AgentCommandError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AgentCommandError::InvalidKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| AgentCommandError::InvalidKey(e.to_string()))
}

fn load_enrollment(config: &AgentConfig) -> Option<OverlayInfo> {
    if !config.overlay.enabled {
        return None;
    }
    let path = config.work_dir.join(OVERLAY_DIR).join(ENROLLMENT_FILE);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice::<Enrollment>(&bytes) {
        Ok(enrollment) => Some(OverlayInfo {
            ip: None,
            host_id: Some(enrollment.host_id),
        }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable overlay enrollment");
            None
        }
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
