// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::bundle::{Bundle, BundleHashes, BundleManifest};
use crate::domain::policy::PolicyViolation;

pub use crate::domain::bundle::BuildMode;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid {entity} state transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Compiling,
    Compiled,
    Failed,
}

impl BuildStatus {
    /// A build never skips `COMPILING` on the way to `COMPILED`; a policy
    /// rejection fails it straight from `QUEUED`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Queued, Compiling) | (Queued, Failed) | (Compiling, Compiled) | (Compiling, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Compiled | BuildStatus::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Compiling => "COMPILING",
            BuildStatus::Compiled => "COMPILED",
            BuildStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Control-plane record of one compile request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: BuildId,
    pub channel_id: String,
    pub mode: BuildMode,
    pub status: BuildStatus,
    #[serde(default)]
    pub violations: Vec<PolicyViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BundleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BundleHashes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub bundle: Option<Bundle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildRecord {
    pub fn new(id: BuildId, channel_id: impl Into<String>, mode: BuildMode) -> Self {
        let now = Utc::now();
        Self {
            id,
            channel_id: channel_id.into(),
            mode,
            status: BuildStatus::Queued,
            violations: Vec::new(),
            manifest: None,
            hashes: None,
            error: None,
            bundle: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(&mut self, next: BuildStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: "build",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self, bundle: Bundle) -> Result<(), TransitionError> {
        self.transition_to(BuildStatus::Compiled)?;
        self.manifest = Some(bundle.manifest.clone());
        self.hashes = Some(bundle.hashes.clone());
        self.bundle = Some(bundle);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition_to(BuildStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_edges() {
        use BuildStatus::*;
        let all = [Queued, Compiling, Compiled, Failed];
        let allowed = [(Queued, Compiling), (Queued, Failed), (Compiling, Compiled), (Compiling, Failed)];
        for from in all {
            for to in all {
                assert_eq!(from.can_transition_to(to), allowed.contains(&(from, to)), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_cannot_skip_compiling() {
        let mut build = BuildRecord::new(BuildId::new(), "ch-1", BuildMode::Test);
        let err = build.transition_to(BuildStatus::Compiled).unwrap_err();
        assert_eq!(err.from, "QUEUED");
        assert_eq!(build.status, BuildStatus::Queued);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut build = BuildRecord::new(BuildId::new(), "ch-1", BuildMode::Prod);
        build.fail("policy gate rejected the channel").unwrap();
        assert!(build.status.is_terminal());
        assert!(build.transition_to(BuildStatus::Compiling).is_err());
        assert_eq!(build.error.as_deref(), Some("policy gate rejected the channel"));
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_value(BuildStatus::Compiled).unwrap(), "COMPILED");
    }
}
