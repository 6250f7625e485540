// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Channel intermediate representation and nexon templates.
//!
//! The IR arrives already schema-validated; [`ChannelIr::check_references`]
//! only enforces the referential rules the compiler relies on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("Channel id must not be empty")]
    EmptyChannelId,

    #[error("Channel id '{0}' contains characters outside [A-Za-z0-9._-]")]
    InvalidChannelId(String),

    #[error("Duplicate stage id: {0}")]
    DuplicateStage(String),

    #[error("Connection references unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage '{stage_id}' binds a secret to unknown template node '{node_id}'")]
    UnknownSecretTarget { stage_id: String, node_id: String },

    #[error("Failed to parse channel IR: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSecurity {
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default)]
    pub public_endpoint: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCapabilities {
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub filesystem: bool,
    #[serde(default)]
    pub encryption: bool,
}

/// Binds a named secret to one credential key of a template node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBinding {
    pub template_node_id: String,
    pub key: String,
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub nexon_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexon_version: Option<String>,
    /// Overrides applied to template node properties of the same name.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub capabilities: StageCapabilities,
    #[serde(default)]
    pub secrets: Vec<SecretBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelIr {
    pub channel_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub runtime_target: String,
    #[serde(default)]
    pub security: ChannelSecurity,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl ChannelIr {
    pub fn from_json(json: &str) -> Result<Self, IrError> {
        serde_json::from_str(json).map_err(|e| IrError::Parse(e.to_string()))
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Reject IR the compiler cannot turn into a consistent flow graph.
    pub fn check_references(&self) -> Result<(), IrError> {
        check_channel_id(&self.channel_id)?;

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(IrError::DuplicateStage(stage.id.clone()));
            }
        }
        for conn in &self.connections {
            for end in [&conn.from, &conn.to] {
                if !seen.contains(end.as_str()) {
                    return Err(IrError::UnknownStage(end.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Channel ids become directory names on the agent, so they are restricted
/// to a filesystem-safe alphabet.
pub fn check_channel_id(id: &str) -> Result<(), IrError> {
    if id.is_empty() {
        return Err(IrError::EmptyChannelId);
    }
    let safe = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !safe || id == "." || id == ".." {
        return Err(IrError::InvalidChannelId(id.to_string()));
    }
    Ok(())
}

/// One node of a nexon's flow fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateNode {
    /// Template-local id, stable across versions of the nexon.
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    /// Output ports, each listing template-local target ids.
    #[serde(default)]
    pub wires: Vec<Vec<String>>,
}

/// Flow fragment implementing a nexon. Stages are wired from the last node
/// of one fragment to the first node of the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NexonTemplate {
    pub nexon_id: String,
    pub version: String,
    pub nodes: Vec<TemplateNode>,
}

impl NexonTemplate {
    pub fn entry(&self) -> Option<&TemplateNode> {
        self.nodes.first()
    }

    pub fn exit(&self) -> Option<&TemplateNode> {
        self.nodes.last()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Nexon template not found: {nexon_id}@{version}")]
    NotFound { nexon_id: String, version: String },

    #[error("Nexon template {0} has no nodes")]
    Empty(String),

    #[error("Failed to load nexon template {nexon_id}: {message}")]
    Load { nexon_id: String, message: String },
}

/// Version requested when a stage does not pin one.
pub const LATEST_VERSION: &str = "latest";

/// Where nexon templates come from.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch(&self, nexon_id: &str, version: &str) -> Result<NexonTemplate, TemplateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ir_json() -> &'static str {
        r#"{
            "channelId": "ch-1",
            "name": "Ingest",
            "runtimeTarget": "edge-linux",
            "stages": [
                {"id": "s1", "name": "Receive", "nexonId": "hl7.listener"},
                {"id": "s2", "name": "Forward", "nexonId": "http.out", "capabilities": {"network": true}}
            ],
            "connections": [{"from": "s1", "to": "s2"}]
        }"#
    }

    #[test]
    fn test_parse_with_defaults() {
        let ir = ChannelIr::from_json(ir_json()).unwrap();
        assert_eq!(ir.stages.len(), 2);
        assert!(!ir.security.internet_access);
        assert!(ir.stage("s2").unwrap().capabilities.network);
        assert!(ir.stage("s1").unwrap().config.is_empty());
        ir.check_references().unwrap();
    }

    #[test]
    fn test_dangling_connection() {
        let mut ir = ChannelIr::from_json(ir_json()).unwrap();
        ir.connections.push(Connection {
            from: "s2".into(),
            to: "s9".into(),
        });
        assert_eq!(ir.check_references(), Err(IrError::UnknownStage("s9".into())));
    }

    #[test]
    fn test_duplicate_stage() {
        let mut ir = ChannelIr::from_json(ir_json()).unwrap();
        let dup = ir.stages[0].clone();
        ir.stages.push(dup);
        assert_eq!(ir.check_references(), Err(IrError::DuplicateStage("s1".into())));
    }

    #[test]
    fn test_channel_id_alphabet() {
        assert!(check_channel_id("lab-results_v2.1").is_ok());
        assert_eq!(check_channel_id(""), Err(IrError::EmptyChannelId));
        assert!(check_channel_id("../etc").is_err());
        assert!(check_channel_id("..").is_err());
        assert!(check_channel_id("a/b").is_err());
    }
}
