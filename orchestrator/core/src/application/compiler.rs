// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Compiler / Bundler
//!
//! Turns a policy-approved [`ChannelIr`] into the four bundle artifacts and
//! packages them:
//!
//! 1. `flows.json`: one tab plus every template node of every stage, with
//!    ids derived from `flow|channelId` and `node|stageId|templateNodeId`
//! 2. `settings.js`: engine settings reading the per-start environment
//! 3. `credentials.map.json`: node id -> key -> `${secret:NAME}`
//! 4. `manifest.json`
//!
//! then `bundle.tgz` and [`BundleHashes`]. Identical IR, build id and
//! templates always produce byte-identical artifacts.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::bundle::{ArtifactSet, BuildMode, Bundle, BundleHashes, BundleManifest, CredentialsMap};
use crate::domain::integrity::{deterministic_id, IntegrityError};
use crate::domain::ir::{ChannelIr, IrError, NexonTemplate, TemplateError, LATEST_VERSION};
use crate::infrastructure::archive;
use crate::infrastructure::secrets::placeholder;
use crate::infrastructure::templates::TemplateCache;

const MQTT_IN: &str = "mqtt in";
const MQTT_OUT: &str = "mqtt out";
const MQTT_BROKER: &str = "mqtt-broker";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Invalid channel IR: {0}")]
    Ir(#[from] IrError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Integrity computation failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Failed to serialize {artifact}: {message}")]
    Serialization { artifact: &'static str, message: String },

    #[error("Failed to package bundle: {0}")]
    Archive(String),
}

pub fn flow_id(channel_id: &str) -> String {
    deterministic_id(&["flow", channel_id])
}

pub fn node_id(stage_id: &str, template_node_id: &str) -> String {
    deterministic_id(&["node", stage_id, template_node_id])
}

pub fn config_node_id(channel_id: &str, key: &str) -> String {
    deterministic_id(&["config", channel_id, key])
}

pub struct Compiler {
    templates: TemplateCache,
}

impl Compiler {
    pub fn new(templates: TemplateCache) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    pub async fn compile(&self, ir: &ChannelIr, build_id: &str, mode: BuildMode) -> Result<Bundle, CompileError> {
        ir.check_references()?;

        let mut templates = Vec::with_capacity(ir.stages.len());
        for stage in &ir.stages {
            let version = stage.nexon_version.as_deref().unwrap_or(LATEST_VERSION);
            templates.push(self.templates.get(&stage.nexon_id, version).await?);
        }

        let flows = render_flows(ir, &templates);
        let credentials = render_credentials(ir, &templates)?;
        let manifest = BundleManifest::new(&ir.channel_id, build_id, mode);

        let artifacts = ArtifactSet {
            flows: to_json("flows.json", &flows)?,
            settings: render_settings(&ir.channel_id, build_id, mode).into_bytes(),
            manifest: to_json("manifest.json", &manifest)?,
            credentials_map: to_json("credentials.map.json", &credentials)?,
        };
        let archive = archive::pack(&artifacts).map_err(|e| CompileError::Archive(e.to_string()))?;
        let hashes = BundleHashes::compute(&artifacts, &archive)?;

        info!(
            channel_id = %ir.channel_id,
            build_id,
            stages = ir.stages.len(),
            merkle_root = %hashes.merkle_root,
            "Bundle compiled"
        );
        Ok(Bundle {
            manifest,
            artifacts,
            archive,
            hashes,
        })
    }
}

fn to_json<T: serde::Serialize>(artifact: &'static str, value: &T) -> Result<Vec<u8>, CompileError> {
    serde_json::to_vec_pretty(value).map_err(|e| CompileError::Serialization {
        artifact,
        message: e.to_string(),
    })
}

fn render_flows(ir: &ChannelIr, templates: &[NexonTemplate]) -> Vec<Value> {
    let tab_id = flow_id(&ir.channel_id);
    let broker_id = config_node_id(&ir.channel_id, MQTT_BROKER);
    let mut uses_mqtt = false;

    let mut nodes: Vec<Map<String, Value>> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for (stage, template) in ir.stages.iter().zip(templates) {
        for tn in &template.nodes {
            let id = node_id(&stage.id, &tn.id);
            let mut node = tn.props.clone();
            for (key, value) in &stage.config {
                if node.contains_key(key) {
                    node.insert(key.clone(), value.clone());
                }
            }

            if tn.node_type == MQTT_IN || tn.node_type == MQTT_OUT {
                uses_mqtt = true;
                node.insert("broker".into(), Value::String(broker_id.clone()));
                let blank_topic = node.get("topic").and_then(Value::as_str).map_or(true, str::is_empty);
                if blank_topic {
                    let env = if tn.node_type == MQTT_IN { "${GJ_TOPIC_IN}" } else { "${GJ_TOPIC_OUT}" };
                    node.insert("topic".into(), Value::String(env.into()));
                }
            }

            let name = if tn.name.is_empty() { &stage.name } else { &tn.name };
            let wires: Vec<Value> = tn
                .wires
                .iter()
                .map(|port| Value::from(port.iter().map(|target| node_id(&stage.id, target)).collect::<Vec<_>>()))
                .collect();

            node.insert("id".into(), Value::String(id.clone()));
            node.insert("type".into(), Value::String(tn.node_type.clone()));
            node.insert("z".into(), Value::String(tab_id.clone()));
            node.insert("name".into(), Value::String(name.clone()));
            node.insert("wires".into(), Value::Array(wires));

            position.insert(id, nodes.len());
            nodes.push(node);
        }
    }

    for conn in &ir.connections {
        let (Some(from), Some(to)) = (stage_index(ir, &conn.from), stage_index(ir, &conn.to)) else {
            continue;
        };
        let (Some(exit), Some(entry)) = (templates[from].exit(), templates[to].entry()) else {
            continue;
        };
        let source = node_id(&ir.stages[from].id, &exit.id);
        let target = Value::String(node_id(&ir.stages[to].id, &entry.id));
        if let Some(node) = position.get(&source).and_then(|i| nodes.get_mut(*i)) {
            add_wire(node, target);
        }
    }

    let mut flows = Vec::with_capacity(nodes.len() + 2);
    flows.push(json!({
        "id": tab_id,
        "type": "tab",
        "label": ir.name,
        "disabled": false,
        "info": ir.description.clone().unwrap_or_default(),
    }));
    if uses_mqtt {
        flows.push(json!({
            "id": broker_id,
            "type": MQTT_BROKER,
            "name": "gatejet",
            "broker": "${GJ_MQTT_URL}",
            "clientid": "",
            "autoConnect": true,
            "protocolVersion": "4",
        }));
    }
    flows.extend(nodes.into_iter().map(Value::Object));
    debug!(channel_id = %ir.channel_id, nodes = flows.len(), "Rendered flow graph");
    flows
}

fn stage_index(ir: &ChannelIr, stage_id: &str) -> Option<usize> {
    ir.stages.iter().position(|s| s.id == stage_id)
}

/// Append `target` to output port 0, creating the port if needed.
fn add_wire(node: &mut Map<String, Value>, target: Value) {
    let wires = node.entry("wires").or_insert_with(|| Value::Array(vec![]));
    let Some(ports) = wires.as_array_mut() else {
        return;
    };
    if ports.is_empty() {
        ports.push(Value::Array(vec![]));
    }
    if let Some(first) = ports[0].as_array_mut() {
        if !first.contains(&target) {
            first.push(target);
        }
    }
}

fn render_credentials(ir: &ChannelIr, templates: &[NexonTemplate]) -> Result<CredentialsMap, CompileError> {
    let mut map = CredentialsMap::new();
    for (stage, template) in ir.stages.iter().zip(templates) {
        for binding in &stage.secrets {
            if !template.nodes.iter().any(|n| n.id == binding.template_node_id) {
                return Err(IrError::UnknownSecretTarget {
                    stage_id: stage.id.clone(),
                    node_id: binding.template_node_id.clone(),
                }
                .into());
            }
            map.entry(node_id(&stage.id, &binding.template_node_id))
                .or_default()
                .insert(binding.key.clone(), placeholder(&binding.secret_name));
        }
    }
    Ok(map)
}

fn render_settings(channel_id: &str, build_id: &str, mode: BuildMode) -> String {
    let quote = |s: &str| Value::String(s.to_string()).to_string();
    let (log_level, disable_editor) = match mode {
        BuildMode::Test => ("debug", false),
        BuildMode::Prod => ("info", true),
    };
    format!(
        r#"// Generated by GateJet. Admin credentials, port and topics arrive through
// the environment at every engine start.
const env = process.env;
const bcrypt = require("bcryptjs");

module.exports = {{
    flowFile: "flows.json",
    credentialsFile: "flows_cred.json",
    credentialSecret: false,
    uiHost: env.GJ_ADMIN_HOST || "127.0.0.1",
    uiPort: parseInt(env.PORT || "1880", 10),
    httpAdminRoot: env.GJ_ADMIN_PATH || "/admin",
    httpNodeRoot: "/",
    disableEditor: {disable_editor},
    adminAuth: {{
        type: "credentials",
        users: [{{
            username: env.GJ_ADMIN_USER || "admin",
            password: bcrypt.hashSync(env.GJ_ADMIN_PASS || "", 8),
            permissions: "*"
        }}]
    }},
    diagnostics: {{ enabled: false }},
    logging: {{ console: {{ level: "{log_level}", metrics: false, audit: false }} }},
    editorTheme: {{ projects: {{ enabled: false }} }},
    functionGlobalContext: {{
        gatejet: {{
            channelId: {channel_id},
            buildId: {build_id},
            mode: "{mode}",
            topicIn: env.GJ_TOPIC_IN || null,
            topicOut: env.GJ_TOPIC_OUT || null,
            mqttUrl: env.GJ_MQTT_URL || null
        }}
    }}
}};
"#,
        channel_id = quote(channel_id),
        build_id = quote(build_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ir::{ChannelSecurity, Connection, SecretBinding, Stage, StageCapabilities, TemplateNode};
    use crate::infrastructure::archive;
    use crate::infrastructure::templates::InMemoryTemplateSource;
    use std::sync::Arc;

    fn template(nexon_id: &str, nodes: &[(&str, &str, &[&str])]) -> NexonTemplate {
        NexonTemplate {
            nexon_id: nexon_id.into(),
            version: "1.0.0".into(),
            nodes: nodes
                .iter()
                .map(|(id, node_type, wires)| TemplateNode {
                    id: id.to_string(),
                    node_type: node_type.to_string(),
                    name: String::new(),
                    props: Map::from_iter([("port".to_string(), json!(2575)), ("topic".to_string(), json!(""))]),
                    wires: if wires.is_empty() {
                        vec![]
                    } else {
                        vec![wires.iter().map(|w| w.to_string()).collect()]
                    },
                })
                .collect(),
        }
    }

    fn compiler() -> Compiler {
        let source = InMemoryTemplateSource::new();
        source.register(template("hl7.listener", &[("in", "tcp in", &["parse"]), ("parse", "function", &[])]));
        source.register(template("bus.publish", &[("out", MQTT_OUT, &[])]));
        Compiler::new(TemplateCache::new(Arc::new(source), 8))
    }

    fn stage(id: &str, nexon_id: &str) -> Stage {
        Stage {
            id: id.into(),
            name: id.into(),
            nexon_id: nexon_id.into(),
            nexon_version: None,
            config: Map::new(),
            capabilities: StageCapabilities::default(),
            secrets: vec![],
            documentation: None,
        }
    }

    fn ir() -> ChannelIr {
        let mut listen = stage("listen", "hl7.listener");
        listen.config.insert("port".into(), json!(6661));
        listen.config.insert("unknown".into(), json!(true));
        listen.secrets.push(SecretBinding {
            template_node_id: "in".into(),
            key: "password".into(),
            secret_name: "HL7_PASS".into(),
        });
        ChannelIr {
            channel_id: "lab-results".into(),
            name: "Lab results".into(),
            description: None,
            runtime_target: "edge".into(),
            security: ChannelSecurity::default(),
            stages: vec![listen, stage("publish", "bus.publish")],
            connections: vec![Connection {
                from: "listen".into(),
                to: "publish".into(),
            }],
        }
    }

    fn flows(bundle: &Bundle) -> Vec<Value> {
        serde_json::from_slice(&bundle.artifacts.flows).unwrap()
    }

    fn find<'a>(flows: &'a [Value], id: &str) -> &'a Value {
        flows.iter().find(|n| n["id"] == id).unwrap()
    }

    #[tokio::test]
    async fn test_compile_is_deterministic() {
        let a = compiler().compile(&ir(), "b-1", BuildMode::Test).await.unwrap();
        let b = compiler().compile(&ir(), "b-1", BuildMode::Test).await.unwrap();
        assert_eq!(a.artifacts, b.artifacts);
        assert_eq!(a.hashes, b.hashes);
        a.hashes.verify(&a.artifacts, &a.archive).unwrap();
        assert_eq!(archive::unpack(&a.archive).unwrap(), a.artifacts);
    }

    #[tokio::test]
    async fn test_flow_graph_shape() {
        let bundle = compiler().compile(&ir(), "b-1", BuildMode::Test).await.unwrap();
        let flows = flows(&bundle);
        let tab = flow_id("lab-results");

        assert_eq!(flows[0]["type"], "tab");
        assert_eq!(flows[0]["id"], tab.as_str());

        let listener = find(&flows, &node_id("listen", "in"));
        assert_eq!(listener["z"], tab.as_str());
        assert_eq!(listener["port"], 6661);
        assert!(listener.get("unknown").is_none());
        assert_eq!(listener["wires"], json!([[node_id("listen", "parse")]]));

        // stage connection: last node of listen -> first node of publish
        let parse = find(&flows, &node_id("listen", "parse"));
        assert_eq!(parse["wires"], json!([[node_id("publish", "out")]]));

        let publisher = find(&flows, &node_id("publish", "out"));
        assert_eq!(publisher["broker"], config_node_id("lab-results", MQTT_BROKER).as_str());
        assert_eq!(publisher["topic"], "${GJ_TOPIC_OUT}");
        assert_eq!(find(&flows, &config_node_id("lab-results", MQTT_BROKER))["type"], MQTT_BROKER);
    }

    #[tokio::test]
    async fn test_credentials_use_placeholders() {
        let bundle = compiler().compile(&ir(), "b-1", BuildMode::Prod).await.unwrap();
        let creds = bundle.artifacts.credentials_map().unwrap();
        assert_eq!(creds[&node_id("listen", "in")]["password"], "${secret:HL7_PASS}");

        let manifest = bundle.artifacts.manifest().unwrap();
        manifest.check_identity("lab-results", "b-1", BuildMode::Prod).unwrap();
        let settings = String::from_utf8(bundle.artifacts.settings.clone()).unwrap();
        assert!(settings.contains("disableEditor: true"));
        assert!(settings.contains("env.GJ_ADMIN_PASS"));
    }

    #[tokio::test]
    async fn test_unknown_secret_target() {
        let mut channel = ir();
        channel.stages[0].secrets[0].template_node_id = "nope".into();
        let err = compiler().compile(&channel, "b-1", BuildMode::Test).await.unwrap_err();
        assert!(matches!(err, CompileError::Ir(IrError::UnknownSecretTarget { .. })));
    }

    #[tokio::test]
    async fn test_missing_template() {
        let mut channel = ir();
        channel.stages[1].nexon_id = "does.not.exist".into();
        let err = compiler().compile(&channel, "b-1", BuildMode::Test).await.unwrap_err();
        assert!(matches!(err, CompileError::Template(TemplateError::NotFound { .. })));
    }

    #[test]
    fn test_ids_are_stable_and_distinct() {
        assert_eq!(flow_id("a"), flow_id("a"));
        assert_ne!(flow_id("a"), flow_id("b"));
        assert_eq!(node_id("s1", "in").len(), 16);
        assert!(node_id("s1", "in").starts_with('n'));
    }
}
