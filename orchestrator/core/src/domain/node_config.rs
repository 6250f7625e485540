// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for GateJet nodes, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Edge agent settings (identity, control endpoint, engine runtime, overlay, MQTT)
// - Control plane settings (bind address, protocol timings, policy, templates)
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "gatejet.io/v1";
pub const KIND: &str = "NodeConfig";

pub const ENV_CONFIG_PATH: &str = "GATEJET_CONFIG_PATH";
pub const ENV_RUNTIME_ID: &str = "GATEJET_RUNTIME_ID";
pub const ENV_CONTROL_URL: &str = "GATEJET_CONTROL_URL";
pub const ENV_NODE_RUNTIME_BIN: &str = "GATEJET_NODE_RUNTIME_BIN";
pub const ENV_BOOTSTRAP_TOKEN: &str = "GATEJET_BOOTSTRAP_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "gatejet.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    /// Settings for `gatejet agent`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    /// Settings for `gatejet control`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Identity used in `hello` and as the registry key on the control plane
    #[serde(default = "default_runtime_id")]
    pub runtime_id: String,

    /// Stable device identifier; defaults to the runtime id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Shared secret; also the key source for sealed secret payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token: Option<String>,

    #[serde(default)]
    pub control: ControlEndpoint,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub node_runtime: NodeRuntimeConfig,

    #[serde(default)]
    pub security: AgentSecurityConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<SidecarsConfig>,

    /// Root for materialized builds, staged updates and overlay state
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    /// Bound on engine readiness after spawn
    #[serde(default = "default_startup_window_ms")]
    pub startup_window_ms: u64,

    /// Drain applied when `stop` carries no `drainMs`; 0 kills immediately
    #[serde(default)]
    pub default_drain_ms: u64,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEndpoint {
    #[serde(default = "default_control_url")]
    pub base_url: String,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub lighthouses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRuntimeConfig {
    /// Path to the flow-engine executable
    #[serde(default = "default_node_runtime_bin")]
    pub bin: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSecurityConfig {
    /// HTTP root of the engine's admin API
    #[serde(default = "default_admin_path")]
    pub admin_path: String,

    /// Interface engines bind their admin API to
    #[serde(default = "default_admin_host")]
    pub api_admin_host: String,

    /// First port handed to engines; ephemeral ports when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_admin_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_orthanc: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_syncthing: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfig {
    /// Base64 Ed25519 public key that signs agent updates
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Expected agent heartbeat interval; liveness is a multiple of it
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_liveness_multiplier")]
    pub liveness_multiplier: u32,

    /// Timeout for start/stop/restart/status round trips
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_deploy_timeout_ms")]
    pub deploy_timeout_ms: u64,

    /// Automatic re-sends after a deploy timeout (0 or 1)
    #[serde(default = "default_deploy_retries")]
    pub deploy_retries: u32,

    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// YAML org policy; permissive defaults when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,

    /// Directory of nexon templates (`<nexonId>@<version>.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    #[serde(default = "default_template_cache_size")]
    pub template_cache_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_runtime_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "gatejet-agent".to_string())
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/gatejet")
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_startup_window_ms() -> u64 {
    30_000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_control_url() -> String {
    "ws://127.0.0.1:8088".to_string()
}

fn default_ws_path() -> String {
    "/ws/agent".to_string()
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_node_runtime_bin() -> PathBuf {
    PathBuf::from("node-red")
}

fn default_admin_path() -> String {
    "/admin".to_string()
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8088
}

fn default_liveness_multiplier() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_deploy_timeout_ms() -> u64 {
    60_000
}

/// A timed-out deploy is re-sent at most once.
pub const MAX_DEPLOY_RETRIES: u32 = 1;

fn default_deploy_retries() -> u32 {
    1
}

fn default_template_cache_size() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for ControlEndpoint {
    fn default() -> Self {
        Self {
            base_url: default_control_url(),
            ws_path: default_ws_path(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
        }
    }
}

impl Default for NodeRuntimeConfig {
    fn default() -> Self {
        Self {
            bin: default_node_runtime_bin(),
        }
    }
}

impl Default for AgentSecurityConfig {
    fn default() -> Self {
        Self {
            admin_path: default_admin_path(),
            api_admin_host: default_admin_host(),
            api_admin_port: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            runtime_id: default_runtime_id(),
            device_id: None,
            bootstrap_token: None,
            control: ControlEndpoint::default(),
            overlay: OverlayConfig::default(),
            mqtt: MqttConfig::default(),
            node_runtime: NodeRuntimeConfig::default(),
            security: AgentSecurityConfig::default(),
            sidecars: None,
            work_dir: default_work_dir(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            startup_window_ms: default_startup_window_ms(),
            default_drain_ms: 0,
            outbound_queue: default_outbound_queue(),
            update: None,
        }
    }
}

impl AgentConfig {
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.runtime_id)
    }

    /// Websocket URL of the control plane's agent endpoint
    pub fn ws_url(&self) -> String {
        format!(
            "{}/{}",
            self.control.base_url.trim_end_matches('/'),
            self.control.ws_path.trim_start_matches('/')
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    pub fn default_drain(&self) -> Duration {
        Duration::from_millis(self.default_drain_ms)
    }

    pub fn mqtt_url(&self) -> Option<String> {
        self.mqtt
            .enabled
            .then(|| format!("mqtt://{}:{}", self.mqtt.host, self.mqtt.port))
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            ws_path: default_ws_path(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            liveness_multiplier: default_liveness_multiplier(),
            request_timeout_ms: default_request_timeout_ms(),
            deploy_timeout_ms: default_deploy_timeout_ms(),
            deploy_retries: default_deploy_retries(),
            outbound_queue: default_outbound_queue(),
            policy_file: None,
            template_dir: None,
            template_cache_size: default_template_cache_size(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.liveness_multiplier))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_millis(self.deploy_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "gatejet-node".to_string(),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = self.to_yaml_string()?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Discover configuration file using precedence order
    /// 1. GATEJET_CONFIG_PATH environment variable
    /// 2. ./gatejet-config.yaml (working directory)
    /// 3. ~/.gatejet/config.yaml (user home)
    /// 4. /etc/gatejet/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./gatejet-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".gatejet").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/gatejet/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to the agent section, creating
    /// it when an override is present
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides = [
            ENV_RUNTIME_ID,
            ENV_CONTROL_URL,
            ENV_NODE_RUNTIME_BIN,
            ENV_BOOTSTRAP_TOKEN,
        ];
        for key in overrides {
            let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
                continue;
            };
            let agent = self.spec.agent.get_or_insert_with(AgentConfig::default);
            match key {
                ENV_RUNTIME_ID => agent.runtime_id = value,
                ENV_CONTROL_URL => agent.control.base_url = value,
                ENV_NODE_RUNTIME_BIN => agent.node_runtime.bin = PathBuf::from(value),
                ENV_BOOTSTRAP_TOKEN => {
                    tracing::info!("Environment override: {}=<redacted>", key);
                    agent.bootstrap_token = Some(value);
                    continue;
                }
                _ => continue,
            }
            tracing::info!("Environment override: {}", key);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "apiVersion '{}' must be '{}'",
                self.api_version, API_VERSION
            )));
        }

        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!("kind '{}' must be '{}'", self.kind, KIND)));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".into()));
        }

        if let Some(agent) = &self.spec.agent {
            if agent.runtime_id.is_empty() {
                return Err(ConfigError::Invalid("spec.agent.runtimeId cannot be empty".into()));
            }
            let url = &agent.control.base_url;
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "spec.agent.control.baseUrl '{url}' must use ws:// or wss://"
                )));
            }
            if !agent.control.ws_path.starts_with('/') {
                return Err(ConfigError::Invalid("spec.agent.control.wsPath must start with '/'".into()));
            }
            if agent.heartbeat_interval_secs == 0 {
                return Err(ConfigError::Invalid("spec.agent.heartbeatIntervalSecs must be positive".into()));
            }
            if agent.startup_window_ms == 0 {
                return Err(ConfigError::Invalid("spec.agent.startupWindowMs must be positive".into()));
            }
            if agent.outbound_queue == 0 {
                return Err(ConfigError::Invalid("spec.agent.outboundQueue must be positive".into()));
            }
            if agent.overlay.enabled && agent.overlay.lighthouses.is_empty() {
                return Err(ConfigError::Invalid(
                    "spec.agent.overlay.lighthouses must list at least one lighthouse when overlay is enabled".into(),
                ));
            }
            if agent.node_runtime.bin.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("spec.agent.nodeRuntime.bin cannot be empty".into()));
            }
        }

        if let Some(cp) = &self.spec.control_plane {
            if cp.heartbeat_interval_secs == 0 || cp.liveness_multiplier == 0 {
                return Err(ConfigError::Invalid(
                    "spec.controlPlane heartbeat interval and liveness multiplier must be positive".into(),
                ));
            }
            if cp.request_timeout_ms == 0 || cp.deploy_timeout_ms == 0 {
                return Err(ConfigError::Invalid("spec.controlPlane timeouts must be positive".into()));
            }
            if cp.deploy_retries > MAX_DEPLOY_RETRIES {
                return Err(ConfigError::Invalid(format!(
                    "spec.controlPlane.deployRetries {} exceeds the maximum of {}",
                    cp.deploy_retries, MAX_DEPLOY_RETRIES
                )));
            }
            if cp.outbound_queue == 0 {
                return Err(ConfigError::Invalid("spec.controlPlane.outboundQueue must be positive".into()));
            }
            if !cp.ws_path.starts_with('/') {
                return Err(ConfigError::Invalid("spec.controlPlane.wsPath must start with '/'".into()));
            }
            if cp.template_cache_size == 0 {
                return Err(ConfigError::Invalid("spec.controlPlane.templateCacheSize must be positive".into()));
            }
        }

        if let Some(obs) = &self.spec.observability {
            if !matches!(obs.logging.format.as_str(), "compact" | "json") {
                return Err(ConfigError::Invalid(format!(
                    "spec.observability.logging.format '{}' must be 'compact' or 'json'",
                    obs.logging.format
                )));
            }
        }

        Ok(())
    }

    pub fn agent(&self) -> AgentConfig {
        self.spec.agent.clone().unwrap_or_default()
    }

    pub fn control_plane(&self) -> ControlPlaneConfig {
        self.spec.control_plane.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_agent_yaml() {
        let yaml = r#"
apiVersion: gatejet.io/v1
kind: NodeConfig
metadata:
  name: clinic-edge-01
spec:
  agent:
    runtimeId: rt-clinic-01
    bootstrapToken: s3cret
    control:
      baseUrl: wss://control.example.org
      wsPath: /ws/agent
    overlay:
      enabled: true
      lighthouses: ["10.42.0.1:4242"]
    mqtt:
      enabled: true
      host: broker.local
    nodeRuntime:
      bin: /usr/local/bin/node-red
    security:
      adminPath: /gj-admin
      apiAdminHost: 127.0.0.1
      apiAdminPort: 19000
    sidecars:
      installOrthanc: true
"#;
        let manifest = NodeConfigManifest::from_yaml_str(yaml).unwrap();
        manifest.validate().unwrap();

        let agent = manifest.agent();
        assert_eq!(agent.runtime_id, "rt-clinic-01");
        assert_eq!(agent.ws_url(), "wss://control.example.org/ws/agent");
        assert_eq!(agent.mqtt.port, 1883);
        assert_eq!(agent.mqtt_url().as_deref(), Some("mqtt://broker.local:1883"));
        assert_eq!(agent.security.api_admin_port, Some(19000));
        assert_eq!(agent.sidecars.as_ref().and_then(|s| s.install_orthanc), Some(true));
        assert_eq!(agent.default_drain_ms, 0);
        assert_eq!(agent.heartbeat_interval_secs, 15);
        assert_eq!(agent.device_id(), "rt-clinic-01");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut manifest = NodeConfigManifest::default();
        manifest.spec.control_plane = Some(ControlPlaneConfig::default());
        let yaml = manifest.to_yaml_string().unwrap();
        let parsed = NodeConfigManifest::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.control_plane().port, 8088);
        assert_eq!(parsed.control_plane().liveness_window(), Duration::from_secs(45));
    }

    #[test]
    fn test_env_overrides_create_agent_section() {
        let mut manifest = NodeConfigManifest::default();
        manifest.apply_overrides_from(|key| match key {
            ENV_RUNTIME_ID => Some("rt-from-env".into()),
            ENV_CONTROL_URL => Some("ws://10.0.0.5:8088".into()),
            ENV_BOOTSTRAP_TOKEN => Some("tok".into()),
            _ => None,
        });
        let agent = manifest.agent();
        assert_eq!(agent.runtime_id, "rt-from-env");
        assert_eq!(agent.control.base_url, "ws://10.0.0.5:8088");
        assert_eq!(agent.bootstrap_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_validation() {
        let mut manifest = NodeConfigManifest::default();
        manifest.api_version = "v0".into();
        assert!(manifest.validate().is_err());

        let mut manifest = NodeConfigManifest::default();
        let mut agent = AgentConfig::default();
        agent.control.base_url = "http://control".into();
        manifest.spec.agent = Some(agent);
        assert!(manifest.validate().is_err());

        let mut manifest = NodeConfigManifest::default();
        let mut agent = AgentConfig::default();
        agent.overlay.enabled = true;
        manifest.spec.agent = Some(agent);
        assert!(manifest.validate().is_err());

        let mut manifest = NodeConfigManifest::default();
        manifest.spec.observability = Some(ObservabilityConfig {
            logging: LoggingConfig {
                level: "debug".into(),
                format: "xml".into(),
            },
            metrics: None,
        });
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_deploy_retries_capped_at_one() {
        let mut manifest = NodeConfigManifest::default();
        let mut cp = ControlPlaneConfig::default();
        cp.deploy_retries = 1;
        manifest.spec.control_plane = Some(cp.clone());
        manifest.validate().unwrap();

        cp.deploy_retries = 0;
        manifest.spec.control_plane = Some(cp.clone());
        manifest.validate().unwrap();

        cp.deploy_retries = 5;
        manifest.spec.control_plane = Some(cp);
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("deployRetries"));
    }
}
