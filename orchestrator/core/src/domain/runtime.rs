// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ports to the flow-engine subprocess.
//!
//! The channel manager decides *what* to run; an [`EngineLauncher`] turns
//! that into a concrete command line and a [`ReadinessProbe`] decides when
//! the engine is serving.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const ENV_ADMIN_USER: &str = "GJ_ADMIN_USER";
pub const ENV_ADMIN_PASS: &str = "GJ_ADMIN_PASS";
pub const ENV_PORT: &str = "PORT";
pub const ENV_ADMIN_PATH: &str = "GJ_ADMIN_PATH";
pub const ENV_ADMIN_HOST: &str = "GJ_ADMIN_HOST";
pub const ENV_TOPIC_IN: &str = "GJ_TOPIC_IN";
pub const ENV_TOPIC_OUT: &str = "GJ_TOPIC_OUT";
pub const ENV_MQTT_URL: &str = "GJ_MQTT_URL";

const ADMIN_PASSWORD_LEN: usize = 24;

/// Per-start admin credentials for the engine's editor/admin API.
#[derive(Clone)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
}

impl AdminCredentials {
    pub fn generate(user: impl Into<String>) -> Self {
        let password = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ADMIN_PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self {
            user: user.into(),
            password,
        }
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Message-bus side channel topics: `gj/{channelId}/in|out`.
pub fn channel_topics(channel_id: &str) -> (String, String) {
    (format!("gj/{channel_id}/in"), format!("gj/{channel_id}/out"))
}

/// Everything needed to start one engine for one build.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub channel_id: String,
    pub build_id: String,
    /// Materialized build directory; also the engine's user directory.
    pub build_dir: PathBuf,
    pub flows_path: PathBuf,
    pub settings_path: PathBuf,
    pub port: u16,
    pub admin: AdminCredentials,
    pub admin_path: String,
    pub admin_host: String,
    /// Broker URL when the MQTT side channel is enabled.
    pub mqtt_url: Option<String>,
}

impl LaunchSpec {
    /// Environment the generated `settings.js` reads at engine start.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(ENV_ADMIN_USER.to_string(), self.admin.user.clone());
        env.insert(ENV_ADMIN_PASS.to_string(), self.admin.password.clone());
        env.insert(ENV_PORT.to_string(), self.port.to_string());
        env.insert(ENV_ADMIN_PATH.to_string(), self.admin_path.clone());
        env.insert(ENV_ADMIN_HOST.to_string(), self.admin_host.clone());
        if let Some(url) = &self.mqtt_url {
            let (topic_in, topic_out) = channel_topics(&self.channel_id);
            env.insert(ENV_MQTT_URL.to_string(), url.clone());
            env.insert(ENV_TOPIC_IN.to_string(), topic_in);
            env.insert(ENV_TOPIC_OUT.to_string(), topic_out);
        }
        env
    }
}

/// Concrete process invocation, independent of any process API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

pub trait EngineLauncher: Send + Sync {
    fn command(&self, spec: &LaunchSpec) -> LaunchCommand;
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// One probe attempt; the caller polls within the startup window.
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mqtt: Option<&str>) -> LaunchSpec {
        LaunchSpec {
            channel_id: "ch-1".into(),
            build_id: "b-1".into(),
            build_dir: PathBuf::from("/tmp/b-1"),
            flows_path: PathBuf::from("/tmp/b-1/flows.json"),
            settings_path: PathBuf::from("/tmp/b-1/settings.js"),
            port: 18080,
            admin: AdminCredentials::generate("admin"),
            admin_path: "/admin".into(),
            admin_host: "127.0.0.1".into(),
            mqtt_url: mqtt.map(Into::into),
        }
    }

    #[test]
    fn test_admin_password_shape() {
        let a = AdminCredentials::generate("admin");
        let b = AdminCredentials::generate("admin");
        assert_eq!(a.password.len(), ADMIN_PASSWORD_LEN);
        assert!(a.password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.password, b.password);
        assert!(!format!("{a:?}").contains(&a.password));
    }

    #[test]
    fn test_environment_without_mqtt() {
        let env = spec(None).environment();
        assert_eq!(env[ENV_PORT], "18080");
        assert_eq!(env[ENV_ADMIN_PATH], "/admin");
        assert!(!env.contains_key(ENV_TOPIC_IN));
    }

    #[test]
    fn test_environment_with_mqtt_topics() {
        let env = spec(Some("mqtt://localhost:1883")).environment();
        assert_eq!(env[ENV_TOPIC_IN], "gj/ch-1/in");
        assert_eq!(env[ENV_TOPIC_OUT], "gj/ch-1/out");
    }
}
