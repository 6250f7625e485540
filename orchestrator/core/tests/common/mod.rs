// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures: `/bin/sh` engines, a switchable readiness probe and
//! hand-built bundles.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatejet_core::application::{ChannelManager, ChannelManagerConfig};
use gatejet_core::domain::bundle::{ArtifactSet, Bundle, BundleHashes, BundleManifest, BuildMode};
use gatejet_core::domain::runtime::{EngineLauncher, LaunchCommand, LaunchSpec, ReadinessProbe};
use gatejet_core::infrastructure::archive;

/// Runs until asked to stop, exiting promptly on SIGTERM.
pub const GRACEFUL: &str = "trap 'exit 0' TERM; while true; do sleep 0.05; done";

/// Ignores SIGTERM; only SIGKILL ends it.
pub const STUBBORN: &str = "trap '' TERM; while true; do sleep 0.05; done";

pub const TOKEN: &str = "bootstrap-token";

pub struct ShellLauncher(pub &'static str);

impl EngineLauncher for ShellLauncher {
    fn command(&self, spec: &LaunchSpec) -> LaunchCommand {
        LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), self.0.to_string()],
            env: spec.environment(),
            cwd: spec.build_dir.clone(),
        }
    }
}

pub struct SwitchProbe(pub AtomicBool);

impl SwitchProbe {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadinessProbe for SwitchProbe {
    async fn is_ready(&self, _host: &str, _port: u16) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn manager_config(work_dir: &Path) -> ChannelManagerConfig {
    ChannelManagerConfig {
        work_dir: work_dir.to_path_buf(),
        admin_path: "/admin".into(),
        admin_host: "127.0.0.1".into(),
        port_base: None,
        startup_window: Duration::from_secs(2),
        default_drain: Duration::ZERO,
        mqtt_url: None,
        bootstrap_token: Some(TOKEN.into()),
    }
}

pub fn manager(work_dir: &Path, script: &'static str, probe: Arc<SwitchProbe>) -> Arc<ChannelManager> {
    ChannelManager::new(manager_config(work_dir), Arc::new(ShellLauncher(script)), probe)
}

pub fn bundle(channel_id: &str, build_id: &str) -> Bundle {
    let manifest = BundleManifest::new(channel_id, build_id, BuildMode::Test);
    let artifacts = ArtifactSet {
        flows: format!(r#"[{{"id":"tab","type":"tab","label":"{channel_id}"}}]"#).into_bytes(),
        settings: b"module.exports = {};".to_vec(),
        manifest: serde_json::to_vec(&manifest).unwrap(),
        credentials_map: b"{}".to_vec(),
    };
    let archive = archive::pack(&artifacts).unwrap();
    let hashes = BundleHashes::compute(&artifacts, &archive).unwrap();
    Bundle {
        manifest,
        artifacts,
        archive,
        hashes,
    }
}

/// Poll `check` every 20ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
