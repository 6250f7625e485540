// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Channel Manager
//!
//! Owns the agent's channel table. Each channel is a slot holding
//!
//! - a snapshot of its [`ChannelStatus`] behind a `parking_lot::RwLock`, read
//!   by `status` and heartbeats without waiting for in-flight commands, and
//! - its runtime (installed build, engine process, usage sampler) behind a
//!   `tokio::sync::Mutex` held for the whole of a deploy/start/stop/restart,
//!   so commands for one channel never overlap while different channels
//!   proceed in parallel.
//!
//! Unrequested engine exits reach a reaper task. Every spawn gets a fresh
//! generation number; an exit whose generation no longer matches the slot
//! belongs to a process that has already been replaced and is ignored.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::bundle::{
    ArtifactSet, BuildMode, BundleContent, CREDENTIALS_MAP_FILE, FLOWS_FILE, MANIFEST_FILE, SETTINGS_FILE,
};
use crate::domain::channel::{ChannelError, ChannelState, ChannelStatus};
use crate::domain::ir::check_channel_id;
use crate::domain::node_config::AgentConfig;
use crate::domain::protocol::SecretPayload;
use crate::domain::runtime::{AdminCredentials, EngineLauncher, LaunchSpec, ReadinessProbe};
use crate::infrastructure::archive;
use crate::infrastructure::engine::{EngineProcess, ExitReport, PortAllocator, UsageSampler};
use crate::infrastructure::secrets::{resolve_credentials, SecretSealer};

/// Resolved credentials written next to the flows for the engine.
pub const CREDENTIALS_FILE: &str = "flows_cred.json";

const READY_POLL: Duration = Duration::from_millis(100);
const ADMIN_USER: &str = "admin";

#[derive(Debug, Clone)]
pub struct ChannelManagerConfig {
    pub work_dir: PathBuf,
    pub admin_path: String,
    pub admin_host: String,
    pub port_base: Option<u16>,
    pub startup_window: Duration,
    pub default_drain: Duration,
    pub mqtt_url: Option<String>,
    pub bootstrap_token: Option<String>,
}

impl ChannelManagerConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            admin_path: config.security.admin_path.clone(),
            admin_host: config.security.api_admin_host.clone(),
            port_base: config.security.api_admin_port,
            startup_window: config.startup_window(),
            default_drain: config.default_drain(),
            mqtt_url: config.mqtt_url(),
            bootstrap_token: config.bootstrap_token.clone(),
        }
    }
}

/// Result of a successful deploy.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub status: ChannelStatus,
    /// Merkle root recomputed from the received artifacts.
    pub verified_root: String,
}

#[derive(Debug, Clone)]
struct InstalledBuild {
    build_id: String,
    dir: PathBuf,
}

struct SlotRuntime {
    build: Option<InstalledBuild>,
    process: Option<EngineProcess>,
    generation: u64,
    sampler: UsageSampler,
}

struct ChannelSlot {
    snapshot: RwLock<ChannelStatus>,
    runtime: Mutex<SlotRuntime>,
}

impl ChannelSlot {
    fn new(channel_id: &str) -> Self {
        Self {
            snapshot: RwLock::new(ChannelStatus::new(channel_id)),
            runtime: Mutex::new(SlotRuntime {
                build: None,
                process: None,
                generation: 0,
                sampler: UsageSampler::new(),
            }),
        }
    }

    fn state(&self) -> ChannelState {
        self.snapshot.read().state
    }

    fn read(&self) -> ChannelStatus {
        self.snapshot.read().clone()
    }

    fn transition(&self, next: ChannelState) -> Result<(), ChannelError> {
        self.snapshot.write().transition_to(next)
    }

    fn update<F: FnOnce(&mut ChannelStatus)>(&self, f: F) {
        f(&mut self.snapshot.write());
    }
}

struct ProcessExit {
    channel_id: String,
    generation: u64,
    report: ExitReport,
}

pub struct ChannelManager {
    config: ChannelManagerConfig,
    launcher: Arc<dyn EngineLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    ports: PortAllocator,
    slots: DashMap<String, Arc<ChannelSlot>>,
    generation: AtomicU64,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl ChannelManager {
    /// Create the manager and start its reaper. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: ChannelManagerConfig,
        launcher: Arc<dyn EngineLauncher>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Arc<Self> {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let ports = PortAllocator::new(config.admin_host.clone(), config.port_base);
        let manager = Arc::new(Self {
            config,
            launcher,
            probe,
            ports,
            slots: DashMap::new(),
            generation: AtomicU64::new(0),
            exits,
        });
        tokio::spawn(reap_exits(Arc::downgrade(&manager), exit_rx));
        manager
    }

    pub fn config(&self) -> &ChannelManagerConfig {
        &self.config
    }

    /// Verify, materialize and (re)start a build. A bundle that fails
    /// verification leaves the channel exactly as it was.
    pub async fn deploy(
        &self,
        channel_id: &str,
        build_id: &str,
        mode: BuildMode,
        content: &BundleContent,
        secrets: Option<&SecretPayload>,
    ) -> Result<DeployOutcome, ChannelError> {
        check_path_component(channel_id)?;
        check_path_component(build_id)?;

        // Nothing touches the channel table or disk until the bundle verifies.
        let archive = content.archive_bytes()?;
        let artifacts = archive::unpack(&archive)?;
        if let Err(e) = content.hashes.verify(&artifacts, &archive) {
            warn!(channel_id, build_id, error = %e, "Bundle rejected");
            return Err(e.into());
        }
        artifacts.manifest()?.check_identity(channel_id, build_id, mode)?;
        info!(channel_id, build_id, merkle_root = %content.hashes.merkle_root, "Bundle verified");
        let credentials = self.resolve_secrets(&artifacts, secrets)?;

        let slot = self.slot_or_create(channel_id);
        let mut runtime = slot.runtime.lock().await;

        let staging = self.staging_dir(channel_id, build_id);
        if let Err(e) = materialize(&staging, &artifacts, credentials.as_deref()).await {
            discard_dir(&staging).await;
            return Err(ChannelError::Materialize {
                channel_id: channel_id.to_string(),
                message: e.to_string(),
            });
        }

        if let Err(e) = self.vacate(channel_id, &slot, &mut runtime).await {
            discard_dir(&staging).await;
            return Err(e);
        }

        let dir = self.build_dir(channel_id, build_id);
        if let Err(e) = install(&staging, &dir).await {
            discard_dir(&staging).await;
            let err = ChannelError::Materialize {
                channel_id: channel_id.to_string(),
                message: e.to_string(),
            };
            return Err(self.fail_start(&slot, err));
        }
        debug!(channel_id, build_id, dir = %dir.display(), "Build installed");

        runtime.build = Some(InstalledBuild {
            build_id: build_id.to_string(),
            dir,
        });
        slot.update(|s| {
            s.build_id = Some(build_id.to_string());
            s.last_error = None;
        });

        let status = self.launch(channel_id, &slot, &mut runtime).await?;
        Ok(DeployOutcome {
            status,
            verified_root: content.hashes.merkle_root.clone(),
        })
    }

    /// Start the installed build. Already running is a no-op; a channel in
    /// `error` must be restarted or redeployed.
    pub async fn start(&self, channel_id: &str) -> Result<ChannelStatus, ChannelError> {
        let slot = self.slot(channel_id)?;
        let mut runtime = slot.runtime.lock().await;

        match slot.state() {
            ChannelState::Running | ChannelState::Starting => Ok(slot.read()),
            ChannelState::Error => Err(ChannelError::InvalidTransition {
                channel_id: channel_id.to_string(),
                from: ChannelState::Error,
                to: ChannelState::Starting,
            }),
            _ => {
                if runtime.build.is_none() {
                    return Err(ChannelError::NoBuild(channel_id.to_string()));
                }
                slot.transition(ChannelState::Starting)?;
                self.launch(channel_id, &slot, &mut runtime).await
            }
        }
    }

    /// Stop with a drain window (`None` uses the configured default). A
    /// stopped channel is left alone.
    pub async fn stop(&self, channel_id: &str, drain: Option<Duration>) -> Result<ChannelStatus, ChannelError> {
        let slot = self.slot(channel_id)?;
        let mut runtime = slot.runtime.lock().await;

        if slot.state() == ChannelState::Stopped {
            debug!(channel_id, "Stop on stopped channel ignored");
            return Ok(slot.read());
        }
        let drain = drain.unwrap_or(self.config.default_drain);
        self.drain(channel_id, &slot, &mut runtime, drain).await?;
        slot.transition(ChannelState::Stopped)?;
        info!(channel_id, "Channel stopped");
        Ok(slot.read())
    }

    /// Drain if running, then start the current build again. Also the way
    /// out of `error`.
    pub async fn restart(&self, channel_id: &str) -> Result<ChannelStatus, ChannelError> {
        let slot = self.slot(channel_id)?;
        let mut runtime = slot.runtime.lock().await;

        if runtime.build.is_none() {
            return Err(ChannelError::NoBuild(channel_id.to_string()));
        }
        self.vacate(channel_id, &slot, &mut runtime).await?;
        info!(channel_id, "Restarting channel");
        self.launch(channel_id, &slot, &mut runtime).await
    }

    /// Snapshot of one channel. Never waits for an in-flight command.
    pub fn status(&self, channel_id: &str) -> Option<ChannelStatus> {
        self.slots
            .get(channel_id)
            .map(|slot| slot.read())
            .filter(|status| status.build_id.is_some())
    }

    /// Every deployed channel, ordered by id.
    pub fn summary(&self) -> Vec<ChannelStatus> {
        let mut channels: Vec<ChannelStatus> = self
            .slots
            .iter()
            .map(|slot| slot.read())
            .filter(|status| status.build_id.is_some())
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    /// Refresh cpu/memory of running engines. Channels busy with a command
    /// keep their previous sample.
    pub fn sample_usage(&self) {
        for entry in self.slots.iter() {
            let slot = entry.value();
            let Ok(mut runtime) = slot.runtime.try_lock() else {
                continue;
            };
            if slot.state() != ChannelState::Running {
                continue;
            }
            let Some(pid) = runtime.process.as_ref().and_then(EngineProcess::pid) else {
                continue;
            };
            if let Some(usage) = runtime.sampler.sample(pid) {
                slot.update(|s| {
                    s.cpu_pct = Some(usage.cpu_pct);
                    s.rss_mb = Some(usage.rss_mb);
                });
            }
        }
    }

    /// Stop every channel, used when the agent exits.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for channel_id in ids {
            let Ok(slot) = self.slot(&channel_id) else {
                continue;
            };
            let mut runtime = slot.runtime.lock().await;
            if slot.state() == ChannelState::Running {
                if let Err(e) = self.drain(&channel_id, &slot, &mut runtime, self.config.default_drain).await {
                    warn!(channel_id = %channel_id, error = %e, "Failed to drain channel on shutdown");
                    continue;
                }
                if let Err(e) = slot.transition(ChannelState::Stopped) {
                    warn!(channel_id = %channel_id, error = %e, "Could not record channel stop on shutdown");
                }
            } else {
                self.discard_process(&slot, &mut runtime).await;
            }
        }
    }

    fn slot(&self, channel_id: &str) -> Result<Arc<ChannelSlot>, ChannelError> {
        self.slots
            .get(channel_id)
            .map(|s| s.clone())
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))
    }

    fn slot_or_create(&self, channel_id: &str) -> Arc<ChannelSlot> {
        self.slots
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(ChannelSlot::new(channel_id)))
            .clone()
    }

    /// Fresh directory on the same filesystem as the build dirs, so the
    /// final install is a rename.
    fn staging_dir(&self, channel_id: &str, build_id: &str) -> PathBuf {
        self.config
            .work_dir
            .join("channels")
            .join(channel_id)
            .join("staging")
            .join(format!("{build_id}-{}", Uuid::new_v4().simple()))
    }

    fn build_dir(&self, channel_id: &str, build_id: &str) -> PathBuf {
        self.config
            .work_dir
            .join("channels")
            .join(channel_id)
            .join("builds")
            .join(build_id)
    }

    /// Open the sealed payload and fill the credentials map. `None` when the
    /// bundle carries no credentials.
    fn resolve_secrets(
        &self,
        artifacts: &ArtifactSet,
        payload: Option<&SecretPayload>,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let map = artifacts.credentials_map()?;
        if map.is_empty() {
            return Ok(None);
        }
        let secrets = match payload {
            Some(payload) => {
                let token = self
                    .config
                    .bootstrap_token
                    .as_deref()
                    .ok_or_else(|| ChannelError::Secrets("no bootstrap token to open secret payload".to_string()))?;
                SecretSealer::from_token(token)
                    .open(payload)
                    .map_err(|e| ChannelError::Secrets(e.to_string()))?
            }
            None => Default::default(),
        };
        let resolved = resolve_credentials(&map, &secrets).map_err(|e| ChannelError::Secrets(e.to_string()))?;
        serde_json::to_vec_pretty(&resolved)
            .map(Some)
            .map_err(|e| ChannelError::Secrets(e.to_string()))
    }

    /// Allocate a port, spawn the engine and wait for readiness. The slot
    /// must already be `starting`; any failure leaves it in `error`.
    async fn launch(
        &self,
        channel_id: &str,
        slot: &ChannelSlot,
        runtime: &mut SlotRuntime,
    ) -> Result<ChannelStatus, ChannelError> {
        let Some(build) = runtime.build.clone() else {
            return Err(self.fail_start(slot, ChannelError::NoBuild(channel_id.to_string())));
        };

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => return Err(self.fail_start(slot, e)),
        };

        let spec = LaunchSpec {
            channel_id: channel_id.to_string(),
            build_id: build.build_id.clone(),
            flows_path: build.dir.join(FLOWS_FILE),
            settings_path: build.dir.join(SETTINGS_FILE),
            build_dir: build.dir.clone(),
            port,
            admin: AdminCredentials::generate(ADMIN_USER),
            admin_path: self.config.admin_path.clone(),
            admin_host: self.config.admin_host.clone(),
            mqtt_url: self.config.mqtt_url.clone(),
        };
        let command = self.launcher.command(&spec);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let exits = self.exits.clone();
        let exit_channel = channel_id.to_string();
        let spawned = EngineProcess::spawn(&command, channel_id, move |report| {
            let _ = exits.send(ProcessExit {
                channel_id: exit_channel,
                generation,
                report,
            });
        });
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.ports.release(port);
                let err = ChannelError::Spawn {
                    channel_id: channel_id.to_string(),
                    message: e.to_string(),
                };
                return Err(self.fail_start(slot, err));
            }
        };

        runtime.generation = generation;
        runtime.sampler = UsageSampler::new();
        slot.update(|s| {
            s.pid = process.pid();
            s.port = Some(port);
            s.started_at = Some(Utc::now());
            s.last_error = None;
        });
        runtime.process = Some(process);

        if let Err(e) = self.wait_ready(channel_id, port, runtime).await {
            self.discard_process(slot, runtime).await;
            return Err(self.fail_start(slot, e));
        }

        slot.transition(ChannelState::Running)?;
        let status = slot.read();
        info!(channel_id, build_id = %build.build_id, pid = ?status.pid, port, "Channel running");
        Ok(status)
    }

    async fn wait_ready(&self, channel_id: &str, port: u16, runtime: &SlotRuntime) -> Result<(), ChannelError> {
        let window = self.config.startup_window;
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if let Some(report) = runtime.process.as_ref().and_then(EngineProcess::exit_report) {
                return Err(ChannelError::ExitedDuringStartup {
                    channel_id: channel_id.to_string(),
                    status: report.description,
                });
            }
            if self.probe.is_ready(&self.config.admin_host, port).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::StartupTimeout {
                    channel_id: channel_id.to_string(),
                    window_ms: window.as_millis() as u64,
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn fail_start(&self, slot: &ChannelSlot, err: ChannelError) -> ChannelError {
        slot.update(|s| {
            error!(channel_id = %s.channel_id, error = %err, "Channel failed to start");
            s.clear_process();
            s.last_error = Some(err.to_string());
        });
        if let Err(e) = slot.transition(ChannelState::Error) {
            warn!(error = %e, "Could not record start failure");
        }
        err
    }

    /// Drain a running engine or clear a failed one, leaving the slot `starting`.
    async fn vacate(&self, channel_id: &str, slot: &ChannelSlot, runtime: &mut SlotRuntime) -> Result<(), ChannelError> {
        match slot.state() {
            ChannelState::Running => self.drain(channel_id, slot, runtime, self.config.default_drain).await?,
            ChannelState::Error => self.discard_process(slot, runtime).await,
            _ => {}
        }
        slot.transition(ChannelState::Starting)
    }

    /// `running -> draining`, then terminate within `grace`.
    async fn drain(
        &self,
        channel_id: &str,
        slot: &ChannelSlot,
        runtime: &mut SlotRuntime,
        grace: Duration,
    ) -> Result<(), ChannelError> {
        slot.transition(ChannelState::Draining)?;
        info!(channel_id, drain_ms = grace.as_millis() as u64, "Draining channel");
        self.discard_process_with(slot, runtime, grace).await;
        Ok(())
    }

    async fn discard_process(&self, slot: &ChannelSlot, runtime: &mut SlotRuntime) {
        self.discard_process_with(slot, runtime, Duration::ZERO).await;
    }

    /// Terminate and release whatever process the slot still owns.
    async fn discard_process_with(&self, slot: &ChannelSlot, runtime: &mut SlotRuntime, grace: Duration) {
        if let Some(mut process) = runtime.process.take() {
            process.terminate(grace).await;
        }
        if let Some(port) = slot.snapshot.read().port {
            self.ports.release(port);
        }
        slot.update(ChannelStatus::clear_process);
    }

    async fn handle_exit(&self, exit: ProcessExit) {
        let Ok(slot) = self.slot(&exit.channel_id) else {
            return;
        };
        let mut runtime = slot.runtime.lock().await;
        if runtime.generation != exit.generation || runtime.process.is_none() {
            debug!(channel_id = %exit.channel_id, "Ignoring exit of a replaced engine");
            return;
        }
        runtime.process = None;
        if let Some(port) = slot.snapshot.read().port {
            self.ports.release(port);
        }
        slot.update(|s| {
            s.clear_process();
            s.last_error = Some(format!("engine exited: {}", exit.report.description));
        });
        match slot.transition(ChannelState::Error) {
            Ok(()) => error!(channel_id = %exit.channel_id, status = %exit.report.description, "Channel engine crashed"),
            Err(e) => warn!(channel_id = %exit.channel_id, error = %e, "Unexpected engine exit"),
        }
    }
}

async fn reap_exits(manager: Weak<ChannelManager>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_exit(exit).await;
    }
}

fn check_path_component(id: &str) -> Result<(), ChannelError> {
    check_channel_id(id).map_err(|e| ChannelError::Materialize {
        channel_id: id.to_string(),
        message: e.to_string(),
    })
}

async fn materialize(dir: &Path, artifacts: &ArtifactSet, credentials: Option<&[u8]>) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, bytes) in [
        (FLOWS_FILE, artifacts.flows.as_slice()),
        (SETTINGS_FILE, artifacts.settings.as_slice()),
        (MANIFEST_FILE, artifacts.manifest.as_slice()),
        (CREDENTIALS_MAP_FILE, artifacts.credentials_map.as_slice()),
    ] {
        tokio::fs::write(dir.join(name), bytes).await?;
    }
    if let Some(credentials) = credentials {
        tokio::fs::write(dir.join(CREDENTIALS_FILE), credentials).await?;
    }
    Ok(())
}

/// Move a staged build into place, replacing an earlier copy of the same build.
async fn install(staging: &Path, dir: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(staging, dir).await
}

async fn discard_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::bundle::{Bundle, BundleHashes, BundleManifest};
    use crate::domain::runtime::LaunchCommand;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    struct ShellLauncher(&'static str);

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

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ReadinessProbe for FlagProbe {
        async fn is_ready(&self, _host: &str, _port: u16) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    const LONG_RUNNING: &str = "trap 'exit 0' TERM; while true; do sleep 0.05; done";

    fn config(dir: &Path) -> ChannelManagerConfig {
        ChannelManagerConfig {
            work_dir: dir.to_path_buf(),
            admin_path: "/admin".into(),
            admin_host: "127.0.0.1".into(),
            port_base: None,
            startup_window: Duration::from_millis(500),
            default_drain: Duration::ZERO,
            mqtt_url: None,
            bootstrap_token: Some("token".into()),
        }
    }

    fn manager(dir: &Path, script: &'static str, ready: bool) -> Arc<ChannelManager> {
        ChannelManager::new(
            config(dir),
            Arc::new(ShellLauncher(script)),
            Arc::new(FlagProbe(AtomicBool::new(ready))),
        )
    }

    fn bundle(channel_id: &str, build_id: &str, credentials: &str) -> Bundle {
        bundle_with_flows(channel_id, build_id, credentials, "[]")
    }

    fn bundle_with_flows(channel_id: &str, build_id: &str, credentials: &str, flows: &str) -> Bundle {
        let manifest = BundleManifest::new(channel_id, build_id, BuildMode::Test);
        let artifacts = ArtifactSet {
            flows: flows.as_bytes().to_vec(),
            settings: b"module.exports = {};".to_vec(),
            manifest: serde_json::to_vec(&manifest).unwrap(),
            credentials_map: credentials.as_bytes().to_vec(),
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

    #[tokio::test]
    async fn test_deploy_runs_and_materializes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        let b = bundle("ch-1", "b-1", r#"{"n1":{"password":"${secret:PASS}"}}"#);
        let sealed = SecretSealer::from_token("token")
            .seal(&BTreeMap::from([("PASS".to_string(), "hunter2".to_string())]))
            .unwrap();

        let outcome = manager
            .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), Some(&sealed))
            .await
            .unwrap();
        assert_eq!(outcome.status.state, ChannelState::Running);
        assert_eq!(outcome.verified_root, b.hashes.merkle_root);
        assert!(outcome.status.pid.is_some());

        let build_dir = dir.path().join("channels/ch-1/builds/b-1");
        assert!(build_dir.join(FLOWS_FILE).exists());
        let creds = std::fs::read_to_string(build_dir.join(CREDENTIALS_FILE)).unwrap();
        assert!(creds.contains("hunter2"));

        manager.stop("ch-1", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_secret_fails_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        let b = bundle("ch-1", "b-1", r#"{"n1":{"password":"${secret:PASS}"}}"#);

        let err = manager
            .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Secrets(_)));
        assert!(manager.status("ch-1").is_none());
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        let b = bundle("ch-1", "b-1", "{}");

        let err = manager
            .deploy("ch-2", "b-1", BuildMode::Test, &b.to_content(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Integrity(_)));
        assert!(manager.slots.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_first_deploy_leaves_no_slot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        let mut b = bundle("ch-1", "b-1", "{}");
        b.hashes.merkle_root = "00".repeat(32);

        for _ in 0..3 {
            let err = manager
                .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
                .await
                .unwrap_err();
            assert!(matches!(err, ChannelError::Integrity(_)));
        }
        assert!(manager.slots.is_empty());
        assert!(!dir.path().join("channels").exists());
    }

    #[tokio::test]
    async fn test_same_build_redeploy_swaps_files_after_drain() {
        // the engine records the flows it sees when asked to stop
        const RECORDING: &str = "trap 'cat flows.json >> ../../drained.log; exit 0' TERM; while true; do sleep 0.05; done";
        let dir = tempfile::tempdir().unwrap();
        let manager = ChannelManager::new(
            ChannelManagerConfig {
                default_drain: Duration::from_secs(5),
                ..config(dir.path())
            },
            Arc::new(ShellLauncher(RECORDING)),
            Arc::new(FlagProbe(AtomicBool::new(true))),
        );

        let first = bundle_with_flows("ch-1", "b-1", "{}", r#"[{"id":"old"}]"#);
        manager
            .deploy("ch-1", "b-1", BuildMode::Test, &first.to_content(), None)
            .await
            .unwrap();
        let second = bundle_with_flows("ch-1", "b-1", "{}", r#"[{"id":"new"}]"#);
        let outcome = manager
            .deploy("ch-1", "b-1", BuildMode::Test, &second.to_content(), None)
            .await
            .unwrap();
        assert_eq!(outcome.status.state, ChannelState::Running);

        let channel_dir = dir.path().join("channels/ch-1");
        let drained = std::fs::read_to_string(channel_dir.join("drained.log")).unwrap();
        assert_eq!(drained, r#"[{"id":"old"}]"#);
        let installed = std::fs::read_to_string(channel_dir.join("builds/b-1").join(FLOWS_FILE)).unwrap();
        assert_eq!(installed, r#"[{"id":"new"}]"#);
        assert_eq!(std::fs::read_dir(channel_dir.join("staging")).unwrap().count(), 0);

        manager.stop("ch-1", Some(Duration::ZERO)).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_window_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, false);
        let b = bundle("ch-1", "b-1", "{}");

        let err = manager
            .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::StartupTimeout { .. }));
        let status = manager.status("ch-1").unwrap();
        assert_eq!(status.state, ChannelState::Error);
        assert!(status.pid.is_none());
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop_rules() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        assert!(matches!(manager.start("nope").await, Err(ChannelError::UnknownChannel(_))));

        let b = bundle("ch-1", "b-1", "{}");
        manager
            .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
            .await
            .unwrap();
        let pid = manager.status("ch-1").unwrap().pid;

        // start on running is a no-op
        assert_eq!(manager.start("ch-1").await.unwrap().pid, pid);

        let stopped = manager.stop("ch-1", None).await.unwrap();
        assert_eq!(stopped.state, ChannelState::Stopped);
        assert!(stopped.pid.is_none());
        assert_eq!(manager.stop("ch-1", None).await.unwrap().state, ChannelState::Stopped);

        let restarted = manager.restart("ch-1").await.unwrap();
        assert_eq!(restarted.state, ChannelState::Running);
        assert_ne!(restarted.pid, pid);
        manager.shutdown().await;
        assert_eq!(manager.status("ch-1").unwrap().state, ChannelState::Stopped);
    }

    #[tokio::test]
    async fn test_summary_lists_deployed_channels() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), LONG_RUNNING, true);
        for id in ["ch-b", "ch-a"] {
            let b = bundle(id, "b-1", "{}");
            manager.deploy(id, "b-1", BuildMode::Test, &b.to_content(), None).await.unwrap();
        }
        let ids: Vec<String> = manager.summary().into_iter().map(|s| s.channel_id).collect();
        assert_eq!(ids, vec!["ch-a", "ch-b"]);
        manager.sample_usage();
        manager.shutdown().await;
    }
}
