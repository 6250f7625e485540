// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Control-Plane Orchestrator
//!
//! Owns build and deployment records and drives both state machines.
//!
//! ```text
//! compile:  lint ──fail──▶ FAILED
//!             └──pass──▶ QUEUED ─▶ COMPILING ─▶ COMPILED | FAILED      (background)
//! deploy:   QUEUED ─▶ SENT ─▶ ACKED | FAILED
//!                       └──▶ TIMEOUT ─▶ SENT (once) | FAILED            (background)
//! ```
//!
//! `start`/`stop`/`restart`/`status` are pass-throughs to the agent. Deploys
//! and channel commands for one channel are serialized on a per-channel
//! lock; everything else runs concurrently.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::application::compiler::Compiler;
use crate::application::policy_gate::PolicyGate;
use crate::domain::build::{BuildId, BuildMode, BuildRecord, BuildStatus, TransitionError};
use crate::domain::channel::ChannelStatus;
use crate::domain::deployment::{DeployId, DeploymentRecord, DeploymentStatus};
use crate::domain::events::{BuildEvent, DeploymentEvent};
use crate::domain::ir::{ChannelIr, IrError};
use crate::domain::node_config::{ControlPlaneConfig, MAX_DEPLOY_RETRIES};
use crate::domain::policy::{LintResult, OrgPolicy, PolicyViolation};
use crate::domain::protocol::{AgentMessage, ControlMessage, Frame, RuntimeSummary, SecretPayload};
use crate::domain::repository::{BuildRepository, DeploymentRepository, RepositoryError};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::keyed_lock::KeyedLocks;
use crate::infrastructure::protocol::{AgentInfo, AgentRegistry, ProtocolError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid channel IR: {0}")]
    InvalidIr(#[from] IrError),

    #[error("Build {build_id} rejected by policy ({} blocking violation(s))", blocking_count(.violations))]
    PolicyRejected {
        build_id: BuildId,
        violations: Vec<PolicyViolation>,
    },

    #[error("Build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(DeployId),

    #[error("Build {build_id} is {status}, not COMPILED")]
    BuildNotCompiled { build_id: BuildId, status: BuildStatus },

    #[error("Unknown runtime: {0}")]
    UnknownRuntime(String),

    #[error("Channel {channel_id} is not known on runtime {runtime_id}")]
    UnknownChannel { runtime_id: String, channel_id: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Agent refused {op}: {reason}")]
    AgentRejected { op: &'static str, reason: String },

    #[error("Unexpected {got} reply to {op}")]
    UnexpectedReply { op: &'static str, got: &'static str },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

fn blocking_count(violations: &[PolicyViolation]) -> usize {
    violations.iter().filter(|v| v.blocks()).count()
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub request_timeout: Duration,
    pub deploy_timeout: Duration,
    /// Automatic re-sends after a deploy timeout, capped at `MAX_DEPLOY_RETRIES`.
    pub deploy_retries: u32,
}

impl From<&ControlPlaneConfig> for OrchestratorConfig {
    fn from(config: &ControlPlaneConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            deploy_timeout: config.deploy_timeout(),
            deploy_retries: config.deploy_retries.min(MAX_DEPLOY_RETRIES),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub ir: ChannelIr,
    pub mode: BuildMode,
    /// Violation ids (or rule ids) the caller has acknowledged.
    #[serde(default)]
    pub acknowledged: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub build_id: BuildId,
    pub runtime_id: String,
    #[serde(default)]
    pub secret_payload: Option<SecretPayload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildAccepted {
    pub build_id: BuildId,
    pub status: BuildStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentAccepted {
    pub deploy_id: DeployId,
    pub status: DeploymentStatus,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    policy: OrgPolicy,
    gate: PolicyGate,
    compiler: Arc<Compiler>,
    builds: Arc<dyn BuildRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    registry: Arc<AgentRegistry>,
    event_bus: EventBus,
    locks: KeyedLocks,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        policy: OrgPolicy,
        gate: PolicyGate,
        compiler: Arc<Compiler>,
        builds: Arc<dyn BuildRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        registry: Arc<AgentRegistry>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            config,
            policy,
            gate,
            compiler,
            builds,
            deployments,
            registry,
            event_bus,
            locks: KeyedLocks::new(),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn policy(&self) -> &OrgPolicy {
        &self.policy
    }

    pub fn lint(&self, ir: &ChannelIr, acknowledged: &HashSet<String>) -> LintResult {
        self.gate.lint(ir, &self.policy, acknowledged)
    }

    // ========================================================================
    // Builds
    // ========================================================================

    /// Lint synchronously, then compile in the background. A policy
    /// rejection records the build as FAILED and returns the violations.
    pub async fn compile(self: &Arc<Self>, request: CompileRequest) -> OrchestratorResult<BuildAccepted> {
        request.ir.check_references()?;

        let mut build = BuildRecord::new(BuildId::new(), &request.ir.channel_id, request.mode);
        let build_id = build.id;
        let channel_id = build.channel_id.clone();

        let lint = self.lint(&request.ir, &request.acknowledged);
        build.violations = lint.violations.clone();
        if !lint.passed {
            build.fail("rejected by policy")?;
            self.builds.save(&build).await?;
            warn!(build_id = %build_id, channel_id = %channel_id, errors = lint.summary.errors, "Build rejected by policy");
            self.event_bus.publish_build_event(BuildEvent::BuildRejected {
                build_id,
                channel_id,
                violations: lint.violations.clone(),
                rejected_at: Utc::now(),
            });
            metrics::counter!("gatejet_builds_total", "status" => "REJECTED").increment(1);
            return Err(OrchestratorError::PolicyRejected {
                build_id,
                violations: lint.violations,
            });
        }

        self.builds.save(&build).await?;
        self.event_bus.publish_build_event(BuildEvent::BuildQueued {
            build_id,
            channel_id: channel_id.clone(),
            queued_at: Utc::now(),
        });
        info!(build_id = %build_id, channel_id = %channel_id, mode = %request.mode, "Build queued");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_build(build, request.ir).await {
                error!(build_id = %build_id, error = %e, "Build bookkeeping failed");
            }
        });

        Ok(BuildAccepted {
            build_id,
            status: BuildStatus::Queued,
        })
    }

    async fn run_build(&self, mut build: BuildRecord, ir: ChannelIr) -> OrchestratorResult<()> {
        self.set_build_status(&mut build, BuildStatus::Compiling).await?;

        match self.compiler.compile(&ir, &build.id.to_string(), build.mode).await {
            Ok(bundle) => {
                info!(
                    build_id = %build.id,
                    channel_id = %build.channel_id,
                    merkle_root = %bundle.hashes.merkle_root,
                    "Build compiled"
                );
                build.complete(bundle)?;
            }
            Err(e) => {
                warn!(build_id = %build.id, channel_id = %build.channel_id, error = %e, "Build failed");
                build.fail(e.to_string())?;
            }
        }
        self.builds.save(&build).await?;
        self.publish_build_status(&build);
        metrics::counter!("gatejet_builds_total", "status" => build.status.to_string()).increment(1);
        Ok(())
    }

    async fn set_build_status(&self, build: &mut BuildRecord, status: BuildStatus) -> OrchestratorResult<()> {
        build.transition_to(status)?;
        self.builds.save(build).await?;
        self.publish_build_status(build);
        Ok(())
    }

    fn publish_build_status(&self, build: &BuildRecord) {
        self.event_bus.publish_build_event(BuildEvent::BuildStatusChanged {
            build_id: build.id,
            channel_id: build.channel_id.clone(),
            status: build.status,
            changed_at: Utc::now(),
        });
    }

    pub async fn get_build(&self, build_id: BuildId) -> OrchestratorResult<BuildRecord> {
        self.builds
            .find_by_id(build_id)
            .await?
            .ok_or(OrchestratorError::BuildNotFound(build_id))
    }

    pub async fn builds_for_channel(&self, channel_id: &str) -> OrchestratorResult<Vec<BuildRecord>> {
        Ok(self.builds.find_by_channel(channel_id).await?)
    }

    // ========================================================================
    // Deployments
    // ========================================================================

    /// Record a deployment and dispatch it in the background. An agent
    /// without a live connection fails the deployment immediately.
    pub async fn deploy(self: &Arc<Self>, request: DeployRequest) -> OrchestratorResult<DeploymentAccepted> {
        let build = self.get_build(request.build_id).await?;
        let bundle = match (&build.status, &build.bundle) {
            (BuildStatus::Compiled, Some(bundle)) => bundle.clone(),
            _ => {
                return Err(OrchestratorError::BuildNotCompiled {
                    build_id: build.id,
                    status: build.status,
                })
            }
        };

        let mut deployment = DeploymentRecord::new(DeployId::new(), build.id, &request.runtime_id, &build.channel_id);
        let deploy_id = deployment.id;

        if !self.registry.is_online(&request.runtime_id) {
            let err = ProtocolError::AgentOffline(request.runtime_id.clone());
            deployment.fail(err.to_string())?;
            self.deployments.save(&deployment).await?;
            self.publish_deployment(&deployment);
            metrics::counter!("gatejet_deployments_total", "status" => "FAILED").increment(1);
            warn!(deploy_id = %deploy_id, runtime_id = %request.runtime_id, "Deploy to offline agent refused");
            return Err(err.into());
        }

        self.deployments.save(&deployment).await?;
        self.publish_deployment(&deployment);
        info!(
            deploy_id = %deploy_id,
            build_id = %build.id,
            runtime_id = %request.runtime_id,
            channel_id = %build.channel_id,
            "Deployment queued"
        );

        let command = ControlMessage::Deploy {
            correlation_id: None,
            build_id: build.id.to_string(),
            bundle_content: bundle.to_content(),
            channel_id: build.channel_id.clone(),
            mode: build.mode,
            secret_payload: request.secret_payload,
        };
        let expected_root = bundle.hashes.merkle_root;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_deployment(deployment, command, expected_root).await {
                error!(deploy_id = %deploy_id, error = %e, "Deployment bookkeeping failed");
            }
        });

        Ok(DeploymentAccepted {
            deploy_id,
            status: DeploymentStatus::Queued,
        })
    }

    async fn run_deployment(
        &self,
        mut deployment: DeploymentRecord,
        command: ControlMessage,
        expected_root: String,
    ) -> OrchestratorResult<()> {
        let _guard = self.locks.lock(&deployment.channel_id).await;

        let outcome = loop {
            self.set_deployment_status(&mut deployment, DeploymentStatus::Sent).await?;
            let reply = self
                .registry
                .request(&deployment.runtime_id, command.clone(), self.config.deploy_timeout)
                .await;

            match reply {
                Err(ProtocolError::Timeout { .. }) => {
                    self.set_deployment_status(&mut deployment, DeploymentStatus::Timeout).await?;
                    if deployment.attempts > self.config.deploy_retries.min(MAX_DEPLOY_RETRIES) {
                        break Err(format!("no deploy-result after {} attempt(s)", deployment.attempts));
                    }
                    warn!(deploy_id = %deployment.id, attempt = deployment.attempts, "Deploy timed out, retrying");
                }
                Err(e) => break Err(e.to_string()),
                Ok(AgentMessage::DeployResult {
                    ok: true,
                    verified_root,
                    ..
                }) => {
                    break match verified_root {
                        Some(root) if root == expected_root => Ok(()),
                        Some(root) => Err(format!("agent verified root {root}, expected {expected_root}")),
                        None => Err("agent did not report a verified merkle root".to_string()),
                    }
                }
                Ok(AgentMessage::DeployResult { ok: false, details, .. }) => {
                    break Err(details.unwrap_or_else(|| "deploy failed on agent".to_string()))
                }
                Ok(AgentMessage::Ack { ok: false, error, .. }) => {
                    break Err(error.unwrap_or_else(|| "deploy refused by agent".to_string()))
                }
                Ok(other) => break Err(format!("unexpected {} reply to deploy", other.op())),
            }
        };

        match outcome {
            Ok(()) => {
                deployment.transition_to(DeploymentStatus::Acked)?;
                info!(
                    deploy_id = %deployment.id,
                    runtime_id = %deployment.runtime_id,
                    channel_id = %deployment.channel_id,
                    "Deployment acknowledged"
                );
            }
            Err(reason) => {
                warn!(deploy_id = %deployment.id, runtime_id = %deployment.runtime_id, reason = %reason, "Deployment failed");
                deployment.fail(reason)?;
            }
        }
        self.deployments.save(&deployment).await?;
        self.publish_deployment(&deployment);
        metrics::counter!("gatejet_deployments_total", "status" => deployment.status.to_string()).increment(1);
        Ok(())
    }

    async fn set_deployment_status(
        &self,
        deployment: &mut DeploymentRecord,
        status: DeploymentStatus,
    ) -> OrchestratorResult<()> {
        deployment.transition_to(status)?;
        self.deployments.save(deployment).await?;
        self.publish_deployment(deployment);
        Ok(())
    }

    fn publish_deployment(&self, deployment: &DeploymentRecord) {
        self.event_bus.publish_deployment_event(DeploymentEvent::DeploymentStatusChanged {
            deploy_id: deployment.id,
            build_id: deployment.build_id,
            runtime_id: deployment.runtime_id.clone(),
            channel_id: deployment.channel_id.clone(),
            status: deployment.status,
            error: deployment.error.clone(),
            changed_at: Utc::now(),
        });
    }

    pub async fn get_deployment(&self, deploy_id: DeployId) -> OrchestratorResult<DeploymentRecord> {
        self.deployments
            .find_by_id(deploy_id)
            .await?
            .ok_or(OrchestratorError::DeploymentNotFound(deploy_id))
    }

    // ========================================================================
    // Channel pass-throughs
    // ========================================================================

    pub async fn start(&self, runtime_id: &str, channel_id: &str) -> OrchestratorResult<Option<ChannelStatus>> {
        let command = ControlMessage::Start {
            correlation_id: None,
            channel_id: channel_id.to_string(),
        };
        self.channel_command(runtime_id, channel_id, command, self.config.request_timeout)
            .await
    }

    pub async fn stop(
        &self,
        runtime_id: &str,
        channel_id: &str,
        drain_ms: Option<u64>,
    ) -> OrchestratorResult<Option<ChannelStatus>> {
        let command = ControlMessage::Stop {
            correlation_id: None,
            channel_id: channel_id.to_string(),
            drain_ms,
        };
        let timeout = self.config.request_timeout + Duration::from_millis(drain_ms.unwrap_or(0));
        self.channel_command(runtime_id, channel_id, command, timeout).await
    }

    pub async fn restart(&self, runtime_id: &str, channel_id: &str) -> OrchestratorResult<Option<ChannelStatus>> {
        let command = ControlMessage::Restart {
            correlation_id: None,
            channel_id: channel_id.to_string(),
        };
        self.channel_command(runtime_id, channel_id, command, self.config.request_timeout)
            .await
    }

    async fn channel_command(
        &self,
        runtime_id: &str,
        channel_id: &str,
        command: ControlMessage,
        timeout: Duration,
    ) -> OrchestratorResult<Option<ChannelStatus>> {
        self.check_channel_known(runtime_id, channel_id).await?;
        let op = command.op();
        let _guard = self.locks.lock(channel_id).await;

        info!(runtime_id, channel_id, op, "Forwarding channel command");
        match self.registry.request(runtime_id, command, timeout).await? {
            AgentMessage::Ack { ok: true, channel, .. } => Ok(channel),
            AgentMessage::Ack { error, .. } => Err(OrchestratorError::AgentRejected {
                op,
                reason: error.unwrap_or_default(),
            }),
            other => Err(OrchestratorError::UnexpectedReply {
                op,
                got: other.op(),
            }),
        }
    }

    async fn check_channel_known(&self, runtime_id: &str, channel_id: &str) -> OrchestratorResult<()> {
        if !self.registry.is_known(runtime_id) {
            return Err(OrchestratorError::UnknownRuntime(runtime_id.to_string()));
        }
        let reported = self
            .registry
            .last_summary(runtime_id)
            .is_some_and(|s| s.channel(channel_id).is_some());
        if reported {
            return Ok(());
        }
        let deployed = self
            .deployments
            .find_by_runtime(runtime_id)
            .await?
            .iter()
            .any(|d| d.channel_id == channel_id);
        if deployed {
            Ok(())
        } else {
            Err(OrchestratorError::UnknownChannel {
                runtime_id: runtime_id.to_string(),
                channel_id: channel_id.to_string(),
            })
        }
    }

    /// Fresh summary straight from the agent.
    pub async fn status(&self, runtime_id: &str) -> OrchestratorResult<RuntimeSummary> {
        if !self.registry.is_known(runtime_id) {
            return Err(OrchestratorError::UnknownRuntime(runtime_id.to_string()));
        }
        let command = ControlMessage::Status { correlation_id: None };
        match self
            .registry
            .request(runtime_id, command, self.config.request_timeout)
            .await?
        {
            AgentMessage::Status { summary, .. } => Ok(summary),
            other => Err(OrchestratorError::UnexpectedReply {
                op: "status",
                got: other.op(),
            }),
        }
    }

    pub fn runtimes(&self) -> Vec<AgentInfo> {
        self.registry.list()
    }

    // ========================================================================
    // Agent-level commands
    // ========================================================================

    pub async fn update_agent(&self, runtime_id: &str, url: &str, signature: &str) -> OrchestratorResult<()> {
        let command = ControlMessage::UpdateAgent {
            correlation_id: None,
            url: url.to_string(),
            signature: signature.to_string(),
        };
        self.agent_command(runtime_id, command).await
    }

    pub async fn enroll_overlay(&self, runtime_id: &str, enrollment_code: &str) -> OrchestratorResult<()> {
        let command = ControlMessage::OverlayEnroll {
            correlation_id: None,
            enrollment_code: enrollment_code.to_string(),
        };
        self.agent_command(runtime_id, command).await
    }

    async fn agent_command(&self, runtime_id: &str, command: ControlMessage) -> OrchestratorResult<()> {
        if !self.registry.is_known(runtime_id) {
            return Err(OrchestratorError::UnknownRuntime(runtime_id.to_string()));
        }
        let op = command.op();
        match self
            .registry
            .request(runtime_id, command, self.config.request_timeout)
            .await?
        {
            AgentMessage::Ack { ok: true, .. } => Ok(()),
            AgentMessage::Ack { error, .. } => Err(OrchestratorError::AgentRejected {
                op,
                reason: error.unwrap_or_default(),
            }),
            other => Err(OrchestratorError::UnexpectedReply {
                op,
                got: other.op(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ir::{ChannelSecurity, Stage, StageCapabilities, TemplateNode, NexonTemplate};
    use crate::domain::protocol::{AgentCapabilities, AgentHello};
    use crate::infrastructure::repositories::{InMemoryBuildRepository, InMemoryDeploymentRepository};
    use crate::infrastructure::templates::{InMemoryTemplateSource, TemplateCache};
    use serde_json::Map;

    fn orchestrator(policy: OrgPolicy, deploy_timeout: Duration) -> Arc<Orchestrator> {
        let source = InMemoryTemplateSource::new();
        source.register(NexonTemplate {
            nexon_id: "core.inject".into(),
            version: "1.0.0".into(),
            nodes: vec![TemplateNode {
                id: "inject".into(),
                node_type: "inject".into(),
                name: String::new(),
                props: Map::new(),
                wires: vec![],
            }],
        });
        let bus = EventBus::new(64);
        Arc::new(Orchestrator::new(
            OrchestratorConfig {
                request_timeout: Duration::from_millis(200),
                deploy_timeout,
                deploy_retries: 1,
            },
            policy,
            PolicyGate::new(),
            Arc::new(Compiler::new(TemplateCache::new(Arc::new(source), 8))),
            Arc::new(InMemoryBuildRepository::new()),
            Arc::new(InMemoryDeploymentRepository::new()),
            Arc::new(AgentRegistry::new(Duration::from_secs(30), 16, bus.clone())),
            bus,
        ))
    }

    fn ir(internet: bool) -> ChannelIr {
        ChannelIr {
            channel_id: "ch-1".into(),
            name: "Channel".into(),
            description: None,
            runtime_target: "edge".into(),
            security: ChannelSecurity {
                internet_access: internet,
                public_endpoint: false,
            },
            stages: vec![Stage {
                id: "s1".into(),
                name: "Inject".into(),
                nexon_id: "core.inject".into(),
                nexon_version: None,
                config: Map::new(),
                capabilities: StageCapabilities::default(),
                secrets: vec![],
                documentation: None,
            }],
            connections: vec![],
        }
    }

    fn compile_request(internet: bool) -> CompileRequest {
        CompileRequest {
            ir: ir(internet),
            mode: BuildMode::Test,
            acknowledged: HashSet::new(),
        }
    }

    async fn wait_for_build(orch: &Orchestrator, id: BuildId) -> BuildRecord {
        for _ in 0..100 {
            let build = orch.get_build(id).await.unwrap();
            if build.status.is_terminal() {
                return build;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build {id} did not finish");
    }

    async fn wait_for_deployment(orch: &Orchestrator, id: DeployId) -> DeploymentRecord {
        for _ in 0..200 {
            let deployment = orch.get_deployment(id).await.unwrap();
            if deployment.status.is_terminal() {
                return deployment;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {id} did not finish");
    }

    fn hello(runtime_id: &str) -> AgentHello {
        AgentHello {
            runtime_id: runtime_id.into(),
            agent_version: "0.0.0".into(),
            device_id: runtime_id.into(),
            overlay: None,
            capabilities: AgentCapabilities::default(),
        }
    }

    #[tokio::test]
    async fn test_compile_converges() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_secs(1));
        let accepted = orch.compile(compile_request(false)).await.unwrap();
        assert_eq!(accepted.status, BuildStatus::Queued);

        let build = wait_for_build(&orch, accepted.build_id).await;
        assert_eq!(build.status, BuildStatus::Compiled);
        assert!(build.hashes.is_some());
        assert!(build.bundle.is_some());
    }

    #[tokio::test]
    async fn test_policy_rejection_skips_compiler() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_secs(1));
        let err = orch.compile(compile_request(true)).await.unwrap_err();
        let OrchestratorError::PolicyRejected { build_id, violations } = err else {
            panic!("expected policy rejection");
        };
        assert!(!violations.is_empty());

        let build = orch.get_build(build_id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert!(build.hashes.is_none());
    }

    #[tokio::test]
    async fn test_deploy_offline_fails_fast() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_secs(5));
        let accepted = orch.compile(compile_request(false)).await.unwrap();
        wait_for_build(&orch, accepted.build_id).await;

        let started = std::time::Instant::now();
        let err = orch
            .deploy(DeployRequest {
                build_id: accepted.build_id,
                runtime_id: "ghost".into(),
                secret_payload: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Protocol(ProtocolError::AgentOffline(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_deploy_times_out_after_one_retry() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_millis(50));
        let (_conn, mut rx) = orch.registry().register(hello("edge-1"));
        let accepted = orch.compile(compile_request(false)).await.unwrap();
        wait_for_build(&orch, accepted.build_id).await;

        let deploy = orch
            .deploy(DeployRequest {
                build_id: accepted.build_id,
                runtime_id: "edge-1".into(),
                secret_payload: None,
            })
            .await
            .unwrap();
        let deployment = wait_for_deployment(&orch, deploy.deploy_id).await;
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.attempts, 2);

        // the agent saw two deploy commands
        assert!(matches!(rx.recv().await, Some(ControlMessage::Deploy { .. })));
        assert!(matches!(rx.recv().await, Some(ControlMessage::Deploy { .. })));
    }

    #[test]
    fn test_config_caps_deploy_retries() {
        let mut cp = ControlPlaneConfig::default();
        cp.deploy_retries = 5;
        assert_eq!(OrchestratorConfig::from(&cp).deploy_retries, 1);
        cp.deploy_retries = 0;
        assert_eq!(OrchestratorConfig::from(&cp).deploy_retries, 0);
    }

    #[tokio::test]
    async fn test_deploy_requires_compiled_build() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_secs(1));
        let err = orch
            .deploy(DeployRequest {
                build_id: BuildId::new(),
                runtime_id: "edge-1".into(),
                secret_payload: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BuildNotFound(_)));
    }

    #[tokio::test]
    async fn test_channel_command_needs_known_pair() {
        let orch = orchestrator(OrgPolicy::default(), Duration::from_secs(1));
        assert!(matches!(
            orch.start("ghost", "ch-1").await,
            Err(OrchestratorError::UnknownRuntime(_))
        ));

        let (_conn, _rx) = orch.registry().register(hello("edge-1"));
        assert!(matches!(
            orch.start("edge-1", "ch-1").await,
            Err(OrchestratorError::UnknownChannel { .. })
        ));
    }
}
