// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `gatejet control`: the control-plane process.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use gatejet_core::{
    application::{Compiler, Orchestrator, OrchestratorConfig, PolicyGate},
    domain::{
        ir::TemplateSource,
        node_config::{ControlPlaneConfig, MetricsConfig},
        policy::OrgPolicy,
    },
    infrastructure::{
        event_bus::EventBus,
        protocol::AgentRegistry,
        repositories::{InMemoryBuildRepository, InMemoryDeploymentRepository},
        templates::{DirectoryTemplateSource, InMemoryTemplateSource, TemplateCache},
    },
    presentation::api::{self, AppState},
};

use super::{load_config, shutdown_signal};

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let manifest = load_config(config_path)?;
    let config = manifest.control_plane();

    if let Some(metrics) = manifest
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    {
        install_metrics_exporter(metrics)?;
    }

    let orchestrator = build_orchestrator(&config)?;
    let registry = orchestrator.registry().clone();
    let monitor = registry.spawn_liveness_monitor(Duration::from_secs(config.heartbeat_interval_secs));

    let app = api::app(AppState::new(orchestrator), &config.ws_path);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(
        addr = %addr,
        ws_path = %config.ws_path,
        liveness_secs = config.liveness_window().as_secs(),
        "Control plane listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    monitor.abort();
    info!("Control plane shutting down");
    Ok(())
}

fn build_orchestrator(config: &ControlPlaneConfig) -> Result<Arc<Orchestrator>> {
    let policy = match &config.policy_file {
        Some(path) => OrgPolicy::from_file(path).with_context(|| format!("Failed to load policy {:?}", path))?,
        None => {
            info!("No policy file configured, using the default org policy");
            OrgPolicy::default()
        }
    };

    let source: Arc<dyn TemplateSource> = match &config.template_dir {
        Some(dir) => Arc::new(DirectoryTemplateSource::new(dir.clone())),
        None => {
            warn!("No template directory configured; every compile will fail with a missing template");
            Arc::new(InMemoryTemplateSource::new())
        }
    };

    let event_bus = EventBus::with_default_capacity();
    let registry = Arc::new(AgentRegistry::new(
        config.liveness_window(),
        config.outbound_queue,
        event_bus.clone(),
    ));

    Ok(Arc::new(Orchestrator::new(
        OrchestratorConfig::from(config),
        policy,
        PolicyGate::new(),
        Arc::new(Compiler::new(TemplateCache::new(source, config.template_cache_size))),
        Arc::new(InMemoryBuildRepository::new()),
        Arc::new(InMemoryDeploymentRepository::new()),
        registry,
        event_bus,
    )))
}

fn install_metrics_exporter(metrics: &MetricsConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(addr = %addr, "Prometheus metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_policy_file_is_an_error() {
        let config = ControlPlaneConfig {
            policy_file: Some(PathBuf::from("/nonexistent/gatejet-policy.yaml")),
            ..ControlPlaneConfig::default()
        };
        assert!(build_orchestrator(&config).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_uses_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "allowInternetAccess: true\nmaxStages: 4\n").unwrap();
        let config = ControlPlaneConfig {
            policy_file: Some(path),
            ..ControlPlaneConfig::default()
        };
        let orchestrator = build_orchestrator(&config).unwrap();
        assert!(orchestrator.policy().allow_internet_access);
        assert_eq!(orchestrator.policy().max_stages, Some(4));
    }
}
