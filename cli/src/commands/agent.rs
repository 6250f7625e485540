// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `gatejet agent`: the edge agent process.
//!
//! Runs the control link until a shutdown signal, then stops every engine
//! before exiting.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use gatejet_core::{
    application::{AgentService, ChannelManager, ChannelManagerConfig},
    domain::node_config::AgentConfig,
    infrastructure::{
        engine::{NodeRuntimeLauncher, TcpReadinessProbe},
        protocol::{agent_link::AgentLinkConfig, AgentLink},
    },
};

use super::{load_config, shutdown_signal};

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let manifest = load_config(config_path)?;
    let config = manifest.agent();

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {:?}", config.work_dir))?;
    if config.bootstrap_token.is_none() {
        warn!("No bootstrap token configured; deploys carrying secrets will fail");
    }

    let manager = ChannelManager::new(
        ChannelManagerConfig::from_agent(&config),
        Arc::new(NodeRuntimeLauncher::new(config.node_runtime.bin.clone())),
        Arc::new(TcpReadinessProbe),
    );
    let service = Arc::new(AgentService::new(config.clone(), manager.clone()));
    let link = AgentLink::new(link_config(&config), service);

    info!(
        runtime_id = %config.runtime_id,
        control_url = %config.ws_url(),
        work_dir = %config.work_dir.display(),
        "Agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link_task = tokio::spawn(async move { link.run(shutdown_rx).await });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = link_task.await {
        warn!(error = %e, "Control link task ended abnormally");
    }

    manager.shutdown().await;
    info!("Agent stopped");
    Ok(())
}

fn link_config(config: &AgentConfig) -> AgentLinkConfig {
    AgentLinkConfig {
        url: config.ws_url(),
        heartbeat_interval: config.heartbeat_interval(),
        outbound_capacity: config.outbound_queue,
        max_backoff: MAX_RECONNECT_BACKOFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_from_agent_config() {
        let mut config = AgentConfig::default();
        config.control.base_url = "ws://control:8080/".into();
        config.control.ws_path = "/ws/agent".into();
        config.heartbeat_interval_secs = 5;

        let link = link_config(&config);
        assert_eq!(link.url, "ws://control:8080/ws/agent");
        assert_eq!(link.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(link.outbound_capacity, config.outbound_queue);
    }
}
