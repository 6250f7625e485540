// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the GateJet CLI

pub mod agent;
pub mod config;
pub mod control;
pub mod policy;
pub mod secrets;

pub use self::config::ConfigCommand;
pub use self::policy::PolicyCommand;
pub use self::secrets::SecretsCommand;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use gatejet_core::domain::node_config::NodeConfigManifest;

/// Discover, load and validate the node configuration.
pub fn load_config(config_path: Option<PathBuf>) -> Result<NodeConfigManifest> {
    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
