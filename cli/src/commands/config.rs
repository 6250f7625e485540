// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use gatejet_core::domain::node_config::{
    AgentConfig, ControlPlaneConfig, NodeConfigManifest, ObservabilityConfig, ENV_CONFIG_PATH,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./gatejet-config.yaml)
        #[arg(short, long, default_value = "./gatejet-config.yaml")]
        output: PathBuf,

        /// Only emit the agent section
        #[arg(long, conflicts_with = "control_only")]
        agent_only: bool,

        /// Only emit the control-plane section
        #[arg(long)]
        control_only: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate {
            output,
            agent_only,
            control_only,
        } => generate(output, agent_only, control_only).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            ENV_CONFIG_PATH,
            std::env::var(ENV_CONFIG_PATH)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./gatejet-config.yaml");
        println!("  4. ~/.gatejet/config.yaml");
        println!("  5. /etc/gatejet/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    match &config.spec.agent {
        Some(agent) => {
            println!("{}", "Agent:".bold());
            println!("  Runtime ID: {}", agent.runtime_id);
            println!("  Device ID: {}", agent.device_id());
            println!("  Control: {}", agent.ws_url());
            println!(
                "  Bootstrap token: {}",
                if agent.bootstrap_token.is_some() { "set" } else { "(not set)" }
            );
            println!("  Engine: {}", agent.node_runtime.bin.display());
            println!("  Work dir: {}", agent.work_dir.display());
            println!(
                "  Admin API: {}:{}{}",
                agent.security.api_admin_host,
                agent
                    .security
                    .api_admin_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "<ephemeral>".to_string()),
                agent.security.admin_path
            );
            println!("  MQTT: {}", agent.mqtt_url().unwrap_or_else(|| "disabled".to_string()));
            println!("  Overlay: {}", if agent.overlay.enabled { "enabled" } else { "disabled" });
            println!("  Heartbeat: {}s", agent.heartbeat_interval_secs);
            println!("  Updates: {}", if agent.update.is_some() { "signed" } else { "disabled" });
            println!();
        }
        None => println!("{}", "Agent: (not configured)".dimmed()),
    }

    match &config.spec.control_plane {
        Some(cp) => {
            println!("{}", "Control plane:".bold());
            println!("  Listen: {}:{}", cp.bind_address, cp.port);
            println!("  Agent websocket: {}", cp.ws_path);
            println!(
                "  Liveness: {}s ({} x {}s heartbeat)",
                cp.liveness_window().as_secs(),
                cp.liveness_multiplier,
                cp.heartbeat_interval_secs
            );
            println!("  Request timeout: {}ms", cp.request_timeout_ms);
            println!("  Deploy timeout: {}ms ({} retry)", cp.deploy_timeout_ms, cp.deploy_retries);
            println!(
                "  Policy: {}",
                cp.policy_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(default)".to_string())
            );
            println!(
                "  Templates: {}",
                cp.template_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
            println!();
        }
        None => println!("{}", "Control plane: (not configured)".dimmed()),
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Sample manifest with every section at its defaults.
pub fn sample_manifest(agent_only: bool, control_only: bool) -> NodeConfigManifest {
    let mut manifest = NodeConfigManifest::default();
    if !control_only {
        manifest.spec.agent = Some(AgentConfig::default());
    }
    if !agent_only {
        manifest.spec.control_plane = Some(ControlPlaneConfig::default());
    }
    manifest.spec.observability = Some(ObservabilityConfig::default());
    manifest
}

async fn generate(output: PathBuf, agent_only: bool, control_only: bool) -> Result<()> {
    let manifest = sample_manifest(agent_only, control_only);
    manifest
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_manifest_round_trips_and_validates() {
        let manifest = sample_manifest(false, false);
        let yaml = manifest.to_yaml_string().unwrap();
        let parsed = NodeConfigManifest::from_yaml_str(&yaml).unwrap();
        parsed.validate().unwrap();
        assert!(parsed.spec.agent.is_some());
        assert!(parsed.spec.control_plane.is_some());
    }

    #[test]
    fn test_sample_manifest_sections() {
        assert!(sample_manifest(true, false).spec.control_plane.is_none());
        assert!(sample_manifest(false, true).spec.agent.is_none());
    }

    #[tokio::test]
    async fn test_generate_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("gatejet.yaml");
        generate(output.clone(), false, true).await.unwrap();
        let written = NodeConfigManifest::from_yaml_file(&output).unwrap();
        assert!(written.spec.control_plane.is_some());
        assert!(written.spec.agent.is_none());
    }
}
