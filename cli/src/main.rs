// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # GateJet CLI
//!
//! One binary for both halves of a GateJet deployment:
//!
//! - `gatejet control` - control plane: REST API, agent websocket, build
//!   and deployment orchestration
//! - `gatejet agent` - edge agent: dials the control plane and supervises
//!   one flow-engine process per channel
//! - `gatejet config show|validate|generate` - configuration management
//! - `gatejet policy rules|lint` - org policy tooling
//! - `gatejet secrets seal` - produce a sealed secret payload for a deploy

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use gatejet::commands::{self, ConfigCommand, PolicyCommand, SecretsCommand};

/// GateJet - integrity-verified channel deployment to edge runtimes
#[derive(Parser)]
#[command(name = "gatejet")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "GATEJET_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "GATEJET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format (compact, json)
    #[arg(long, global = true, env = "GATEJET_LOG_FORMAT", default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    #[command(name = "control")]
    Control,

    /// Run the edge agent
    #[command(name = "agent")]
    Agent,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Org policy tooling
    #[command(name = "policy")]
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },

    /// Secret payload tooling
    #[command(name = "secrets")]
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Some(Commands::Control) => commands::control::run(cli.config).await,
        Some(Commands::Agent) => commands::agent::run(cli.config).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Policy { command }) => commands::policy::handle_command(command, cli.config).await,
        Some(Commands::Secrets { command }) => commands::secrets::handle_command(command).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{other}' (expected compact or json)"),
    }

    Ok(())
}
