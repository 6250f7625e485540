// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret payload commands
//!
//! Commands: seal

use anyhow::{Context, Result};
use clap::Subcommand;
use std::collections::BTreeMap;

use gatejet_core::infrastructure::secrets::SecretSealer;

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// Seal NAME=VALUE pairs for the `secretPayload` of a deploy request
    Seal {
        /// Bootstrap token of the target agent
        #[arg(long, env = "GATEJET_BOOTSTRAP_TOKEN", hide_env_values = true)]
        token: String,

        /// Secrets as NAME=VALUE
        #[arg(value_name = "NAME=VALUE", required = true)]
        secrets: Vec<String>,
    },
}

pub async fn handle_command(command: SecretsCommand) -> Result<()> {
    match command {
        SecretsCommand::Seal { token, secrets } => {
            let payload = seal(&token, &secrets)?;
            println!("{payload}");
            Ok(())
        }
    }
}

fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected NAME=VALUE, got '{pair}'"))?;
            if name.is_empty() {
                anyhow::bail!("Secret name cannot be empty in '{pair}'");
            }
            Ok((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Sealed payload as pretty JSON.
pub fn seal(token: &str, pairs: &[String]) -> Result<String> {
    let secrets = parse_pairs(pairs)?;
    let payload = SecretSealer::from_token(token)
        .seal(&secrets)
        .context("Failed to seal secrets")?;
    Ok(serde_json::to_string_pretty(&payload)?)
}
