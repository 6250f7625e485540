// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Org policy commands
//!
//! Commands: rules, lint

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::collections::HashSet;
use std::path::PathBuf;

use gatejet_core::{
    application::PolicyGate,
    domain::{
        ir::ChannelIr,
        policy::{list_rules, LintResult, OrgPolicy, Severity},
    },
};

use super::load_config;

#[derive(Subcommand)]
pub enum PolicyCommand {
    /// List the rule catalogue
    Rules,

    /// Lint a channel IR file against the org policy
    Lint {
        /// Path to channel IR JSON
        #[arg(value_name = "IR_FILE")]
        ir: PathBuf,

        /// Policy file (default: controlPlane.policyFile, else built-in defaults)
        #[arg(long, value_name = "FILE")]
        policy: Option<PathBuf>,

        /// Acknowledge a rule id or violation id (repeatable)
        #[arg(long = "ack", value_name = "ID")]
        acknowledged: Vec<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: PolicyCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        PolicyCommand::Rules => {
            rules();
            Ok(())
        }
        PolicyCommand::Lint {
            ir,
            policy,
            acknowledged,
            json,
        } => lint(ir, policy, acknowledged, json, config_path),
    }
}

fn rules() {
    println!("{}", "Policy rules:".bold());
    for rule in list_rules() {
        println!(
            "  {} {:<22} {:<8} {}",
            rule.id.bold(),
            rule.name,
            severity_label(rule.severity),
            rule.description.dimmed()
        );
    }
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Error => "error".red(),
        Severity::Warning => "warning".yellow(),
        Severity::Info => "info".blue(),
    }
}

fn resolve_policy(explicit: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<OrgPolicy> {
    let path = match explicit {
        Some(path) => Some(path),
        None => load_config(config_path)?.control_plane().policy_file,
    };
    match path {
        Some(path) => OrgPolicy::from_file(&path).with_context(|| format!("Failed to load policy {:?}", path)),
        None => Ok(OrgPolicy::default()),
    }
}

/// Evaluate `ir` under `policy`; the gate is the same one the control plane runs.
pub fn lint_ir(ir: &ChannelIr, policy: &OrgPolicy, acknowledged: &HashSet<String>) -> LintResult {
    PolicyGate::new().lint(ir, policy, acknowledged)
}

fn lint(
    ir_path: PathBuf,
    policy: Option<PathBuf>,
    acknowledged: Vec<String>,
    json: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let content = std::fs::read_to_string(&ir_path).with_context(|| format!("Failed to read {:?}", ir_path))?;
    let ir = ChannelIr::from_json(&content).context("Invalid channel IR")?;
    let policy = resolve_policy(policy, config_path)?;
    let acknowledged: HashSet<String> = acknowledged.into_iter().collect();

    let result = lint_ir(&ir, &policy, &acknowledged);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&ir, &result);
    }

    if !result.passed {
        anyhow::bail!("Channel {} does not pass the org policy", ir.channel_id);
    }
    Ok(())
}

fn print_result(ir: &ChannelIr, result: &LintResult) {
    println!("{} {}", "Linting channel".bold(), ir.channel_id);
    for violation in &result.violations {
        let scope = violation
            .stage_id
            .as_deref()
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default();
        let ack = if violation.acknowledged { " (acknowledged)".dimmed().to_string() } else { String::new() };
        println!(
            "  {} {}{}: {}{}",
            severity_label(violation.severity),
            violation.rule_id.bold(),
            scope,
            violation.message,
            ack
        );
        if let Some(suggestion) = &violation.suggestion {
            println!("      {}", suggestion.dimmed());
        }
    }
    for failure in &result.rule_failures {
        println!("  {} {}: {}", "failed".red(), failure.rule_id, failure.message);
    }
    println!(
        "  {} error(s), {} warning(s), {} info, {} acknowledged",
        result.summary.errors, result.summary.warnings, result.summary.infos, result.summary.acknowledged
    );
    if result.passed {
        println!("{}", "✓ Policy check passed".green());
    } else {
        println!("{}", "✗ Policy check failed".red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IR: &str = r#"{
        "channelId": "ch-lint",
        "name": "Lint",
        "runtimeTarget": "edge",
        "security": { "internetAccess": true },
        "stages": [{ "id": "s1", "name": "Inject", "nexonId": "core.inject" }]
    }"#;

    #[test]
    fn test_lint_ir_blocks_until_acknowledged() {
        let ir = ChannelIr::from_json(IR).unwrap();
        let policy = OrgPolicy::default();

        let result = lint_ir(&ir, &policy, &HashSet::new());
        assert!(!result.passed);

        let acked: HashSet<String> = ["SEC001".to_string()].into_iter().collect();
        assert!(lint_ir(&ir, &policy, &acked).passed);
    }

    #[test]
    fn test_lint_file_with_explicit_policy() {
        let dir = tempfile::tempdir().unwrap();
        let ir_path = dir.path().join("ir.json");
        std::fs::write(&ir_path, IR).unwrap();
        let policy_path = dir.path().join("policy.yaml");
        std::fs::write(&policy_path, "allowInternetAccess: true\n").unwrap();

        lint(ir_path.clone(), Some(policy_path), vec![], true, None).unwrap();

        let strict = dir.path().join("strict.yaml");
        std::fs::write(&strict, "allowInternetAccess: false\n").unwrap();
        assert!(lint(ir_path, Some(strict), vec![], true, None).is_err());
    }
}
