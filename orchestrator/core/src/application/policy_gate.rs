// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Gate
//!
//! Evaluates a channel IR against an [`OrgPolicy`]. Each catalogue entry in
//! [`crate::domain::policy::RULES`] has one [`PolicyRule`] implementation;
//! the gate runs all of them, unions their findings and applies
//! acknowledgements.
//!
//! A rule that cannot be evaluated is reported as a [`RuleFailure`] and the
//! remaining rules still run. Malformed list patterns are reported the same
//! way, while the well-formed patterns of the same list still apply.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::domain::ir::{ChannelIr, Stage};
use crate::domain::policy::{
    matches_pattern, validate_pattern, LintResult, OrgPolicy, PolicyError, PolicyViolation, RuleDescriptor,
    RuleFailure, Severity, RULE_BLOCKED_NEXON, RULE_DOCUMENTATION, RULE_ENCRYPTION_REQUIRED,
    RULE_FILESYSTEM_CAPABILITY, RULE_INTERNET_ACCESS, RULE_NETWORK_CAPABILITY, RULE_NEXON_NOT_ALLOWED,
    RULE_PUBLIC_ENDPOINT, RULE_RUNTIME_TARGET, RULE_STAGE_COUNT,
};

pub trait PolicyRule: Send + Sync {
    fn descriptor(&self) -> RuleDescriptor;

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError>;

    /// Policy settings this rule had to skip; reported without aborting `evaluate`.
    fn skipped(&self, _policy: &OrgPolicy) -> Vec<PolicyError> {
        Vec::new()
    }
}

fn violation(rule: RuleDescriptor, message: impl Into<String>) -> PolicyViolation {
    PolicyViolation {
        rule_id: rule.id.to_string(),
        rule_name: rule.name.to_string(),
        severity: rule.severity,
        category: rule.category,
        message: message.into(),
        stage_id: None,
        suggestion: None,
        acknowledged: false,
    }
}

fn stage_violation(rule: RuleDescriptor, stage: &Stage, message: impl Into<String>) -> PolicyViolation {
    PolicyViolation {
        stage_id: Some(stage.id.clone()),
        ..violation(rule, message)
    }
}

/// Malformed patterns never match.
fn any_match(patterns: &[String], value: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| matches_pattern(pattern, value).unwrap_or(false))
}

fn malformed(patterns: &[String]) -> Vec<PolicyError> {
    patterns.iter().filter_map(|p| validate_pattern(p).err()).collect()
}

struct InternetAccessRule;

impl PolicyRule for InternetAccessRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_INTERNET_ACCESS
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if ir.security.internet_access && !policy.allow_internet_access {
            let mut v = violation(RULE_INTERNET_ACCESS, "Channel requests internet access");
            v.suggestion = Some("Disable security.internetAccess or route through an approved proxy".into());
            return Ok(vec![v]);
        }
        Ok(vec![])
    }
}

struct PublicEndpointRule;

impl PolicyRule for PublicEndpointRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_PUBLIC_ENDPOINT
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if ir.security.public_endpoint && !policy.allow_public_endpoints {
            let mut v = violation(RULE_PUBLIC_ENDPOINT, "Channel exposes a public endpoint");
            v.suggestion = Some("Expose the channel through the overlay network instead".into());
            return Ok(vec![v]);
        }
        Ok(vec![])
    }
}

struct BlockedNexonRule;

impl PolicyRule for BlockedNexonRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_BLOCKED_NEXON
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        let mut found = Vec::new();
        for stage in &ir.stages {
            if any_match(&policy.blocked_nexons, &stage.nexon_id) {
                found.push(stage_violation(
                    RULE_BLOCKED_NEXON,
                    stage,
                    format!("Stage '{}' uses blocked nexon {}", stage.name, stage.nexon_id),
                ));
            }
        }
        Ok(found)
    }

    fn skipped(&self, policy: &OrgPolicy) -> Vec<PolicyError> {
        malformed(&policy.blocked_nexons)
    }
}

struct AllowedNexonRule;

impl PolicyRule for AllowedNexonRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_NEXON_NOT_ALLOWED
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        let Some(allowed) = &policy.allowed_nexons else {
            return Ok(vec![]);
        };
        let mut found = Vec::new();
        for stage in &ir.stages {
            if !any_match(allowed, &stage.nexon_id) {
                let mut v = stage_violation(
                    RULE_NEXON_NOT_ALLOWED,
                    stage,
                    format!("Stage '{}' uses nexon {} which is not allow-listed", stage.name, stage.nexon_id),
                );
                v.suggestion = Some("Request the nexon be added to allowedNexons".into());
                found.push(v);
            }
        }
        Ok(found)
    }

    fn skipped(&self, policy: &OrgPolicy) -> Vec<PolicyError> {
        policy.allowed_nexons.as_deref().map(malformed).unwrap_or_default()
    }
}

struct NetworkCapabilityRule;

impl PolicyRule for NetworkCapabilityRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_NETWORK_CAPABILITY
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if policy.allow_network_capability {
            return Ok(vec![]);
        }
        Ok(ir
            .stages
            .iter()
            .filter(|s| s.capabilities.network)
            .map(|s| stage_violation(RULE_NETWORK_CAPABILITY, s, format!("Stage '{}' requires network access", s.name)))
            .collect())
    }
}

struct FilesystemCapabilityRule;

impl PolicyRule for FilesystemCapabilityRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_FILESYSTEM_CAPABILITY
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if policy.allow_filesystem_access {
            return Ok(vec![]);
        }
        Ok(ir
            .stages
            .iter()
            .filter(|s| s.capabilities.filesystem)
            .map(|s| {
                stage_violation(
                    RULE_FILESYSTEM_CAPABILITY,
                    s,
                    format!("Stage '{}' requires filesystem access", s.name),
                )
            })
            .collect())
    }
}

struct EncryptionRule;

impl PolicyRule for EncryptionRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_ENCRYPTION_REQUIRED
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if policy.require_encryption && !ir.stages.iter().any(|s| s.capabilities.encryption) {
            let mut v = violation(RULE_ENCRYPTION_REQUIRED, "No stage provides encryption");
            v.suggestion = Some("Add an encryption-capable stage (TLS or payload encryption)".into());
            return Ok(vec![v]);
        }
        Ok(vec![])
    }
}

struct RuntimeTargetRule;

impl PolicyRule for RuntimeTargetRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_RUNTIME_TARGET
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        if policy.allowed_runtime_targets.is_empty() || policy.allowed_runtime_targets.contains(&ir.runtime_target) {
            return Ok(vec![]);
        }
        Ok(vec![violation(
            RULE_RUNTIME_TARGET,
            format!(
                "Runtime target '{}' is not one of: {}",
                ir.runtime_target,
                policy.allowed_runtime_targets.join(", ")
            ),
        )])
    }
}

struct StageCountRule;

impl PolicyRule for StageCountRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_STAGE_COUNT
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        match policy.max_stages {
            Some(max) if ir.stages.len() > max => Ok(vec![violation(
                RULE_STAGE_COUNT,
                format!("Channel has {} stages, limit is {max}", ir.stages.len()),
            )]),
            _ => Ok(vec![]),
        }
    }
}

struct DocumentationRule;

impl PolicyRule for DocumentationRule {
    fn descriptor(&self) -> RuleDescriptor {
        RULE_DOCUMENTATION
    }

    fn evaluate(&self, ir: &ChannelIr, policy: &OrgPolicy) -> Result<Vec<PolicyViolation>, PolicyError> {
        let severity = if policy.require_documentation {
            Severity::Warning
        } else {
            Severity::Info
        };
        let blank = |text: &Option<String>| text.as_deref().map_or(true, |t| t.trim().is_empty());

        let mut found = Vec::new();
        if blank(&ir.description) {
            found.push(violation(RULE_DOCUMENTATION, "Channel has no description"));
        }
        for stage in ir.stages.iter().filter(|s| blank(&s.documentation)) {
            found.push(stage_violation(
                RULE_DOCUMENTATION,
                stage,
                format!("Stage '{}' has no documentation", stage.name),
            ));
        }
        for v in &mut found {
            v.severity = severity;
        }
        Ok(found)
    }
}

pub struct PolicyGate {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyGate {
    /// Gate with the full rule catalogue.
    pub fn new() -> Self {
        Self::with_rules(vec![
            Box::new(InternetAccessRule),
            Box::new(PublicEndpointRule),
            Box::new(BlockedNexonRule),
            Box::new(AllowedNexonRule),
            Box::new(NetworkCapabilityRule),
            Box::new(FilesystemCapabilityRule),
            Box::new(EncryptionRule),
            Box::new(RuntimeTargetRule),
            Box::new(StageCountRule),
            Box::new(DocumentationRule),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn PolicyRule>>) -> Self {
        Self { rules }
    }

    pub fn lint(&self, ir: &ChannelIr, policy: &OrgPolicy, acknowledged: &HashSet<String>) -> LintResult {
        let mut violations = Vec::new();
        let mut failures = Vec::new();

        for rule in &self.rules {
            let descriptor = rule.descriptor();
            for e in rule.skipped(policy) {
                warn!(channel_id = %ir.channel_id, rule_id = descriptor.id, error = %e, "Policy setting skipped");
                failures.push(RuleFailure {
                    rule_id: descriptor.id.to_string(),
                    message: e.to_string(),
                });
            }
            match rule.evaluate(ir, policy) {
                Ok(found) => violations.extend(found),
                Err(e) => {
                    warn!(channel_id = %ir.channel_id, rule_id = descriptor.id, error = %e, "Policy rule could not be evaluated");
                    failures.push(RuleFailure {
                        rule_id: descriptor.id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for v in &mut violations {
            v.acknowledged = v.is_acknowledged_by(acknowledged);
        }

        let result = LintResult::from_violations(violations, failures);
        debug!(
            channel_id = %ir.channel_id,
            passed = result.passed,
            errors = result.summary.errors,
            warnings = result.summary.warnings,
            acknowledged = result.summary.acknowledged,
            "Policy lint complete"
        );
        result
    }
}
