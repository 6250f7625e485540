// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Organization policy, violation model and the rule catalogue.
//!
//! Evaluation lives in [`crate::application::policy_gate`]; the catalogue
//! here can be listed without evaluating anything.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Failed to read policy file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse policy: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    Security,
    Compliance,
    Performance,
    BestPractice,
}

/// Organization security policy applied to every channel IR.
///
/// Nexon lists accept exact ids, `*`, or a trailing wildcard such as
/// `vendor.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrgPolicy {
    pub allow_internet_access: bool,
    pub allow_public_endpoints: bool,
    pub allow_network_capability: bool,
    pub allow_filesystem_access: bool,
    pub require_encryption: bool,
    /// `None` allows every nexon not blocked.
    pub allowed_nexons: Option<Vec<String>>,
    pub blocked_nexons: Vec<String>,
    pub max_stages: Option<usize>,
    pub require_documentation: bool,
    /// Empty allows every runtime target.
    pub allowed_runtime_targets: Vec<String>,
}

impl Default for OrgPolicy {
    fn default() -> Self {
        Self {
            allow_internet_access: false,
            allow_public_endpoints: false,
            allow_network_capability: true,
            allow_filesystem_access: true,
            require_encryption: false,
            allowed_nexons: None,
            blocked_nexons: Vec::new(),
            max_stages: None,
            require_documentation: false,
            allowed_runtime_targets: Vec::new(),
        }
    }
}

impl OrgPolicy {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_yaml::from_str(yaml).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Every nexon list pattern must be well-formed.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.blocked_nexons
            .iter()
            .chain(self.allowed_nexons.iter().flatten())
            .try_for_each(|p| validate_pattern(p))
    }
}

/// Patterns are an exact id, `*`, or a prefix ending in a single trailing `*`.
pub fn validate_pattern(pattern: &str) -> Result<(), PolicyError> {
    match pattern.find('*') {
        Some(pos) if pos != pattern.len() - 1 => Err(PolicyError::InvalidPattern(pattern.to_string())),
        _ => Ok(()),
    }
}

/// Match a nexon id against a list pattern.
pub fn matches_pattern(pattern: &str, value: &str) -> Result<bool, PolicyError> {
    if pattern == "*" || pattern == value {
        return Ok(true);
    }
    match pattern.find('*') {
        None => Ok(false),
        Some(pos) if pos == pattern.len() - 1 => Ok(value.starts_with(&pattern[..pos])),
        Some(_) => Err(PolicyError::InvalidPattern(pattern.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub category: RuleCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl PolicyViolation {
    /// `ruleId` for channel-wide findings, `ruleId:stageId` for stage findings.
    pub fn violation_id(&self) -> String {
        match &self.stage_id {
            Some(stage) => format!("{}:{}", self.rule_id, stage),
            None => self.rule_id.clone(),
        }
    }

    /// An acknowledgement names either the rule or the specific finding.
    pub fn is_acknowledged_by(&self, acknowledged: &HashSet<String>) -> bool {
        acknowledged.contains(&self.rule_id) || acknowledged.contains(&self.violation_id())
    }

    pub fn blocks(&self) -> bool {
        self.severity == Severity::Error && !self.acknowledged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: RuleCategory,
    /// Severity reported when the rule fires; BP001 downgrades to info
    /// unless documentation is required.
    pub severity: Severity,
}

pub const RULE_INTERNET_ACCESS: RuleDescriptor = RuleDescriptor {
    id: "SEC001",
    name: "internet-access",
    description: "Channel requests internet access but the organization policy forbids it",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_PUBLIC_ENDPOINT: RuleDescriptor = RuleDescriptor {
    id: "SEC002",
    name: "public-endpoint",
    description: "Channel exposes a public endpoint but the organization policy forbids it",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_BLOCKED_NEXON: RuleDescriptor = RuleDescriptor {
    id: "SEC003",
    name: "blocked-nexon",
    description: "Stage uses a nexon on the organization block list",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_NEXON_NOT_ALLOWED: RuleDescriptor = RuleDescriptor {
    id: "SEC004",
    name: "nexon-not-allowlisted",
    description: "Stage uses a nexon missing from the organization allow list",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_NETWORK_CAPABILITY: RuleDescriptor = RuleDescriptor {
    id: "SEC005",
    name: "network-capability",
    description: "Stage declares network capability while outbound networking is not permitted",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_FILESYSTEM_CAPABILITY: RuleDescriptor = RuleDescriptor {
    id: "SEC006",
    name: "filesystem-capability",
    description: "Stage declares filesystem access which the organization policy forbids",
    category: RuleCategory::Security,
    severity: Severity::Error,
};

pub const RULE_ENCRYPTION_REQUIRED: RuleDescriptor = RuleDescriptor {
    id: "CMP001",
    name: "encryption-required",
    description: "Organization requires encryption but no stage provides it",
    category: RuleCategory::Compliance,
    severity: Severity::Error,
};

pub const RULE_RUNTIME_TARGET: RuleDescriptor = RuleDescriptor {
    id: "CMP002",
    name: "runtime-target",
    description: "Channel targets a runtime outside the organization allow list",
    category: RuleCategory::Compliance,
    severity: Severity::Error,
};

pub const RULE_STAGE_COUNT: RuleDescriptor = RuleDescriptor {
    id: "PRF001",
    name: "stage-count",
    description: "Channel exceeds the maximum number of stages",
    category: RuleCategory::Performance,
    severity: Severity::Warning,
};

pub const RULE_DOCUMENTATION: RuleDescriptor = RuleDescriptor {
    id: "BP001",
    name: "documentation",
    description: "Channel or stage lacks documentation",
    category: RuleCategory::BestPractice,
    severity: Severity::Warning,
};

/// Every rule the gate evaluates, in evaluation order.
pub const RULES: &[RuleDescriptor] = &[
    RULE_INTERNET_ACCESS,
    RULE_PUBLIC_ENDPOINT,
    RULE_BLOCKED_NEXON,
    RULE_NEXON_NOT_ALLOWED,
    RULE_NETWORK_CAPABILITY,
    RULE_FILESYSTEM_CAPABILITY,
    RULE_ENCRYPTION_REQUIRED,
    RULE_RUNTIME_TARGET,
    RULE_STAGE_COUNT,
    RULE_DOCUMENTATION,
];

pub fn list_rules() -> &'static [RuleDescriptor] {
    RULES
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
    pub acknowledged: usize,
}

/// A rule that could not be evaluated. The remaining rules still ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleFailure {
    pub rule_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintResult {
    pub passed: bool,
    pub violations: Vec<PolicyViolation>,
    pub summary: LintSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_failures: Vec<RuleFailure>,
}

impl LintResult {
    pub fn from_violations(violations: Vec<PolicyViolation>, rule_failures: Vec<RuleFailure>) -> Self {
        let mut summary = LintSummary::default();
        for v in &violations {
            match v.severity {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Info => summary.infos += 1,
            }
            if v.acknowledged {
                summary.acknowledged += 1;
            }
        }
        Self {
            passed: !violations.iter().any(PolicyViolation::blocks),
            violations,
            summary,
            rule_failures,
        }
    }

    pub fn blocking(&self) -> impl Iterator<Item = &PolicyViolation> {
        self.violations.iter().filter(|v| v.blocks())
    }
}
