// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;

use crate::domain::runtime::{EngineLauncher, LaunchCommand, LaunchSpec};

/// Runs the configured flow-engine binary against a materialized build:
/// `<bin> --userDir <buildDir> --settings <settings.js> <flows.json>`.
#[derive(Debug, Clone)]
pub struct NodeRuntimeLauncher {
    bin: PathBuf,
}

impl NodeRuntimeLauncher {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl EngineLauncher for NodeRuntimeLauncher {
    fn command(&self, spec: &LaunchSpec) -> LaunchCommand {
        LaunchCommand {
            program: self.bin.clone(),
            args: vec![
                "--userDir".to_string(),
                spec.build_dir.display().to_string(),
                "--settings".to_string(),
                spec.settings_path.display().to_string(),
                spec.flows_path.display().to_string(),
            ],
            env: spec.environment(),
            cwd: spec.build_dir.clone(),
        }
    }
}
