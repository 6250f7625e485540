// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryBuildRepository** - Build records including their compiled bundles
//! - **InMemoryDeploymentRepository** - Deployment attempts and their outcome

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::build::{BuildId, BuildRecord};
use crate::domain::deployment::{DeployId, DeploymentRecord};
use crate::domain::repository::{BuildRepository, DeploymentRepository, RepositoryError};

#[derive(Clone, Default)]
pub struct InMemoryBuildRepository {
    builds: Arc<RwLock<HashMap<BuildId, BuildRecord>>>,
}

impl InMemoryBuildRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildRepository for InMemoryBuildRepository {
    async fn save(&self, build: &BuildRecord) -> Result<(), RepositoryError> {
        self.builds.write().insert(build.id, build.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: BuildId) -> Result<Option<BuildRecord>, RepositoryError> {
        Ok(self.builds.read().get(&id).cloned())
    }

    async fn find_by_channel(&self, channel_id: &str) -> Result<Vec<BuildRecord>, RepositoryError> {
        let mut builds: Vec<_> = self
            .builds
            .read()
            .values()
            .filter(|b| b.channel_id == channel_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(builds)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeploymentRepository {
    deployments: Arc<RwLock<HashMap<DeployId, DeploymentRecord>>>,
}

impl InMemoryDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryDeploymentRepository {
    async fn save(&self, deployment: &DeploymentRecord) -> Result<(), RepositoryError> {
        self.deployments.write().insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: DeployId) -> Result<Option<DeploymentRecord>, RepositoryError> {
        Ok(self.deployments.read().get(&id).cloned())
    }

    async fn find_by_runtime(&self, runtime_id: &str) -> Result<Vec<DeploymentRecord>, RepositoryError> {
        let mut deployments: Vec<_> = self
            .deployments
            .read()
            .values()
            .filter(|d| d.runtime_id == runtime_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }
}
