// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the control plane's aggregates. The interface
//! lives in the domain layer and is implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `BuildRepository` | `BuildRecord` | `InMemoryBuildRepository` |
//! | `DeploymentRepository` | `DeploymentRecord` | `InMemoryDeploymentRepository` |
//!
//! Durable storage of builds and bundles is an external collaborator; the
//! in-memory implementations are what the control plane runs with.

use async_trait::async_trait;

use crate::domain::build::{BuildId, BuildRecord};
use crate::domain::deployment::{DeployId, DeploymentRecord};

/// Repository interface for Build aggregates
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Save build (create or update)
    async fn save(&self, build: &BuildRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: BuildId) -> Result<Option<BuildRecord>, RepositoryError>;

    /// Builds for a channel, newest first
    async fn find_by_channel(&self, channel_id: &str) -> Result<Vec<BuildRecord>, RepositoryError>;
}

/// Repository interface for Deployment aggregates
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn save(&self, deployment: &DeploymentRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: DeployId) -> Result<Option<DeploymentRecord>, RepositoryError>;

    /// Deployments targeting a runtime, newest first
    async fn find_by_runtime(&self, runtime_id: &str) -> Result<Vec<DeploymentRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
