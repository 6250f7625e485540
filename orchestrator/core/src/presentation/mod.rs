// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! HTTP surface of the control plane. No business logic lives here; every
//! handler delegates to [`crate::application::orchestrator`].
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | REST endpoints for builds, deployments, runtimes and policy |
//! | [`ws`] | WebSocket (Axum) | Agent control connection |

pub mod api;
pub mod ws;
