// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer
//!
//! | Module | Role |
//! |--------|------|
//! | [`policy_gate`] | Rule evaluation against the org policy |
//! | [`compiler`] | Channel IR → artifacts → bundle |
//! | [`orchestrator`] | Control-plane build and deployment lifecycles |
//! | [`channel_manager`] | Agent-side channel supervision |
//! | [`agent_service`] | Agent command dispatch |

pub mod agent_service;
pub mod channel_manager;
pub mod compiler;
pub mod orchestrator;
pub mod policy_gate;

pub use agent_service::AgentService;
pub use channel_manager::{ChannelManager, ChannelManagerConfig};
pub use compiler::Compiler;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
pub use policy_gate::PolicyGate;
