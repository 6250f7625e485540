// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # GateJet Core
//!
//! Compiles channel IR into integrity-protected bundles, gates them on org
//! policy and deploys them to edge agents over a persistent websocket. The
//! same crate carries the agent side: the channel manager that verifies,
//! materializes and supervises one flow-engine process per channel.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Layout:** `domain` (pure types) → `application` (use cases) →
//!   `infrastructure` (processes, sockets, storage) → `presentation` (HTTP/WS)

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
