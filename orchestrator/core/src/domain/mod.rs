// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`gatejet-core`)
//!
//! Pure types, state machines and integrity algorithms. Nothing here
//! performs I/O except configuration and policy file loading.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`integrity`] | SHA-256 digests, deterministic ids, Merkle tree |
//! | [`bundle`] | Bundle layout, manifest, `BundleHashes` |
//! | [`ir`] | Channel IR and nexon template types |
//! | [`policy`] | Org policy, violations, rule catalogue |
//! | [`channel`] | Agent-side channel record and state machine |
//! | [`protocol`] | Control/agent wire messages |
//! | [`build`], [`deployment`] | Control-plane lifecycles |
//! | [`repository`] | Persistence contracts |
//! | [`runtime`] | Engine launcher and readiness ports |
//! | [`events`] | Events broadcast by the orchestrator |
//! | [`node_config`] | Node configuration manifest |

pub mod build;
pub mod bundle;
pub mod channel;
pub mod deployment;
pub mod events;
pub mod integrity;
pub mod ir;
pub mod node_config;
pub mod policy;
pub mod protocol;
pub mod repository;
pub mod runtime;
