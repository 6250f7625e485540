// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Flow-Engine Subprocess Plumbing
//!
//! | Module | Provides |
//! |--------|----------|
//! | `launcher` | [`NodeRuntimeLauncher`], the production [`EngineLauncher`](crate::domain::runtime::EngineLauncher) |
//! | `probe` | [`TcpReadinessProbe`] |
//! | `process` | [`EngineProcess`], the owned child handle and its exit watcher |
//! | `ports` | [`PortAllocator`] for per-channel engine ports |
//! | `usage` | `/proc` based cpu and memory sampling |

pub mod launcher;
pub mod ports;
pub mod probe;
pub mod process;
pub mod usage;

pub use launcher::NodeRuntimeLauncher;
pub use ports::PortAllocator;
pub use probe::TcpReadinessProbe;
pub use process::{EngineProcess, ExitReport};
pub use usage::{ResourceUsage, UsageSampler};
