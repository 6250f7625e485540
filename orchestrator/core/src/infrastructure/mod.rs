// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod archive;
pub mod engine;
pub mod event_bus;
pub mod keyed_lock;
pub mod protocol;
pub mod repositories;
pub mod secrets;
pub mod templates;

pub use event_bus::EventBus;
