// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;

use crate::domain::channel::ChannelError;

const EPHEMERAL_ATTEMPTS: usize = 16;

/// Hands out engine ports that are free on `host` and not already held by
/// another channel on this agent.
///
/// With a base port, ports are taken sequentially from it; otherwise the OS
/// picks an ephemeral one.
pub struct PortAllocator {
    host: String,
    base: Option<u16>,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, base: Option<u16>) -> Self {
        Self {
            host: host.into(),
            base,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16, ChannelError> {
        let mut reserved = self.reserved.lock();
        let port = match self.base {
            Some(base) => (base..=u16::MAX)
                .filter(|p| !reserved.contains(p))
                .find(|p| self.is_free(*p)),
            None => (0..EPHEMERAL_ATTEMPTS)
                .filter_map(|_| self.ephemeral())
                .find(|p| !reserved.contains(p)),
        };
        let port = port.ok_or_else(|| ChannelError::PortUnavailable(format!("no free port on {}", self.host)))?;
        reserved.insert(port);
        Ok(port)
    }

    pub fn release(&self, port: u16) {
        self.reserved.lock().remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.reserved.lock().len()
    }

    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((self.host.as_str(), port)).is_ok()
    }

    fn ephemeral(&self) -> Option<u16> {
        let listener = TcpListener::bind((self.host.as_str(), 0)).ok()?;
        listener.local_addr().ok().map(|addr| addr.port())
    }
}
