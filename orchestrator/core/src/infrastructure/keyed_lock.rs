// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-key mutual exclusion.
//!
//! Operations on different keys run in parallel; operations on the same key
//! queue on a fair tokio mutex and never overlap.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Whether some operation currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("ch-1").await;
        assert!(locks.is_locked("ch-1"));

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("ch-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("ch-1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("ch-2")).await;
        assert!(b.is_ok());
    }
}
