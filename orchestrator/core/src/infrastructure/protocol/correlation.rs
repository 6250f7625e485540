// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pending request table for one connection.
//!
//! Every waiter is removed exactly once: by its reply, by its own timeout,
//! or by [`PendingRequests::fail_all`] when the connection goes away.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::protocol::{AgentMessage, Frame};
use crate::infrastructure::protocol::ProtocolError;

pub type Reply = Result<AgentMessage, ProtocolError>;

struct Waiter {
    tx: oneshot::Sender<Reply>,
    deploy_key: Option<(String, String)>,
}

pub struct PendingRequests {
    peer: Arc<str>,
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    pub fn new(peer: impl Into<Arc<str>>) -> Self {
        Self {
            peer: peer.into(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter. `deploy_key` lets a `deploy-result` without a
    /// correlation id still find it.
    pub fn register(&self, token: impl Into<String>, deploy_key: Option<(String, String)>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(token.into(), Waiter { tx, deploy_key });
        rx
    }

    pub fn resolve(&self, token: &str, reply: AgentMessage) -> bool {
        let waiter = self.waiters.lock().remove(token);
        match waiter {
            Some(waiter) => {
                // The caller may have given up already
                let _ = waiter.tx.send(Ok(reply));
                true
            }
            None => {
                debug!(peer = %self.peer, token, "Reply for unknown or expired request");
                false
            }
        }
    }

    /// Route a reply to its waiter: by correlation token first, then, for a
    /// `deploy-result`, by `(channelId, buildId)`.
    pub fn resolve_reply(&self, reply: AgentMessage) -> bool {
        let token = {
            let waiters = self.waiters.lock();
            let by_token = reply
                .correlation_token()
                .filter(|token| waiters.contains_key(*token))
                .map(str::to_owned);
            by_token.or_else(|| match &reply {
                AgentMessage::DeployResult { channel_id, build_id, .. } => waiters
                    .iter()
                    .find(|(_, w)| {
                        w.deploy_key
                            .as_ref()
                            .is_some_and(|(c, b)| c == channel_id && b == build_id)
                    })
                    .map(|(token, _)| token.clone()),
                _ => None,
            })
        };
        match token {
            Some(token) => self.resolve(&token, reply),
            None => {
                debug!(peer = %self.peer, op = reply.op(), "Reply matched no pending request");
                false
            }
        }
    }

    pub fn cancel(&self, token: &str) -> bool {
        self.waiters.lock().remove(token).is_some()
    }

    /// Fail every outstanding waiter; returns how many there were.
    pub fn fail_all(&self, error: impl Fn() -> ProtocolError) -> usize {
        let drained: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(error()));
        }
        if count > 0 {
            warn!(peer = %self.peer, count, "Failed in-flight requests");
        }
        count
    }

    /// Await a registered reply for at most `timeout`. A timed-out waiter is
    /// removed before returning.
    pub async fn wait(
        &self,
        token: &str,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
        op: &'static str,
    ) -> Reply {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ProtocolError::Disconnected(self.peer.to_string())),
            Err(_) => {
                self.cancel(token);
                warn!(peer = %self.peer, token, op, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(ProtocolError::Timeout {
                    peer: self.peer.to_string(),
                    op,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
