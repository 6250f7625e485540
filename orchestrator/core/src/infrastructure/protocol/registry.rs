// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control-plane table of agent connections, keyed by `runtimeId`.
//!
//! A second `hello` for the same runtime replaces the earlier connection and
//! fails everything still waiting on it. An agent is live while traffic has
//! been seen within the liveness window; requests to anything else fail
//! immediately with [`ProtocolError::AgentOffline`].

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::events::AgentEvent;
use crate::domain::protocol::{AgentHello, AgentMessage, ControlMessage, Frame, LogLevel, RuntimeSummary};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::protocol::correlation::PendingRequests;
use crate::infrastructure::protocol::outbound::Outbound;
use crate::infrastructure::protocol::ProtocolError;

/// One registered agent socket.
pub struct AgentConnection {
    pub connection_id: Uuid,
    pub hello: AgentHello,
    pub connected_at: DateTime<Utc>,
    outbound: Outbound<ControlMessage>,
    pending: PendingRequests,
    last_seen: Mutex<Instant>,
    summary: RwLock<Option<RuntimeSummary>>,
    closed: AtomicBool,
    closed_signal: Notify,
}

impl AgentConnection {
    fn new(hello: AgentHello, capacity: usize) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (outbound, rx) = Outbound::channel(hello.runtime_id.as_str(), capacity);
        let pending = PendingRequests::new(hello.runtime_id.as_str());
        let conn = Self {
            connection_id: Uuid::new_v4(),
            hello,
            connected_at: Utc::now(),
            outbound,
            pending,
            last_seen: Mutex::new(Instant::now()),
            summary: RwLock::new(None),
            closed: AtomicBool::new(false),
            closed_signal: Notify::new(),
        };
        (conn, rx)
    }

    pub fn runtime_id(&self) -> &str {
        &self.hello.runtime_id
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn summary(&self) -> Option<RuntimeSummary> {
        self.summary.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been closed or replaced.
    pub async fn closed(&self) {
        let notified = self.closed_signal.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Mark dead and fail every waiter. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime_id = self.runtime_id().to_string();
        self.pending.fail_all(|| ProtocolError::Disconnected(runtime_id.clone()));
        self.closed_signal.notify_waiters();
    }
}

/// Listing entry for `GET /api/runtimes`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub runtime_id: String,
    pub device_id: String,
    pub agent_version: String,
    pub connected_at: DateTime<Utc>,
    pub online: bool,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RuntimeSummary>,
}

pub struct AgentRegistry {
    connections: DashMap<String, Arc<AgentConnection>>,
    /// Last summary per runtime, kept after disconnect for reconciliation.
    summaries: DashMap<String, RuntimeSummary>,
    known: DashSet<String>,
    liveness_window: Duration,
    outbound_capacity: usize,
    event_bus: EventBus,
}

impl AgentRegistry {
    pub fn new(liveness_window: Duration, outbound_capacity: usize, event_bus: EventBus) -> Self {
        Self {
            connections: DashMap::new(),
            summaries: DashMap::new(),
            known: DashSet::new(),
            liveness_window,
            outbound_capacity,
            event_bus,
        }
    }

    /// Register the connection announced by `hello`. The receiver is the
    /// socket writer's queue.
    pub fn register(&self, hello: AgentHello) -> (Arc<AgentConnection>, mpsc::Receiver<ControlMessage>) {
        let (conn, rx) = AgentConnection::new(hello, self.outbound_capacity);
        let conn = Arc::new(conn);
        let runtime_id = conn.runtime_id().to_string();
        self.known.insert(runtime_id.clone());

        if let Some(previous) = self.connections.insert(runtime_id.clone(), conn.clone()) {
            warn!(
                runtime_id = %runtime_id,
                previous = %previous.connection_id,
                "Agent reconnected, replacing previous connection"
            );
            previous.close();
        }

        info!(
            runtime_id = %runtime_id,
            connection_id = %conn.connection_id,
            device_id = %conn.hello.device_id,
            agent_version = %conn.hello.agent_version,
            "Agent connected"
        );
        self.record_online();
        self.event_bus.publish_agent_event(AgentEvent::AgentConnected {
            runtime_id,
            agent_version: conn.hello.agent_version.clone(),
            connected_at: conn.connected_at,
        });
        (conn, rx)
    }

    /// Drop `conn` if it is still the registered connection for its runtime.
    pub fn disconnect(&self, conn: &AgentConnection) {
        conn.close();
        let removed = self
            .connections
            .remove_if(conn.runtime_id(), |_, current| current.connection_id == conn.connection_id)
            .is_some();
        if removed {
            info!(runtime_id = %conn.runtime_id(), connection_id = %conn.connection_id, "Agent disconnected");
            self.record_online();
            self.event_bus.publish_agent_event(AgentEvent::AgentDisconnected {
                runtime_id: conn.runtime_id().to_string(),
                disconnected_at: Utc::now(),
            });
        }
    }

    pub fn get(&self, runtime_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.get(runtime_id).map(|c| c.value().clone())
    }

    pub fn is_online(&self, runtime_id: &str) -> bool {
        self.live_connection(runtime_id).is_ok()
    }

    /// Whether this runtime has ever said hello.
    pub fn is_known(&self, runtime_id: &str) -> bool {
        self.known.contains(runtime_id)
    }

    pub fn last_summary(&self, runtime_id: &str) -> Option<RuntimeSummary> {
        self.summaries.get(runtime_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .connections
            .iter()
            .map(|entry| {
                let conn = entry.value();
                AgentInfo {
                    runtime_id: conn.runtime_id().to_string(),
                    device_id: conn.hello.device_id.clone(),
                    agent_version: conn.hello.agent_version.clone(),
                    connected_at: conn.connected_at,
                    online: !conn.is_closed() && conn.idle_for() <= self.liveness_window,
                    idle_ms: conn.idle_for().as_millis() as u64,
                    summary: conn.summary(),
                }
            })
            .collect();
        agents.sort_by(|a, b| a.runtime_id.cmp(&b.runtime_id));
        agents
    }

    fn live_connection(&self, runtime_id: &str) -> Result<Arc<AgentConnection>, ProtocolError> {
        let conn = self
            .get(runtime_id)
            .ok_or_else(|| ProtocolError::AgentOffline(runtime_id.to_string()))?;
        if conn.is_closed() || conn.idle_for() > self.liveness_window {
            return Err(ProtocolError::AgentOffline(runtime_id.to_string()));
        }
        Ok(conn)
    }

    /// Send without waiting for a reply.
    pub fn send(&self, runtime_id: &str, message: ControlMessage) -> Result<(), ProtocolError> {
        self.live_connection(runtime_id)?.outbound.send(message)
    }

    /// Send a command and await its correlated reply. A correlation id is
    /// assigned when the command has none.
    pub async fn request(
        &self,
        runtime_id: &str,
        message: ControlMessage,
        timeout: Duration,
    ) -> Result<AgentMessage, ProtocolError> {
        let conn = self.live_connection(runtime_id)?;
        let token = match message.correlation_id() {
            Some(token) => token.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let message = message.with_correlation_id(token.clone());
        let op = message.op();

        let rx = conn.pending.register(token.clone(), message.deploy_key());
        // close() flips the flag before failing waiters, so a waiter
        // registered after that sweep is caught here
        if conn.is_closed() {
            conn.pending.cancel(&token);
            return Err(ProtocolError::Disconnected(runtime_id.to_string()));
        }
        if let Err(e) = conn.outbound.send(message) {
            conn.pending.cancel(&token);
            return Err(e);
        }

        debug!(runtime_id = %runtime_id, op, correlation_id = %token, "Request sent");
        conn.pending.wait(&token, rx, timeout, op).await
    }

    /// Apply one inbound frame from `conn`.
    pub fn handle_inbound(&self, conn: &AgentConnection, message: AgentMessage) {
        conn.touch();
        match &message {
            AgentMessage::Hello { .. } => {
                debug!(runtime_id = %conn.runtime_id(), "Ignoring repeated hello on open connection");
                return;
            }
            AgentMessage::Log { channel_id, level, msg } => {
                let channel_id = channel_id.as_deref().unwrap_or("-");
                match level {
                    LogLevel::Error => warn!(runtime_id = %conn.runtime_id(), channel_id, "agent: {msg}"),
                    LogLevel::Warn => warn!(runtime_id = %conn.runtime_id(), channel_id, "agent: {msg}"),
                    LogLevel::Info => info!(runtime_id = %conn.runtime_id(), channel_id, "agent: {msg}"),
                    LogLevel::Debug => debug!(runtime_id = %conn.runtime_id(), channel_id, "agent: {msg}"),
                }
                return;
            }
            AgentMessage::Heartbeat { summary, .. } => {
                if let Some(summary) = summary {
                    self.store_summary(conn, summary.clone());
                }
                return;
            }
            AgentMessage::Status { summary, .. } => self.store_summary(conn, summary.clone()),
            AgentMessage::Ack { .. } | AgentMessage::DeployResult { .. } => {}
        }
        conn.pending.resolve_reply(message);
    }

    fn store_summary(&self, conn: &AgentConnection, summary: RuntimeSummary) {
        *conn.summary.write() = Some(summary.clone());
        self.summaries.insert(conn.runtime_id().to_string(), summary.clone());
        self.event_bus.publish_agent_event(AgentEvent::RuntimeSummaryReceived {
            runtime_id: conn.runtime_id().to_string(),
            summary,
        });
    }

    /// Close and remove every connection silent for longer than the
    /// liveness window. Returns the evicted runtime ids.
    pub fn evict_stale(&self) -> Vec<String> {
        let stale: Vec<Arc<AgentConnection>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() > self.liveness_window)
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for conn in stale {
            let idle = conn.idle_for();
            conn.close();
            let removed = self
                .connections
                .remove_if(conn.runtime_id(), |_, current| current.connection_id == conn.connection_id)
                .is_some();
            if !removed {
                continue;
            }
            warn!(
                runtime_id = %conn.runtime_id(),
                idle_secs = idle.as_secs(),
                "Agent missed its liveness window, marking offline"
            );
            self.event_bus.publish_agent_event(AgentEvent::AgentWentOffline {
                runtime_id: conn.runtime_id().to_string(),
                last_seen_secs: idle.as_secs(),
                detected_at: Utc::now(),
            });
            evicted.push(conn.runtime_id().to_string());
        }
        if !evicted.is_empty() {
            self.record_online();
        }
        evicted
    }

    /// Periodically run [`Self::evict_stale`].
    pub fn spawn_liveness_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.evict_stale();
            }
        })
    }

    pub fn online_count(&self) -> usize {
        self.connections.len()
    }

    fn record_online(&self) {
        metrics::gauge!("gatejet_agents_online").set(self.connections.len() as f64);
    }
}
