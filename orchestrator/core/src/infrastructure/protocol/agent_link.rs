// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent side of the control connection.
//!
//! Dials the control plane, introduces itself with `hello`, then serves
//! commands until the socket drops, reconnecting with capped exponential
//! backoff. Heartbeats run on their own task so a slow command never delays
//! them.

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::domain::protocol::{AgentHello, AgentMessage, ControlMessage, Frame, RuntimeSummary};
use crate::infrastructure::protocol::outbound::Outbound;
use crate::infrastructure::protocol::{decode, encode, ProtocolError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// What the link needs from the agent it serves.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    fn hello(&self) -> AgentHello;

    /// Execute one command and produce its reply.
    async fn handle(&self, command: ControlMessage) -> AgentMessage;

    async fn summary(&self) -> RuntimeSummary;
}

#[derive(Debug, Clone)]
pub struct AgentLinkConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub outbound_capacity: usize,
    pub max_backoff: Duration,
}

enum SessionEnd {
    Shutdown,
    Closed,
}

pub struct AgentLink {
    config: AgentLinkConfig,
    handler: Arc<dyn CommandHandler>,
}

impl AgentLink {
    pub fn new(config: AgentLinkConfig, handler: Arc<dyn CommandHandler>) -> Self {
        Self { config, handler }
    }

    /// Stay connected until `shutdown` flips to true or its sender is
    /// dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => {
                    info!(url = %self.config.url, "Control connection closed, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, retry_ms = backoff.as_millis() as u64, "Control plane unreachable");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
        info!("Agent link stopped");
    }

    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd, ProtocolError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let hello = self.handler.hello();
        let runtime_id = hello.runtime_id.clone();
        sink.send(WsMessage::Text(encode(&AgentMessage::Hello { payload: hello })?))
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        info!(url = %self.config.url, runtime_id = %runtime_id, "Connected to control plane");

        let (outbound, mut rx) = Outbound::<AgentMessage>::channel("control-plane", self.config.outbound_capacity);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match encode(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(op = frame.op(), error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!(error = %e, "Control socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat = tokio::spawn(heartbeat_loop(
            outbound.clone(),
            self.handler.clone(),
            self.config.heartbeat_interval,
        ));

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text, &outbound),
                    Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Control socket read failed");
                        break SessionEnd::Closed;
                    }
                },
            }
        };

        heartbeat.abort();
        writer.abort();
        Ok(end)
    }

    fn dispatch(&self, text: &str, outbound: &Outbound<AgentMessage>) {
        let command: ControlMessage = match decode(text) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed command");
                return;
            }
        };
        debug!(op = command.op(), correlation_id = ?command.correlation_id(), "Command received");

        let handler = self.handler.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            let op = command.op();
            let reply = handler.handle(command).await;
            if let Err(e) = outbound.send(reply) {
                warn!(op, error = %e, "Could not deliver command reply");
            }
        });
    }
}

async fn heartbeat_loop(outbound: Outbound<AgentMessage>, handler: Arc<dyn CommandHandler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let frame = AgentMessage::Heartbeat {
            ts: Utc::now(),
            summary: Some(handler.summary().await),
        };
        if let Err(ProtocolError::Disconnected(_)) = outbound.send(frame) {
            break;
        }
    }
}
