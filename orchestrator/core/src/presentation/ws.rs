// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control-plane end of the agent websocket.
//!
//! The first frame must be `hello`; anything else (or silence past
//! [`HELLO_TIMEOUT`]) closes the socket before the agent is registered.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::protocol::{AgentHello, AgentMessage, Frame};
use crate::infrastructure::protocol::{decode, encode, AgentRegistry, ProtocolError};
use crate::presentation::api::AppState;

pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let registry = state.orchestrator.registry().clone();
    ws.on_upgrade(move |socket| serve_agent(socket, registry))
}

async fn read_hello(socket: &mut WebSocket) -> Result<AgentHello, ProtocolError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, socket.next())
        .await
        .map_err(|_| ProtocolError::Handshake("no hello received".to_string()))?;
    match frame {
        Some(Ok(Message::Text(text))) => match decode::<AgentMessage>(text.as_str())? {
            AgentMessage::Hello { payload } => Ok(payload),
            other => Err(ProtocolError::Handshake(format!("expected hello, got {}", other.op()))),
        },
        Some(Ok(_)) => Err(ProtocolError::Handshake("expected a text frame".to_string())),
        Some(Err(e)) => Err(ProtocolError::Transport(e.to_string())),
        None => Err(ProtocolError::Handshake("socket closed before hello".to_string())),
    }
}

/// Run one agent connection to completion.
pub async fn serve_agent(mut socket: WebSocket, registry: Arc<AgentRegistry>) {
    let hello = match read_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "Rejecting agent socket");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (conn, mut outbound) = registry.register(hello);
    let (mut sink, mut stream) = socket.split();

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            let text = match encode(&command) {
                Ok(text) => text,
                Err(e) => {
                    warn!(runtime_id = %writer_conn.runtime_id(), error = %e, "Dropping unencodable command");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(runtime_id = %writer_conn.runtime_id(), error = %e, "Agent socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode::<AgentMessage>(text.as_str()) {
                    Ok(message) => registry.handle_inbound(&conn, message),
                    Err(e) => {
                        conn.touch();
                        warn!(runtime_id = %conn.runtime_id(), error = %e, "Ignoring malformed agent frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => conn.touch(),
                Some(Err(e)) => {
                    debug!(runtime_id = %conn.runtime_id(), error = %e, "Agent socket read failed");
                    break;
                }
            },
            _ = conn.closed() => {
                debug!(runtime_id = %conn.runtime_id(), connection_id = %conn.connection_id, "Connection superseded");
                break;
            }
        }
    }

    registry.disconnect(&conn);
    writer.abort();
}
