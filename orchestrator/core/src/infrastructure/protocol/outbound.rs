// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded per-connection outbound queue.
//!
//! Sends never wait. When the queue is full a non-critical frame is dropped
//! and counted, and a critical frame fails with [`ProtocolError::QueueFull`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::domain::protocol::Frame;
use crate::infrastructure::protocol::ProtocolError;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

pub struct Outbound<M> {
    tx: mpsc::Sender<M>,
    dropped: Arc<AtomicU64>,
    peer: Arc<str>,
}

impl<M> Clone for Outbound<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
            peer: self.peer.clone(),
        }
    }
}

impl<M: Frame> Outbound<M> {
    /// Queue and its draining end; `peer` labels logs and metrics.
    pub fn channel(peer: impl Into<Arc<str>>, capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                peer: peer.into(),
            },
            rx,
        )
    }

    pub fn send(&self, frame: M) -> Result<(), ProtocolError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) if !frame.is_critical() => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("gatejet_protocol_dropped_total", "op" => frame.op()).increment(1);
                debug!(peer = %self.peer, op = frame.op(), dropped_total = total, "Outbound queue full, dropping frame");
                Ok(())
            }
            Err(TrySendError::Full(frame)) => Err(ProtocolError::QueueFull {
                peer: self.peer.to_string(),
                op: frame.op(),
            }),
            Err(TrySendError::Closed(_)) => Err(ProtocolError::Disconnected(self.peer.to_string())),
        }
    }

    /// Frames dropped for lack of space since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
