// src/connection/publish_queue.rs

//! Outbound publish queue.
//!
//! Decouples message submission from transport availability: `publish`
//! appends to an in-process buffer and returns immediately, and a
//! per-connection drain task flushes the buffer to the broker whenever the
//! connection is Connected. Messages submitted while disconnected simply
//! wait; nothing is dropped.
//!
//! The buffer is **unbounded by design** — under sustained disconnection it
//! grows without limit. This mirrors the fire-and-forget contract of
//! `publish`: submission never fails and never applies backpressure. Callers
//! that need bounds must watch [`PublishQueue::len`] themselves.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// A message waiting to be published.
pub struct OutboundMessage {
    /// Target exchange; empty for the default exchange.
    pub exchange: String,

    /// Routing key, or queue name when targeting the default exchange.
    pub routing_key: String,

    /// Raw payload bytes.
    pub payload: Bytes,

    pub(crate) confirm: Option<oneshot::Sender<bool>>,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            confirm: None,
        }
    }

    /// Attach a publish-acknowledgment signal.
    ///
    /// The receipt resolves once the broker has accepted (or rejected) the
    /// message during a drain.
    pub fn with_confirm(mut self) -> (Self, PublishReceipt) {
        let (tx, rx) = oneshot::channel();
        self.confirm = Some(tx);
        (self, PublishReceipt { receipt: rx })
    }
}

/// Resolves once a buffered message has actually been published.
pub struct PublishReceipt {
    receipt: oneshot::Receiver<bool>,
}

impl PublishReceipt {
    /// Wait for the broker's accept/reject result.
    pub async fn confirmed(self) -> Result<bool> {
        self.receipt
            .await
            .map_err(|_| Error::Transport("publish confirmation dropped".into()))
    }
}

/// Per-connection outbound buffer. Owned by a [`Connection`](crate::Connection);
/// reach it through [`Connection::queue`](crate::Connection::queue).
pub struct PublishQueue {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    len: Arc<AtomicUsize>,
}

impl PublishQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            len: Arc::new(AtomicUsize::new(0)),
        };
        (queue, rx)
    }

    pub(crate) fn pending(&self) -> Arc<AtomicUsize> {
        self.len.clone()
    }

    /// Buffer a message for publication. Returns immediately.
    pub fn publish(&self, message: OutboundMessage) {
        self.len.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            // Drain task gone; only happens while the connection is being
            // dropped, at which point the counter no longer matters.
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Serialize `value` as JSON and buffer it, returning a receipt that
    /// resolves when the message reaches the broker.
    pub fn publish_json<T: Serialize>(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        value: &T,
    ) -> Result<PublishReceipt> {
        let payload = serde_json::to_vec(value)?;
        let (message, receipt) =
            OutboundMessage::new(exchange, routing_key, Bytes::from(payload)).with_confirm();
        self.publish(message);
        Ok(receipt)
    }

    /// Number of messages buffered and not yet published.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
