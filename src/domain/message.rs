// src/domain/message.rs

//! Inbound message envelope and acknowledgment handles.

use crate::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Acknowledgment surface of one delivery.
///
/// `multiple` extends the operation to every delivery up to and including
/// this one on the same channel; `requeue` asks the broker to redeliver
/// instead of dropping.
#[async_trait::async_trait]
pub trait MessageAcker: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<()>;
    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()>;
}

/// A message delivered to a consumer.
///
/// Carries the raw payload, the delivery metadata needed for RPC reply
/// routing, and the acknowledgment handles for this delivery. Cloning is
/// cheap and clones share the same acknowledgment state; acknowledge each
/// delivery once.
#[derive(Clone)]
pub struct InboundMessage {
    /// Raw payload bytes.
    pub payload: Bytes,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published under.
    pub routing_key: String,

    /// Correlation id, when the publisher set one.
    pub correlation_id: Option<String>,

    /// Reply queue, when the publisher expects an answer.
    pub reply_to: Option<String>,

    acker: Arc<dyn MessageAcker>,
}

impl InboundMessage {
    /// Assemble a delivery. Called by transport implementations.
    pub fn new(
        payload: Bytes,
        exchange: String,
        routing_key: String,
        correlation_id: Option<String>,
        reply_to: Option<String>,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        Self {
            payload,
            exchange,
            routing_key,
            correlation_id,
            reply_to,
            acker,
        }
    }

    /// Acknowledge this delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(false).await
    }

    /// Acknowledge this delivery and every earlier one on the channel.
    pub async fn ack_all(&self) -> Result<()> {
        self.acker.ack(true).await
    }

    /// Reject this delivery.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(false, requeue).await
    }

    /// Reject this delivery and every earlier one on the channel.
    pub async fn nack_all(&self, requeue: bool) -> Result<()> {
        self.acker.nack(true, requeue).await
    }

    /// Deserialize the payload as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries produced by one consumer registration.
///
/// Ends when the channel or connection behind it is closed.
pub struct DeliveryStream {
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

impl DeliveryStream {
    /// Wrap a receiver. Called by transport implementations.
    pub fn new(inbox: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        Self { inbox }
    }

    /// Receive the next delivery, or `None` once the consumer is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbox.recv().await
    }
}

/// Handle returned from [`Connection::subscribe`](crate::Connection::subscribe).
///
/// Unlike a raw [`DeliveryStream`], the inbox survives reconnects: the
/// connection re-registers the consumer on every declaration cycle and keeps
/// feeding the same receiver. The subscription ends when this handle is
/// dropped.
pub struct SubscriptionHandle {
    /// Receiver for delivered messages.
    pub inbox: mpsc::Receiver<InboundMessage>,
}
