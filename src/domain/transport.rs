// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the contract the connection state machine programs
//! against. It deliberately mirrors the primitive surface of an AMQP client
//! (declare, bind, publish, consume, delete) without referencing any
//! concrete client library, so the lifecycle layers can be exercised against
//! the in-memory reference broker exactly as they run against a real one.
//!
//! The transport is responsible only for executing primitives and reporting
//! connection-level signals. Higher-level semantics (status tracking,
//! declaration cycles, buffering, RPC correlation, reconnection) live above
//! this boundary and must not leak into it.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::message::DeliveryStream;

/// Exchange type selector.
///
/// The usual AMQP exchange kinds plus an escape hatch for broker-specific
/// types (`x-delayed-message` and friends).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Headers,
    Fanout,
    Custom(String),
}

impl Default for ExchangeKind {
    fn default() -> Self {
        ExchangeKind::Direct
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Custom(kind) => f.write_str(kind),
        }
    }
}

/// Assertion options applied when an exchange is declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    #[serde(default)]
    pub durable: bool,

    /// Delete the exchange once the last queue unbinds from it.
    #[serde(default)]
    pub auto_delete: bool,
}

/// Assertion options applied when a queue is declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survive broker restarts.
    #[serde(default)]
    pub durable: bool,

    /// Restrict the queue to the declaring connection.
    #[serde(default)]
    pub exclusive: bool,

    /// Delete the queue once the last consumer disconnects.
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a short-lived RPC reply queue: not durable, deleted as
    /// soon as its single consumer goes away.
    pub fn rpc_reply() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }
}

/// Per-message properties attached to a publish.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    /// Correlation id pairing a request with its reply.
    pub correlation_id: Option<String>,

    /// Queue the responder should publish its answer to.
    pub reply_to: Option<String>,

    /// Payload content type, e.g. `application/json`.
    pub content_type: Option<String>,
}

/// Options applied when a consumer is registered.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Deliver without expecting acknowledgments.
    pub no_ack: bool,

    /// Request exclusive access to the queue.
    pub exclusive: bool,
}

/// Connection-level signal emitted by the transport.
///
/// The connection state machine reacts to these: `Closed`, `Errored`, and
/// `Blocked` all force a disconnect; `Unblocked` is informational.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The broker closed the connection.
    Closed,
    /// The connection failed with a transport error.
    Errored(String),
    /// The broker stopped accepting publishes (e.g. a resource alarm).
    Blocked(String),
    /// The broker resumed accepting publishes.
    Unblocked,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Closed => f.write_str("closed"),
            ConnectionEvent::Errored(reason) => write!(f, "errored: {reason}"),
            ConnectionEvent::Blocked(reason) => write!(f, "blocked: {reason}"),
            ConnectionEvent::Unblocked => f.write_str("unblocked"),
        }
    }
}

/// A freshly dialed broker connection plus its signal stream.
///
/// The event receiver is bound to this physical connection only; it ends
/// when the connection is closed or dropped.
pub struct BrokerHandle {
    /// The live connection.
    pub connection: Arc<dyn BrokerConnection>,
    /// Connection-level lifecycle signals.
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Factory for physical broker connections.
///
/// One `Transport` may dial any number of independent connections; each call
/// to [`connect`](Transport::connect) yields a fresh one. Implementations
/// must bound the attempt by `timeout`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the broker at `url`.
    async fn connect(&self, url: &str, timeout: Duration) -> Result<BrokerHandle>;
}

/// Shared transport pointer.
///
/// An `Arc<dyn Transport>`: cheap to clone, safe to hand to every connection
/// in a registry.
pub type TransportPtr = Arc<dyn Transport>;

/// A live physical connection to a broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Close the connection and everything on it.
    async fn close(&self) -> Result<()>;
}

/// A channel carrying the AMQP-style primitive operations.
///
/// All operations fail with [`Error::Transport`](crate::Error::Transport)
/// once the channel or its connection has been closed.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limit the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Assert an exchange, creating it if needed.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()>;

    /// Assert a queue, creating it if needed.
    ///
    /// An empty `name` asks the broker to generate one; the actual queue
    /// name is returned either way.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String>;

    /// Bind a queue to an exchange under a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a payload to an exchange under a routing key.
    ///
    /// Publishing to the default exchange (empty name) routes directly to
    /// the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Bytes,
        properties: &PublishProperties,
    ) -> Result<()>;

    /// Start consuming from a queue.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream>;

    /// Delete a queue.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Delete an exchange.
    async fn delete_exchange(&self, name: &str) -> Result<()>;

    /// Close this channel, cancelling its consumers.
    async fn close(&self) -> Result<()>;
}
