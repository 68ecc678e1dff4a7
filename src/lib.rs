//! Connection and messaging lifecycle manager for AMQP-style brokers.
//!
//! This library maintains one or more independent named broker connections,
//! declares routing topology (exchange, queues, bindings), buffers and
//! drains outbound messages, delivers inbound messages with acknowledgment
//! control, and implements request/response (RPC) semantics over a
//! fundamentally fire-and-forget transport.
//!
//! # Architecture
//!
//! - A [`Registry`] holds named [`Connection`]s created from [`AmqpConfig`].
//! - Each [`Connection`] is a state machine cycling
//!   `Disconnected → Connecting → Connected → Disconnected`, declaring its
//!   resources once per connected cycle and recovering transport faults
//!   locally (reconnect, process exit, or passive idle, per configuration).
//! - Outbound messages go through the connection's [`PublishQueue`], which
//!   buffers while disconnected and drains in FIFO order while connected.
//! - RPC calls correlate request and reply through a per-call broker-named
//!   reply queue and a correlation id, raced against a timeout.
//!
//! The lifecycle layers are written against the transport contract in
//! [`Transport`]/[`BrokerConnection`]/[`BrokerChannel`]; the production
//! implementation is backed by `lapin` (feature `transport-lapin`, default)
//! and an in-memory reference broker is always available for tests.

// Import all sub modules once...
mod config;
mod connection;
mod correlation;
mod domain;
mod error;
mod registry;

mod macros;

pub mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use connection::publish_queue::{OutboundMessage, PublishQueue, PublishReceipt};
pub use connection::rpc::{RpcCall, DEFAULT_RPC_TIMEOUT};
pub use connection::{Connection, ConnectionStatus};
pub use registry::Registry;

pub use config::{
    //
    AmqpConfig,
    ConnectionConfig,
    ExchangeConfig,
    QueueConfig,
    ReconnectPolicy,
};

pub use correlation::CorrelationId;
pub use error::{Error, Result};

pub use transport::{create_memory_transport, create_transport, MemoryTransport};

#[cfg(feature = "transport-lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    BrokerChannel,
    BrokerConnection,
    BrokerHandle,
    ConnectionEvent,
    ConsumeOptions,
    DeliveryStream,
    ExchangeKind,
    ExchangeOptions,
    InboundMessage,
    MessageAcker,
    PublishProperties,
    QueueOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
