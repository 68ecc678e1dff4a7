// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This transport simulates a message broker entirely within the process and
//! is the **reference implementation** of the transport contract: the
//! lifecycle layers are tested against it, and other transports are expected
//! to approximate its behavior as closely as their underlying systems allow.
//!
//! ## Semantics
//!
//! - All connections dialed through one `MemoryTransport` share one broker
//!   (exchanges, queues, bindings survive reconnects, as they do on a real
//!   broker).
//! - Direct, topic (with `*`/`#` wildcards), and fanout routing are modeled;
//!   headers exchanges fan out (header-table matching is not simulated).
//! - A queue delivers each message to exactly one consumer, round-robin;
//!   messages published while a queue has no consumer are buffered and
//!   flushed to the first consumer that registers.
//! - `nack(requeue: true)` redelivers; acknowledgments are otherwise
//!   bookkeeping only.
//!
//! ## Non-goals
//!
//! - Persistence or durability
//! - Network behavior beyond the reachability toggle below
//! - Redelivery of unacknowledged messages on channel close
//!
//! ## Test hooks
//!
//! [`MemoryTransport::set_reachable`] makes subsequent dials fail, and
//! [`MemoryTransport::fail_connections`] injects a fault signal into every
//! live connection, for exercising the disconnect/reconnect paths.

mod broker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker::{BrokerCore, MemoryConnection};

use crate::{BrokerHandle, ConnectionEvent, Error, Result, Transport, TransportPtr};

/// In-memory transport; one instance is one broker.
pub struct MemoryTransport {
    core: Arc<BrokerCore>,
    reachable: AtomicBool,
}

impl MemoryTransport {
    /// Create a new broker.
    ///
    /// The concrete type is returned (rather than [`TransportPtr`]) so tests
    /// can keep hold of the inspection and fault-injection hooks; it coerces
    /// to `TransportPtr` wherever a transport is expected.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: BrokerCore::new(),
            reachable: AtomicBool::new(true),
        })
    }

    /// Make subsequent [`connect`](Transport::connect) calls succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Inject a fault signal into every live connection.
    pub async fn fail_connections(&self, reason: &str) {
        use tokio::sync::mpsc::error::TrySendError;

        let mut inner = self.core.inner.write().await;
        inner.links.retain(|(_, tx)| {
            match tx.try_send(ConnectionEvent::Errored(reason.to_string())) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Does the broker currently know this exchange?
    pub async fn exchange_exists(&self, name: &str) -> bool {
        self.core.inner.read().await.exchanges.contains_key(name)
    }

    /// Does the broker currently know this queue?
    pub async fn queue_exists(&self, name: &str) -> bool {
        self.core.inner.read().await.queues.contains_key(name)
    }

    /// Number of messages buffered in a queue awaiting a consumer.
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.core
            .inner
            .read()
            .await
            .queues
            .get(name)
            .map(|entry| entry.ready.len())
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<BrokerHandle> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("broker at {url} is unreachable")));
        }

        let (connection, events) = MemoryConnection::open(self.core.clone()).await;
        Ok(BrokerHandle { connection, events })
    }
}

/// Create a new in-memory transport.
///
/// Always available; requires no external resources.
pub fn create_transport() -> TransportPtr {
    MemoryTransport::new()
}
