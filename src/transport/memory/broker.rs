// src/transport/memory/broker.rs

//! Broker state and primitive operations for the in-memory transport.
//!
//! One [`BrokerCore`] plays the part of the broker process: it owns the
//! exchanges, queues, and bindings shared by every connection the transport
//! dials. Connections and channels are thin views onto that state with their
//! own open/closed flags.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{
    //
    log_debug,
    BrokerChannel,
    BrokerConnection,
    ConnectionEvent,
    ConsumeOptions,
    DeliveryStream,
    Error,
    ExchangeKind,
    ExchangeOptions,
    InboundMessage,
    MessageAcker,
    QueueOptions,
    Result,
};

pub(super) struct BrokerCore {
    pub(super) inner: RwLock<BrokerInner>,
    next_id: AtomicU64,
}

#[derive(Default)]
pub(super) struct BrokerInner {
    pub(super) exchanges: HashMap<String, ExchangeEntry>,
    pub(super) queues: HashMap<String, QueueEntry>,
    pub(super) bindings: Vec<Binding>,
    /// Event senders of live connections, for fault injection.
    pub(super) links: Vec<(u64, mpsc::Sender<ConnectionEvent>)>,
}

pub(super) struct ExchangeEntry {
    pub(super) kind: ExchangeKind,
}

#[derive(Default)]
pub(super) struct QueueEntry {
    consumers: Vec<Consumer>,
    pub(super) ready: VecDeque<StoredDelivery>,
    cursor: usize,
}

struct Consumer {
    id: u64,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

pub(super) struct Binding {
    pub(super) queue: String,
    pub(super) exchange: String,
    pub(super) routing_key: String,
}

#[derive(Clone)]
pub(super) struct StoredDelivery {
    payload: Bytes,
    exchange: String,
    routing_key: String,
    correlation_id: Option<String>,
    reply_to: Option<String>,
}

impl BrokerCore {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(BrokerInner::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Deliver to one queue: hand the message to a live consumer round-robin,
/// or buffer it until a consumer registers.
fn deliver(core: &Arc<BrokerCore>, inner: &mut BrokerInner, queue: &str, delivery: StoredDelivery) {
    let Some(entry) = inner.queues.get_mut(queue) else {
        return;
    };

    loop {
        entry.consumers.retain(|consumer| !consumer.tx.is_closed());

        if entry.consumers.is_empty() {
            entry.ready.push_back(delivery);
            return;
        }

        let index = entry.cursor % entry.consumers.len();
        entry.cursor = entry.cursor.wrapping_add(1);

        let message = make_message(core, queue, delivery.clone());
        if entry.consumers[index].tx.send(message).is_ok() {
            return;
        }
        entry.consumers.remove(index);
    }
}

fn make_message(core: &Arc<BrokerCore>, queue: &str, delivery: StoredDelivery) -> InboundMessage {
    let acker = MemoryAcker {
        core: Arc::downgrade(core),
        queue: queue.to_string(),
        delivery: Mutex::new(Some(delivery.clone())),
    };

    InboundMessage::new(
        delivery.payload,
        delivery.exchange,
        delivery.routing_key,
        delivery.correlation_id,
        delivery.reply_to,
        Arc::new(acker),
    )
}

/// Does `routing_key` reach a queue bound with `binding_key` on an exchange
/// of the given kind?
///
/// Headers exchanges are modeled as fanout: header-table matching is not
/// simulated here.
fn binding_matches(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct | ExchangeKind::Custom(_) => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` matches zero or
/// more words, words separated by `.`.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

//
// Acknowledgment
//

struct MemoryAcker {
    core: Weak<BrokerCore>,
    queue: String,
    delivery: Mutex<Option<StoredDelivery>>,
}

#[async_trait::async_trait]
impl MessageAcker for MemoryAcker {
    async fn ack(&self, _multiple: bool) -> Result<()> {
        self.delivery.lock().map(|mut d| d.take()).ok();
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<()> {
        let delivery = match self.delivery.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if requeue {
            if let (Some(core), Some(delivery)) = (self.core.upgrade(), delivery) {
                let mut inner = core.inner.write().await;
                deliver(&core, &mut inner, &self.queue, delivery);
            }
        }

        Ok(())
    }
}

//
// Connection
//

pub(super) struct MemoryConnection {
    core: Arc<BrokerCore>,
    link_id: u64,
    open: Arc<AtomicBool>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
}

impl MemoryConnection {
    pub(super) async fn open(core: Arc<BrokerCore>) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let link_id = core.next_id();

        {
            let mut inner = core.inner.write().await;
            inner.links.retain(|(_, tx)| !tx.is_closed());
            inner.links.push((link_id, events_tx.clone()));
        }

        let connection = Arc::new(Self {
            core,
            link_id,
            open: Arc::new(AtomicBool::new(true)),
            channels: Mutex::new(Vec::new()),
            events_tx,
        });

        (connection, events_rx)
    }
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection is closed".into()));
        }

        let channel = Arc::new(MemoryChannel {
            core: self.core.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
            consumers: Mutex::new(Vec::new()),
        });

        if let Ok(mut channels) = self.channels.lock() {
            channels.push(channel.clone());
        }

        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let channels: Vec<_> = match self.channels.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for channel in channels {
            channel.shutdown().await;
        }

        let _ = self.events_tx.try_send(ConnectionEvent::Closed);

        let mut inner = self.core.inner.write().await;
        inner.links.retain(|(id, _)| *id != self.link_id);

        Ok(())
    }
}

//
// Channel
//

pub(super) struct MemoryChannel {
    core: Arc<BrokerCore>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    /// (queue, consumer id) pairs registered through this channel.
    consumers: Mutex<Vec<(String, u64)>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Transport("channel is closed".into()));
        }
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection is closed".into()));
        }
        Ok(())
    }

    /// Cancel this channel's consumers and mark it closed.
    async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);

        let registered: Vec<_> = match self.consumers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if registered.is_empty() {
            return;
        }

        let mut inner = self.core.inner.write().await;
        for (queue, id) in registered {
            if let Some(entry) = inner.queues.get_mut(&queue) {
                entry.consumers.retain(|consumer| consumer.id != id);
            }
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Prefetch does not change in-process delivery; accepted for parity.
        self.ensure_open()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<()> {
        self.ensure_open()?;

        let mut inner = self.core.inner.write().await;
        match inner.exchanges.get(name) {
            Some(existing) if existing.kind != *kind => Err(Error::Transport(format!(
                "exchange \"{name}\" already declared as {}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                inner
                    .exchanges
                    .insert(name.to_string(), ExchangeEntry { kind: kind.clone() });
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, _options: &QueueOptions) -> Result<String> {
        self.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", &Uuid::new_v4().simple().to_string()[..12])
        } else {
            name.to_string()
        };

        let mut inner = self.core.inner.write().await;
        inner.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        let mut inner = self.core.inner.write().await;
        if !inner.queues.contains_key(queue) {
            return Err(Error::Transport(format!("no queue named \"{queue}\"")));
        }
        if !inner.exchanges.contains_key(exchange) {
            return Err(Error::Transport(format!("no exchange named \"{exchange}\"")));
        }

        let duplicate = inner.bindings.iter().any(|binding| {
            binding.queue == queue
                && binding.exchange == exchange
                && binding.routing_key == routing_key
        });
        if !duplicate {
            inner.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Bytes,
        properties: &crate::PublishProperties,
    ) -> Result<()> {
        self.ensure_open()?;

        let delivery = StoredDelivery {
            payload: payload.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            correlation_id: properties.correlation_id.clone(),
            reply_to: properties.reply_to.clone(),
        };

        let mut inner = self.core.inner.write().await;

        // Default exchange: route straight to the queue named by the key.
        if exchange.is_empty() {
            if inner.queues.contains_key(routing_key) {
                deliver(&self.core, &mut inner, routing_key, delivery);
            } else {
                log_debug!("dropping unroutable message for queue \"{routing_key}\"");
            }
            return Ok(());
        }

        let kind = match inner.exchanges.get(exchange) {
            Some(entry) => entry.kind.clone(),
            None => {
                return Err(Error::Transport(format!(
                    "no exchange named \"{exchange}\""
                )))
            }
        };

        let targets: Vec<String> = inner
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange
                    && binding_matches(&kind, &binding.routing_key, routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();

        for queue in targets {
            deliver(&self.core, &mut inner, &queue, delivery.clone());
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.core.next_id();

        {
            let mut inner = self.core.inner.write().await;
            let Some(entry) = inner.queues.get_mut(queue) else {
                return Err(Error::Transport(format!("no queue named \"{queue}\"")));
            };

            // Flush anything buffered while the queue had no consumer.
            let buffered: Vec<_> = entry.ready.drain(..).collect();
            entry.consumers.push(Consumer { id, tx: tx.clone() });
            for delivery in buffered {
                let message = make_message(&self.core, queue, delivery);
                let _ = tx.send(message);
            }
        }

        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.push((queue.to_string(), id));
        }

        Ok(DeliveryStream::new(rx))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;

        let mut inner = self.core.inner.write().await;
        if inner.queues.remove(name).is_none() {
            return Err(Error::Transport(format!("no queue named \"{name}\"")));
        }
        inner.bindings.retain(|binding| binding.queue != name);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;

        let mut inner = self.core.inner.write().await;
        if inner.exchanges.remove(name).is_none() {
            return Err(Error::Transport(format!("no exchange named \"{name}\"")));
        }
        inner.bindings.retain(|binding| binding.exchange != name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn topic_matching_single_word_wildcard() {
        // ---
        assert!(topic_matches("job.*", "job.created"));
        assert!(topic_matches("*.created", "job.created"));
        assert!(!topic_matches("job.*", "job.created.eu"));
        assert!(!topic_matches("job.*", "job"));
    }

    #[test]
    fn topic_matching_multi_word_wildcard() {
        // ---
        assert!(topic_matches("job.#", "job"));
        assert!(topic_matches("job.#", "job.created"));
        assert!(topic_matches("job.#", "job.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("job.#.eu", "job.created.eu"));
        assert!(!topic_matches("job.#.eu", "job.created.us"));
    }

    #[test]
    fn topic_matching_exact() {
        // ---
        assert!(topic_matches("job.created", "job.created"));
        assert!(!topic_matches("job.created", "job.removed"));
    }

    #[test]
    fn direct_and_fanout_binding_semantics() {
        // ---
        assert!(binding_matches(&ExchangeKind::Direct, "k", "k"));
        assert!(!binding_matches(&ExchangeKind::Direct, "k", "other"));
        assert!(binding_matches(&ExchangeKind::Fanout, "ignored", "other"));
    }
}
