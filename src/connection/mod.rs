// src/connection/mod.rs

//! Connection state machine.
//!
//! A [`Connection`] owns one logical broker connection: its status, the
//! current physical link (transport connection + channel), the outbound
//! publish queue, and every background task bound to the link. Status cycles
//! `Disconnected → Connecting → Connected → Disconnected` and is always
//! re-enterable; disconnection is never terminal unless the connection is
//! configured to exit the process on fatal errors.
//!
//! # Architecture
//!
//! The handle is cheap to clone (`Arc`-backed inner). All lifecycle
//! transitions are serialized behind an async operation lock, so observers
//! never see status values out of order. Each successful connect produces a
//! fresh *generation*: background tasks (the transport event listener,
//! consumer forwarders) remember the generation they were born under and
//! stand down once it is superseded, which keeps callbacks bound to a stale
//! physical connection from acting on a newer one.
//!
//! Resource declaration runs exactly once per Connected transition; the
//! per-cycle ready signal fires only after the whole declaration cycle has
//! succeeded. Consumers registered through [`Connection::subscribe`] or
//! [`Connection::rpc_consume`](crate::Connection::rpc_consume) are
//! re-established on every ready cycle, so their streams survive reconnects.

pub mod publish_queue;
pub mod rpc;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerChannel,
    BrokerConnection,
    ConnectionConfig,
    ConnectionEvent,
    ConsumeOptions,
    DeliveryStream,
    Error,
    PublishProperties,
    Result,
    SubscriptionHandle,
    TransportPtr,
};

use publish_queue::{OutboundMessage, PublishQueue};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The state protected by std mutexes in this module (link slot, listener
/// lists, in-flight correlation ids) has no invariants spanning multiple
/// fields; the worst outcome of ignoring a poison is a dropped notification.
/// This also avoids propagating non-`Send` poison errors across async
/// boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
        }
    }
}

/// One physical broker connection and everything bound to it.
///
/// Replaced wholesale on reconnect, never mutated in place.
struct Link {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    /// Tasks that must not outlive this link.
    tasks: Vec<JoinHandle<()>>,
}

struct ConnectionInner {
    name: String,
    config: ConnectionConfig,
    transport: TransportPtr,

    status_tx: watch::Sender<ConnectionStatus>,
    status_listeners: Mutex<Vec<mpsc::UnboundedSender<ConnectionStatus>>>,

    /// Generation of the last fully declared cycle (0 = never declared).
    declared_tx: watch::Sender<u64>,

    /// Bumped on every connect and disconnect; stale tasks compare and stop.
    generation: AtomicU64,

    link: Mutex<Option<Link>>,

    /// Serializes connect/disconnect/reconnect so status transitions are
    /// strictly sequential.
    op_lock: AsyncMutex<()>,

    queue: PublishQueue,

    /// Correlation ids of RPC calls currently awaiting replies.
    pub(crate) rpc_inflight: Mutex<HashSet<String>>,

    reconnecting: AtomicBool,
}

/// Running connection instance. Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection from its configuration.
    ///
    /// A missing name is replaced with a generated UUID. If the
    /// configuration asks for auto-connect, connecting starts immediately in
    /// the background. Must be called within a Tokio runtime.
    pub fn new(config: ConnectionConfig, transport: TransportPtr) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        log_debug!("instantiating connection \"{name}\"");

        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (declared_tx, _) = watch::channel(0u64);
        let (queue, buffered) = PublishQueue::new();

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                name,
                config,
                transport,
                status_tx,
                status_listeners: Mutex::new(Vec::new()),
                declared_tx,
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
                op_lock: AsyncMutex::new(()),
                queue,
                rpc_inflight: Mutex::new(HashSet::new()),
                reconnecting: AtomicBool::new(false),
            }),
        };

        connection.spawn_drain(buffered);

        if connection.inner.config.auto_connect {
            let auto = connection.clone();
            tokio::spawn(async move { auto.connect().await });
        }

        connection
    }

    /// Resolved connection name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration this connection was created from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch-style status receiver, for gating on the current value.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Lossless ordered status stream.
    ///
    /// The receiver is seeded with the current status, then gets every
    /// subsequent transition in order.
    pub fn observe_status(&self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = lock_ignore_poison(&self.inner.status_listeners);
        let _ = tx.send(*self.inner.status_tx.borrow());
        listeners.push(tx);
        rx
    }

    /// The outbound publish queue.
    pub fn queue(&self) -> &PublishQueue {
        &self.inner.queue
    }

    /// Wait until the current connected cycle has declared its resources.
    pub async fn wait_ready(&self) -> Result<()> {
        self.ready_cycle(0).await.map(|_| ())
    }

    //
    // Lifecycle
    //

    /// Connect to the broker.
    ///
    /// Completes when the attempt concludes. A failed attempt does not
    /// return an error: it is logged and observed through the status stream,
    /// which transitions back to `Disconnected`.
    pub async fn connect(&self) {
        let _guard = self.inner.op_lock.lock().await;
        if self.status() == ConnectionStatus::Connected {
            return;
        }
        let _ = self.try_connect().await;
    }

    /// Disconnect from the broker.
    ///
    /// Cancels every task bound to the current link, transitions to
    /// `Disconnected`, and closes channel then connection, suppressing and
    /// logging closure errors. Afterwards the configured policy applies:
    /// process exit on `exit_on_fatal_error`, a scheduled reconnect on
    /// `auto_reconnect`, passive idle otherwise. Broker resources are left
    /// in place.
    pub async fn disconnect(&self) {
        let _guard = self.inner.op_lock.lock().await;
        self.disconnect_and_apply_policy().await;
    }

    /// Reconnect: disconnect, then connect, resolving only once status has
    /// reached `Connected` again.
    ///
    /// Attempts are retried under the configured [`ReconnectPolicy`]
    /// (exponential backoff with jitter); the last connect error is returned
    /// once the policy is exhausted.
    ///
    /// [`ReconnectPolicy`]: crate::ReconnectPolicy
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;

        let policy = self.inner.config.reconnect.clone();
        let mut attempt = 0u32;
        let mut delay = policy.initial_delay;

        loop {
            self.do_disconnect().await;

            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt > policy.max_attempts {
                        return Err(err);
                    }

                    let wait = policy.jittered(delay);
                    log_debug!(
                        "reconnect attempt {attempt}/{} for \"{}\" failed, next try in {wait:?}",
                        policy.max_attempts,
                        self.inner.name,
                    );
                    tokio::time::sleep(wait).await;
                    delay = policy.next_delay(delay);
                }
            }
        }
    }

    /// Delete every configured queue, then the exchange.
    ///
    /// Explicit administrative cleanup; waits for a live link like any other
    /// channel operation. Per-deletion errors are swallowed so one missing
    /// resource does not block the rest.
    pub async fn tear_down(&self) -> Result<()> {
        let (_, channel) = self.wait_link().await?;

        log_debug!("tearing down broker resources for connection \"{}\"", self.inner.name);

        for queue in &self.inner.config.queues {
            if let Err(err) = channel.delete_queue(&queue.name).await {
                log_debug!("queue \"{}\" deletion skipped: {err}", queue.name);
            }
        }

        let exchange = &self.inner.config.exchange.name;
        if let Err(err) = channel.delete_exchange(exchange).await {
            log_debug!("exchange \"{exchange}\" deletion skipped: {err}");
        }

        Ok(())
    }

    /// Subscribe to a queue.
    ///
    /// Waits until the connection is ready (resources declared), registers a
    /// consumer, and returns a handle whose inbox survives reconnects: on
    /// every later ready cycle the consumer is registered again and keeps
    /// feeding the same inbox. Dropping the handle ends the subscription.
    pub async fn subscribe(&self, queue: impl Into<String>) -> Result<SubscriptionHandle> {
        let queue = queue.into();

        let mut cycle = self.ready_cycle(0).await?;
        let mut stream = loop {
            match self.consume_on_current(&queue).await {
                Ok(stream) => break stream,
                Err(err) => {
                    log_error!("consumer setup failed on queue \"{queue}\": {err}");
                    cycle = self.ready_cycle(cycle).await?;
                }
            }
        };

        let (tx, inbox) = mpsc::channel(64);
        let connection = self.clone();

        tokio::spawn(async move {
            loop {
                // Forward until the link dies or the subscriber goes away.
                loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        message = stream.recv() => match message {
                            Some(message) => {
                                if tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }

                // Link is gone; re-register on the next ready cycle.
                loop {
                    cycle = tokio::select! {
                        _ = tx.closed() => return,
                        next = connection.ready_cycle(cycle) => match next {
                            Ok(next) => next,
                            Err(_) => return,
                        },
                    };

                    match connection.consume_on_current(&queue).await {
                        Ok(next_stream) => {
                            stream = next_stream;
                            break;
                        }
                        Err(err) => {
                            log_warn!("consumer re-registration failed on \"{queue}\": {err}");
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle { inbox })
    }

    //
    // Internals
    //

    async fn try_connect(&self) -> Result<()> {
        let config = &self.inner.config;
        let name = &self.inner.name;

        self.set_status(ConnectionStatus::Connecting);

        let handle = match self
            .inner
            .transport
            .connect(&config.url, config.connect_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                log_error!("connection \"{name}\" failed to reach broker: {err}");
                self.set_status(ConnectionStatus::Disconnected);
                return Err(err);
            }
        };

        let channel = match handle.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                log_error!("connection \"{name}\" failed to open a channel: {err}");
                let _ = handle.connection.close().await;
                self.set_status(ConnectionStatus::Disconnected);
                return Err(err);
            }
        };

        if let Err(err) = channel.set_prefetch(config.prefetch).await {
            log_error!("connection \"{name}\" failed to apply prefetch: {err}");
            let _ = channel.close().await;
            let _ = handle.connection.close().await;
            self.set_status(ConnectionStatus::Disconnected);
            return Err(err);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = self.spawn_event_listener(handle.events, generation);

        {
            let mut link = lock_ignore_poison(&self.inner.link);
            *link = Some(Link {
                connection: handle.connection,
                channel: channel.clone(),
                generation,
                tasks: vec![listener],
            });
        }

        self.set_status(ConnectionStatus::Connected);

        // Declaration failures abort the cycle and are observed through the
        // missing ready signal, not re-raised to the connect caller.
        match self.declare_resources(channel.as_ref()).await {
            Ok(()) => {
                self.inner.declared_tx.send_replace(generation);
                log_info!("connection \"{name}\" is ready");
            }
            Err(err) => {
                log_error!("resource declaration failed for connection \"{name}\": {err}");
            }
        }

        Ok(())
    }

    /// Assert the exchange, then each bound queue and its binding.
    ///
    /// Strictly sequential; the first failure aborts the remaining
    /// declarations for this cycle.
    async fn declare_resources(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let config = &self.inner.config;
        let name = &self.inner.name;

        log_debug!("declaring broker resources for connection \"{name}\"");

        channel
            .declare_exchange(
                &config.exchange.name,
                &config.exchange.kind,
                &config.exchange.options,
            )
            .await?;

        for queue in &config.queues {
            if !queue.create_bindings {
                continue;
            }

            channel.declare_queue(&queue.name, &queue.options).await?;
            channel
                .bind_queue(&queue.name, &config.exchange.name, &queue.routing_key)
                .await?;

            log_debug!("declared and bound queue \"{}\" for connection \"{name}\"", queue.name);
        }

        Ok(())
    }

    /// Disconnect sequence plus the configured aftermath (exit / reconnect).
    /// Caller must hold the operation lock.
    async fn disconnect_and_apply_policy(&self) {
        self.do_disconnect().await;

        if self.inner.config.exit_on_fatal_error {
            log_error!(
                "exiting: exit_on_fatal_error is set and connection \"{}\" is down",
                self.inner.name
            );
            std::process::exit(1);
        } else if self.inner.config.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    /// The bare disconnect sequence: invalidate the generation, cancel link
    /// tasks, transition, close channel then connection best-effort.
    async fn do_disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let link = lock_ignore_poison(&self.inner.link).take();

        let Some(link) = link else {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };

        for task in &link.tasks {
            task.abort();
        }

        self.set_status(ConnectionStatus::Disconnected);

        if let Err(err) = link.channel.close().await {
            log_debug!("channel closure suppressed for \"{}\": {err}", self.inner.name);
        }
        if let Err(err) = link.connection.close().await {
            log_debug!("connection closure suppressed for \"{}\": {err}", self.inner.name);
        }
    }

    /// Disconnect triggered by a transport fault, guarded by generation so a
    /// stale event cannot tear down a newer link.
    async fn fault_disconnect(&self, generation: u64) {
        let _guard = self.inner.op_lock.lock().await;

        let current = lock_ignore_poison(&self.inner.link)
            .as_ref()
            .map(|link| link.generation);
        if current != Some(generation) {
            return;
        }

        self.disconnect_and_apply_policy().await;
    }

    fn schedule_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        log_info!("scheduling reconnect for connection \"{}\"", self.inner.name);

        let connection = self.clone();
        tokio::spawn(async move {
            let result = connection.reconnect().await;
            connection.inner.reconnecting.store(false, Ordering::SeqCst);
            if let Err(err) = result {
                log_error!(
                    "auto-reconnect gave up for connection \"{}\": {err}",
                    connection.inner.name
                );
            }
        });
    }

    fn spawn_event_listener(
        &self,
        mut events: mpsc::Receiver<ConnectionEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let connection = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if connection.inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }

                match event {
                    ConnectionEvent::Unblocked => {
                        log_debug!(
                            "broker reports unblocked for connection \"{}\"",
                            connection.inner.name
                        );
                    }
                    event => {
                        log_debug!(
                            "broker reports {event} for connection \"{}\"",
                            connection.inner.name
                        );
                        // Run the disconnect outside this task: disconnect
                        // aborts the link tasks, and this listener is one of
                        // them.
                        let faulted = connection.clone();
                        tokio::spawn(async move { faulted.fault_disconnect(generation).await });
                        break;
                    }
                }
            }
        })
    }

    fn spawn_drain(&self, mut buffered: mpsc::UnboundedReceiver<OutboundMessage>) {
        let weak = Arc::downgrade(&self.inner);
        let mut status_rx = self.inner.status_tx.subscribe();
        let mut declared_rx = self.inner.declared_tx.subscribe();
        let pending = self.inner.queue.pending();

        /// Drain only while the current cycle is Connected *and* declared:
        /// publishing before declaration would race the exchange assert.
        fn gate_open(inner: &ConnectionInner) -> bool {
            let declared = *inner.declared_tx.borrow();
            declared != 0
                && declared == inner.generation.load(Ordering::SeqCst)
                && *inner.status_tx.borrow() == ConnectionStatus::Connected
        }

        tokio::spawn(async move {
            let mut retained: Option<OutboundMessage> = None;

            loop {
                // Park until the gate opens.
                loop {
                    match weak.upgrade() {
                        Some(inner) if gate_open(&inner) => break,
                        Some(_) => {}
                        None => return,
                    }
                    tokio::select! {
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        changed = declared_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }

                let mut message = match retained.take() {
                    Some(message) => message,
                    None => match buffered.recv().await {
                        Some(message) => message,
                        None => return,
                    },
                };

                // The gate may have closed while waiting for a message.
                let channel = match weak.upgrade() {
                    Some(inner) if gate_open(&inner) => lock_ignore_poison(&inner.link)
                        .as_ref()
                        .map(|link| link.channel.clone()),
                    Some(_) => None,
                    None => return,
                };
                let Some(channel) = channel else {
                    retained = Some(message);
                    tokio::task::yield_now().await;
                    continue;
                };

                match channel
                    .publish(
                        &message.exchange,
                        &message.routing_key,
                        &message.payload,
                        &PublishProperties::default(),
                    )
                    .await
                {
                    Ok(()) => {
                        pending.fetch_sub(1, Ordering::SeqCst);
                        if let Some(confirm) = message.confirm.take() {
                            let _ = confirm.send(true);
                        }
                    }
                    Err(err) => {
                        log_warn!("publish failed, message retained for redelivery: {err}");
                        retained = Some(message);
                        tokio::select! {
                            _ = status_rx.changed() => {}
                            _ = declared_rx.changed() => {}
                        }
                    }
                }
            }
        });
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if !changed {
            return;
        }

        log_debug!("connection \"{}\" status changed to {status}", self.inner.name);

        let mut listeners = lock_ignore_poison(&self.inner.status_listeners);
        listeners.retain(|tx| tx.send(status).is_ok());
    }

    /// Wait for a ready cycle newer than `last_seen` (0 = any) and return
    /// its generation.
    ///
    /// A cycle counts as ready only while its declaration is current: a
    /// ready signal left over from a superseded link does not open the gate.
    async fn ready_cycle(&self, last_seen: u64) -> Result<u64> {
        let mut declared_rx = self.inner.declared_tx.subscribe();

        loop {
            let declared = *declared_rx.borrow();
            if declared != 0
                && declared != last_seen
                && declared == self.inner.generation.load(Ordering::SeqCst)
                && self.status() == ConnectionStatus::Connected
            {
                return Ok(declared);
            }

            declared_rx
                .changed()
                .await
                .map_err(|_| Error::NotConnected)?;
        }
    }

    /// Wait until Connected and return the live link parts.
    async fn wait_link(&self) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let mut status_rx = self.inner.status_tx.subscribe();

        loop {
            if *status_rx.borrow() == ConnectionStatus::Connected {
                let parts = lock_ignore_poison(&self.inner.link)
                    .as_ref()
                    .map(|link| (link.connection.clone(), link.channel.clone()));
                if let Some(parts) = parts {
                    return Ok(parts);
                }
            }

            status_rx.changed().await.map_err(|_| Error::NotConnected)?;
        }
    }

    fn link_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        lock_ignore_poison(&self.inner.link)
            .as_ref()
            .map(|link| link.channel.clone())
    }

    async fn consume_on_current(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self.link_channel().ok_or(Error::NotConnected)?;
        let tag = format!("{}-{queue}", self.inner.name);
        channel
            .consume(queue, &tag, &ConsumeOptions::default())
            .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("pending_publishes", &self.inner.queue.len())
            .finish()
    }
}
