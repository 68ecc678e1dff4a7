// src/connection/rpc.rs

//! Request/response semantics over the fire-and-forget transport.
//!
//! Two independent halves:
//!
//! - [`Connection::rpc_call`] publishes a request and waits for the single
//!   reply, correlated through a broker-named reply queue created for that
//!   one call.
//! - [`Connection::rpc_consume`] serves a request queue with a typed async
//!   handler, publishing each result back to the request's reply-to address
//!   under its correlation id.
//!
//! Correlation ids are the sole mechanism tying a call to its reply; the
//! per-call reply queue keeps concurrent callers on one request queue from
//! ever seeing each other's replies. The connection additionally refuses to
//! issue a call whose correlation id is still in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time;

use crate::{
    //
    log_debug,
    log_error,
    log_warn,
    BrokerChannel,
    BrokerConnection,
    ConsumeOptions,
    CorrelationId,
    Error,
    InboundMessage,
    PublishProperties,
    QueueOptions,
    Result,
};

use super::{lock_ignore_poison, Connection, ConnectionInner};

/// Default window an RPC call waits for its reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// One RPC request. Lives only for the duration of the call.
pub struct RpcCall {
    /// Queue the responder consumes from.
    pub queue: String,

    /// Raw request payload.
    pub payload: Bytes,

    /// Correlation id; generated when absent.
    pub correlation_id: Option<CorrelationId>,

    /// Reply window; [`DEFAULT_RPC_TIMEOUT`] when absent.
    pub timeout: Option<Duration>,
}

impl RpcCall {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            correlation_id: None,
            timeout: None,
        }
    }

    /// Build a call with a JSON-serialized payload.
    pub fn json<T: Serialize>(queue: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(queue, serde_json::to_vec(value)?))
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Releases an in-flight correlation id when the call completes, times out,
/// or is dropped mid-flight.
struct InflightGuard {
    inner: Arc<ConnectionInner>,
    correlation_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        lock_ignore_poison(&self.inner.rpc_inflight).remove(&self.correlation_id);
    }
}

impl Connection {
    /// Perform an RPC call and return the reply.
    ///
    /// Waits for a live link, opens a short-lived channel, declares a
    /// broker-named auto-delete reply queue, starts consuming it, then
    /// publishes the request to `call.queue` (default exchange) carrying the
    /// correlation id and reply-to address. The single reply is raced
    /// against the call's timeout; the temporary channel is closed on every
    /// outcome, including timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::RpcTimeout`] — no reply arrived within the window
    /// - [`Error::CorrelationInUse`] — the supplied correlation id belongs
    ///   to a call still awaiting its reply
    /// - [`Error::Transport`] — channel setup or publish failed
    pub async fn rpc_call(&self, call: RpcCall) -> Result<InboundMessage> {
        let (connection, _) = self.wait_link().await?;

        let correlation_id = call
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);

        let _guard = self.reserve_correlation(&correlation_id)?;

        log_debug!(
            "sending rpc call to \"{}\" with correlation id {correlation_id} on connection \"{}\"",
            call.queue,
            self.name(),
        );

        let channel = connection.create_channel().await?;
        let outcome = self.rpc_exchange(channel.as_ref(), &call, &correlation_id).await;
        let _ = channel.close().await;
        outcome
    }

    /// The call body, separated so the temporary channel is closed on every
    /// exit path by the caller.
    async fn rpc_exchange(
        &self,
        channel: &dyn BrokerChannel,
        call: &RpcCall,
        correlation_id: &CorrelationId,
    ) -> Result<InboundMessage> {
        let reply_queue = channel.declare_queue("", &QueueOptions::rpc_reply()).await?;

        // Consumer first, publish second: the reply must never race a
        // not-yet-registered consumer.
        let tag = format!("{}-rpc-{reply_queue}", self.name());
        let mut replies = channel
            .consume(&reply_queue, &tag, &ConsumeOptions::default())
            .await?;

        let properties = PublishProperties {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_queue),
            content_type: Some("application/json".into()),
        };
        channel
            .publish("", &call.queue, &call.payload, &properties)
            .await?;

        let window = call.timeout.unwrap_or(DEFAULT_RPC_TIMEOUT);
        match time::timeout(window, replies.recv()).await {
            Ok(Some(reply)) => {
                let _ = reply.ack().await;
                Ok(reply)
            }
            Ok(None) => Err(Error::Transport(
                "reply stream closed before a response arrived".into(),
            )),
            Err(_) => Err(Error::RpcTimeout),
        }
    }

    /// Serve RPC requests arriving on `queue` with an async handler.
    ///
    /// Waits until the connection is ready, declares the (auto-delete)
    /// request queue, and consumes it. Each request is handled in its own
    /// task: the handler result is serialized as JSON, published to the
    /// request's reply-to address under the original correlation id, and the
    /// request is acknowledged once the reply is on its way. Requests
    /// without a reply-to address, and requests whose handler fails, are
    /// rejected without requeue and logged.
    ///
    /// Returns once the consumer is registered; like
    /// [`subscribe`](Connection::subscribe), the consumer is re-registered
    /// on every later ready cycle.
    pub async fn rpc_consume<F, Fut, Resp>(
        &self,
        queue: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        let queue = queue.into();
        let handler = Arc::new(handler);

        let mut cycle = self.ready_cycle(0).await?;
        let consumer = loop {
            match self.rpc_consumer_on_current(&queue).await {
                Ok(consumer) => break consumer,
                Err(err) => {
                    log_error!("rpc consumer setup failed on queue \"{queue}\": {err}");
                    cycle = self.ready_cycle(cycle).await?;
                }
            }
        };

        log_debug!("rpc consuming queue \"{queue}\" on connection \"{}\"", self.name());

        let connection = self.clone();
        tokio::spawn(async move {
            let mut current = consumer;

            loop {
                let (channel, mut stream) = current;

                while let Some(request) = stream.recv().await {
                    let channel = channel.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        respond(channel.as_ref(), request, handler.as_ref()).await;
                    });
                }

                // Link is gone; re-register on the next ready cycle.
                current = loop {
                    cycle = match connection.ready_cycle(cycle).await {
                        Ok(next) => next,
                        Err(_) => return,
                    };

                    match connection.rpc_consumer_on_current(&queue).await {
                        Ok(next) => break next,
                        Err(err) => {
                            log_warn!("rpc consumer re-registration failed on \"{queue}\": {err}");
                        }
                    }
                };
            }
        });

        Ok(())
    }

    async fn rpc_consumer_on_current(
        &self,
        queue: &str,
    ) -> Result<(Arc<dyn BrokerChannel>, crate::DeliveryStream)> {
        let channel = self.link_channel().ok_or(Error::NotConnected)?;

        let options = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        channel.declare_queue(queue, &options).await?;

        let tag = format!("{}-rpc-{queue}", self.name());
        let stream = channel
            .consume(queue, &tag, &ConsumeOptions::default())
            .await?;

        Ok((channel, stream))
    }

    fn reserve_correlation(&self, correlation_id: &CorrelationId) -> Result<InflightGuard> {
        let key = correlation_id.to_string();
        let mut inflight = lock_ignore_poison(&self.inner.rpc_inflight);

        if !inflight.insert(key.clone()) {
            return Err(Error::CorrelationInUse(key));
        }

        Ok(InflightGuard {
            inner: self.inner.clone(),
            correlation_id: key,
        })
    }
}

/// Handle one request: run the handler, publish the reply, acknowledge.
async fn respond<F, Fut, Resp>(channel: &dyn BrokerChannel, request: InboundMessage, handler: &F)
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp>> + Send,
    Resp: Serialize + Send,
{
    let Some(reply_to) = request.reply_to.clone() else {
        log_error!("rejecting rpc request without a reply-to address");
        let _ = request.nack(false).await;
        return;
    };
    let correlation_id = request.correlation_id.clone();

    let reply = match handler(request.clone()).await {
        Ok(reply) => reply,
        Err(err) => {
            log_error!("rpc handler failed: {err}");
            let _ = request.nack(false).await;
            return;
        }
    };

    let payload = match serde_json::to_vec(&reply) {
        Ok(payload) => Bytes::from(payload),
        Err(err) => {
            log_error!("rpc reply serialization failed: {err}");
            let _ = request.nack(false).await;
            return;
        }
    };

    let properties = PublishProperties {
        correlation_id,
        reply_to: None,
        content_type: Some("application/json".into()),
    };

    if let Err(err) = channel.publish("", &reply_to, &payload, &properties).await {
        log_error!("failed to publish rpc reply to \"{reply_to}\": {err}");
        let _ = request.nack(true).await;
        return;
    }

    let _ = request.ack().await;
}
