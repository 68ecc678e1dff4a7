// src/transport/lapin.rs

//! AMQP transport implementation using `lapin`.
//!
//! This is the production implementation of the transport contract. It is a
//! thin mapping layer: each trait method corresponds to one lapin call, with
//! lapin errors converted to [`Error::Transport`] at the boundary so no
//! client-library types escape.
//!
//! ## Connection behavior
//!
//! Each [`connect`](Transport::connect) call dials a fresh physical
//! connection, bounded by the caller's timeout. lapin's error callback is
//! wired into the [`ConnectionEvent`] stream so the connection state machine
//! observes broker-side failures the same way it does with the in-memory
//! transport.
//!
//! ## Consumer tasks
//!
//! Each `consume()` spawns a forward task that drains the lapin consumer
//! stream into a [`DeliveryStream`]. The task ends when the channel is
//! closed (the stream terminates) or the receiving side is dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        ExchangeDeleteOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};
use tokio::sync::mpsc;

use crate::{
    //
    log_debug,
    log_error,
    BrokerChannel,
    BrokerConnection,
    BrokerHandle,
    ConnectionEvent,
    ConsumeOptions,
    DeliveryStream,
    Error,
    ExchangeKind,
    ExchangeOptions,
    InboundMessage,
    MessageAcker,
    PublishProperties,
    QueueOptions,
    Result,
    Transport,
    TransportPtr,
};

fn transport_err(err: lapin::Error) -> Error {
    Error::Transport(err.to_string())
}

/// Lapin-backed AMQP transport.
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> TransportPtr {
        Arc::new(Self)
    }
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, url: &str, timeout: Duration) -> Result<BrokerHandle> {
        // ---
        log_debug!("connecting to AMQP broker: {url}");

        let connecting = Connection::connect(url, ConnectionProperties::default());
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| {
                Error::Transport(format!("connection attempt timed out after {timeout:?}"))
            })?
            .map_err(transport_err)?;

        let (events_tx, events) = mpsc::channel(8);
        connection.on_error(move |err| {
            let _ = events_tx.try_send(ConnectionEvent::Errored(err.to_string()));
        });

        Ok(BrokerHandle {
            connection: Arc::new(LapinBrokerConnection { connection }),
            events,
        })
    }
}

struct LapinBrokerConnection {
    connection: Connection,
}

#[async_trait::async_trait]
impl BrokerConnection for LapinBrokerConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(transport_err)?;
        Ok(Arc::new(LapinBrokerChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "closing")
            .await
            .map_err(transport_err)
    }
}

struct LapinBrokerChannel {
    channel: Channel,
}

#[async_trait::async_trait]
impl BrokerChannel for LapinBrokerChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(transport_err)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Custom(custom) => lapin::ExchangeKind::Custom(custom.clone()),
        };

        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Bytes,
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default();
        if let Some(correlation_id) = &properties.correlation_id {
            props = props.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(reply_to) = &properties.reply_to {
            props = props.with_reply_to(reply_to.clone().into());
        }
        if let Some(content_type) = &properties.content_type {
            props = props.with_content_type(content_type.clone().into());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload.as_ref(),
                props,
            )
            .await
            .map_err(transport_err)?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let properties = &delivery.properties;
                        let correlation_id = properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string());
                        let reply_to = properties
                            .reply_to()
                            .as_ref()
                            .map(|queue| queue.as_str().to_string());

                        let message = InboundMessage::new(
                            Bytes::from(delivery.data),
                            delivery.exchange.as_str().to_string(),
                            delivery.routing_key.as_str().to_string(),
                            correlation_id,
                            reply_to,
                            Arc::new(LapinAcker {
                                acker: delivery.acker,
                            }),
                        );

                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        log_error!("consumer stream error on queue \"{queue}\": {err}");
                        break;
                    }
                }
            }

            log_debug!("consumer task ended for queue \"{queue}\"");
        });

        Ok(DeliveryStream::new(rx))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(transport_err)?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(transport_err)
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(transport_err)
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait::async_trait]
impl MessageAcker for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(transport_err)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(transport_err)
    }
}
