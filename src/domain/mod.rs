// src/domain/mod.rs

//! Domain abstractions shared by the lifecycle layers.
//!
//! These modules define the contract between the connection state machine
//! and whatever actually talks to a broker. They carry no protocol or
//! client-library types; concrete implementations live under
//! `src/transport/`.

mod message;
mod transport;

pub use message::{DeliveryStream, InboundMessage, MessageAcker, SubscriptionHandle};
pub use transport::{
    //
    BrokerChannel,
    BrokerConnection,
    BrokerHandle,
    ConnectionEvent,
    ConsumeOptions,
    ExchangeKind,
    ExchangeOptions,
    PublishProperties,
    QueueOptions,
    Transport,
    TransportPtr,
};
