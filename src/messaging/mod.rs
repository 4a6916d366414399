//! # Messaging
//!
//! The broker collaborator: a provider-agnostic [`Broker`] trait, the
//! [`EventEnvelope`] carried in message headers, and two providers.
//!
//! - [`RabbitMqBroker`]: production provider over `lapin`
//! - [`InMemoryBroker`]: tests and local development

pub mod broker;
pub mod envelope;
pub mod errors;
pub mod in_memory;
pub mod rabbitmq;
pub mod types;

pub use broker::{Broker, DeliveryStream};
pub use envelope::{header_keys, EventEnvelope};
pub use errors::{BrokerError, BrokerResult};
pub use in_memory::{BrokerEvent, InMemoryBroker, PublishedMessage};
pub use rabbitmq::{RabbitMqBroker, RabbitMqSettings};
pub use types::{
    Delivery, ExchangeKind, ExchangeSpec, Headers, OutboundMessage, QueueSpec, ReceiptHandle,
};
