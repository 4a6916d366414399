//! # Broker Trait
//!
//! Provider-agnostic broker collaborator. The rest of the crate holds an
//! `Arc<dyn Broker>` and never touches a client library directly.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::BrokerResult;
use super::types::{Delivery, ExchangeSpec, OutboundMessage, QueueSpec};

/// Stream of deliveries from a single queue
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare an exchange. Idempotent for identical declarations.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;

    /// Declare a queue. An existing queue with different arguments is a
    /// precondition failure.
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    /// Publish and wait for the broker to confirm the message
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BrokerResult<()>;

    /// Start consuming. The stream ends when the broker closes.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;

    async fn health_check(&self) -> BrokerResult<bool>;

    fn provider_name(&self) -> &'static str;
}
