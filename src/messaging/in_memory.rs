//! # In-Memory Broker
//!
//! Thread-safe in-memory broker for testing and local development.
//!
//! ## Features
//!
//! - **Exchange routing**: topic (`*`, `#`) and direct exchanges, plus the
//!   default exchange which routes by queue name
//! - **Expiry emulation**: messages with a per-message expiration, or sitting
//!   in a queue with `message_ttl`, wait in FIFO order and only expire at the
//!   head of the queue, as RabbitMQ does. Expired messages are re-routed
//!   through the queue's dead-letter exchange, or dropped without one.
//! - **Outage simulation**: [`InMemoryBroker::set_available`] makes publishes fail
//! - **Inspection**: publish log, ack/nack journal and queue draining for assertions

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::broker::{Broker, DeliveryStream};
use super::errors::{BrokerError, BrokerResult};
use super::types::{
    Delivery, ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec, ReceiptHandle,
};
use crate::registry::topic_matches;

/// Observable broker activity, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Published {
        exchange: String,
        routing_key: String,
        message_id: Option<String>,
    },
    Acked {
        queue: String,
        delivery_tag: u64,
    },
    Nacked {
        queue: String,
        delivery_tag: u64,
        requeue: bool,
    },
}

/// A message accepted by [`InMemoryBroker::publish`]
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

struct InMemoryQueue {
    spec: QueueSpec,
    sender: mpsc::UnboundedSender<Delivery>,
    /// Present until a consumer attaches
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

struct ExpiringMessage {
    expires_at: tokio::time::Instant,
    routing_key: String,
    message: OutboundMessage,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, InMemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Delivery>,
    published: Vec<PublishedMessage>,
    journal: Vec<BrokerEvent>,
    /// Messages waiting to expire, per queue, in arrival order
    delayed: HashMap<String, VecDeque<ExpiringMessage>>,
}

struct Inner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    closed: AtomicBool,
    next_tag: AtomicU64,
}

/// In-memory [`Broker`] implementation. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("available", &self.inner.available.load(Ordering::SeqCst))
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`) for publishes
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Every message accepted so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().published.clone()
    }

    /// Messages accepted on one exchange
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.inner
            .state
            .lock()
            .published
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn journal(&self) -> Vec<BrokerEvent> {
        self.inner.state.lock().journal.clone()
    }

    /// Drain ready messages from a queue nobody consumes (e.g. a DLQ)
    pub fn take_messages(&self, queue: &str) -> Vec<Delivery> {
        let mut state = self.inner.state.lock();
        let mut taken = Vec::new();
        if let Some(receiver) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.receiver.as_mut())
        {
            while let Ok(delivery) = receiver.try_recv() {
                taken.push(delivery);
            }
        }
        for delivery in &taken {
            state.unacked.remove(&delivery.receipt.delivery_tag());
        }
        taken
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.spec.clone())
    }

    pub fn exchange_spec(&self, exchange: &str) -> Option<ExchangeSpec> {
        self.inner.state.lock().exchanges.get(exchange).cloned()
    }

    /// `(exchange, routing_key)` pairs bound to a queue
    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.inner
            .state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Messages parked in a queue until their expiration fires
    pub fn delayed_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .delayed
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn route(
        state: &BrokerState,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let spec = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound {
                exchange: exchange.to_string(),
            })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match spec.kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct => binding.routing_key == routing_key,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(
        self: &Arc<Self>,
        state: &mut BrokerState,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
        redelivered: bool,
    ) {
        let Some((spec, sender)) = state
            .queues
            .get(queue)
            .map(|q| (q.spec.clone(), q.sender.clone()))
        else {
            return;
        };

        let ttl = match (message.expiration, spec.message_ttl) {
            (Some(own), Some(queue_wide)) => Some(own.min(queue_wide)),
            (own, queue_wide) => own.or(queue_wide),
        };
        if let Some(ttl) = ttl {
            let waiting = state.delayed.entry(queue.to_string()).or_default();
            let start_drain = waiting.is_empty();
            waiting.push_back(ExpiringMessage {
                expires_at: tokio::time::Instant::now() + ttl,
                routing_key: routing_key.to_string(),
                message,
            });
            if start_drain {
                tokio::spawn(Arc::clone(self).drain_expired(queue.to_string()));
            }
            return;
        }

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            receipt: ReceiptHandle(tag),
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            headers: message.headers,
            message_id: message.message_id,
            redelivered,
        };
        state.unacked.insert(tag, delivery.clone());
        if sender.send(delivery).is_err() {
            state.unacked.remove(&tag);
            warn!(queue = %queue, "⚠️ In-memory consumer dropped, message discarded");
        }
    }

    /// Expire messages from the head of `queue` until none are left waiting
    async fn drain_expired(self: Arc<Self>, queue: String) {
        loop {
            let head = {
                let state = self.state.lock();
                state
                    .delayed
                    .get(&queue)
                    .and_then(VecDeque::front)
                    .map(|m| m.expires_at)
            };
            let Some(expires_at) = head else { return };
            tokio::time::sleep_until(expires_at).await;

            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let mut state = self.state.lock();
            let Some(waiting) = state.delayed.get_mut(&queue) else {
                return;
            };
            let Some(expired) = waiting.pop_front() else {
                return;
            };
            let drained = waiting.is_empty();
            if drained {
                state.delayed.remove(&queue);
            }
            self.dead_letter(&mut state, &queue, expired);
            if drained {
                return;
            }
        }
    }

    fn dead_letter(self: &Arc<Self>, state: &mut BrokerState, queue: &str, expired: ExpiringMessage) {
        let Some(spec) = state.queues.get(queue).map(|q| q.spec.clone()) else {
            return;
        };
        let Some(dead_letter_exchange) = spec.dead_letter_exchange else {
            debug!(queue = %queue, "⏰ Message expired without a dead-letter exchange, dropped");
            return;
        };
        let dead_letter_key = spec.dead_letter_routing_key.unwrap_or(expired.routing_key);
        let mut message = expired.message;
        message.expiration = None;

        match Self::route(state, &dead_letter_exchange, &dead_letter_key) {
            Ok(targets) => {
                debug!(
                    queue = %queue,
                    dead_letter_key = %dead_letter_key,
                    targets = targets.len(),
                    "⏰ Message expired, dead-lettering"
                );
                for target in targets {
                    self.enqueue(
                        state,
                        &target,
                        &dead_letter_exchange,
                        &dead_letter_key,
                        message.clone(),
                        false,
                    );
                }
            }
            Err(e) => warn!(queue = %queue, error = %e, "⚠️ Dead-letter routing failed"),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::precondition_failed(
                &spec.name,
                format!(
                    "inequivalent arg 'type' for exchange '{}': declared {:?}, existing {:?}",
                    spec.name, spec.kind, existing.kind
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if &existing.spec != spec => Err(BrokerError::precondition_failed(
                &spec.name,
                format!("inequivalent arguments for queue '{}'", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.queues.insert(
                    spec.name.clone(),
                    InMemoryQueue {
                        spec: spec.clone(),
                        sender,
                        receiver: Some(receiver),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound {
                exchange: exchange.to_string(),
            });
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
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
        message: OutboundMessage,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::unavailable("in-memory broker marked unavailable"));
        }

        let mut state = self.inner.state.lock();
        let targets = Inner::route(&state, exchange, routing_key)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        state.journal.push(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id: message.message_id.clone(),
        });

        for target in targets {
            self.inner.enqueue(
                &mut state,
                &target,
                exchange,
                routing_key,
                message.clone(),
                false,
            );
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let receiver = {
            let mut state = self.inner.state.lock();
            state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound {
                    queue: queue.to_string(),
                })?
                .receiver
                .take()
                .ok_or_else(|| BrokerError::consume(queue, "queue already has a consumer"))?
        };

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.ensure_open()?;
        let tag = delivery.receipt.delivery_tag();
        let mut state = self.inner.state.lock();
        state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::ack(tag, "unknown delivery tag"))?;
        state.journal.push(BrokerEvent::Acked {
            queue: delivery.queue.clone(),
            delivery_tag: tag,
        });
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let tag = delivery.receipt.delivery_tag();
        let mut state = self.inner.state.lock();
        let original = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::ack(tag, "unknown delivery tag"))?;
        state.journal.push(BrokerEvent::Nacked {
            queue: delivery.queue.clone(),
            delivery_tag: tag,
            requeue,
        });

        if requeue {
            let message = OutboundMessage {
                body: original.body,
                headers: original.headers,
                message_id: original.message_id,
                expiration: None,
            };
            self.inner.enqueue(
                &mut state,
                &original.queue,
                &original.exchange,
                &original.routing_key,
                message,
                true,
            );
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every consumer stream
        let mut state = self.inner.state.lock();
        state.queues.clear();
        state.unacked.clear();
        state.delayed.clear();
        debug!("🔌 In-memory broker closed");
        Ok(())
    }

    async fn health_check(&self) -> BrokerResult<bool> {
        Ok(!self.inner.closed.load(Ordering::SeqCst)
            && self.inner.available.load(Ordering::SeqCst))
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with_topology() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::topic("domain_events"))
            .await
            .unwrap();
        broker
            .declare_exchange(&ExchangeSpec::direct("domain_events.retry"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::durable("orders"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueSpec::durable("orders.retry").with_dead_letter("", "orders"))
            .await
            .unwrap();
        broker
            .bind_queue("orders", "domain_events", "order.*")
            .await
            .unwrap();
        broker
            .bind_queue("orders.retry", "domain_events.retry", "orders")
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broker = broker_with_topology().await;

        broker
            .publish("domain_events", "order.placed", OutboundMessage::new(b"1".to_vec()))
            .await
            .unwrap();
        broker
            .publish(
                "domain_events",
                "order.placed.extra",
                OutboundMessage::new(b"2".to_vec()),
            )
            .await
            .unwrap();

        let messages = broker.take_messages("orders");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, b"1".to_vec());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_queue_declaration() {
        let broker = broker_with_topology().await;
        let mut conflicting = QueueSpec::durable("orders");
        conflicting.durable = false;

        let result = broker.declare_queue(&conflicting).await;
        assert!(matches!(
            result,
            Err(BrokerError::PreconditionFailed { .. })
        ));
        // Identical redeclaration is fine
        broker
            .declare_queue(&QueueSpec::durable("orders"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_message_dead_letters_to_main_queue() {
        let broker = broker_with_topology().await;

        broker
            .publish(
                "domain_events.retry",
                "orders",
                OutboundMessage::new(b"retry".to_vec()).with_expiration(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        assert_eq!(broker.delayed_count("orders.retry"), 1);
        assert!(broker.take_messages("orders").is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = broker.take_messages("orders");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routing_key, "orders");
        assert_eq!(broker.delayed_count("orders.retry"), 0);
    }

    #[tokio::test]
    async fn test_expiry_only_happens_at_the_head_of_the_queue() {
        let broker = broker_with_topology().await;

        for (body, ttl_ms) in [("long", 200), ("short", 10)] {
            broker
                .publish(
                    "domain_events.retry",
                    "orders",
                    OutboundMessage::new(body.as_bytes().to_vec())
                        .with_expiration(Duration::from_millis(ttl_ms)),
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(broker.take_messages("orders").is_empty());
        assert_eq!(broker.delayed_count("orders.retry"), 2);

        tokio::time::sleep(Duration::from_millis(220)).await;
        let bodies: Vec<Vec<u8>> = broker
            .take_messages("orders")
            .into_iter()
            .map(|d| d.body)
            .collect();
        assert_eq!(bodies, vec![b"long".to_vec(), b"short".to_vec()]);
    }

    #[tokio::test]
    async fn test_queue_ttl_applies_to_every_message() {
        let broker = broker_with_topology().await;
        broker
            .declare_queue(
                &QueueSpec::durable("invoices.retry")
                    .with_dead_letter("", "orders")
                    .with_message_ttl(Duration::from_millis(20)),
            )
            .await
            .unwrap();

        broker
            .publish("", "invoices.retry", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.delayed_count("invoices.retry"), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.take_messages("orders").len(), 1);
        assert_eq!(broker.delayed_count("invoices.retry"), 0);
    }

    #[tokio::test]
    async fn test_ack_and_nack_requeue() {
        let broker = broker_with_topology().await;
        broker
            .publish("domain_events", "order.placed", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();

        let mut stream = broker.consume("orders", "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        broker.nack(&first, true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        broker.ack(&second).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);

        // Double ack is rejected
        assert!(broker.ack(&second).await.is_err());
    }

    #[tokio::test]
    async fn test_outage_simulation() {
        let broker = broker_with_topology().await;
        broker.set_available(false);
        let result = broker
            .publish("domain_events", "order.placed", OutboundMessage::new(b"x".to_vec()))
            .await;
        assert!(matches!(result, Err(BrokerError::Unavailable { .. })));
        assert!(!broker.health_check().await.unwrap());

        broker.set_available(true);
        assert!(broker.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_ends_consumer_streams() {
        let broker = broker_with_topology().await;
        let mut stream = broker.consume("orders", "test").await.unwrap();
        broker.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            broker
                .publish("domain_events", "order.placed", OutboundMessage::new(vec![]))
                .await,
            Err(BrokerError::Closed)
        ));
    }
}
