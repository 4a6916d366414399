//! # Queue Topology
//!
//! Every use case owns three durable queues:
//!
//! | queue | bound to | routing key |
//! |---|---|---|
//! | `<uc>` | `domain_events` (topic) | each pattern, and `<uc>` |
//! | `<uc>.retry` | `domain_events.retry` (direct) | `<uc>` |
//! | `<uc>.dlq` | `domain_events.dlq` (direct) | `<uc>` |
//!
//! The retry queue expires every message after one backoff hop and
//! dead-letters it into the default exchange with routing key `<uc>`, so an
//! expired retry lands back on that use case's main queue and nowhere else.
//! The `<uc>` binding on `domain_events` lets operators replay a DLQ message
//! by publishing it there under the use case name. Queue names are a
//! persisted contract with the broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::BackoffConfig;
use crate::error::{PapaError, PapaResult};
use crate::messaging::{Broker, BrokerError, ExchangeSpec, QueueSpec};
use crate::registry::UseCaseBinding;

pub const RETRY_SUFFIX: &str = ".retry";
pub const DLQ_SUFFIX: &str = ".dlq";

pub fn retry_queue_name(use_case: &str) -> String {
    format!("{use_case}{RETRY_SUFFIX}")
}

pub fn dlq_queue_name(use_case: &str) -> String {
    format!("{use_case}{DLQ_SUFFIX}")
}

/// The shared exchanges derived from one base name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeNames {
    pub events: String,
    pub retry: String,
    pub dlq: String,
}

impl ExchangeNames {
    pub fn new(base: &str) -> Self {
        Self {
            events: base.to_string(),
            retry: format!("{base}{RETRY_SUFFIX}"),
            dlq: format!("{base}{DLQ_SUFFIX}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub use_case_name: String,
    pub main_queue: String,
    pub retry_queue: String,
    pub dlq_queue: String,
    pub exchange_ref: String,
}

impl QueueTopology {
    pub fn for_use_case(use_case_name: &str, exchange: &str) -> Self {
        Self {
            use_case_name: use_case_name.to_string(),
            main_queue: use_case_name.to_string(),
            retry_queue: retry_queue_name(use_case_name),
            dlq_queue: dlq_queue_name(use_case_name),
            exchange_ref: exchange.to_string(),
        }
    }
}

pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    exchanges: ExchangeNames,
    retry_ttl: Duration,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, exchange: &str) -> Self {
        Self {
            broker,
            exchanges: ExchangeNames::new(exchange),
            retry_ttl: BackoffConfig::default().base_delay(),
        }
    }

    /// Queue-wide TTL of the retry queues, one backoff hop. Part of the
    /// queue arguments, so changing it conflicts with already declared queues.
    pub fn with_retry_ttl(mut self, retry_ttl: Duration) -> Self {
        self.retry_ttl = retry_ttl;
        self
    }

    pub fn exchanges(&self) -> &ExchangeNames {
        &self.exchanges
    }

    /// Declare exchanges, queues and bindings for every use case.
    /// Idempotent; a conflicting existing declaration is a [`PapaError::Topology`].
    pub async fn provision<'a, I>(&self, bindings: I) -> PapaResult<BTreeMap<String, QueueTopology>>
    where
        I: IntoIterator<Item = &'a Arc<UseCaseBinding>>,
    {
        self.declare_exchanges().await?;

        let mut topologies = BTreeMap::new();
        for binding in bindings {
            let topology = self.provision_use_case(binding).await?;
            topologies.insert(binding.name.clone(), topology);
        }

        info!(
            exchange = %self.exchanges.events,
            use_cases = topologies.len(),
            "🏗️ Topology provisioned"
        );
        Ok(topologies)
    }

    async fn declare_exchanges(&self) -> PapaResult<()> {
        let specs = [
            ExchangeSpec::topic(&self.exchanges.events),
            ExchangeSpec::direct(&self.exchanges.retry),
            ExchangeSpec::direct(&self.exchanges.dlq),
        ];
        for spec in &specs {
            self.broker
                .declare_exchange(spec)
                .await
                .map_err(|e| topology_error(&spec.name, e))?;
        }
        Ok(())
    }

    async fn provision_use_case(&self, binding: &UseCaseBinding) -> PapaResult<QueueTopology> {
        let topology = QueueTopology::for_use_case(&binding.name, &self.exchanges.events);

        let queues = [
            QueueSpec::durable(&topology.main_queue),
            QueueSpec::durable(&topology.retry_queue)
                .with_dead_letter("", &binding.name)
                .with_message_ttl(self.retry_ttl),
            QueueSpec::durable(&topology.dlq_queue),
        ];
        for spec in &queues {
            self.broker
                .declare_queue(spec)
                .await
                .map_err(|e| topology_error(&spec.name, e))?;
        }

        for pattern in &binding.patterns {
            self.bind(&topology.main_queue, &self.exchanges.events, pattern.routing_key())
                .await?;
        }
        self.bind(&topology.main_queue, &self.exchanges.events, &binding.name)
            .await?;
        self.bind(&topology.retry_queue, &self.exchanges.retry, &binding.name)
            .await?;
        self.bind(&topology.dlq_queue, &self.exchanges.dlq, &binding.name)
            .await?;

        Ok(topology)
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> PapaResult<()> {
        self.broker
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(|e| topology_error(queue, e))
    }
}

fn topology_error(resource: &str, err: BrokerError) -> PapaError {
    error!(resource = %resource, error = %err, "❌ Topology declaration failed");
    match err {
        BrokerError::Unavailable { .. } | BrokerError::Connection { .. } | BrokerError::Closed => {
            err.into()
        }
        BrokerError::PreconditionFailed { message, .. } => PapaError::topology(resource, message),
        other => PapaError::topology(resource, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{self, HandlerError};
    use crate::messaging::InMemoryBroker;
    use crate::registry::UseCaseRegistry;

    fn registry() -> UseCaseRegistry {
        let mut registry = UseCaseRegistry::new();
        let noop =
            || handler::payload_only(|_: serde_json::Value| async { Ok::<_, HandlerError>(()) });
        registry
            .register("send_welcome_email", ["user.created", "user.reactivated"], noop(), 5)
            .unwrap();
        registry
            .register("audit_log", ["#"], noop(), 1)
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_provision_declares_three_queues_per_use_case() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker.clone()), "domain_events");
        let registry = registry();

        let topologies = manager.provision(registry.bindings()).await.unwrap();
        assert_eq!(topologies.len(), 2);

        let topology = &topologies["send_welcome_email"];
        assert_eq!(topology.retry_queue, "send_welcome_email.retry");
        assert_eq!(topology.dlq_queue, "send_welcome_email.dlq");

        let retry = broker.queue_spec("send_welcome_email.retry").unwrap();
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some(""));
        assert_eq!(
            retry.dead_letter_routing_key.as_deref(),
            Some("send_welcome_email")
        );
        assert_eq!(retry.message_ttl, Some(Duration::from_secs(1)));

        let mut main_bindings = broker.bindings_for("send_welcome_email");
        main_bindings.sort();
        assert_eq!(
            main_bindings,
            vec![
                ("domain_events".to_string(), "send_welcome_email".to_string()),
                ("domain_events".to_string(), "user.created".to_string()),
                ("domain_events".to_string(), "user.reactivated".to_string()),
            ]
        );
        assert_eq!(
            broker.bindings_for("audit_log.dlq"),
            vec![("domain_events.dlq".to_string(), "audit_log".to_string())]
        );
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker.clone()), "domain_events");
        let registry = registry();

        manager.provision(registry.bindings()).await.unwrap();
        manager.provision(registry.bindings()).await.unwrap();
        assert_eq!(broker.bindings_for("send_welcome_email").len(), 3);
    }

    #[tokio::test]
    async fn test_dead_letter_can_be_replayed_under_the_use_case_name() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker.clone()), "domain_events")
            .with_retry_ttl(Duration::from_millis(250));
        manager.provision(registry().bindings()).await.unwrap();
        assert_eq!(
            broker.queue_spec("audit_log.retry").unwrap().message_ttl,
            Some(Duration::from_millis(250))
        );

        broker
            .publish(
                "domain_events",
                "send_welcome_email",
                crate::messaging::OutboundMessage::new(b"{}".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(broker.take_messages("send_welcome_email").len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_queue_is_topology_error() {
        let broker = InMemoryBroker::new();
        let mut conflicting = QueueSpec::durable("send_welcome_email");
        conflicting.quorum = false;
        broker.declare_queue(&conflicting).await.unwrap();

        let manager = TopologyManager::new(Arc::new(broker), "domain_events");
        let result = manager.provision(registry().bindings()).await;
        assert!(matches!(result, Err(PapaError::Topology { .. })));
    }
}
