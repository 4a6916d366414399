//! # Publisher
//!
//! Sends events to the shared topic exchange with the event name as routing
//! key. When the broker cannot take a publish (unreachable, confirm timeout,
//! circuit open) the event is parked in the failover store instead, and the
//! caller still gets success once the record is durable.

use std::any::type_name;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PapaError, PapaResult};
use crate::failover::{FailoverRecord, FailoverStore};
use crate::logging::log_failover_operation;
use crate::messaging::{header_keys, Broker, BrokerError, EventEnvelope, OutboundMessage};
use crate::resilience::{CircuitBreaker, CircuitBreakerError};
use crate::telemetry;

/// Where a published event ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirmed by the broker
    Published { message_id: Uuid },
    /// Parked in the failover store for later replay
    FailedOver { record_id: i64 },
}

pub struct Publisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    publish_timeout: Duration,
    failover: Option<Arc<dyn FailoverStore>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    published: AtomicU64,
    failed_over: AtomicU64,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>, publish_timeout: Duration) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            publish_timeout,
            failover: None,
            circuit_breaker: None,
            published: AtomicU64::new(0),
            failed_over: AtomicU64::new(0),
        }
    }

    pub fn with_failover(mut self, store: Arc<dyn FailoverStore>) -> Self {
        self.failover = Some(store);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Publish raw JSON bytes under `event_name`
    pub async fn publish(
        &self,
        event_name: &str,
        payload: impl Into<Vec<u8>>,
    ) -> PapaResult<PublishOutcome> {
        validate_event_name(event_name)?;
        let envelope = EventEnvelope::new(event_name, payload)
            .with_trace_context(telemetry::current_trace_headers());
        self.publish_envelope(envelope).await
    }

    /// Serialize `payload` as JSON and publish it
    pub async fn publish_json<T>(&self, event_name: &str, payload: &T) -> PapaResult<PublishOutcome>
    where
        T: Serialize + ?Sized,
    {
        validate_event_name(event_name)?;
        let body = serde_json::to_vec(payload)?;
        let envelope = EventEnvelope::new(event_name, body)
            .with_schema_ref(type_name::<T>())
            .with_trace_context(telemetry::current_trace_headers());
        self.publish_envelope(envelope).await
    }

    pub async fn publish_envelope(&self, envelope: EventEnvelope) -> PapaResult<PublishOutcome> {
        match self.send(&envelope.event_name, envelope.to_message()).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_name = %envelope.event_name,
                    message_id = %envelope.message_id,
                    "📤 Event published"
                );
                Ok(PublishOutcome::Published {
                    message_id: envelope.message_id,
                })
            }
            Err(err) if err.warrants_failover() => self.fail_over(&envelope, &err).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Replay a failover record. Never records to failover again.
    pub async fn republish(&self, record: &FailoverRecord) -> PapaResult<()> {
        let mut message =
            OutboundMessage::new(record.payload.clone()).with_headers(record.headers.clone());
        if let Some(message_id) = record.headers.get(header_keys::MESSAGE_ID) {
            message = message.with_message_id(message_id.clone());
        }

        self.send(&record.event_name, message)
            .await
            .map_err(|e| PapaError::broker_unavailable(e.to_string()))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Successful broker publishes so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed_over_count(&self) -> u64 {
        self.failed_over.load(Ordering::Relaxed)
    }

    pub fn has_failover(&self) -> bool {
        self.failover.is_some()
    }

    /// Upper bound on a single broker publish, confirm included
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    async fn fail_over(
        &self,
        envelope: &EventEnvelope,
        cause: &BrokerError,
    ) -> PapaResult<PublishOutcome> {
        let Some(store) = &self.failover else {
            warn!(
                event_name = %envelope.event_name,
                error = %cause,
                "❌ Broker unavailable and no failover store configured"
            );
            return Err(PapaError::broker_unavailable(cause.to_string()));
        };

        let record_id = store
            .record(&envelope.event_name, &envelope.payload, &envelope.headers())
            .await?;
        self.failed_over.fetch_add(1, Ordering::Relaxed);

        warn!(
            event_name = %envelope.event_name,
            message_id = %envelope.message_id,
            record_id = record_id,
            error = %cause,
            "💾 Broker publish failed, event parked in failover store"
        );
        log_failover_operation(
            "record",
            Some(record_id),
            Some(&envelope.event_name),
            "pending",
            Some(&cause.to_string()),
        );
        Ok(PublishOutcome::FailedOver { record_id })
    }

    async fn send(&self, routing_key: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let timeout = self.publish_timeout;
        let attempt = move || async move {
            tokio::time::timeout(timeout, self.broker.publish(&self.exchange, routing_key, message))
                .await
                .unwrap_or(Err(BrokerError::PublishTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }))
        };

        match &self.circuit_breaker {
            Some(circuit_breaker) => circuit_breaker.call(attempt).await.map_err(|e| match e {
                CircuitBreakerError::CircuitOpen { component } => {
                    BrokerError::unavailable(format!("circuit breaker open for {component}"))
                }
                CircuitBreakerError::OperationFailed(err) => err,
            }),
            None => attempt().await,
        }
    }
}

fn validate_event_name(event_name: &str) -> PapaResult<()> {
    if event_name.is_empty() {
        return Err(PapaError::validation("event_name", "event name must not be empty"));
    }
    if event_name.contains(['*', '#']) {
        return Err(PapaError::validation(
            "event_name",
            format!("event name '{event_name}' must not contain wildcards"),
        ));
    }
    Ok(())
}
