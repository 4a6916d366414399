//! # Retry and Dead-Letter Controller
//!
//! Decides what happens to a delivery whose processing failed, then enacts
//! the decision on the broker:
//!
//! - **Retry**: the envelope, with `retry_count + 1` and an
//!   `x-retry-not-before` deadline, goes to the retry exchange.
//! - **DeadLetter**: the envelope goes to the DLQ exchange carrying the
//!   failure reason in `x-exception`.
//!
//! The retry queue has a single queue-wide TTL of one *hop* (the base delay)
//! and dead-letters back to the main queue. Brokers only expire messages at
//! the head of a queue, so per-message delays would make a short retry wait
//! behind a long one. Instead a retry that comes back before its deadline is
//! re-parked for another hop, which rounds every delay to whole hops.
//!
//! The original delivery is acked only after the decision is on the broker.
//! If that publish fails the original is nacked with requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::config::BackoffConfig;
use crate::error::{PapaError, PapaResult};
use crate::messaging::{Broker, Delivery, EventEnvelope, OutboundMessage};
use crate::registry::UseCaseBinding;
use crate::topology::ExchangeNames;

/// Exponential backoff: `base_delay * multiplier^retry_count`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
            max_delay: config.max_delay(),
        }
    }

    /// Delay before the attempt following `retry_count` earlier retries
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(seconds)
        }
    }

    /// Time a parked retry spends in the retry queue per pass
    pub fn hop(&self) -> Duration {
        self.base_delay
    }

    /// Whether a returning retry should wait another hop. Within half a hop
    /// of its deadline it runs now.
    pub fn is_parked(&self, envelope: &EventEnvelope, now: DateTime<Utc>) -> bool {
        let Some(not_before) = envelope.retry_not_before else {
            return false;
        };
        match (not_before - now).to_std() {
            Ok(remaining) => remaining > self.hop() / 2,
            Err(_) => false,
        }
    }
}

/// Why processing a delivery failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The payload did not decode into the handler's type
    Validation(String),
    /// The handler returned an error
    Handler { message: String, retryable: bool },
    /// The handler panicked
    Panic(String),
    /// The handler exceeded its time budget
    Timeout(Duration),
    /// The handler returned an event descriptor that cannot be published
    InvalidEmission(String),
}

impl FailureCause {
    pub fn is_permanent(&self) -> bool {
        match self {
            FailureCause::Validation(_) | FailureCause::InvalidEmission(_) => true,
            FailureCause::Handler { retryable, .. } => !retryable,
            FailureCause::Panic(_) | FailureCause::Timeout(_) => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FailureCause::Validation(message) => format!("ValidationError: {message}"),
            FailureCause::Handler { message, .. } => format!("HandlerError: {message}"),
            FailureCause::Panic(message) => format!("HandlerPanic: {message}"),
            FailureCause::Timeout(after) => {
                format!("HandlerTimeout: exceeded {}ms", after.as_millis())
            }
            FailureCause::InvalidEmission(message) => format!("InvalidEmission: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        next_retry_count: u32,
    },
    DeadLetter {
        reason: String,
    },
}

pub struct RetryController {
    broker: Arc<dyn Broker>,
    exchanges: ExchangeNames,
    policy: BackoffPolicy,
}

impl RetryController {
    pub fn new(broker: Arc<dyn Broker>, exchanges: ExchangeNames, policy: BackoffPolicy) -> Self {
        Self {
            broker,
            exchanges,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Pure decision for a failed delivery
    pub fn decide(
        &self,
        envelope: &EventEnvelope,
        max_retries: u32,
        cause: &FailureCause,
    ) -> RetryDecision {
        if cause.is_permanent() {
            return RetryDecision::DeadLetter {
                reason: cause.describe(),
            };
        }
        if envelope.retry_count < max_retries {
            RetryDecision::Retry {
                delay: self.policy.delay_for(envelope.retry_count),
                next_retry_count: envelope.retry_count + 1,
            }
        } else {
            RetryDecision::DeadLetter {
                reason: format!(
                    "MaxRetriesExceeded: gave up after {} retries; last error: {}",
                    envelope.retry_count,
                    cause.describe()
                ),
            }
        }
    }

    /// Decide, route the envelope accordingly, then settle the original delivery
    pub async fn handle_failure(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        binding: &UseCaseBinding,
        cause: FailureCause,
    ) -> PapaResult<RetryDecision> {
        let decision = self.decide(envelope, binding.max_retries, &cause);

        let (exchange, message) = match &decision {
            RetryDecision::Retry { delay, .. } => {
                warn!(
                    use_case = %binding.name,
                    event_name = %envelope.event_name,
                    message_id = %envelope.message_id,
                    retry_count = envelope.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause.describe(),
                    "🔁 Scheduling retry"
                );
                let not_before = Utc::now()
                    + chrono::Duration::from_std(*delay).unwrap_or_else(|_| chrono::Duration::zero());
                let next = envelope.next_attempt(cause.describe(), not_before);
                (&self.exchanges.retry, next.to_message())
            }
            RetryDecision::DeadLetter { reason } => {
                if cause.is_permanent() {
                    warn!(
                        use_case = %binding.name,
                        event_name = %envelope.event_name,
                        message_id = %envelope.message_id,
                        reason = %reason,
                        "☠️ Permanent failure, dead-lettering"
                    );
                } else {
                    error!(
                        use_case = %binding.name,
                        event_name = %envelope.event_name,
                        message_id = %envelope.message_id,
                        retry_count = envelope.retry_count,
                        max_retries = binding.max_retries,
                        reason = %reason,
                        "☠️ MaxRetriesExceeded, dead-lettering"
                    );
                }
                (&self.exchanges.dlq, envelope.dead_lettered(reason.clone()).to_message())
            }
        };

        self.route_then_ack(delivery, binding, exchange, message).await?;
        Ok(decision)
    }

    /// Send a retry that came back early to the retry queue for another hop
    pub async fn repark(
        &self,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        binding: &UseCaseBinding,
    ) -> PapaResult<()> {
        debug!(
            use_case = %binding.name,
            message_id = %envelope.message_id,
            retry_count = envelope.retry_count,
            not_before = ?envelope.retry_not_before,
            "⏳ Retry not due yet, parking for another hop"
        );
        self.route_then_ack(delivery, binding, &self.exchanges.retry, envelope.to_message())
            .await
    }

    async fn route_then_ack(
        &self,
        delivery: &Delivery,
        binding: &UseCaseBinding,
        exchange: &str,
        message: OutboundMessage,
    ) -> PapaResult<()> {
        if let Err(publish_error) = self.broker.publish(exchange, &binding.name, message).await {
            error!(
                use_case = %binding.name,
                exchange = %exchange,
                error = %publish_error,
                "❌ Could not route failed delivery, requeueing original"
            );
            if let Err(nack_error) = self.broker.nack(delivery, true).await {
                error!(
                    use_case = %binding.name,
                    error = %nack_error,
                    "❌ Requeue failed, broker will redeliver after reconnect"
                );
            }
            return Err(PapaError::from(publish_error));
        }

        self.broker.ack(delivery).await?;
        Ok(())
    }
}
