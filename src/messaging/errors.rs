//! # Broker Error Types
//!
//! Structured errors for the broker collaborator using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Errors raised by a [`crate::messaging::Broker`] implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker connection is closed")]
    Closed,

    #[error("Precondition failed for {resource}: {message}")]
    PreconditionFailed { resource: String, message: String },

    #[error("Exchange not found: {exchange}")]
    ExchangeNotFound { exchange: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Publish failed: {exchange}/{routing_key}: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Publish confirmation timed out after {timeout_ms}ms")]
    PublishTimeout { timeout_ms: u64 },

    #[error("Consume failed on {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Acknowledgement failed for delivery {delivery_tag}: {message}")]
    Ack { delivery_tag: u64, message: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },
}

impl BrokerError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn precondition_failed(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    pub fn consume(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue: queue.into(),
            message: message.into(),
        }
    }

    pub fn ack(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Ack {
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether a failed publish should be diverted to the failover store.
    ///
    /// Anything except a malformed message qualifies: the event itself is
    /// fine, the broker just could not take it right now.
    pub fn warrants_failover(&self) -> bool {
        !matches!(self, Self::Serialization { .. })
    }
}

/// Conversion from lapin errors. Channel-level precondition failures are
/// surfaced as such so topology conflicts stay distinguishable.
impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        let message = err.to_string();
        if message.contains("PRECONDITION_FAILED") {
            BrokerError::precondition_failed("amqp", message)
        } else if message.contains("NOT_FOUND") {
            BrokerError::QueueNotFound { queue: message }
        } else {
            BrokerError::connection(message)
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::serialization(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_eligibility() {
        assert!(BrokerError::unavailable("down").warrants_failover());
        assert!(BrokerError::PublishTimeout { timeout_ms: 5000 }.warrants_failover());
        assert!(BrokerError::Closed.warrants_failover());
        assert!(!BrokerError::serialization("bad").warrants_failover());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::publish("domain_events", "user.created", "nacked");
        let display = format!("{err}");
        assert!(display.contains("domain_events/user.created"));
        assert!(display.contains("nacked"));
    }
}
