//! # Error Types
//!
//! Crate-wide error taxonomy using thiserror. Broker-level failures are
//! modelled separately in [`crate::messaging::BrokerError`] and converted
//! into [`PapaError`] at the component boundary.

use crate::messaging::BrokerError;
use thiserror::Error;

/// Errors surfaced by the public API
#[derive(Error, Debug)]
pub enum PapaError {
    #[error("Duplicate functions for use case <{use_case}>")]
    DuplicateUseCase { use_case: String },

    #[error("Invalid use case <{use_case}>: {reason}")]
    InvalidUseCase { use_case: String, reason: String },

    #[error("Invalid event pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Topology error on {resource}: {message}")]
    Topology { resource: String, message: String },

    #[error("Broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    #[error("Payload validation failed for {schema}: {message}")]
    Validation { schema: String, message: String },

    #[error("Failover write failed: {message}")]
    FailoverWrite { message: String },

    #[error("Failover store error: {operation}: {message}")]
    FailoverStore { operation: String, message: String },

    #[error("Init needed: the application has not been started")]
    NotStarted,

    #[error("Application already started; registration is closed")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PapaError {
    pub fn duplicate_use_case(use_case: impl Into<String>) -> Self {
        Self::DuplicateUseCase {
            use_case: use_case.into(),
        }
    }

    pub fn invalid_use_case(use_case: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUseCase {
            use_case: use_case.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn topology(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    pub fn validation(schema: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            schema: schema.into(),
            message: message.into(),
        }
    }

    pub fn failover_write(message: impl Into<String>) -> Self {
        Self::FailoverWrite {
            message: message.into(),
        }
    }

    pub fn failover_store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FailoverStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a transient infrastructure failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable { .. } | Self::FailoverStore { .. }
        )
    }
}

impl From<BrokerError> for PapaError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::PreconditionFailed { resource, message } => {
                PapaError::topology(resource, message)
            }
            BrokerError::Serialization { message } => PapaError::Serialization(message),
            other => PapaError::broker_unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PapaError {
    fn from(err: serde_json::Error) -> Self {
        PapaError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PapaError {
    fn from(err: config::ConfigError) -> Self {
        PapaError::Configuration(err.to_string())
    }
}

impl From<sqlx::Error> for PapaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                PapaError::failover_write(err.to_string())
            }
            other => PapaError::failover_store("query", other.to_string()),
        }
    }
}

pub type PapaResult<T> = std::result::Result<T, PapaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_use_case_display() {
        let err = PapaError::duplicate_use_case("send_welcome_email");
        assert!(err
            .to_string()
            .starts_with("Duplicate functions for use case <send_welcome_email>"));
    }

    #[test]
    fn test_not_started_display() {
        assert!(PapaError::NotStarted.to_string().contains("Init needed"));
    }

    #[test]
    fn test_broker_error_conversion() {
        let err: PapaError = BrokerError::precondition_failed("orders", "durable mismatch").into();
        assert!(matches!(err, PapaError::Topology { .. }));

        let err: PapaError = BrokerError::unavailable("connection refused").into();
        assert!(matches!(err, PapaError::BrokerUnavailable { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_sqlx_pool_errors_are_write_failures() {
        let err: PapaError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, PapaError::FailoverWrite { .. }));
    }
}
