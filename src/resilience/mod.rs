//! # Resilience Module
//!
//! Fault tolerance for broker publishes. A circuit breaker isolates a failing
//! broker so publishes degrade straight to the failover store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use papa_events::config::CircuitBreakerConfig;
//! use papa_events::resilience::CircuitBreaker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit_breaker = CircuitBreaker::new("broker_publish", &CircuitBreakerConfig::default());
//!
//! let result = circuit_breaker
//!     .call(|| async { Ok::<&str, std::io::Error>("published") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerMetrics, CircuitState,
};
