//! # Circuit Breaker Implementation
//!
//! Fault isolation for broker publishes. Three states:
//! Closed (normal operation), Open (failing fast), and Half-Open (testing recovery).
//!
//! While open, publishes skip the broker entirely so callers reach the
//! failover store without waiting out a confirmation timeout.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited calls allowed to test system health
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Point-in-time counters for a circuit breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    pub consecutive_failures: u64,
    pub half_open_calls: u64,
    pub current_state: Option<CircuitState>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    failure_threshold: u64,
    success_threshold: u64,
    open_timeout: Duration,
    metrics: Mutex<CircuitBreakerMetrics>,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            open_timeout_ms = config.open_timeout_ms,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_threshold: u64::from(config.failure_threshold.max(1)),
            success_threshold: u64::from(config.success_threshold.max(1)),
            open_timeout: config.open_timeout(),
            metrics: Mutex::new(CircuitBreakerMetrics::default()),
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow_call() {
            self.metrics.lock().rejected_count += 1;
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        }

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => self.record_success(duration),
            Err(_) => self.record_failure(duration),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    fn should_allow_call(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.lock().map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.open_timeout => {
                        self.transition_to_half_open();
                        true
                    }
                    Some(_) => false,
                    None => {
                        warn!(component = %self.name, "Circuit open but no timestamp recorded");
                        true
                    }
                }
            }
            CircuitState::HalfOpen => self.metrics.lock().half_open_calls < self.success_threshold,
        }
    }

    fn record_success(&self, duration: Duration) {
        let close = {
            let mut metrics = self.metrics.lock();
            metrics.total_calls += 1;
            metrics.success_count += 1;
            metrics.consecutive_failures = 0;

            debug!(
                component = %self.name,
                duration_ms = duration.as_millis(),
                "🟢 Operation succeeded"
            );

            if self.state() == CircuitState::HalfOpen {
                metrics.half_open_calls += 1;
                metrics.half_open_calls >= self.success_threshold
            } else {
                false
            }
        };
        if close {
            self.transition_to_closed();
        }
    }

    fn record_failure(&self, duration: Duration) {
        let open = {
            let mut metrics = self.metrics.lock();
            metrics.total_calls += 1;
            metrics.failure_count += 1;
            metrics.consecutive_failures += 1;

            warn!(
                component = %self.name,
                duration_ms = duration.as_millis(),
                consecutive_failures = metrics.consecutive_failures,
                "🔴 Operation failed"
            );

            match self.state() {
                CircuitState::Closed => metrics.consecutive_failures >= self.failure_threshold,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            }
        };
        if open {
            self.transition_to_open();
        }
    }

    fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        *self.opened_at.lock() = None;
        let mut metrics = self.metrics.lock();
        metrics.consecutive_failures = 0;
        metrics.half_open_calls = 0;

        info!(
            component = %self.name,
            total_calls = metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock() = Some(Instant::now());
        let mut metrics = self.metrics.lock();
        metrics.half_open_calls = 0;

        error!(
            component = %self.name,
            consecutive_failures = metrics.consecutive_failures,
            failure_threshold = self.failure_threshold,
            open_timeout_ms = self.open_timeout.as_millis() as u64,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_half_open(&self) {
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.metrics.lock().half_open_calls = 0;

        info!(
            component = %self.name,
            success_threshold = self.success_threshold,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
    }

    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        self.transition_to_open();
    }

    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        self.transition_to_closed();
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut snapshot = self.metrics.lock().clone();
        snapshot.current_state = Some(self.state());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn config(failure_threshold: u32, open_timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold,
            open_timeout_ms,
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test", &config(3, 100));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let circuit = CircuitBreaker::new("test", &config(2, 100));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let result = circuit
            .call(|| async { Ok::<_, String>("should not execute") })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovery() {
        let circuit = CircuitBreaker::new("test", &config(1, 50));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;

        let result = circuit.call(|| async { Ok::<_, String>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test", &config(1, 20));
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        sleep(Duration::from_millis(40)).await;

        let _ = circuit.call(|| async { Err::<(), _>("still down") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_forced_transitions() {
        let circuit = CircuitBreaker::new("test", &config(5, 1000));
        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
