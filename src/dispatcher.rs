//! # Dispatcher
//!
//! One consume loop per use case. Each delivery takes a permit from the
//! process-wide semaphore before its processing task is spawned, so total
//! in-flight handlers never exceed `max_jobs` no matter how many use cases
//! are registered.
//!
//! ```text
//! consume(<uc>) → [global Semaphore] → decode → handler → ack → publish emitted
//!                                          │         │
//!                                          └─────────┴──→ RetryController
//! ```
//!
//! A retry that returns from its retry queue before its deadline is parked
//! again without reaching the handler.
//!
//! Panics and timeouts are caught and handed to the retry controller the same
//! way handler errors are. Emitted descriptors are validated before the ack so
//! a bad one never leaves a partial set published.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{PapaError, PapaResult};
use crate::handler::{HandlerError, HandlerOutcome};
use crate::logging::log_dispatch_outcome;
use crate::messaging::{Broker, Delivery, DeliveryStream, EventEnvelope};
use crate::publisher::Publisher;
use crate::registry::UseCaseBinding;
use crate::retry::{FailureCause, RetryController, RetryDecision};
use crate::telemetry;

#[derive(Debug, Default)]
struct UseCaseCounters {
    received: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    validation_failures: AtomicU64,
    reparked: AtomicU64,
}

impl UseCaseCounters {
    fn snapshot(&self) -> UseCaseStats {
        UseCaseStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            reparked: self.reparked.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one use case at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UseCaseStats {
    /// Deliveries handed to the handler
    pub received: u64,
    /// Deliveries whose handler succeeded
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub validation_failures: u64,
    /// Retries that came back early and were parked for another hop
    pub reparked: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub use_cases: BTreeMap<String, UseCaseStats>,
    pub in_flight: usize,
    /// Highest concurrent handler count observed
    pub peak_in_flight: usize,
}

impl DispatchStatsSnapshot {
    pub fn use_case(&self, name: &str) -> UseCaseStats {
        self.use_cases.get(name).copied().unwrap_or_default()
    }
}

/// Live dispatch counters shared by all consume loops
#[derive(Debug, Default)]
pub struct DispatchStats {
    use_cases: parking_lot::RwLock<BTreeMap<String, Arc<UseCaseCounters>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, use_case: &str) -> Arc<UseCaseCounters> {
        if let Some(counters) = self.use_cases.read().get(use_case) {
            return counters.clone();
        }
        self.use_cases
            .write()
            .entry(use_case.to_string())
            .or_default()
            .clone()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            use_cases: self
                .use_cases
                .read()
                .iter()
                .map(|(name, counters)| (name.clone(), counters.snapshot()))
                .collect(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Terminal state of one processed delivery
#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Acked { emitted: usize },
    Failed(RetryDecision),
    /// Could not be settled on the broker, left for redelivery
    Unsettled,
}

pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    publisher: Arc<Publisher>,
    retry: Arc<RetryController>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    stats: Arc<DispatchStats>,
    handler_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: Arc<Publisher>,
        retry: Arc<RetryController>,
        max_jobs: usize,
        handler_timeout: Option<Duration>,
    ) -> Self {
        Self {
            broker,
            publisher,
            retry,
            semaphore: Arc::new(Semaphore::new(max_jobs)),
            tracker: TaskTracker::new(),
            stats: Arc::new(DispatchStats::new()),
            handler_timeout,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Open a consumer per binding and spawn its loop. Consumer setup errors
    /// surface here; the loops run until `shutdown` fires.
    pub async fn start<'a, I>(self: &Arc<Self>, bindings: I, shutdown: CancellationToken) -> PapaResult<()>
    where
        I: IntoIterator<Item = &'a Arc<UseCaseBinding>>,
    {
        let mut consumers = Vec::new();
        for binding in bindings {
            let consumer_tag = format!("papa-events.{}", binding.name);
            let stream = self.broker.consume(&binding.name, &consumer_tag).await?;
            consumers.push((binding.clone(), stream));
        }

        for (binding, stream) in consumers {
            info!(use_case = %binding.name, "👂 Consumer loop starting");
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            self.tracker
                .spawn(async move { dispatcher.consume_loop(binding, stream, shutdown).await });
        }
        Ok(())
    }

    /// Close the tracker and wait for loops and in-flight handlers, up to `grace`.
    /// Returns false when the grace period ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    in_flight = self.stats.in_flight.load(Ordering::SeqCst),
                    grace_ms = grace.as_millis() as u64,
                    "⏱️ Shutdown grace elapsed with handlers still running"
                );
                false
            }
        }
    }

    async fn consume_loop(
        self: Arc<Self>,
        binding: Arc<UseCaseBinding>,
        mut stream: DeliveryStream,
        shutdown: CancellationToken,
    ) {
        let counters = self.stats.counters(&binding.name);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        warn!(use_case = %binding.name, error = %err, "⚠️ Consumer error");
                        continue;
                    }
                    None => {
                        info!(use_case = %binding.name, "Consumer stream ended");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    if let Err(err) = self.broker.nack(&delivery, true).await {
                        warn!(use_case = %binding.name, error = %err, "⚠️ Requeue on shutdown failed");
                    }
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!(use_case = %binding.name, "❌ Dispatch semaphore closed");
                        break;
                    }
                },
            };

            let dispatcher = self.clone();
            let binding = binding.clone();
            let counters = counters.clone();
            self.stats.enter();
            self.tracker.spawn(async move {
                dispatcher.process(&binding, &counters, delivery).await;
                dispatcher.stats.exit();
                drop(permit);
            });
        }

        debug!(use_case = %binding.name, "Consumer loop stopped");
    }

    async fn process(&self, binding: &UseCaseBinding, counters: &UseCaseCounters, delivery: Delivery) {
        let envelope = EventEnvelope::from_delivery(&delivery);
        if self.retry.policy().is_parked(&envelope, Utc::now()) {
            match self.retry.repark(&delivery, &envelope, binding).await {
                Ok(()) => {
                    counters.reparked.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => warn!(
                    use_case = %binding.name,
                    message_id = %envelope.message_id,
                    error = %err,
                    "⚠️ Could not park early retry"
                ),
            }
            return;
        }
        counters.received.fetch_add(1, Ordering::Relaxed);
        let span = info_span!(
            "dispatch",
            use_case = %binding.name,
            event_name = %envelope.event_name,
            message_id = %envelope.message_id,
            retry_count = envelope.retry_count,
        );

        let started = Instant::now();
        let settlement = self
            .settle(binding, counters, &delivery, &envelope)
            .instrument(span)
            .await;

        let message_id = envelope.message_id.to_string();
        let elapsed_ms = started.elapsed().as_millis();
        let (outcome, details) = match &settlement {
            Settlement::Acked { emitted } => {
                ("acked", format!("{elapsed_ms}ms, emitted {emitted}"))
            }
            Settlement::Failed(RetryDecision::Retry { delay, .. }) => (
                "retrying",
                format!("{elapsed_ms}ms, retry in {}ms", delay.as_millis()),
            ),
            Settlement::Failed(RetryDecision::DeadLetter { reason }) => {
                ("dead_lettered", format!("{elapsed_ms}ms, {reason}"))
            }
            Settlement::Unsettled => ("unsettled", format!("{elapsed_ms}ms")),
        };
        log_dispatch_outcome(
            &binding.name,
            &envelope.event_name,
            &message_id,
            envelope.retry_count,
            outcome,
            Some(&details),
        );
    }

    async fn settle(
        &self,
        binding: &UseCaseBinding,
        counters: &UseCaseCounters,
        delivery: &Delivery,
        envelope: &EventEnvelope,
    ) -> Settlement {
        let consumer_cx = telemetry::consumer_context(&binding.name, envelope);

        let outcome = match self.run_handler(binding, envelope).await {
            Ok(outcome) => outcome,
            Err(cause) => return self.fail(binding, counters, delivery, envelope, cause).await,
        };

        let mut emitted = Vec::with_capacity(outcome.emitted.len());
        for event in &outcome.emitted {
            match event.validate() {
                Ok(body) => emitted.push((event.name().to_string(), body)),
                Err(reason) => {
                    let cause = FailureCause::InvalidEmission(reason);
                    return self.fail(binding, counters, delivery, envelope, cause).await;
                }
            }
        }

        if let Err(err) = self.broker.ack(delivery).await {
            error!(
                use_case = %binding.name,
                message_id = %envelope.message_id,
                error = %err,
                "❌ Ack failed, delivery will be redelivered"
            );
            return Settlement::Unsettled;
        }
        counters.acked.fetch_add(1, Ordering::Relaxed);

        let trace_headers = telemetry::inject_context(&consumer_cx);
        let count = emitted.len();
        for (name, body) in emitted {
            let follow_up = EventEnvelope::new(name, body).with_trace_context(trace_headers.clone());
            let event_name = follow_up.event_name.clone();
            if let Err(err) = self.publisher.publish_envelope(follow_up).await {
                error!(
                    use_case = %binding.name,
                    emitted_event = %event_name,
                    error = %err,
                    "❌ Could not publish emitted event"
                );
            }
        }

        Settlement::Acked { emitted: count }
    }

    async fn run_handler(
        &self,
        binding: &UseCaseBinding,
        envelope: &EventEnvelope,
    ) -> Result<HandlerOutcome, FailureCause> {
        let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            binding.handler.invoke(&envelope.event_name, &envelope.payload)
        }))
        .map_err(|panic| FailureCause::Panic(panic_message(panic.as_ref())))?;

        let future = match invoked {
            Ok(future) => future,
            Err(PapaError::Validation { schema, message }) => {
                return Err(FailureCause::Validation(format!("{schema}: {message}")))
            }
            Err(other) => {
                return Err(FailureCause::Handler {
                    message: other.to_string(),
                    retryable: true,
                })
            }
        };

        let guarded = AssertUnwindSafe(future).catch_unwind();
        let result = match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| FailureCause::Timeout(limit))?,
            None => guarded.await,
        };

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(handler_failure(err)),
            Err(panic) => Err(FailureCause::Panic(panic_message(panic.as_ref()))),
        }
    }

    async fn fail(
        &self,
        binding: &UseCaseBinding,
        counters: &UseCaseCounters,
        delivery: &Delivery,
        envelope: &EventEnvelope,
        cause: FailureCause,
    ) -> Settlement {
        if matches!(cause, FailureCause::Validation(_)) {
            counters.validation_failures.fetch_add(1, Ordering::Relaxed);
        }

        match self.retry.handle_failure(delivery, envelope, binding, cause).await {
            Ok(decision) => {
                match decision {
                    RetryDecision::Retry { .. } => counters.retried.fetch_add(1, Ordering::Relaxed),
                    RetryDecision::DeadLetter { .. } => {
                        counters.dead_lettered.fetch_add(1, Ordering::Relaxed)
                    }
                };
                Settlement::Failed(decision)
            }
            Err(err) => {
                error!(
                    use_case = %binding.name,
                    message_id = %envelope.message_id,
                    error = %err,
                    "❌ Failed delivery could not be routed"
                );
                Settlement::Unsettled
            }
        }
    }
}

fn handler_failure(err: HandlerError) -> FailureCause {
    FailureCause::Handler {
        message: err.message(),
        retryable: err.is_retryable(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
