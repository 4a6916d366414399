#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, PostgreSQL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Papa Events
//!
//! Event-driven use-case framework on top of RabbitMQ.
//!
//! Applications register *use cases*: a named handler subscribed to one or
//! more event-name patterns. Each use case gets its own durable queue trio
//! (`<uc>`, `<uc>.retry`, `<uc>.dlq`) bound to a shared topic exchange, so
//! every matching use case receives its own copy of an event and retries or
//! dead-letters independently of the others.
//!
//! ## Module Organization
//!
//! - [`app`] - [`EventApp`] lifecycle: register, start, publish, stop
//! - [`registry`] - Use-case bindings and event-name pattern matching
//! - [`topology`] - Exchange and queue provisioning
//! - [`publisher`] - Publishing with failover when the broker is down
//! - [`failover`] - Durable failover stores and the reconciler
//! - [`dispatcher`] - Consume loops bounded by a global semaphore
//! - [`retry`] - Exponential backoff, retry and dead-letter routing
//! - [`handler`] - Typed handler adapters and emitted events
//! - [`messaging`] - Broker trait with RabbitMQ and in-memory providers
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging bootstrap
//! - [`telemetry`] - W3C trace-context propagation
//! - [`resilience`] - Circuit breaker for broker publishes
//!
//! ## Delivery Semantics
//!
//! At least once. A delivery is acked only after its handler succeeded, or
//! after its retry or dead-letter copy is on the broker. Handlers must be
//! idempotent.
//!
//! ## Testing
//!
//! Unit tests run against [`messaging::InMemoryBroker`] and
//! [`failover::InMemoryFailoverStore`]. Tests that need RabbitMQ or
//! PostgreSQL are `#[ignore]`d:
//!
//! ```bash
//! cargo test
//! cargo test -- --ignored   # with RabbitMQ and DATABASE_URL available
//! ```

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failover;
pub mod handler;
pub mod logging;
pub mod messaging;
pub mod publisher;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod telemetry;
pub mod topology;

pub use app::{AppStats, EventApp};
pub use config::AppConfig;
pub use dispatcher::{DispatchStatsSnapshot, UseCaseStats};
pub use error::{PapaError, PapaResult};
pub use failover::{FailoverRecord, FailoverStatus, FailoverStore, ReconcileReport};
pub use handler::{EmittedEvent, EventHandler, HandlerError, HandlerOutcome};
pub use messaging::{Broker, EventEnvelope};
pub use publisher::PublishOutcome;
pub use registry::{EventPattern, UseCase, UseCaseBinding, UseCaseRegistry};
