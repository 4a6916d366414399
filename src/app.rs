//! # Event Application
//!
//! [`EventApp`] owns the lifecycle: use cases are registered while stopped,
//! `start()` connects the collaborators, provisions topology and spawns the
//! consume loops and failover reconciler, and `stop()` drains them in order.
//!
//! ```rust,no_run
//! use papa_events::handler::{self, HandlerError};
//! use papa_events::{AppConfig, EventApp, UseCase};
//!
//! # async fn example() -> papa_events::PapaResult<()> {
//! papa_events::logging::init_structured_logging();
//!
//! let mut app = EventApp::new(AppConfig::load(None)?);
//! app.register_use_case(UseCase::new(
//!     "send_welcome_email",
//!     ["user.created"],
//!     handler::payload_only(|user: serde_json::Value| async move {
//!         tracing::info!(?user, "sending welcome email");
//!         Ok::<_, HandlerError>(())
//!     }),
//! ))?;
//!
//! app.start().await?;
//! app.publish_json("user.created", &serde_json::json!({ "id": 1 })).await?;
//! app.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dispatcher::{DispatchStatsSnapshot, Dispatcher};
use crate::error::{PapaError, PapaResult};
use crate::failover::{
    FailoverReconciler, FailoverStore, PostgresFailoverStore, ReconcileReport,
};
use crate::messaging::{Broker, RabbitMqBroker, RabbitMqSettings};
use crate::publisher::{PublishOutcome, Publisher};
use crate::registry::{UseCase, UseCaseBinding, UseCaseRegistry};
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics};
use crate::retry::{BackoffPolicy, RetryController};
use crate::telemetry;
use crate::topology::{QueueTopology, TopologyManager};

/// Counters across the whole app
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppStats {
    pub dispatch: DispatchStatsSnapshot,
    /// Successful broker publishes, including replays
    pub published: u64,
    pub failed_over: u64,
    pub circuit_breaker: Option<CircuitBreakerMetrics>,
}

struct RunningApp {
    broker: Arc<dyn Broker>,
    publisher: Arc<Publisher>,
    dispatcher: Arc<Dispatcher>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    reconciler: Option<Arc<FailoverReconciler>>,
    reconciler_handle: Option<JoinHandle<()>>,
    topology: BTreeMap<String, QueueTopology>,
    shutdown: CancellationToken,
}

pub struct EventApp {
    config: AppConfig,
    registry: UseCaseRegistry,
    broker: Option<Arc<dyn Broker>>,
    failover_store: Option<Arc<dyn FailoverStore>>,
    running: Option<RunningApp>,
}

impl EventApp {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: UseCaseRegistry::new(),
            broker: None,
            failover_store: None,
            running: None,
        }
    }

    /// Use this broker instead of connecting to `broker_uri` on start
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use this failover store instead of connecting to `failover_uri` on start
    pub fn with_failover_store(mut self, store: Arc<dyn FailoverStore>) -> Self {
        self.failover_store = Some(store);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn register_use_case(&mut self, use_case: UseCase) -> PapaResult<Arc<UseCaseBinding>> {
        if self.running.is_some() {
            return Err(PapaError::AlreadyStarted);
        }
        self.registry
            .register_use_case(use_case, self.config.retries)
    }

    pub fn registry(&self) -> &UseCaseRegistry {
        &self.registry
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Connect, provision topology and start consuming.
    /// Topology conflicts are fatal and leave the app stopped.
    pub async fn start(&mut self) -> PapaResult<()> {
        if self.running.is_some() {
            return Err(PapaError::AlreadyStarted);
        }
        self.config.validate()?;
        telemetry::install_trace_propagator();

        info!(
            use_cases = self.registry.len(),
            exchange = %self.config.exchange,
            max_jobs = self.config.max_jobs,
            "🚀 Starting event app"
        );

        let broker = self.connect_broker().await?;
        match self.start_with(broker.clone()).await {
            Ok(running) => {
                self.running = Some(running);
                info!("✅ Event app started");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "❌ Event app failed to start");
                if let Err(close_err) = broker.close().await {
                    warn!(error = %close_err, "⚠️ Broker close after failed start also failed");
                }
                Err(err)
            }
        }
    }

    async fn start_with(&self, broker: Arc<dyn Broker>) -> PapaResult<RunningApp> {
        let backoff = BackoffPolicy::from_config(&self.config.backoff);
        let topology_manager = TopologyManager::new(broker.clone(), &self.config.exchange)
            .with_retry_ttl(backoff.hop());
        let topology = topology_manager.provision(self.registry.bindings()).await?;

        let failover_store = self.connect_failover_store().await?;

        let mut publisher = Publisher::new(
            broker.clone(),
            self.config.exchange.clone(),
            self.config.publish_timeout(),
        );
        let circuit_breaker = self.config.circuit_breaker.enabled.then(|| {
            Arc::new(CircuitBreaker::new(
                "broker_publish",
                &self.config.circuit_breaker,
            ))
        });
        if let Some(circuit_breaker) = &circuit_breaker {
            publisher = publisher.with_circuit_breaker(circuit_breaker.clone());
        }
        if let Some(store) = &failover_store {
            publisher = publisher.with_failover(store.clone());
        }
        let publisher = Arc::new(publisher);

        let retry = Arc::new(RetryController::new(
            broker.clone(),
            topology_manager.exchanges().clone(),
            backoff,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            broker.clone(),
            publisher.clone(),
            retry,
            self.config.max_jobs,
            self.config.handler_timeout(),
        ));

        let shutdown = CancellationToken::new();
        dispatcher
            .start(self.registry.bindings(), shutdown.clone())
            .await?;

        let reconciler = failover_store.map(|store| {
            Arc::new(FailoverReconciler::new(
                store,
                publisher.clone(),
                self.config.failover.clone(),
            ))
        });
        let reconciler_handle = reconciler
            .as_ref()
            .map(|reconciler| reconciler.clone().spawn(shutdown.child_token()));

        Ok(RunningApp {
            broker,
            publisher,
            dispatcher,
            circuit_breaker,
            reconciler,
            reconciler_handle,
            topology,
            shutdown,
        })
    }

    async fn connect_broker(&self) -> PapaResult<Arc<dyn Broker>> {
        if let Some(broker) = &self.broker {
            return Ok(broker.clone());
        }
        let settings = RabbitMqSettings::from_config(&self.config);
        let broker = RabbitMqBroker::connect(settings).await?;
        Ok(Arc::new(broker))
    }

    async fn connect_failover_store(&self) -> PapaResult<Option<Arc<dyn FailoverStore>>> {
        if let Some(store) = &self.failover_store {
            return Ok(Some(store.clone()));
        }
        match &self.config.failover_uri {
            Some(uri) => {
                let store = PostgresFailoverStore::connect(uri).await?;
                Ok(Some(Arc::new(store)))
            }
            None => {
                warn!("⚠️ No failover store configured, publishes fail while the broker is down");
                Ok(None)
            }
        }
    }

    fn running(&self) -> PapaResult<&RunningApp> {
        self.running.as_ref().ok_or(PapaError::NotStarted)
    }

    pub async fn publish(
        &self,
        event_name: &str,
        payload: impl Into<Vec<u8>>,
    ) -> PapaResult<PublishOutcome> {
        self.running()?.publisher.publish(event_name, payload).await
    }

    pub async fn publish_json<T>(&self, event_name: &str, payload: &T) -> PapaResult<PublishOutcome>
    where
        T: Serialize + ?Sized,
    {
        self.running()?
            .publisher
            .publish_json(event_name, payload)
            .await
    }

    /// Run one failover reconciliation pass now
    pub async fn reconcile_failover(&self) -> PapaResult<ReconcileReport> {
        match &self.running()?.reconciler {
            Some(reconciler) => reconciler.reconcile().await,
            None => Ok(ReconcileReport::default()),
        }
    }

    pub fn stats(&self) -> AppStats {
        match &self.running {
            Some(running) => AppStats {
                dispatch: running.dispatcher.stats().snapshot(),
                published: running.publisher.published_count(),
                failed_over: running.publisher.failed_over_count(),
                circuit_breaker: running.circuit_breaker.as_ref().map(|cb| cb.metrics()),
            },
            None => AppStats::default(),
        }
    }

    /// Provisioned queues per use case
    pub fn topology(&self) -> Option<&BTreeMap<String, QueueTopology>> {
        self.running.as_ref().map(|running| &running.topology)
    }

    /// Stop consuming, wait up to `shutdown_grace` for in-flight handlers,
    /// stop the reconciler, then close the broker. Handlers still running
    /// after the grace period are abandoned unacked.
    pub async fn stop(&mut self) -> PapaResult<()> {
        let running = self.running.take().ok_or(PapaError::NotStarted)?;
        info!("🛑 Stopping event app");

        running.shutdown.cancel();
        let drained = running
            .dispatcher
            .drain(self.config.shutdown_grace())
            .await;

        if let Some(handle) = running.reconciler_handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "⚠️ Failover reconciler task ended abnormally");
            }
        }

        running.broker.close().await?;
        info!(drained = drained, "✅ Event app stopped");
        Ok(())
    }
}
