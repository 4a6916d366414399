#![allow(dead_code)]

pub mod strategies;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use papa_events::config::{BackoffConfig, FailoverConfig};
use papa_events::failover::InMemoryFailoverStore;
use papa_events::messaging::InMemoryBroker;
use papa_events::{AppConfig, AppStats, EventApp};

/// Config with millisecond backoff so retry tests finish quickly
pub fn fast_config() -> AppConfig {
    AppConfig {
        max_jobs: 4,
        retries: 3,
        backoff: BackoffConfig {
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 50,
        },
        failover: FailoverConfig {
            reconcile_interval_ms: 3_600_000,
            ..FailoverConfig::default()
        },
        shutdown_grace_ms: 1_000,
        ..AppConfig::default()
    }
}

pub struct TestApp {
    pub app: EventApp,
    pub broker: InMemoryBroker,
    pub failover: Arc<InMemoryFailoverStore>,
}

pub fn test_app(config: AppConfig) -> TestApp {
    let broker = InMemoryBroker::new();
    let failover = Arc::new(InMemoryFailoverStore::new());
    let app = EventApp::new(config)
        .with_broker(Arc::new(broker.clone()))
        .with_failover_store(failover.clone());
    TestApp {
        app,
        broker,
        failover,
    }
}

/// Poll app stats until `done` holds, panicking after two seconds
pub async fn wait_until<F>(app: &EventApp, done: F)
where
    F: Fn(&AppStats) -> bool,
{
    for _ in 0..200 {
        let stats = app.stats();
        if done(&stats) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached, last stats: {:?}", app.stats());
}

/// Shared invocation counter for handlers under test
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn hit(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
