//! Replays parked events once the broker is reachable again.
//!
//! A pass claims a batch of pending records, oldest first, and republishes
//! them in order. The first replay failure ends the pass: the broker is most
//! likely still down. Records the pass did not get to are released so the
//! next pass can pick them up straight away.
//!
//! A record is only replayed while its lease still covers a full publish
//! timeout, so a slow pass never races a reconciler that re-claimed it.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FailoverRecord, FailoverStore};
use crate::config::FailoverConfig;
use crate::error::PapaResult;
use crate::logging::log_failover_operation;
use crate::publisher::Publisher;

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub claimed: usize,
    pub delivered: usize,
    /// Replays that failed and will be tried again
    pub failed: usize,
    /// Claimed but not attempted, released for the next pass
    pub deferred: usize,
    /// Ids of records given up on during this pass
    pub abandoned: Vec<i64>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

pub struct FailoverReconciler {
    store: Arc<dyn FailoverStore>,
    publisher: Arc<Publisher>,
    config: FailoverConfig,
}

impl FailoverReconciler {
    pub fn new(
        store: Arc<dyn FailoverStore>,
        publisher: Arc<Publisher>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Run one reconciliation pass
    pub async fn reconcile(&self) -> PapaResult<ReconcileReport> {
        let records = self
            .store
            .claim_pending(self.config.batch_size, self.config.lease())
            .await?;

        let mut report = ReconcileReport {
            claimed: records.len(),
            ..ReconcileReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        debug!(
            claimed = records.len(),
            backend = self.store.backend_name(),
            "🔄 Reconciling failover records"
        );

        let mut next = 0;
        while let Some(record) = records.get(next) {
            if !self.lease_covers_publish(record) {
                warn!(
                    record_id = record.id,
                    claimed_until = ?record.claimed_until,
                    "⏱️ Failover lease too short for another replay, ending pass"
                );
                break;
            }
            next += 1;

            match self.publisher.republish(record).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_delivered(record.id).await {
                        warn!(
                            record_id = record.id,
                            error = %err,
                            "⚠️ Replayed record could not be marked delivered, ending pass"
                        );
                        break;
                    }
                    report.delivered += 1;
                    log_failover_operation(
                        "republish",
                        Some(record.id),
                        Some(&record.event_name),
                        "delivered",
                        None,
                    );
                }
                Err(err) => {
                    let message = err.to_string();
                    let attempts = self
                        .store
                        .record_attempt_failure(record.id, &message)
                        .await?;
                    report.failed += 1;

                    if let Some(reason) = self.give_up_reason(record, attempts, &message) {
                        self.abandon(record, &reason, &mut report).await?;
                    } else {
                        warn!(
                            record_id = record.id,
                            event_name = %record.event_name,
                            attempts = attempts,
                            error = %message,
                            "⚠️ Failover replay failed, ending pass"
                        );
                    }
                    break;
                }
            }
        }

        let unattempted = &records[next..];
        report.deferred = unattempted.len();
        if !unattempted.is_empty() {
            self.store.release(unattempted).await?;
        }

        if report.delivered > 0 || !report.abandoned.is_empty() {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                deferred = report.deferred,
                abandoned = report.abandoned.len(),
                "✅ Failover reconciliation pass complete"
            );
        }
        Ok(report)
    }

    fn lease_covers_publish(&self, record: &FailoverRecord) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(self.publisher.publish_timeout()) else {
            return false;
        };
        record
            .claimed_until
            .is_some_and(|until| Utc::now() + timeout < until)
    }

    /// Abandon only after a failed replay, once attempts or age run out
    fn give_up_reason(&self, record: &FailoverRecord, attempts: u32, error: &str) -> Option<String> {
        if attempts >= self.config.max_attempts {
            Some(format!("gave up after {attempts} attempts: {error}"))
        } else if record.age(Utc::now()) > self.config.max_age() {
            Some(format!(
                "exceeded max age of {}s after {attempts} attempts: {error}",
                self.config.max_age_secs
            ))
        } else {
            None
        }
    }

    /// Run `reconcile` every `reconcile_interval`, first pass one interval
    /// after spawning, until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.reconcile_interval();
        tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "🔄 Failover reconciler started");
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.reconcile().await {
                            error!(error = %err, "❌ Failover reconciliation pass failed");
                        }
                    }
                }
            }
            info!("🛑 Failover reconciler stopped");
        })
    }

    async fn abandon(
        &self,
        record: &FailoverRecord,
        reason: &str,
        report: &mut ReconcileReport,
    ) -> PapaResult<()> {
        self.store.mark_abandoned(record.id, reason).await?;
        error!(
            record_id = record.id,
            event_name = %record.event_name,
            enqueued_at = %record.enqueued_at,
            attempts = record.attempts,
            reason = %reason,
            "☠️ Failover record abandoned"
        );
        report.abandoned.push(record.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{FailoverStatus, InMemoryFailoverStore};
    use crate::messaging::{ExchangeSpec, Broker, InMemoryBroker};
    use std::time::Duration;

    async fn setup(config: FailoverConfig) -> (InMemoryBroker, Arc<InMemoryFailoverStore>, FailoverReconciler) {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::topic("domain_events"))
            .await
            .unwrap();
        let store = Arc::new(InMemoryFailoverStore::new());
        let publisher = Arc::new(
            Publisher::new(Arc::new(broker.clone()), "domain_events", Duration::from_secs(1))
                .with_failover(store.clone()),
        );
        let reconciler = FailoverReconciler::new(store.clone(), publisher, config);
        (broker, store, reconciler)
    }

    #[tokio::test]
    async fn test_replays_in_enqueue_order_and_marks_delivered() {
        let (broker, store, reconciler) = setup(FailoverConfig::default()).await;
        for name in ["a.one", "a.two", "a.three"] {
            store.record(name, b"{}", &Default::default()).await.unwrap();
        }

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.delivered, 3);
        let keys: Vec<String> = broker.published().into_iter().map(|p| p.routing_key).collect();
        assert_eq!(keys, vec!["a.one", "a.two", "a.three"]);

        let again = reconciler.reconcile().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(broker.published().len(), 3);
        assert_eq!(
            store.count_by_status(FailoverStatus::Delivered).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_failure_ends_pass_and_releases_the_rest() {
        let (broker, store, reconciler) = setup(FailoverConfig::default()).await;
        let first = store.record("a.one", b"{}", &Default::default()).await.unwrap();
        store.record("a.two", b"{}", &Default::default()).await.unwrap();
        broker.set_available(false);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(store.get(first).await.unwrap().unwrap().attempts, 1);

        // Both are claimable again without waiting out the lease
        broker.set_available(true);
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn test_abandons_after_max_attempts() {
        let config = FailoverConfig {
            max_attempts: 2,
            ..FailoverConfig::default()
        };
        let (broker, store, reconciler) = setup(config).await;
        let id = store.record("a.one", b"{}", &Default::default()).await.unwrap();
        broker.set_available(false);

        assert!(reconciler.reconcile().await.unwrap().abandoned.is_empty());
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.abandoned, vec![id]);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            FailoverStatus::Abandoned
        );
    }

    #[tokio::test]
    async fn test_old_record_is_abandoned_only_when_its_replay_fails() {
        let (broker, store, reconciler) = setup(FailoverConfig::default()).await;
        let id = store.record("a.one", b"{}", &Default::default()).await.unwrap();
        store.set_enqueued_at(id, Utc::now() - chrono::Duration::days(2));

        broker.set_available(false);
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.abandoned, vec![id]);
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, FailoverStatus::Abandoned);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_old_records_are_still_delivered_when_broker_is_healthy() {
        let config = FailoverConfig {
            max_age_secs: 60,
            ..FailoverConfig::default()
        };
        let (broker, store, reconciler) = setup(config).await;
        broker.set_available(false);
        let first = store.record("a.one", b"{}", &Default::default()).await.unwrap();
        let second = store.record("a.two", b"{}", &Default::default()).await.unwrap();
        for _ in 0..3 {
            reconciler.reconcile().await.unwrap();
        }
        assert_eq!(store.get(second).await.unwrap().unwrap().attempts, 0);

        for id in [first, second] {
            store.set_enqueued_at(id, Utc::now() - chrono::Duration::minutes(5));
        }
        broker.set_available(true);

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.abandoned.is_empty());
        assert_eq!(broker.published().len(), 2);
        assert_eq!(
            store.count_by_status(FailoverStatus::Delivered).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_skips_records_whose_lease_cannot_cover_a_publish() {
        let config = FailoverConfig {
            lease_ms: 100,
            ..FailoverConfig::default()
        };
        let (broker, store, reconciler) = setup(config).await;
        let id = store.record("a.one", b"{}", &Default::default()).await.unwrap();

        // Publish timeout is one second, longer than the lease
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.deferred, 1);
        assert!(broker.published().is_empty());

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, FailoverStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.claimed_until.is_none());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_cancel() {
        let config = FailoverConfig {
            reconcile_interval_ms: 10,
            ..FailoverConfig::default()
        };
        let (broker, store, reconciler) = setup(config).await;
        store.record("a.one", b"{}", &Default::default()).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = Arc::new(reconciler).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(broker.published().len(), 1);
    }
}
