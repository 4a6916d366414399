//! In-memory failover store for tests and single-process development.
//! Same state machine and lease semantics as the Postgres store, no durability.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{FailoverRecord, FailoverStatus, FailoverStore};
use crate::error::{PapaError, PapaResult};
use crate::messaging::Headers;

#[derive(Debug)]
pub struct InMemoryFailoverStore {
    records: Mutex<BTreeMap<i64, FailoverRecord>>,
    next_id: AtomicI64,
    available: AtomicBool,
}

impl Default for InMemoryFailoverStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFailoverStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<FailoverRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// Backdate a record, for age-based abandonment tests
    pub fn set_enqueued_at(&self, id: i64, enqueued_at: chrono::DateTime<Utc>) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.enqueued_at = enqueued_at;
        }
    }

    fn ensure_available(&self, operation: &str) -> PapaResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else if operation == "record" {
            Err(PapaError::failover_write("in-memory failover store unavailable"))
        } else {
            Err(PapaError::failover_store(
                operation,
                "in-memory failover store unavailable",
            ))
        }
    }

    fn transition(&self, id: i64, to: FailoverStatus, note: Option<&str>) -> PapaResult<()> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or_else(|| {
            PapaError::failover_store(to.as_str(), format!("record {id} not found"))
        })?;
        if record.status != FailoverStatus::Pending {
            return Err(PapaError::failover_store(
                to.as_str(),
                format!("record {id} is already {}", record.status),
            ));
        }
        record.status = to;
        record.claimed_until = None;
        if let Some(note) = note {
            record.last_error = Some(note.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl FailoverStore for InMemoryFailoverStore {
    async fn record(
        &self,
        event_name: &str,
        payload: &[u8],
        headers: &Headers,
    ) -> PapaResult<i64> {
        self.ensure_available("record")?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.lock().insert(
            id,
            FailoverRecord {
                id,
                event_name: event_name.to_string(),
                payload: payload.to_vec(),
                headers: headers.clone(),
                status: FailoverStatus::Pending,
                attempts: 0,
                last_error: None,
                enqueued_at: Utc::now(),
                claimed_until: None,
            },
        );
        Ok(id)
    }

    async fn claim_pending(&self, limit: u32, lease: Duration) -> PapaResult<Vec<FailoverRecord>> {
        self.ensure_available("claim_pending")?;
        let now = Utc::now();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());

        let mut records = self.records.lock();
        let mut candidates: Vec<&mut FailoverRecord> = records
            .values_mut()
            .filter(|r| r.status == FailoverStatus::Pending)
            .filter(|r| r.claimed_until.map_or(true, |until| until < now))
            .collect();
        candidates.sort_by_key(|r| (r.enqueued_at, r.id));

        Ok(candidates
            .into_iter()
            .take(limit as usize)
            .map(|record| {
                record.claimed_until = Some(lease_until);
                record.clone()
            })
            .collect())
    }

    async fn release(&self, released: &[FailoverRecord]) -> PapaResult<()> {
        self.ensure_available("release")?;
        let mut records = self.records.lock();
        for claimed in released {
            if let Some(record) = records.get_mut(&claimed.id) {
                if record.status == FailoverStatus::Pending
                    && record.claimed_until == claimed.claimed_until
                {
                    record.claimed_until = None;
                }
            }
        }
        Ok(())
    }

    async fn mark_delivered(&self, id: i64) -> PapaResult<()> {
        self.ensure_available("mark_delivered")?;
        self.transition(id, FailoverStatus::Delivered, None)
    }

    async fn record_attempt_failure(&self, id: i64, error: &str) -> PapaResult<u32> {
        self.ensure_available("record_attempt_failure")?;
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or_else(|| {
            PapaError::failover_store("record_attempt_failure", format!("record {id} not found"))
        })?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        record.claimed_until = None;
        Ok(record.attempts)
    }

    async fn mark_abandoned(&self, id: i64, reason: &str) -> PapaResult<()> {
        self.ensure_available("mark_abandoned")?;
        self.transition(id, FailoverStatus::Abandoned, Some(reason))
    }

    async fn get(&self, id: i64) -> PapaResult<Option<FailoverRecord>> {
        self.ensure_available("get")?;
        Ok(self.records.lock().get(&id).cloned())
    }

    async fn count_by_status(&self, status: FailoverStatus) -> PapaResult<u64> {
        self.ensure_available("count_by_status")?;
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.status == status)
            .count() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "in_memory"
    }
}
