//! # Publish Failover
//!
//! Durable side-channel for events the broker could not accept. The
//! publisher records them here; the [`FailoverReconciler`] later replays them
//! through the publisher and marks them delivered.
//!
//! Records move `pending → delivered` or `pending → abandoned`, never back.
//! Claims are leased so concurrent reconcilers never replay the same record
//! at the same time.

pub mod memory;
pub mod postgres;
pub mod reconciler;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PapaError, PapaResult};
use crate::messaging::Headers;

pub use memory::InMemoryFailoverStore;
pub use postgres::PostgresFailoverStore;
pub use reconciler::{FailoverReconciler, ReconcileReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Pending,
    Delivered,
    Abandoned,
}

impl FailoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverStatus::Pending => "pending",
            FailoverStatus::Delivered => "delivered",
            FailoverStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for FailoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailoverStatus {
    type Err = PapaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FailoverStatus::Pending),
            "delivered" => Ok(FailoverStatus::Delivered),
            "abandoned" => Ok(FailoverStatus::Abandoned),
            other => Err(PapaError::failover_store(
                "decode",
                format!("unknown failover status '{other}'"),
            )),
        }
    }
}

/// An event parked in the failover store
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverRecord {
    pub id: i64,
    pub event_name: String,
    pub payload: Vec<u8>,
    /// Envelope headers at the time of the failed publish
    pub headers: Headers,
    pub status: FailoverStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl FailoverRecord {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at).to_std().unwrap_or_default()
    }
}

#[async_trait]
pub trait FailoverStore: Send + Sync + 'static {
    /// Persist an event. Durable once this returns.
    async fn record(&self, event_name: &str, payload: &[u8], headers: &Headers)
        -> PapaResult<i64>;

    /// Claim up to `limit` pending records, oldest first. Claimed records stay
    /// invisible to other claimers until `lease` elapses.
    async fn claim_pending(&self, limit: u32, lease: Duration) -> PapaResult<Vec<FailoverRecord>>;

    /// Hand claimed records back before their lease runs out. A record is only
    /// released while it still carries the `claimed_until` it was claimed with,
    /// so a claim taken over by another reconciler is left alone.
    async fn release(&self, records: &[FailoverRecord]) -> PapaResult<()>;

    /// Transition a pending record to delivered
    async fn mark_delivered(&self, id: i64) -> PapaResult<()>;

    /// Count a failed replay, release the lease, return the attempt count
    async fn record_attempt_failure(&self, id: i64, error: &str) -> PapaResult<u32>;

    /// Transition a pending record to abandoned
    async fn mark_abandoned(&self, id: i64, reason: &str) -> PapaResult<()>;

    async fn get(&self, id: i64) -> PapaResult<Option<FailoverRecord>>;

    async fn count_by_status(&self, status: FailoverStatus) -> PapaResult<u64>;

    fn backend_name(&self) -> &'static str;
}
