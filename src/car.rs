//! Car payload and the durable pending-record entity.
//!
//! A [`Car`] is the unit of work flowing through the pipeline. When the
//! remote queue is unavailable a car is persisted locally as a
//! [`PendingRecord`] until a recovery drain delivers it.

use serde::{Deserialize, Serialize};

/// The car payload. Immutable once created.
///
/// Field names on the wire are camelCase to match the queue contract
/// consumed by downstream workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Car {
    pub normalized_make: String,
    pub normalized_model: String,
    pub year: i32,
    pub price: f64,
    pub location: String,
}

/// Lifecycle status of a locally persisted record.
///
/// Legal transitions: `Pending → Recovering → Sent`, and
/// `Recovering → Pending` when a delivery attempt fails or a claim goes
/// stale. `Sent` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Recovering,
    Sent,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Recovering => "recovering",
            Self::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "recovering" => Some(Self::Recovering),
            "sent" => Some(Self::Sent),
            _ => None,
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A car persisted in the durable store while the remote is unavailable.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// Globally unique: `<instance>-<ms-epoch>-<index>-<rand>`.
    pub id: String,
    pub car: Car,
    /// Epoch millis at persistence; monotonically increasing within a batch.
    pub created_at: i64,
    pub status: PendingStatus,
    pub retry_count: i64,
    /// Instance currently claiming this record for recovery.
    pub recovery_instance: Option<String>,
    /// Epoch millis when the claim was taken.
    pub recovery_started_at: Option<i64>,
    /// Job id returned by the remote queue once delivered.
    pub redis_job_id: Option<String>,
}

/// Identity of this producer process: `<pid>-<startEpochMs>`.
///
/// Combined with a per-store counter and a random segment this makes
/// record ids unique across concurrent producers writing the same file.
pub fn instance_id() -> String {
    format!("{}-{}", std::process::id(), now_ms())
}

/// Build a record id: `<instance>-<ms-epoch>-<index>-<rand>`.
pub fn record_id(instance: &str, index: u64) -> String {
    let rand_segment = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", instance, now_ms(), index, &rand_segment[..6])
}

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
