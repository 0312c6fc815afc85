//! Failover metrics: session tracking and the structured event log.
//!
//! [`FailoverMetrics`] stitches the distributed failover timeline into
//! sessions. A session opens on the first degraded-path event and closes
//! when the producer returns to redis mode; each event is appended to a
//! daily log file as one JSON object per event, separated by blank lines.
//!
//! The free functions at the bottom are the ambient `metrics` facade
//! (counters/gauges); the exporter is the embedding process's choice.
//!
//! # Metric Naming Convention
//! - `car_seeder_` prefix for all metrics
//! - `_total` suffix for counters

use chrono::{Local, SecondsFormat, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::car::now_ms;
use crate::error::Result;
use crate::state::SeederMode;

/// One failover timeline: from master failure through restored operation.
#[derive(Debug, Default, Clone)]
struct FailoverSession {
    id: String,
    master_failure_at: Option<i64>,
    promotion_at: Option<i64>,
    to_sqlite_at: Option<i64>,
    recovery_started_at: Option<i64>,
    recovery_completed_at: Option<i64>,
}

/// Session tracker and event log writer.
pub struct FailoverMetrics {
    log_dir: PathBuf,
    session: Mutex<Option<FailoverSession>>,
    session_seq: AtomicU64,
    sqlite_fallback_count: AtomicU64,
    /// Serializes appends to the daily file.
    sink: Mutex<()>,
}

impl FailoverMetrics {
    /// Create the tracker, ensuring the log directory exists.
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            session: Mutex::new(None),
            session_seq: AtomicU64::new(0),
            sqlite_fallback_count: AtomicU64::new(0),
            sink: Mutex::new(()),
        })
    }

    /// Master replica failure detected (breaker tripped on transport errors).
    pub fn record_master_failure(&self) {
        let session_id = {
            let mut guard = self.session.lock();
            let session = self.ensure_session(&mut guard);
            session.master_failure_at.get_or_insert(now_ms());
            session.id.clone()
        };
        self.emit("MasterFailureDetected", &session_id, Map::new());
    }

    /// The sentinel quorum promoted a new master (or a write probe confirmed
    /// the remote is back).
    pub fn record_sentinel_promotion(&self) {
        let (session_id, since_failure_ms) = {
            let mut guard = self.session.lock();
            let session = self.ensure_session(&mut guard);
            let now = now_ms();
            session.promotion_at.get_or_insert(now);
            let since = session.master_failure_at.map(|t| now - t);
            (session.id.clone(), since)
        };
        let mut details = Map::new();
        details.insert("msSinceMasterFailure".into(), opt_ms(since_failure_ms));
        self.emit("SentinelPromotion", &session_id, details);
    }

    /// Writes started falling through to the durable store.
    pub fn record_state_transition_to_sqlite(&self) {
        let session_id = {
            let mut guard = self.session.lock();
            let session = self.ensure_session(&mut guard);
            session.to_sqlite_at.get_or_insert(now_ms());
            session.id.clone()
        };
        self.emit("StateTransitionToSqlite", &session_id, Map::new());
    }

    /// Remote operation restored: closes the active session and reports the
    /// derived durations plus the fallback count (which resets).
    pub fn record_state_transition_to_redis(&self) {
        let (session_id, details) = {
            let mut guard = self.session.lock();
            if guard.is_none() {
                warn!("Returning to redis mode without an active failover session");
            }
            let session = self.ensure_session(&mut guard);
            let now = now_ms();

            let total_failover_ms = session.master_failure_at.map(|t| now - t);
            let degraded_ms = session.to_sqlite_at.map(|t| now - t);
            let promotion_ms = match (session.master_failure_at, session.promotion_at) {
                (Some(f), Some(p)) => Some(p - f),
                _ => None,
            };
            let fallback_count = self.sqlite_fallback_count.swap(0, Ordering::AcqRel);

            let mut details = Map::new();
            details.insert("totalFailoverDurationMs".into(), opt_ms(total_failover_ms));
            details.insert("sqliteModeDurationMs".into(), opt_ms(degraded_ms));
            details.insert("promotionDurationMs".into(), opt_ms(promotion_ms));
            details.insert("sqliteFallbackCount".into(), json!(fallback_count));

            let id = session.id.clone();
            *guard = None;
            (id, details)
        };

        self.emit("StateTransitionToRedis", &session_id, details);
        info!(session = %session_id, "Failover session closed");
    }

    /// A recovery drain started.
    pub fn record_recovery_started(&self) {
        let session_id = {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                Some(session) => {
                    session.recovery_started_at.get_or_insert(now_ms());
                    session.id.clone()
                }
                // Drains can run outside a failover (leftover records from a
                // previous process); they are logged without a session.
                None => String::new(),
            }
        };
        self.emit("RecoveryStarted", &session_id, Map::new());
    }

    /// A recovery drain finished.
    pub fn record_recovery_completed(&self, entries_recovered: usize, entries_failed: usize) {
        let session_id = {
            let mut guard = self.session.lock();
            match guard.as_mut() {
                Some(session) => {
                    session.recovery_completed_at = Some(now_ms());
                    session.id.clone()
                }
                None => String::new(),
            }
        };
        let mut details = Map::new();
        details.insert("entriesRecovered".into(), json!(entries_recovered));
        if entries_failed > 0 {
            details.insert("entriesFailed".into(), json!(entries_failed));
        }
        self.emit("RecoveryCompleted", &session_id, details);
    }

    /// One record fell through to the durable store.
    pub fn increment_fallback_count(&self) {
        self.sqlite_fallback_count.fetch_add(1, Ordering::AcqRel);
        counter!("car_seeder_sqlite_fallback_total").increment(1);
    }

    /// Current fallback count (resets when a session closes).
    #[must_use]
    pub fn fallback_count(&self) -> u64 {
        self.sqlite_fallback_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Path of today's log file.
    #[must_use]
    pub fn log_file_path(&self) -> PathBuf {
        let day = Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("failover-metrics-{}.log", day))
    }

    fn ensure_session<'a>(
        &self,
        guard: &'a mut Option<FailoverSession>,
    ) -> &'a mut FailoverSession {
        guard.get_or_insert_with(|| {
            let n = self.session_seq.fetch_add(1, Ordering::AcqRel) + 1;
            let id = format!("failover-{}-{}", n, now_ms());
            info!(session = %id, "Failover session opened");
            FailoverSession { id, ..Default::default() }
        })
    }

    fn emit(&self, event: &str, session_id: &str, details: Map<String, Value>) {
        counter!("car_seeder_failover_events_total", "event" => event.to_string()).increment(1);

        let rand_segment = uuid::Uuid::new_v4().simple().to_string();
        let mut line = Map::new();
        line.insert("id".into(), json!(format!("event-{}-{}", now_ms(), &rand_segment[..6])));
        line.insert(
            "timestamp".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        line.insert("event".into(), json!(event));
        if !session_id.is_empty() {
            line.insert("sessionId".into(), json!(session_id));
        }
        for (k, v) in details {
            line.insert(k, v);
        }

        let _guard = self.sink.lock();
        let path = self.log_file_path();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}\n", Value::Object(line)));
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "Failed to append metrics event");
        }
    }
}

fn opt_ms(v: Option<i64>) -> Value {
    v.map(|ms| json!(ms)).unwrap_or(Value::Null)
}

// --- Ambient metrics facade ---

/// Circuit breaker state gauge (0 = closed, 1 = half-open, 2 = open).
pub fn set_breaker_state(circuit: &str, state: u8) {
    gauge!("car_seeder_circuit_breaker_state", "circuit" => circuit.to_string())
        .set(state as f64);
}

/// Seeder mode gauge (0 = redis, 1 = sqlite).
pub fn set_seeder_mode(mode: SeederMode) {
    let v = match mode {
        SeederMode::RedisMode => 0.0,
        SeederMode::SqliteMode => 1.0,
    };
    gauge!("car_seeder_mode").set(v);
}

/// Record a generated car.
pub fn record_car_generated() {
    counter!("car_seeder_cars_generated_total").increment(1);
}

/// Record a successful enqueue to the remote queue.
pub fn record_car_enqueued() {
    counter!("car_seeder_cars_enqueued_total").increment(1);
}

/// Record the outcome of a recovery drain.
pub fn record_recovery_drain(recovered: usize, failed: usize) {
    counter!("car_seeder_recovery_drained_total").increment(recovered as u64);
    if failed > 0 {
        counter!("car_seeder_recovery_failed_total").increment(failed as u64);
    }
}

/// Pending-record gauge for the durable store.
pub fn set_pending_records(count: u64) {
    gauge!("car_seeder_pending_records").set(count as f64);
}
