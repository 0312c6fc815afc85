//! Durable fallback store for cars the remote queue could not take.
//!
//! Backed by a local SQLite file opened with full synchronous commits.
//! Writes are buffered and committed in batches (count or deadline
//! triggered); recovery claims batches of pending records through a
//! RESERVED-lock transaction so concurrent producers draining the same
//! file cannot claim the same record twice.
//!
//! This is not a second queue - it's a durability buffer. Records here
//! are "in flight" to the remote queue, not a permanent home.

use sqlx::sqlite::{
    SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::car::{now_ms, record_id, Car, PendingRecord, PendingStatus};
use crate::error::{Result, SeederError};

/// How often the background task checks the flush deadline.
const FLUSH_TICK: Duration = Duration::from_millis(50);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pending_cars (
        id TEXT PRIMARY KEY,
        normalized_make TEXT NOT NULL,
        normalized_model TEXT NOT NULL,
        year INTEGER NOT NULL,
        price REAL NOT NULL,
        location TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        recovery_instance TEXT,
        recovery_started_at INTEGER,
        redis_job_id TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pending_cars_status_created
        ON pending_cars(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_pending_cars_recovery_instance
        ON pending_cars(recovery_instance)",
];

/// Claim is a single statement so partial claims are impossible: the
/// select and the update happen atomically under the write lock.
const CLAIM_SQL: &str = r#"
    UPDATE pending_cars
    SET status = 'recovering', recovery_instance = ?1, recovery_started_at = ?2
    WHERE id IN (
        SELECT id FROM pending_cars
        WHERE status = 'pending'
        ORDER BY created_at ASC
        LIMIT ?3
    )
    RETURNING id, normalized_make, normalized_model, year, price, location,
              created_at, status, retry_count, recovery_instance,
              recovery_started_at, redis_job_id
"#;

struct SaveBuffer {
    cars: Vec<Car>,
    /// Set when the first record lands in an empty buffer; the flush
    /// deadline counts from here.
    first_buffered: Option<Instant>,
}

/// Batched, claim-aware durable store over SQLite.
pub struct PendingStore {
    pool: SqlitePool,
    instance: String,
    batch_size: usize,
    flush_interval: Duration,
    buffer: Mutex<SaveBuffer>,
    seq: AtomicU64,
    last_created_at: AtomicI64,
    shutting_down: AtomicBool,
    flush_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PendingStore {
    /// Open (and create if needed) the store at `path`, apply PRAGMAs,
    /// ensure the schema, and start the background flush task.
    pub async fn open(
        path: impl AsRef<Path>,
        instance: &str,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Full)
            .pragma("cache_size", "10000");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let store = Arc::new(Self {
            pool,
            instance: instance.to_string(),
            batch_size,
            flush_interval,
            buffer: Mutex::new(SaveBuffer { cars: Vec::new(), first_buffered: None }),
            seq: AtomicU64::new(0),
            last_created_at: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            flush_task: parking_lot::Mutex::new(None),
        });

        let existing = store.pending_count().await.unwrap_or(0);
        if existing > 0 {
            warn!(pending = existing, path = %path.display(), "Store has pending records from a previous run");
        }
        info!(path = %path.display(), batch_size, flush_ms = flush_interval.as_millis() as u64, "Durable store opened");

        store.spawn_flush_task();
        Ok(store)
    }

    fn spawn_flush_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(store) = weak.upgrade() else { break };
                if store.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                store.flush_if_due().await;
            }
        });
        *self.flush_task.lock() = Some(handle);
    }

    /// Buffered append. Commits when the buffer reaches the batch size;
    /// the background task handles the deadline trigger. While shutdown is
    /// in progress, saves are silently dropped - recovery relies on prior
    /// commits.
    pub async fn save_car(&self, car: Car) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("Dropping save during shutdown");
            return Ok(());
        }

        let ready = {
            let mut buffer = self.buffer.lock().await;
            buffer.cars.push(car);
            if buffer.first_buffered.is_none() {
                buffer.first_buffered = Some(Instant::now());
            }
            if buffer.cars.len() >= self.batch_size {
                buffer.first_buffered = None;
                Some(std::mem::take(&mut buffer.cars))
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            self.commit_batch(batch).await?;
        }
        Ok(())
    }

    /// Force the buffer to commit now.
    pub async fn flush_pending_writes(&self) -> Result<()> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.first_buffered = None;
            std::mem::take(&mut buffer.cars)
        };
        self.commit_batch(batch).await
    }

    async fn flush_if_due(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            match buffer.first_buffered {
                Some(first) if first.elapsed() >= self.flush_interval => {
                    buffer.first_buffered = None;
                    Some(std::mem::take(&mut buffer.cars))
                }
                _ => None,
            }
        };
        if let Some(batch) = batch {
            if let Err(e) = self.commit_batch(batch).await {
                // Records were re-buffered; the next flush retries them.
                error!(error = %e, "Deadline flush failed");
            }
        }
    }

    /// Commit a batch in one transaction. On failure the batch goes back to
    /// the front of the buffer and the error surfaces.
    async fn commit_batch(&self, batch: Vec<Car>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();

        match self.try_commit(&batch).await {
            Ok(()) => {
                debug!(count, "Committed batch to durable store");
                Ok(())
            }
            Err(e) => {
                let mut buffer = self.buffer.lock().await;
                let restored = batch.into_iter().rev();
                for car in restored {
                    buffer.cars.insert(0, car);
                }
                if buffer.first_buffered.is_none() {
                    buffer.first_buffered = Some(Instant::now());
                }
                warn!(count, error = %e, "Batch commit failed, records re-buffered");
                Err(e)
            }
        }
    }

    async fn try_commit(&self, batch: &[Car]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for car in batch {
            let index = self.seq.fetch_add(1, Ordering::AcqRel);
            let id = record_id(&self.instance, index);
            let created_at = self.next_created_at();
            sqlx::query(
                "INSERT INTO pending_cars
                    (id, normalized_make, normalized_model, year, price, location,
                     created_at, status, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0)",
            )
            .bind(&id)
            .bind(&car.normalized_make)
            .bind(&car.normalized_model)
            .bind(car.year)
            .bind(car.price)
            .bind(&car.location)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Strictly increasing timestamps, so ordering by `created_at` inside a
    /// batch is total even at millisecond resolution.
    fn next_created_at(&self) -> i64 {
        let now = now_ms();
        let mut prev = self.last_created_at.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_created_at.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(p) => prev = p,
            }
        }
    }

    /// Atomically claim up to `limit` pending records for `instance`.
    ///
    /// Runs under `BEGIN IMMEDIATE` so two claimers serialize on the write
    /// lock; the claim itself is one statement, so a claim is all-or-nothing.
    pub async fn claim_pending(&self, limit: usize, instance: &str) -> Result<Vec<PendingRecord>> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let rows = match sqlx::query(CLAIM_SQL)
            .bind(instance)
            .bind(now_ms())
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e.into());
            }
        };

        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }

        rows.iter().map(row_to_record).collect()
    }

    /// Mark delivered records `sent` with their remote job ids (zipped by
    /// index; a missing job id stores NULL). Idempotent on already-sent
    /// rows; never touches a row that has been reverted to `pending`.
    pub async fn mark_sent(&self, ids: &[String], job_ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (i, id) in ids.iter().enumerate() {
            let job_id = job_ids.get(i).map(|s| s.as_str());
            sqlx::query(
                "UPDATE pending_cars
                 SET status = 'sent', redis_job_id = ?1
                 WHERE id = ?2 AND status <> 'pending'",
            )
            .bind(job_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Release records whose delivery attempt failed back to `pending`,
    /// bumping their retry count and clearing the claim.
    pub async fn mark_pending(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE pending_cars
                 SET status = 'pending', retry_count = retry_count + 1,
                     recovery_instance = NULL, recovery_started_at = NULL
                 WHERE id = ?1 AND status = 'recovering'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Number of records waiting for delivery.
    pub async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_cars WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let count = count.max(0) as u64;
        crate::metrics::set_pending_records(count);
        Ok(count)
    }

    /// Revert claims older than `max_age` back to `pending`, so records
    /// abandoned by a dead instance become claimable again. Returns how
    /// many were reverted.
    pub async fn cleanup_stale_claims(&self, max_age: Duration) -> Result<u64> {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE pending_cars
             SET status = 'pending', recovery_instance = NULL, recovery_started_at = NULL
             WHERE status = 'recovering' AND recovery_started_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let reverted = result.rows_affected();
        if reverted > 0 {
            info!(reverted, "Reverted stale recovery claims");
        }
        Ok(reverted)
    }

    /// Fetch one record by id.
    pub async fn get(&self, id: &str) -> Result<Option<PendingRecord>> {
        let row = sqlx::query(
            "SELECT id, normalized_make, normalized_model, year, price, location,
                    created_at, status, retry_count, recovery_instance,
                    recovery_started_at, redis_job_id
             FROM pending_cars WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Count rows in a given status (observability and tests).
    pub async fn count_by_status(&self, status: PendingStatus) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_cars WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    /// The instance identity used for generated record ids.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The underlying pool, for callers that need raw queries (tests,
    /// operational tooling).
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Mark shutdown (new saves are dropped), flush the buffer, stop the
    /// flush task and close the pool.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.flush_pending_writes().await {
            error!(error = %e, "Final flush failed during close");
        }
        self.pool.close().await;
        info!("Durable store closed");
    }
}

fn row_to_record(row: &SqliteRow) -> Result<PendingRecord> {
    let status_text: String = row.try_get("status")?;
    let status = PendingStatus::parse(&status_text).ok_or_else(|| {
        SeederError::Store(sqlx::Error::Decode(
            format!("unknown status '{}' in pending_cars", status_text).into(),
        ))
    })?;

    Ok(PendingRecord {
        id: row.try_get("id")?,
        car: Car {
            normalized_make: row.try_get("normalized_make")?,
            normalized_model: row.try_get("normalized_model")?,
            year: row.try_get("year")?,
            price: row.try_get("price")?,
            location: row.try_get("location")?,
        },
        created_at: row.try_get("created_at")?,
        status,
        retry_count: row.try_get("retry_count")?,
        recovery_instance: row.try_get("recovery_instance")?,
        recovery_started_at: row.try_get("recovery_started_at")?,
        redis_job_id: row.try_get("redis_job_id")?,
    })
}
