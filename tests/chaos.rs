//! Chaos tests: failure injection into the drain loop and the full
//! failover pipeline, using fake queues with precise error triggers.
//!
//! ```bash
//! cargo test --test chaos
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use car_seeder::{
    BreakerState, Car, CircuitBreaker, CircuitConfig, EnqueueOptions, FailoverMetrics, JobQueue,
    PendingStatus, PendingStore, RecoveryManager, SeederConfig, SeederError, SeederMode,
    StateManager, WriteHandler,
};

// =============================================================================
// Failure-injecting queue
// =============================================================================

/// Fails enqueue on exact call numbers (1-indexed); can also be switched
/// hard-down, which fails everything including pings.
struct ChaosQueue {
    down: AtomicBool,
    enqueue_calls: AtomicU64,
    fail_enqueues_on: Vec<u64>,
    /// Go hard-down after this many successful enqueues (0 = never).
    die_after: u64,
    delivered: parking_lot::Mutex<Vec<Car>>,
    next_job: AtomicU64,
    ready_tx: broadcast::Sender<()>,
}

impl ChaosQueue {
    fn new(fail_enqueues_on: Vec<u64>, die_after: u64) -> Arc<Self> {
        let (ready_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            down: AtomicBool::new(false),
            enqueue_calls: AtomicU64::new(0),
            fail_enqueues_on,
            die_after,
            delivered: parking_lot::Mutex::new(Vec::new()),
            next_job: AtomicU64::new(1),
            ready_tx,
        })
    }

    fn healthy() -> Arc<Self> {
        Self::new(Vec::new(), 0)
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
        if !down {
            let _ = self.ready_tx.send(());
        }
    }

    fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl JobQueue for ChaosQueue {
    async fn enqueue(
        &self,
        _job: &str,
        car: &Car,
        _opts: &EnqueueOptions,
    ) -> car_seeder::Result<String> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SeederError::Queue("connection refused".into()));
        }
        let call = self.enqueue_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_enqueues_on.contains(&call) {
            return Err(SeederError::Queue("connection reset by peer".into()));
        }
        {
            let mut delivered = self.delivered.lock();
            delivered.push(car.clone());
            if self.die_after > 0 && delivered.len() as u64 >= self.die_after {
                self.down.store(true, Ordering::SeqCst);
            }
        }
        Ok(self.next_job.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn ping(&self) -> car_seeder::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(SeederError::Queue("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn test_write(&self) -> car_seeder::Result<()> {
        self.ping().await
    }

    async fn reconnect(&self) -> car_seeder::Result<()> {
        let result = self.ping().await;
        if result.is_ok() {
            let _ = self.ready_tx.send(());
        }
        result
    }

    fn ready_events(&self) -> broadcast::Receiver<()> {
        self.ready_tx.subscribe()
    }

    async fn close(&self) {}
}

// =============================================================================
// Fixtures
// =============================================================================

fn test_car(n: usize) -> Car {
    Car {
        normalized_make: "nissan".into(),
        normalized_model: format!("rogue-{}", n),
        year: 2016,
        price: 15750.25,
        location: "Phoenix, AZ".into(),
    }
}

struct ChaosRig {
    store: Arc<PendingStore>,
    breaker: Arc<CircuitBreaker>,
    state: Arc<StateManager>,
    manager: Arc<RecoveryManager>,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn chaos_rig(queue: Arc<ChaosQueue>, config: SeederConfig) -> ChaosRig {
    let db_dir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();
    let store = PendingStore::open(
        db_dir.path().join("cars.db"),
        "chaos",
        config.save_batch_size,
        Duration::from_millis(config.save_flush_ms),
    )
    .await
    .unwrap();
    let breaker = Arc::new(CircuitBreaker::new(
        "queue",
        CircuitConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            cooldown: Duration::from_millis(config.circuit_breaker_cooldown_ms),
        },
    ));
    let state = Arc::new(StateManager::new());
    let metrics = Arc::new(FailoverMetrics::new(log_dir.path()).unwrap());
    let manager = RecoveryManager::new(
        queue.clone(),
        store.clone(),
        breaker.clone(),
        state.clone(),
        metrics,
        &config,
        "chaos".into(),
    );
    ChaosRig { store, breaker, state, manager, _dirs: (db_dir, log_dir) }
}

fn fast_config() -> SeederConfig {
    SeederConfig {
        recovery_chunk_size: 10,
        recovery_cooldown_ms: 0,
        recovery_check_interval_ms: 40,
        circuit_breaker_cooldown_ms: 60,
        save_batch_size: 50,
        save_flush_ms: 60_000,
        ..Default::default()
    }
}

async fn seed_backlog(store: &PendingStore, count: usize) {
    for n in 0..count {
        store.save_car(test_car(n)).await.unwrap();
    }
    store.flush_pending_writes().await.unwrap();
}

// =============================================================================
// Drain failure injection
// =============================================================================

#[tokio::test]
async fn per_record_failures_retry_within_the_drain() {
    // Calls 3 and 7 fail once; the drain releases those two records, the
    // batch continues, and the next claim pass redelivers them.
    let queue = ChaosQueue::new(vec![3, 7], 0);
    let rig = chaos_rig(queue.clone(), fast_config()).await;
    seed_backlog(&rig.store, 10).await;

    rig.manager.trigger_recovery().await;

    assert_eq!(queue.delivered_count(), 10);
    assert_eq!(rig.store.count_by_status(PendingStatus::Sent).await.unwrap(), 10);
    assert_eq!(rig.store.count_by_status(PendingStatus::Recovering).await.unwrap(), 0);

    // The two failed records went through Recovering -> Pending once.
    let retried: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_cars WHERE retry_count = 1")
            .fetch_one(rig.store.pool())
            .await
            .unwrap();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn permanently_failing_record_does_not_spin_the_drain() {
    // One record in the backlog; its delivery always fails.
    let queue = ChaosQueue::new((1..=1000).collect(), 0);
    let rig = chaos_rig(queue.clone(), fast_config()).await;
    seed_backlog(&rig.store, 1).await;

    // Must terminate: the no-progress guard stops re-claiming.
    tokio::time::timeout(Duration::from_secs(5), rig.manager.trigger_recovery())
        .await
        .expect("drain did not terminate");

    assert_eq!(queue.delivered_count(), 0);
    assert_eq!(rig.store.count_by_status(PendingStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn mid_drain_transport_death_releases_remaining_claims() {
    // Healthy for 10 deliveries, then the transport dies hard.
    let queue = ChaosQueue::new(Vec::new(), 10);
    let rig = chaos_rig(queue.clone(), fast_config()).await;
    seed_backlog(&rig.store, 30).await;

    rig.manager.trigger_recovery().await;

    assert_eq!(queue.delivered_count(), 10);
    let sent = rig.store.count_by_status(PendingStatus::Sent).await.unwrap();
    let pending = rig.store.count_by_status(PendingStatus::Pending).await.unwrap();
    let recovering = rig.store.count_by_status(PendingStatus::Recovering).await.unwrap();

    assert_eq!(sent, 10);
    assert_eq!(pending, 20, "undelivered records released");
    assert_eq!(recovering, 0, "no claim leaked");
}

#[tokio::test]
async fn concurrent_drain_triggers_deliver_each_record_once() {
    let queue = ChaosQueue::healthy();
    let rig = chaos_rig(queue.clone(), fast_config()).await;
    seed_backlog(&rig.store, 40).await;

    let m1 = rig.manager.clone();
    let m2 = rig.manager.clone();
    tokio::join!(m1.trigger_recovery(), m2.trigger_recovery());

    // One of the two triggers drained; claims guarantee single delivery.
    assert_eq!(queue.delivered_count(), 40);
    assert_eq!(rig.store.count_by_status(PendingStatus::Sent).await.unwrap(), 40);
}

// =============================================================================
// Full pipeline: outage, degraded writes, automatic recovery
// =============================================================================

#[tokio::test]
async fn pipeline_survives_outage_and_drains_after_recovery() {
    let queue = ChaosQueue::healthy();
    let config = fast_config();
    let rig = chaos_rig(queue.clone(), config.clone()).await;
    let metrics_dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(FailoverMetrics::new(metrics_dir.path()).unwrap());
    let writer = WriteHandler::new(
        queue.clone(),
        rig.store.clone(),
        rig.breaker.clone(),
        rig.state.clone(),
        metrics,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = rig.manager.spawn(shutdown_rx);

    // Healthy warm-up.
    for n in 0..5 {
        writer.write_car(test_car(n)).await.unwrap();
    }
    assert_eq!(queue.delivered_count(), 5);

    // Outage: drive writes until the breaker opens, then a few degraded ones.
    queue.set_down(true);
    let mut n = 5;
    while rig.breaker.state() != BreakerState::Open {
        let _ = writer.write_car(test_car(n)).await;
        n += 1;
        assert!(n < 50, "breaker never opened");
    }
    assert_eq!(rig.state.get(), SeederMode::SqliteMode);
    for _ in 0..4 {
        writer.write_car(test_car(n)).await.unwrap();
        n += 1;
    }
    rig.store.flush_pending_writes().await.unwrap();
    let backlog = rig.store.pending_count().await.unwrap();
    assert!(backlog >= 5, "expected a durable backlog, got {}", backlog);

    // Remote recovers; the backup probe half-opens the breaker and the
    // drain empties the store without any further writes.
    queue.set_down(false);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = rig.store.pending_count().await.unwrap();
        let recovering =
            rig.store.count_by_status(PendingStatus::Recovering).await.unwrap();
        if pending == 0 && recovering == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "drain never completed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Every record that reached the store was delivered exactly once.
    let sent = rig.store.count_by_status(PendingStatus::Sent).await.unwrap();
    assert_eq!(sent, backlog);
    assert_eq!(queue.delivered_count() as u64, 5 + backlog);

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
}

#[tokio::test]
async fn switch_master_event_drives_reconnect_and_drain() {
    let queue = ChaosQueue::healthy();
    let rig = chaos_rig(queue.clone(), fast_config()).await;

    // Degraded with backlog, remote actually healthy again (new master).
    rig.state.set(SeederMode::SqliteMode);
    seed_backlog(&rig.store, 12).await;

    rig.manager
        .handle_master_switch("mymaster 10.0.0.1 6379 10.0.0.9 6379")
        .await;

    assert_eq!(rig.breaker.state(), BreakerState::HalfOpen);
    assert_eq!(queue.delivered_count(), 12);
    assert_eq!(rig.store.pending_count().await.unwrap(), 0);
}
