//! The seeder coordinator.
//!
//! [`CarSeeder`] wires every component together at startup (explicit
//! constructor injection, no ambient singletons), drives the generator
//! loop, and owns the shutdown sequence.
//!
//! # Lifecycle
//!
//! ```text
//! start() -> run() -> shutdown()
//! ```
//!
//! Startup errors are fatal; write-path errors during `run()` are logged
//! and the generator continues.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::car::instance_id;
use crate::config::SeederConfig;
use crate::error::Result;
use crate::generator::CarGenerator;
use crate::metrics::FailoverMetrics;
use crate::queue::{JobQueue, RedisQueue};
use crate::recovery::RecoveryManager;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::state::{SeederMode, StateManager};
use crate::storage::PendingStore;
use crate::writer::WriteHandler;

/// Bound on waiting for background tasks during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct CarSeeder {
    config: SeederConfig,
    state: Arc<StateManager>,
    store: Arc<PendingStore>,
    queue: Arc<dyn JobQueue>,
    writer: WriteHandler,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CarSeeder {
    /// Connect and wire all components. Fails fast on a bad queue endpoint
    /// or an unopenable durable store.
    pub async fn start(config: SeederConfig) -> Result<Self> {
        let instance = instance_id();
        info!(instance = %instance, "Starting car seeder");

        let metrics = Arc::new(FailoverMetrics::new(&config.metrics_log_dir)?);

        let store = PendingStore::open(
            &config.sqlite_db_path,
            &instance,
            config.save_batch_size,
            Duration::from_millis(config.save_flush_ms),
        )
        .await?;

        let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::connect(&config).await?);

        let breaker = Arc::new(CircuitBreaker::new(
            "queue",
            CircuitConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                cooldown: Duration::from_millis(config.circuit_breaker_cooldown_ms),
            },
        ));
        let state = Arc::new(StateManager::new());

        let writer = WriteHandler::new(
            queue.clone(),
            store.clone(),
            breaker.clone(),
            state.clone(),
            metrics.clone(),
        );

        let recovery = RecoveryManager::new(
            queue.clone(),
            store.clone(),
            breaker,
            state.clone(),
            metrics,
            &config,
            instance,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = recovery.spawn(shutdown_rx.clone());

        info!("Car seeder started");
        Ok(Self { config, state, store, queue, writer, shutdown_tx, shutdown_rx, tasks })
    }

    /// Drive the generator until shutdown: one car per configured interval.
    /// A failed write never stops the loop.
    pub async fn run(&self) {
        let mut tick = interval(Duration::from_millis(self.config.car_generation_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();

        info!(
            interval_ms = self.config.car_generation_interval_ms,
            "Generator running"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let car = CarGenerator::generate();
                    crate::metrics::record_car_generated();
                    if let Err(e) = self.writer.write_car(car).await {
                        warn!(error = %e, "Car write failed, record dropped");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Generator stopped");
    }

    /// Current producer mode (for the health surface).
    #[must_use]
    pub fn mode(&self) -> SeederMode {
        self.state.get()
    }

    /// Shareable handle to the mode, for surfaces that outlive borrows of
    /// the seeder itself (the health endpoint).
    #[must_use]
    pub fn state_handle(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    /// Ask the run loop and background tasks to stop.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Full shutdown sequence: stop tasks (bounded wait), flush the durable
    /// buffer, close the queue and the store.
    pub async fn shutdown(mut self) {
        info!("Shutting down car seeder");
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut self.tasks);
        let drained = timeout(SHUTDOWN_GRACE, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop within grace period");
        }

        if let Err(e) = self.store.flush_pending_writes().await {
            error!(error = %e, "Final buffer flush failed");
        }
        self.queue.close().await;
        self.store.close().await;
        info!("Car seeder shutdown complete");
    }
}
