//! Per-record write routing.
//!
//! Every generated car goes through [`WriteHandler::write_car`], which
//! decides between the remote queue and the durable store based on the
//! circuit breaker and the current seeder mode, and drives the breaker,
//! mode and metrics transitions that result from each attempt.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::car::Car;
use crate::error::{Result, SeederError};
use crate::metrics::FailoverMetrics;
use crate::queue::{EnqueueOptions, JobQueue, CAR_JOB};
use crate::resilience::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::resilience::classify::{classify, ErrorKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::state::{SeederMode, StateManager};
use crate::storage::PendingStore;

pub struct WriteHandler {
    queue: Arc<dyn JobQueue>,
    store: Arc<PendingStore>,
    breaker: Arc<CircuitBreaker>,
    state: Arc<StateManager>,
    metrics: Arc<FailoverMetrics>,
}

impl WriteHandler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<PendingStore>,
        breaker: Arc<CircuitBreaker>,
        state: Arc<StateManager>,
        metrics: Arc<FailoverMetrics>,
    ) -> Self {
        Self { queue, store, breaker, state, metrics }
    }

    /// Route one car: probe when the breaker is half-open, remote in redis
    /// mode, durable store otherwise.
    ///
    /// Transport failures count against the breaker and fall back to the
    /// durable store once it opens; other failures surface to the caller
    /// untouched.
    pub async fn write_car(&self, car: Car) -> Result<()> {
        if self.breaker.state() == BreakerState::HalfOpen {
            return self.try_remote(car, true).await;
        }
        if self.state.get() == SeederMode::RedisMode {
            return self.try_remote(car, false).await;
        }
        self.fall_back(car).await
    }

    async fn try_remote(&self, car: Car, probe: bool) -> Result<()> {
        // Raced with a concurrent trip between the routing check and here.
        if self.breaker.state() == BreakerState::Open {
            self.enter_sqlite_mode();
            return self.fall_back(car).await;
        }

        match self.queue.enqueue(CAR_JOB, &car, &EnqueueOptions::default()).await {
            Ok(job_id) => {
                self.breaker.record_success();
                crate::metrics::record_car_enqueued();
                if self.state.get() == SeederMode::SqliteMode {
                    info!(job_id = %job_id, probe, "Remote write succeeded, returning to redis mode");
                    self.state.set(SeederMode::RedisMode);
                    self.metrics.record_state_transition_to_redis();
                } else {
                    debug!(job_id = %job_id, probe, "Car enqueued");
                }
                Ok(())
            }
            Err(e) => match classify(&e) {
                ErrorKind::Transport => {
                    let after = self.breaker.record_failure();
                    if after == BreakerState::Open {
                        warn!(error = %e, probe, "Transport failure opened the circuit");
                        self.enter_sqlite_mode();
                        self.fall_back(car).await
                    } else {
                        // Breaker counted the failure but has not tripped;
                        // the record is not persisted and the error surfaces.
                        Err(e)
                    }
                }
                _ => {
                    // Not the transport's fault: never counted, never swallowed.
                    Err(e)
                }
            },
        }
    }

    /// Breaker/state/metrics choreography for entering degraded mode. The
    /// mode change lands before any durable commit, so observers never see
    /// a fallback write in redis mode.
    fn enter_sqlite_mode(&self) {
        if self.state.get() != SeederMode::SqliteMode {
            self.metrics.record_master_failure();
            self.state.set(SeederMode::SqliteMode);
            self.metrics.record_state_transition_to_sqlite();
        }
    }

    /// A record falling through to the durable store: counted for the
    /// failover session, then saved.
    async fn fall_back(&self, car: Car) -> Result<()> {
        self.metrics.increment_fallback_count();
        self.save_durable(car).await
    }

    async fn save_durable(&self, car: Car) -> Result<()> {
        let result = retry("save_car", &RetryConfig::save(), || {
            let car = car.clone();
            async move { self.store.save_car(car).await }
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Durable save exhausted retries, data will be lost");
            return Err(SeederError::DataLoss(format!("durable save failed: {}", e)));
        }
        Ok(())
    }
}
