//! Recovery: detect the remote coming back, drive breaker and mode
//! transitions, and drain the durable store into the queue.
//!
//! Three signals feed recovery:
//! - the sentinel event subscription (`+switch-master` announcements),
//! - the transport's ready events after a reconnect,
//! - a periodic health probe as a backup for both.
//!
//! Drains are exclusive (`is_recovering`) and throttled; forced
//! reconnections are latched (`is_handling_reconnection`) and spaced by a
//! fixed cooldown. Claims in the store make concurrent drains from other
//! producer instances safe.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SeederConfig;
use crate::error::Result;
use crate::metrics::FailoverMetrics;
use crate::queue::{sentinel_pubsub, EnqueueOptions, JobQueue, CAR_JOB};
use crate::resilience::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::resilience::retry::reconnect_delay;
use crate::state::{SeederMode, StateManager};
use crate::storage::PendingStore;

/// Minimum spacing between forced reconnections.
const RECONNECT_COOLDOWN: Duration = Duration::from_millis(2000);
/// Settle time after a reconnect before probing the new master.
const STABILIZE_WAIT: Duration = Duration::from_millis(1000);
/// Settle time after a ready event before re-checking availability.
const READY_SETTLE: Duration = Duration::from_millis(500);
/// Deadline for the availability ping.
const PING_DEADLINE: Duration = Duration::from_secs(2);

/// A parsed `+switch-master` announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MasterSwitch {
    master: String,
    old_host: String,
    old_port: u16,
    new_host: String,
    new_port: u16,
}

/// `<master-name> <old-host> <old-port> <new-host> <new-port>`
fn parse_switch_master(payload: &str) -> Option<MasterSwitch> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    if parts.len() != 5 {
        return None;
    }
    Some(MasterSwitch {
        master: parts[0].to_string(),
        old_host: parts[1].to_string(),
        old_port: parts[2].parse().ok()?,
        new_host: parts[3].to_string(),
        new_port: parts[4].parse().ok()?,
    })
}

pub struct RecoveryManager {
    queue: Arc<dyn JobQueue>,
    store: Arc<PendingStore>,
    breaker: Arc<CircuitBreaker>,
    state: Arc<StateManager>,
    metrics: Arc<FailoverMetrics>,

    instance: String,
    chunk_size: usize,
    drain_cooldown: Duration,
    check_interval: Duration,
    stale_claim_max_age: Duration,
    sentinel_hosts: Vec<String>,
    master_name: String,

    is_recovering: AtomicBool,
    last_drain: parking_lot::Mutex<Option<Instant>>,
    is_handling_reconnection: AtomicBool,
    last_forced_reconnect: parking_lot::Mutex<Option<Instant>>,
}

impl RecoveryManager {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<PendingStore>,
        breaker: Arc<CircuitBreaker>,
        state: Arc<StateManager>,
        metrics: Arc<FailoverMetrics>,
        config: &SeederConfig,
        instance: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            breaker,
            state,
            metrics,
            instance,
            chunk_size: config.recovery_chunk_size,
            drain_cooldown: Duration::from_millis(config.recovery_cooldown_ms),
            check_interval: Duration::from_millis(config.recovery_check_interval_ms),
            stale_claim_max_age: Duration::from_millis(config.stale_claim_max_age_ms),
            sentinel_hosts: if config.use_sentinel { config.sentinel_hosts.clone() } else { Vec::new() },
            master_name: config.sentinel_master_name.clone(),
            is_recovering: AtomicBool::new(false),
            last_drain: parking_lot::Mutex::new(None),
            is_handling_reconnection: AtomicBool::new(false),
            last_forced_reconnect: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn the background tasks: health probe, transport-ready listener,
    /// and (when a quorum is configured) the sentinel event subscription.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = interval(this.check_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.health_probe_tick().await,
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Health probe stopped");
            }));
        }

        {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            let mut ready = this.queue.ready_events();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        msg = ready.recv() => match msg {
                            Ok(()) => this.on_transport_ready().await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                debug!("Ready listener stopped");
            }));
        }

        if !self.sentinel_hosts.is_empty() {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.sentinel_event_loop(shutdown).await;
                debug!("Sentinel listener stopped");
            }));
        }

        handles
    }

    /// Dedicated pub/sub connection to one sentinel, pattern-subscribed to
    /// everything; reconnects with capped backoff if the subscription drops.
    async fn sentinel_event_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u64 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match sentinel_pubsub(&self.sentinel_hosts).await {
                Ok(mut pubsub) => {
                    attempt = 0;
                    let mut stream = pubsub.on_message();
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            msg = stream.next() => match msg {
                                Some(msg) => {
                                    if msg.get_channel_name() == "+switch-master" {
                                        match msg.get_payload::<String>() {
                                            Ok(payload) => self.handle_master_switch(&payload).await,
                                            Err(e) => warn!(error = %e, "Unreadable sentinel message"),
                                        }
                                    }
                                }
                                None => {
                                    warn!("Sentinel subscription closed, resubscribing");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Sentinel subscription failed");
                }
            }
            let delay = reconnect_delay(attempt.max(1));
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// React to a `+switch-master` announcement. Idempotent under the
    /// reconnection latch and spaced by the reconnect cooldown.
    pub async fn handle_master_switch(&self, payload: &str) {
        let Some(switch) = parse_switch_master(payload) else {
            warn!(payload = %payload, "Malformed +switch-master message");
            return;
        };
        if switch.master != self.master_name {
            debug!(master = %switch.master, "Switch for a different master, ignoring");
            return;
        }
        info!(
            old = %format!("{}:{}", switch.old_host, switch.old_port),
            new = %format!("{}:{}", switch.new_host, switch.new_port),
            "Master switch announced"
        );

        if self.is_handling_reconnection.swap(true, Ordering::AcqRel) {
            debug!("Reconnection already in progress, ignoring switch event");
            return;
        }
        let _latch = FlagGuard(&self.is_handling_reconnection);

        {
            let mut last = self.last_forced_reconnect.lock();
            if let Some(t) = *last {
                if t.elapsed() < RECONNECT_COOLDOWN {
                    debug!("Reconnect cooldown active, ignoring switch event");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        self.force_reconnection().await;
    }

    /// Tear down the transport, dial the (possibly new) master, let it
    /// stabilize, then probe. A successful probe while degraded moves the
    /// breaker to half-open and kicks a drain.
    async fn force_reconnection(&self) {
        info!("Forcing queue reconnection");
        if let Err(e) = self.queue.reconnect().await {
            warn!(error = %e, "Forced reconnection failed");
            return;
        }
        sleep(STABILIZE_WAIT).await;

        match self.queue.test_write().await {
            Ok(()) => {
                if self.state.get() == SeederMode::SqliteMode {
                    info!("Write probe succeeded on new master");
                    self.metrics.record_sentinel_promotion();
                    self.breaker.transition_to_half_open();
                    self.trigger_recovery().await;
                }
            }
            Err(e) => warn!(error = %e, "Write probe failed after reconnection"),
        }
    }

    /// Backup to the event path: probe the remote while degraded, and kick
    /// a drain whenever pending records exist.
    async fn health_probe_tick(&self) {
        if self.state.get() == SeederMode::SqliteMode
            && self.breaker.state() == BreakerState::Open
        {
            match self.queue.test_write().await {
                Ok(()) => {
                    info!("Backup health probe succeeded, half-opening circuit");
                    self.metrics.record_sentinel_promotion();
                    self.breaker.transition_to_half_open();
                }
                Err(e) => debug!(error = %e, "Backup health probe failed"),
            }
        }

        match self.store.pending_count().await {
            Ok(n) if n > 0 => self.trigger_recovery().await,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Pending count failed"),
        }
    }

    /// Transport announced readiness. The quorum path holds the latch while
    /// it works, so this only acts when nothing else is handling it.
    async fn on_transport_ready(&self) {
        if self.is_handling_reconnection.load(Ordering::Acquire) {
            debug!("Ready event during forced reconnection, ignoring");
            return;
        }
        sleep(READY_SETTLE).await;

        if !self.is_redis_available().await {
            return;
        }
        if self.state.get() == SeederMode::SqliteMode {
            info!("Transport ready while degraded");
            self.metrics.record_sentinel_promotion();
            self.breaker.transition_to_half_open();
            self.trigger_recovery().await;
        }
    }

    /// Drain the durable store into the queue. At most one drain runs at a
    /// time and drains are spaced by the recovery cooldown.
    pub async fn trigger_recovery(&self) {
        if self.is_recovering.swap(true, Ordering::AcqRel) {
            debug!("Drain already in progress");
            return;
        }
        let _guard = FlagGuard(&self.is_recovering);

        {
            let last = self.last_drain.lock();
            if let Some(t) = *last {
                if t.elapsed() < self.drain_cooldown {
                    debug!("Drain cooldown active");
                    return;
                }
            }
        }

        if !self.is_redis_available().await {
            debug!("Remote unavailable, skipping drain");
            return;
        }
        *self.last_drain.lock() = Some(Instant::now());

        self.metrics.record_recovery_started();

        match self.store.cleanup_stale_claims(self.stale_claim_max_age).await {
            Ok(reverted) if reverted > 0 => {
                info!(reverted, "Stale claims reverted before drain")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stale claim cleanup failed"),
        }

        let (recovered, failed) = self.drain().await;
        info!(recovered, failed, "Recovery drain complete");
        crate::metrics::record_recovery_drain(recovered, failed);
        self.metrics.record_recovery_completed(recovered, failed);
    }

    async fn drain(&self) -> (usize, usize) {
        let mut recovered = 0usize;
        let mut failed = 0usize;

        loop {
            let claimed = match self.store.claim_pending(self.chunk_size, &self.instance).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "Claim failed, aborting drain");
                    break;
                }
            };
            if claimed.is_empty() {
                break;
            }
            let ids: Vec<String> = claimed.iter().map(|r| r.id.clone()).collect();

            // The remote can die mid-drain; release the whole batch rather
            // than hammering a dead transport record by record.
            if !self.is_redis_available().await {
                warn!(claimed = ids.len(), "Remote lost mid-drain, releasing claims");
                if let Err(e) = self.store.mark_pending(&ids).await {
                    error!(error = %e, "Failed to release claims");
                }
                failed += ids.len();
                break;
            }

            let mut sent_ids = Vec::new();
            let mut job_ids = Vec::new();
            let mut failed_ids = Vec::new();
            for record in &claimed {
                match self.queue.enqueue(CAR_JOB, &record.car, &EnqueueOptions::default()).await {
                    Ok(job_id) => {
                        sent_ids.push(record.id.clone());
                        job_ids.push(job_id);
                    }
                    Err(e) => {
                        warn!(id = %record.id, error = %e, "Record delivery failed");
                        failed_ids.push(record.id.clone());
                    }
                }
            }

            let bookkeeping: Result<()> = async {
                self.store.mark_sent(&sent_ids, &job_ids).await?;
                self.store.mark_pending(&failed_ids).await?;
                Ok(())
            }
            .await;

            if let Err(e) = bookkeeping {
                // Batch-level failure: revert everything still claimed.
                // Rows already marked sent are protected by the status guard.
                error!(error = %e, "Drain bookkeeping failed, releasing batch");
                let _ = self.store.mark_pending(&ids).await;
                failed += ids.len() - sent_ids.len();
                break;
            }

            recovered += sent_ids.len();
            failed += failed_ids.len();

            if sent_ids.is_empty() {
                // Every delivery failed while the transport looked healthy;
                // stop instead of re-claiming the same records forever.
                warn!("No progress in drain batch, stopping");
                break;
            }
        }

        (recovered, failed)
    }

    /// Cheap availability check: an open breaker short-circuits, a bounded
    /// ping covers the common case, and a write probe is the last resort so
    /// the answer reflects whether a real write would succeed.
    pub async fn is_redis_available(&self) -> bool {
        if self.breaker.state() == BreakerState::Open {
            return false;
        }
        match timeout(PING_DEADLINE, self.queue.ping()).await {
            Ok(Ok(())) => true,
            _ => self.queue.test_write().await.is_ok(),
        }
    }
}

/// RAII reset for latch flags.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
