//! Remote work queue client.
//!
//! The queue is a Redis list consumed by downstream workers. Two deployment
//! shapes: sentinel-discovered (production; the master address comes from
//! the failure-detector quorum) and direct (development only).
//!
//! Offline queueing is deliberately disabled: when the transport is down a
//! write fails immediately, so failures propagate to the circuit breaker
//! instead of piling up in a hidden client-side buffer.
//!
//! [`JobQueue`] is the seam the write handler and recovery manager depend
//! on; tests inject fakes through it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::car::{now_ms, Car};
use crate::config::SeederConfig;
use crate::error::{Result, SeederError};
use crate::resilience::retry::{reconnect_delay, retry, RetryConfig};

/// Named queue consumed by downstream workers.
pub const QUEUE_NAME: &str = "car-seeder-queue";
/// Job name for real work.
pub const CAR_JOB: &str = "car";
/// Job name for write probes; auto-removed after the probe.
pub const HEALTH_CHECK_JOB: &str = "health-check-test";

const CONNECT_DEADLINE: Duration = Duration::from_secs(30);
const TEST_WRITE_DEADLINE: Duration = Duration::from_secs(3);
/// Settle time between dropping a transport and dialing the new master.
const DISCONNECT_SETTLE: Duration = Duration::from_millis(500);

/// Enqueue options carried in the job envelope for the worker side.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub attempts: u32,
    /// Exponential backoff base in milliseconds.
    pub backoff_ms: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { attempts: 3, backoff_ms: 2000 }
    }
}

/// The queue operations the pipeline depends on.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job; returns the job id assigned by the queue.
    async fn enqueue(&self, job: &str, car: &Car, opts: &EnqueueOptions) -> Result<String>;

    /// Liveness check; `Ok` only on a `PONG` reply.
    async fn ping(&self) -> Result<()>;

    /// Health probe: enqueue a sentinel job that removes itself, bounded
    /// by a 3 s deadline. Proves a real write would succeed.
    async fn test_write(&self) -> Result<()>;

    /// Drop the transport and re-establish it (re-resolving the master
    /// through the quorum when configured).
    async fn reconnect(&self) -> Result<()>;

    /// Receiver signaled after every successful (re)connect.
    fn ready_events(&self) -> broadcast::Receiver<()>;

    /// Graceful disconnect.
    async fn close(&self);
}

#[derive(Debug, Clone)]
enum Endpoint {
    Sentinel { hosts: Vec<String>, master: String },
    Direct { url: String },
}

/// Redis-backed [`JobQueue`].
pub struct RedisQueue {
    endpoint: Endpoint,
    conn: RwLock<Option<ConnectionManager>>,
    ready_tx: broadcast::Sender<()>,
}

impl RedisQueue {
    /// Connect and verify the transport is ready (ping returns `PONG`)
    /// before returning. Fails after 30 s.
    pub async fn connect(config: &SeederConfig) -> Result<Self> {
        let endpoint = if config.use_sentinel && !config.sentinel_hosts.is_empty() {
            Endpoint::Sentinel {
                hosts: config.sentinel_hosts.clone(),
                master: config.sentinel_master_name.clone(),
            }
        } else {
            Endpoint::Direct { url: config.direct_redis_url() }
        };

        let (ready_tx, _) = broadcast::channel(8);
        let queue = Self { endpoint, conn: RwLock::new(None), ready_tx };

        let manager = timeout(
            CONNECT_DEADLINE,
            retry("queue_connect", &RetryConfig::startup(), || queue.dial_master()),
        )
        .await
        .map_err(|_| SeederError::Timeout("queue connect after 30s".into()))??;

        *queue.conn.write().await = Some(manager);
        let _ = queue.ready_tx.send(());
        info!(queue = QUEUE_NAME, "Queue transport connected and verified");
        Ok(queue)
    }

    /// Resolve the master address, open a managed connection and verify it
    /// with a ping.
    async fn dial_master(&self) -> Result<ConnectionManager> {
        let url = self.resolve_master_url().await?;
        let client = Client::open(url.as_str())?;
        let mut manager = ConnectionManager::new(client).await?;
        let reply: String = redis::cmd("PING").query_async(&mut manager).await?;
        if reply != "PONG" {
            return Err(SeederError::Queue(format!("unexpected ping reply: {}", reply)));
        }
        debug!(url = %url, "Master transport verified");
        Ok(manager)
    }

    async fn resolve_master_url(&self) -> Result<String> {
        match &self.endpoint {
            Endpoint::Direct { url } => Ok(url.clone()),
            Endpoint::Sentinel { hosts, master } => {
                for host in hosts {
                    match discover_master(host, master).await {
                        Ok(Some((h, p))) => {
                            info!(sentinel = %host, master_host = %h, master_port = p, "Master discovered via sentinel");
                            return Ok(format!("redis://{}:{}", h, p));
                        }
                        Ok(None) => {
                            warn!(sentinel = %host, master = %master, "Sentinel does not know this master");
                        }
                        Err(e) => {
                            warn!(sentinel = %host, error = %e, "Sentinel unreachable");
                        }
                    }
                }
                Err(SeederError::Queue(format!(
                    "no sentinel could resolve master '{}'",
                    master
                )))
            }
        }
    }

    /// A clone of the managed connection, or a not-writable error when the
    /// transport is down (no offline queueing).
    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| SeederError::Queue("transport down, stream not writable".into()))
    }

    fn wait_key() -> String {
        format!("{}:wait", QUEUE_NAME)
    }

    fn id_key() -> String {
        format!("{}:id", QUEUE_NAME)
    }

    /// Job envelope pushed onto the wait list.
    fn job_payload(job_id: &str, name: &str, car: &Car, opts: &EnqueueOptions) -> String {
        json!({
            "id": job_id,
            "name": name,
            "data": car,
            "opts": {
                "attempts": opts.attempts,
                "backoff": { "type": "exponential", "delay": opts.backoff_ms },
            },
            "timestamp": now_ms(),
        })
        .to_string()
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &str, car: &Car, opts: &EnqueueOptions) -> Result<String> {
        let mut conn = self.connection().await?;

        let id: i64 = conn.incr(Self::id_key(), 1i64).await?;
        let job_id = id.to_string();
        let payload = Self::job_payload(&job_id, job, car, opts);
        let _: () = conn.lpush(Self::wait_key(), &payload).await?;

        debug!(job_id = %job_id, job = %job, "Job enqueued");
        Ok(job_id)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(SeederError::Queue(format!("unexpected ping reply: {}", reply)))
        }
    }

    async fn test_write(&self) -> Result<()> {
        timeout(TEST_WRITE_DEADLINE, async {
            let mut conn = self.connection().await?;

            let id: i64 = conn.incr(Self::id_key(), 1i64).await?;
            let probe = Car {
                normalized_make: String::new(),
                normalized_model: String::new(),
                year: 0,
                price: 0.0,
                location: String::new(),
            };
            let payload =
                Self::job_payload(&id.to_string(), HEALTH_CHECK_JOB, &probe, &EnqueueOptions::default());

            let _: () = conn.lpush(Self::wait_key(), &payload).await?;
            // Auto-remove: the probe must not reach a worker.
            let _: i64 = conn.lrem(Self::wait_key(), 1, &payload).await?;
            Ok(())
        })
        .await
        .map_err(|_| SeederError::Timeout("health-check write after 3s".into()))?
    }

    async fn reconnect(&self) -> Result<()> {
        // Disconnect first so in-flight users fail fast instead of writing
        // to a demoted master.
        *self.conn.write().await = None;
        tokio::time::sleep(DISCONNECT_SETTLE).await;

        let deadline = Instant::now() + CONNECT_DEADLINE;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.dial_master().await {
                Ok(manager) => {
                    *self.conn.write().await = Some(manager);
                    let _ = self.ready_tx.send(());
                    info!(attempt, "Queue transport reconnected");
                    return Ok(());
                }
                Err(e) if Instant::now() < deadline => {
                    let delay = reconnect_delay(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Reconnect attempt failed");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn ready_events(&self) -> broadcast::Receiver<()> {
        self.ready_tx.subscribe()
    }

    async fn close(&self) {
        *self.conn.write().await = None;
        info!("Queue transport closed");
    }
}

/// Ask one sentinel for the current master address.
async fn discover_master(host: &str, master: &str) -> Result<Option<(String, u16)>> {
    let client = Client::open(format!("redis://{}", host))?;
    let mut conn = client.get_multiplexed_async_connection().await?;

    let addr: Option<Vec<String>> = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master)
        .query_async(&mut conn)
        .await?;

    match addr.as_deref() {
        Some([h, p]) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| SeederError::Queue(format!("bad master port from sentinel: {}", p)))?;
            Ok(Some((h.clone(), port)))
        }
        _ => Ok(None),
    }
}

/// Open a pattern-subscribed pub/sub connection against the first sentinel
/// that answers. The recovery manager listens here for `+switch-master`.
pub async fn sentinel_pubsub(hosts: &[String]) -> Result<redis::aio::PubSub> {
    for host in hosts {
        match Client::open(format!("redis://{}", host)) {
            Ok(client) => match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    pubsub.psubscribe("*").await?;
                    info!(sentinel = %host, "Subscribed to sentinel events");
                    return Ok(pubsub);
                }
                Err(e) => warn!(sentinel = %host, error = %e, "Sentinel pub/sub connect failed"),
            },
            Err(e) => warn!(sentinel = %host, error = %e, "Bad sentinel address"),
        }
    }
    Err(SeederError::Queue("no sentinel reachable for event subscription".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_car() -> Car {
        Car {
            normalized_make: "ford".into(),
            normalized_model: "focus".into(),
            year: 2017,
            price: 9500.0,
            location: "Tulsa, OK".into(),
        }
    }

    #[test]
    fn test_enqueue_options_defaults() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.backoff_ms, 2000);
    }

    #[test]
    fn test_job_payload_shape() {
        let payload =
            RedisQueue::job_payload("17", CAR_JOB, &test_car(), &EnqueueOptions::default());
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(value["id"], "17");
        assert_eq!(value["name"], "car");
        assert_eq!(value["data"]["normalizedMake"], "ford");
        assert_eq!(value["data"]["normalizedModel"], "focus");
        assert_eq!(value["data"]["year"], 2017);
        assert_eq!(value["data"]["price"], 9500.0);
        assert_eq!(value["data"]["location"], "Tulsa, OK");
        assert_eq!(value["opts"]["attempts"], 3);
        assert_eq!(value["opts"]["backoff"]["type"], "exponential");
        assert_eq!(value["opts"]["backoff"]["delay"], 2000);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_queue_key_names() {
        assert_eq!(RedisQueue::wait_key(), "car-seeder-queue:wait");
        assert_eq!(RedisQueue::id_key(), "car-seeder-queue:id");
    }

    #[tokio::test]
    #[ignore] // Requires a local Redis on 6379
    async fn test_enqueue_against_local_redis() {
        let config = SeederConfig::default();
        let queue = RedisQueue::connect(&config).await.unwrap();

        queue.ping().await.unwrap();
        let job_id = queue
            .enqueue(CAR_JOB, &test_car(), &EnqueueOptions::default())
            .await
            .unwrap();
        assert!(job_id.parse::<i64>().is_ok());

        queue.test_write().await.unwrap();
        queue.close().await;
    }

    #[tokio::test]
    #[ignore] // Requires a local Redis on 6379
    async fn test_reconnect_against_local_redis() {
        let config = SeederConfig::default();
        let queue = RedisQueue::connect(&config).await.unwrap();

        let mut ready = queue.ready_events();
        queue.reconnect().await.unwrap();
        assert!(ready.try_recv().is_ok());
        queue.ping().await.unwrap();
    }
}
