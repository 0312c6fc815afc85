//! # Car Seeder
//!
//! A continuous producer that emits car records at a sustained rate and
//! guarantees at-least-once delivery into a remote Redis work queue, with a
//! local SQLite store as the durable fallback during outages.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │               Generator                  │
//!                 │  one Car every CAR_GENERATION_INTERVAL   │
//!                 └──────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//!                 ┌──────────────────────────────────────────┐
//!                 │             Write Handler                │
//!                 │  routes per record via breaker + mode    │
//!                 └──────────────────────────────────────────┘
//!                        │                         │
//!              (redis mode / probe)         (sqlite mode)
//!                        ▼                         ▼
//!          ┌──────────────────────┐   ┌──────────────────────────┐
//!          │     Redis queue      │   │  SQLite pending store    │
//!          │  car-seeder-queue    │   │  batched, claim-aware    │
//!          └──────────────────────┘   └──────────────────────────┘
//!                        ▲                         │
//!                        └───────── drain ─────────┘
//!                 ┌──────────────────────────────────────────┐
//!                 │            Recovery Manager              │
//!                 │  sentinel events · probes · drain loop   │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! ## Failover behavior
//!
//! Transport failures are counted by a circuit breaker; when it opens, the
//! seeder switches to sqlite mode and records land in the durable store.
//! Recovery is driven by sentinel `+switch-master` announcements, transport
//! ready events, and a periodic backup probe. Once a write probe succeeds
//! the breaker half-opens, the next car acts as the probe, and the store is
//! drained back into the queue under an exclusive claim protocol that is
//! safe across multiple producer instances.
//!
//! Every failover timeline is stitched into a session and appended to a
//! daily JSON event log (see [`metrics::FailoverMetrics`]).
//!
//! ## Modules
//!
//! - [`seeder`]: the [`CarSeeder`] coordinator wiring everything together
//! - [`writer`]: per-record routing
//! - [`recovery`]: failover detection and the drain loop
//! - [`queue`]: the remote queue client and the [`queue::JobQueue`] seam
//! - [`storage`]: the durable pending store
//! - [`resilience`]: circuit breaker, retry policies, error taxonomy
//! - [`metrics`]: failover sessions and the structured event log

pub mod car;
pub mod config;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod queue;
pub mod recovery;
pub mod resilience;
pub mod seeder;
pub mod state;
pub mod storage;
pub mod writer;

pub use car::{Car, PendingRecord, PendingStatus};
pub use config::SeederConfig;
pub use error::{Result, SeederError};
pub use generator::CarGenerator;
pub use metrics::FailoverMetrics;
pub use queue::{EnqueueOptions, JobQueue, RedisQueue, CAR_JOB, HEALTH_CHECK_JOB, QUEUE_NAME};
pub use recovery::RecoveryManager;
pub use resilience::circuit_breaker::{BreakerState, CircuitBreaker, CircuitConfig};
pub use resilience::classify::{classify, ErrorKind};
pub use seeder::CarSeeder;
pub use state::{SeederMode, StateManager};
pub use storage::PendingStore;
pub use writer::WriteHandler;
