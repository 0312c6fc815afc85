//! Configuration for the car seeder.
//!
//! All values are environment-driven with sensible defaults, so the binary
//! runs against a local Redis with nothing set.
//!
//! # Example
//!
//! ```
//! use car_seeder::SeederConfig;
//!
//! let config = SeederConfig::default();
//! assert_eq!(config.redis_port, 6379);
//! assert_eq!(config.circuit_breaker_failure_threshold, 5);
//!
//! let config = SeederConfig {
//!     use_sentinel: true,
//!     sentinel_hosts: vec!["10.0.0.1:26379".into(), "10.0.0.2:26379".into()],
//!     ..Default::default()
//! };
//! assert_eq!(config.sentinel_master_name, "mymaster");
//! ```

use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Configuration for the seeder and its failover core.
#[derive(Debug, Clone, Deserialize)]
pub struct SeederConfig {
    /// HTTP listen port (health endpoint only).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Discover the queue master through a sentinel quorum.
    #[serde(default)]
    pub use_sentinel: bool,

    /// Sentinel endpoints as `host:port`.
    #[serde(default)]
    pub sentinel_hosts: Vec<String>,

    /// Master name registered with the sentinels.
    #[serde(default = "default_master_name")]
    pub sentinel_master_name: String,

    /// Direct-mode Redis endpoint (development only).
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Path of the durable fallback store.
    #[serde(default = "default_sqlite_db_path")]
    pub sqlite_db_path: String,

    /// Consecutive transport failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,

    /// Open -> HalfOpen cooldown.
    #[serde(default = "default_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Records claimed per drain batch.
    #[serde(default = "default_recovery_chunk_size")]
    pub recovery_chunk_size: usize,

    /// Minimum gap between recovery drains.
    #[serde(default = "default_recovery_cooldown_ms")]
    pub recovery_cooldown_ms: u64,

    /// Period of the backup health probe.
    #[serde(default = "default_recovery_check_interval_ms")]
    pub recovery_check_interval_ms: u64,

    /// Producer period.
    #[serde(default = "default_car_generation_interval_ms")]
    pub car_generation_interval_ms: u64,

    /// Directory for the daily failover-metrics log.
    #[serde(default = "default_metrics_log_dir")]
    pub metrics_log_dir: String,

    /// Buffered records committed per flush.
    #[serde(default = "default_save_batch_size")]
    pub save_batch_size: usize,

    /// Flush deadline counted from the first buffered record.
    #[serde(default = "default_save_flush_ms")]
    pub save_flush_ms: u64,

    /// Age after which another instance may revert a claim.
    #[serde(default = "default_stale_claim_max_age_ms")]
    pub stale_claim_max_age_ms: u64,
}

fn default_port() -> u16 { 3000 }
fn default_master_name() -> String { "mymaster".into() }
fn default_redis_host() -> String { "localhost".into() }
fn default_redis_port() -> u16 { 6379 }
fn default_sqlite_db_path() -> String { "./data/cars.db".into() }
fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown_ms() -> u64 { 2000 }
fn default_recovery_chunk_size() -> usize { 50 }
fn default_recovery_cooldown_ms() -> u64 { 10_000 }
fn default_recovery_check_interval_ms() -> u64 { 5000 }
fn default_car_generation_interval_ms() -> u64 { 30 }
fn default_metrics_log_dir() -> String { "./logs".into() }
fn default_save_batch_size() -> usize { 50 }
fn default_save_flush_ms() -> u64 { 1000 }
fn default_stale_claim_max_age_ms() -> u64 { 5 * 60 * 1000 }

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            use_sentinel: false,
            sentinel_hosts: Vec::new(),
            sentinel_master_name: default_master_name(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            sqlite_db_path: default_sqlite_db_path(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_cooldown_ms: default_cooldown_ms(),
            recovery_chunk_size: default_recovery_chunk_size(),
            recovery_cooldown_ms: default_recovery_cooldown_ms(),
            recovery_check_interval_ms: default_recovery_check_interval_ms(),
            car_generation_interval_ms: default_car_generation_interval_ms(),
            metrics_log_dir: default_metrics_log_dir(),
            save_batch_size: default_save_batch_size(),
            save_flush_ms: default_save_flush_ms(),
            stale_claim_max_age_ms: default_stale_claim_max_age_ms(),
        }
    }
}

impl SeederConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", default_port()),
            use_sentinel: env_parse("REDIS_USE_SENTINEL", false),
            sentinel_hosts: env::var("REDIS_SENTINEL_HOSTS")
                .map(|v| {
                    v.split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            sentinel_master_name: env::var("REDIS_SENTINEL_MASTER_NAME")
                .unwrap_or_else(|_| default_master_name()),
            redis_host: env::var("REDIS_HOST").unwrap_or_else(|_| default_redis_host()),
            redis_port: env_parse("REDIS_PORT", default_redis_port()),
            sqlite_db_path: env::var("SQLITE_DB_PATH")
                .unwrap_or_else(|_| default_sqlite_db_path()),
            circuit_breaker_failure_threshold: env_parse(
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                default_failure_threshold(),
            ),
            circuit_breaker_cooldown_ms: env_parse(
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                default_cooldown_ms(),
            ),
            recovery_chunk_size: env_parse("RECOVERY_CHUNK_SIZE", default_recovery_chunk_size()),
            recovery_cooldown_ms: env_parse(
                "RECOVERY_COOLDOWN_MS",
                default_recovery_cooldown_ms(),
            ),
            recovery_check_interval_ms: env_parse(
                "RECOVERY_CHECK_INTERVAL_MS",
                default_recovery_check_interval_ms(),
            ),
            car_generation_interval_ms: env_parse(
                "CAR_GENERATION_INTERVAL_MS",
                default_car_generation_interval_ms(),
            ),
            metrics_log_dir: env::var("METRICS_LOG_DIR")
                .unwrap_or_else(|_| default_metrics_log_dir()),
            save_batch_size: default_save_batch_size(),
            save_flush_ms: default_save_flush_ms(),
            stale_claim_max_age_ms: default_stale_claim_max_age_ms(),
        }
    }

    /// Redis URL for direct mode.
    pub fn direct_redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
