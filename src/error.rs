//! Crate-wide error type.
//!
//! Remote-queue failures keep the underlying `redis::RedisError` so the
//! classifier can inspect error kinds and the wrapped cause chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeederError {
    /// Remote queue / transport error from the redis client.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An operation exceeded its deadline (connect, ping, write probe).
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Durable store error from the SQLite layer.
    #[error("durable store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The queue rejected or could not accept a request (not a transport
    /// failure by itself; classification decides).
    #[error("queue error: {0}")]
    Queue(String),

    /// A record could not be preserved anywhere. Logged loudly upstream.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SeederError>;
