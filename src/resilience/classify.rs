//! Error taxonomy for the write path.
//!
//! The router needs to know whether a failed enqueue means "the transport
//! is down" (count against the breaker, fall back to the durable store) or
//! "the request was bad" (surface to the caller). The durable store has its
//! own transient class for lock contention.
//!
//! Recognition is a union of the redis error kind and case-insensitive
//! substring matches on the message, applied to the error itself and to
//! every wrapped cause in its `source()` chain.

use crate::error::SeederError;
use redis::ErrorKind as RedisErrorKind;

/// Classification of a pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection-level failure: refused, timed out, reset, DNS, pipe,
    /// stream not writable. Counts against the circuit breaker.
    Transport,
    /// SQLite lock contention. Retried briefly by the write handler.
    DurableTransient,
    /// Everything else. Surfaced to the caller, never counted.
    Other,
}

const TRANSPORT_MARKERS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "timed out",
    "etimedout",
    "connection reset",
    "econnreset",
    "broken pipe",
    "epipe",
    "enotfound",
    "failed to lookup address",
    "name or service not known",
    "stream not writable",
    "offline queue",
    "unreachable",
    "connection dropped",
    "not connected",
];

const DURABLE_TRANSIENT_MARKERS: &[&str] = &["database is locked", "locked", "busy"];

/// Classify an error for routing purposes.
pub fn classify(err: &SeederError) -> ErrorKind {
    match err {
        SeederError::Timeout(_) => ErrorKind::Transport,
        SeederError::Redis(e) => classify_redis(e),
        SeederError::Store(e) => {
            if chain_matches(e, DURABLE_TRANSIENT_MARKERS) {
                ErrorKind::DurableTransient
            } else {
                ErrorKind::Other
            }
        }
        SeederError::Queue(msg) => {
            if message_matches(msg, TRANSPORT_MARKERS) {
                ErrorKind::Transport
            } else {
                ErrorKind::Other
            }
        }
        SeederError::Io(e) => {
            if io_is_transport(e) || chain_matches(e, TRANSPORT_MARKERS) {
                ErrorKind::Transport
            } else {
                ErrorKind::Other
            }
        }
        SeederError::DataLoss(_) | SeederError::Config(_) => ErrorKind::Other,
    }
}

fn classify_redis(e: &redis::RedisError) -> ErrorKind {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        return ErrorKind::Transport;
    }
    if matches!(e.kind(), RedisErrorKind::IoError) {
        return ErrorKind::Transport;
    }
    if chain_matches(e, TRANSPORT_MARKERS) {
        return ErrorKind::Transport;
    }
    ErrorKind::Other
}

fn io_is_transport(e: &std::io::Error) -> bool {
    use std::io::ErrorKind as IoKind;
    matches!(
        e.kind(),
        IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected
            | IoKind::BrokenPipe
            | IoKind::TimedOut
    )
}

/// Substring match on the display text of `err` and of every source below it.
fn chain_matches(err: &(dyn std::error::Error + 'static), markers: &[&str]) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if message_matches(&e.to_string(), markers) {
            return true;
        }
        current = e.source();
    }
    false
}

fn message_matches(msg: &str, markers: &[&str]) -> bool {
    let lower = msg.to_ascii_lowercase();
    markers.iter().any(|m| lower.contains(m))
}
