//! Producer mode: remote queue or local durable store.
//!
//! Isolated so no other component reads or writes the enum directly; the
//! write handler and recovery manager go through [`StateManager::get`] and
//! [`StateManager::set`].

use parking_lot::RwLock;
use tracing::info;

/// Where new records are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederMode {
    /// Normal operation: records go to the remote queue.
    RedisMode,
    /// Degraded operation: records go to the local durable store.
    SqliteMode,
}

impl std::fmt::Display for SeederMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RedisMode => write!(f, "redis"),
            Self::SqliteMode => write!(f, "sqlite"),
        }
    }
}

/// Holds the single producer mode. Default [`SeederMode::RedisMode`].
pub struct StateManager {
    mode: RwLock<SeederMode>,
}

impl StateManager {
    pub fn new() -> Self {
        Self { mode: RwLock::new(SeederMode::RedisMode) }
    }

    #[must_use]
    pub fn get(&self) -> SeederMode {
        *self.mode.read()
    }

    /// Replace the mode atomically and log the transition.
    pub fn set(&self, mode: SeederMode) {
        let mut guard = self.mode.write();
        let previous = *guard;
        *guard = mode;
        drop(guard);

        if previous != mode {
            info!(from = %previous, to = %mode, "Seeder mode changed");
            crate::metrics::set_seeder_mode(mode);
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
