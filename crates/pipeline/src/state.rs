//! Connection state tracking for downstream dependencies.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

/// Lifecycle of one downstream connection (broker, queue, or store).
///
/// There is no terminal failure state: a lost connection goes back to
/// `Disconnected` with a retry pending, indefinitely, until a
/// cooperative shutdown moves it to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; a reconnect attempt is scheduled or running.
    Disconnected,
    Connecting,
    Connected,
    /// Deliberate teardown, no reconnect will follow.
    Closed,
}

/// Named state cell that logs every transition. Shared across tasks,
/// so reads give the state at some recent instant, not a lock on it.
pub struct ConnectionGauge {
    name: &'static str,
    state: Mutex<ConnectionState>,
}

impl ConnectionGauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    pub fn get(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, next: ConnectionState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == next {
            return;
        }
        match next {
            ConnectionState::Disconnected => {
                warn!(connection = self.name, from = ?*guard, to = ?next, "connection lost");
            }
            _ => {
                info!(connection = self.name, from = ?*guard, to = ?next, "connection state");
            }
        }
        *guard = next;
    }
}
