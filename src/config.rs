//! Registry configuration.

use serde::{Deserialize, Serialize};

fn default_diagnostic_log_capacity() -> usize {
    512
}

fn default_cursor_timeout_ms() -> u64 {
    // Ten minutes, the historical idle-cursor window.
    10 * 60 * 1000
}

/// Tunables for a [`CursorManager`](crate::manager::CursorManager).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Capacity of the diagnostic event ring.
    #[serde(default = "default_diagnostic_log_capacity")]
    pub diagnostic_log_capacity: usize,

    /// Inactivity window in milliseconds after which mortal cursors are
    /// reaped by [`reap_inactive`](crate::manager::CursorManager::reap_inactive).
    #[serde(default = "default_cursor_timeout_ms")]
    pub cursor_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            diagnostic_log_capacity: default_diagnostic_log_capacity(),
            cursor_timeout_ms: default_cursor_timeout_ms(),
        }
    }
}
