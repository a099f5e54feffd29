//! Wall-clock primitives for activity stamps and reaper cutoffs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Millisecond wall-clock timestamp.
///
/// Used for idle-cursor accounting and diagnostics, not for ordering
/// concurrent operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WallClock(pub u64);

impl WallClock {
    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, d: Duration) -> WallClock {
        WallClock(self.0.saturating_sub(d.as_millis() as u64))
    }

    pub fn saturating_add(self, d: Duration) -> WallClock {
        WallClock(self.0.saturating_add(d.as_millis() as u64))
    }

    /// Elapsed time since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: WallClock) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

/// Source of wall-clock readings. Injected into the registry so tests can
/// substitute a controlled clock.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> WallClock;
}

/// Clock backed by the OS.
#[derive(Debug, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> WallClock {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        WallClock(ms)
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: WallClock) -> Self {
        Self(AtomicU64::new(start.0))
    }

    pub fn set(&self, now: WallClock) {
        self.0.store(now.0, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> WallClock {
        WallClock(self.0.load(Ordering::Relaxed))
    }
}
