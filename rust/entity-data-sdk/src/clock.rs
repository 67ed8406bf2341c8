//! Time sources for the subscription core.
//!
//! The core never reads the system clock directly. Drift accounting uses the
//! monotonic reading, sample timestamps use the wall reading.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic scale with an arbitrary origin.
    fn monotonic_ms(&self) -> i64;

    /// Milliseconds since the Unix epoch.
    fn wall_ms(&self) -> i64;
}

/// Clock backed by `tokio::time::Instant`, so paused tokio time applies.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> i64 {
        tokio::time::Instant::now()
            .saturating_duration_since(self.origin)
            .as_millis() as i64
    }

    fn wall_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Hand-driven clock. Cloned handles share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    monotonic: Arc<AtomicI64>,
    wall: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(wall_ms: i64) -> Self {
        Self {
            monotonic: Arc::new(AtomicI64::new(0)),
            wall: Arc::new(AtomicI64::new(wall_ms)),
        }
    }

    /// Moves both readings forward by `ms`.
    pub fn advance(&self, ms: i64) {
        self.monotonic.fetch_add(ms, Ordering::SeqCst);
        self.wall.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }

    fn wall_ms(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }
}
