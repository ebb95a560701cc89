//! Clock abstractions for replenishment timestamps and key expiry.
//!
//! The continuous policy persists `last_replenished_at` in the shared store, so callers on
//! different machines must agree on the epoch. [`SystemClock`] reads UNIX wall time for that
//! reason; [`ManualClock`] lets tests drive time explicitly, including backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the UNIX epoch.
    fn now_millis(&self) -> u64;

    /// Whole seconds since the UNIX epoch, as stored by the continuous policy.
    fn now_secs(&self) -> i64 {
        i64::try_from(self.now_millis() / 1_000).unwrap_or(i64::MAX)
    }
}

/// Wall clock backed by `SystemTime::now()`.
///
/// Readings before the epoch collapse to zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at the epoch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `secs` seconds after the epoch.
    pub fn at_secs(secs: u64) -> Self {
        let clock = Self::new();
        clock.set(Duration::from_secs(secs));
        clock
    }

    /// Jump to an absolute time since the epoch.
    pub fn set(&self, since_epoch: Duration) {
        let millis = u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX);
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self.now.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
            Some(now.saturating_add(millis))
        });
    }

    /// Move backward, as a skewed peer would.
    pub fn rewind(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self.now.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
            Some(now.saturating_sub(millis))
        });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
