//! Injectable time source.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

/// Source of the current time in microseconds since the Unix epoch.
///
/// Replicas take a clock at construction so tests can control timestamps and
/// expiry; everything else in the crate reads time through the owning
/// replica's clock.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Current time in microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

/// The default [`Clock`], backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("time drift")
            .as_micros() as u64
    }
}

/// A manually advanced [`Clock`] for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Create a clock stopped at the given time.
    pub fn new(micros: u64) -> Self {
        ManualClock {
            micros: AtomicU64::new(micros),
        }
    }

    /// Set the current time.
    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    /// Advance the current time.
    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}
