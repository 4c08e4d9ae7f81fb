//! Monotonic clocks
//!
//! Every time-dependent primitive in Switchyard (decaying counters, limiter
//! bookkeeping, reshuffle timers, queue-time measurement) reads time through
//! the [`Clock`] trait so that tests can drive time deterministically with a
//! [`ManualClock`].
//!
//! # Example
//!
//! ```
//! use switchyard_core_resilience::clock::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! assert_eq!(clock.nanos(), 0);
//!
//! clock.advance(Duration::from_millis(5));
//! assert_eq!(clock.nanos(), 5_000_000);
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Source of monotonic nanosecond timestamps
pub trait Clock: Send + Sync + Debug {
    /// Nanoseconds elapsed since an arbitrary, fixed origin
    fn nanos(&self) -> u64;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by [`Instant`], relative to the first read in this process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shareable system clock
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn nanos(&self) -> u64 {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = ORIGIN.get_or_init(Instant::now);
        origin.elapsed().as_nanos() as u64
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock positioned at zero
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Create a shareable manual clock
    pub fn shared() -> Arc<ManualClock> {
        Arc::new(Self::new())
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp. Moving backwards is ignored.
    pub fn set(&self, nanos: u64) {
        self.now.fetch_max(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
