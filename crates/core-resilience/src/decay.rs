//! Decaying counters: lock-free, time-windowed health signals
//!
//! Both counters decay lazily. Nothing ticks in the background; instead every
//! read or write first works out how many whole decay intervals have elapsed
//! since the last decay and applies all of them in one step. Idle periods of
//! any length therefore cost a single multiplication (or shift).
//!
//! Concurrency is handled with two atomics per counter: the value and the
//! timestamp of the last applied decay. The thread that wins the
//! compare-and-swap on the timestamp applies the decay; losers skip it because
//! the winner already did. An update racing with a decay may land on either
//! side of it, so values are **approximate**. That is the price of staying
//! lock-free on the request path.
//!
//! # Example
//!
//! ```
//! use switchyard_core_resilience::clock::{ManualClock, SharedClock};
//! use switchyard_core_resilience::decay::CoarseExponentialDecay;
//! use std::time::Duration;
//!
//! let clock = ManualClock::shared();
//! let half_life = Duration::from_secs(30);
//! let failures = CoarseExponentialDecay::new(clock.clone() as SharedClock, half_life);
//!
//! failures.update(10.0);
//! clock.advance(Duration::from_secs(30));
//! assert!((failures.get() - 5.0).abs() < 1e-9);
//! ```

use crate::clock::SharedClock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of discrete decay steps per half-life
pub const DECAYS_PER_HALF_LIFE: u32 = 10;

/// Shared interval bookkeeping: returns the number of intervals this caller
/// is responsible for applying, or zero if none elapsed or another thread won.
fn claim_decays(clock: &SharedClock, last_decay: &AtomicU64, interval_nanos: u64) -> u64 {
    let now = clock.nanos();
    let last = last_decay.load(Ordering::Acquire);
    let decays = now.saturating_sub(last) / interval_nanos;
    if decays == 0 {
        return 0;
    }

    let next = last.saturating_add(decays.saturating_mul(interval_nanos));
    match last_decay.compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => decays,
        Err(_) => 0,
    }
}

/// Fractional counter that decays exponentially with a configurable half-life.
///
/// The value is multiplied by `0.5^(1/DECAYS_PER_HALF_LIFE)` once per
/// `half_life / DECAYS_PER_HALF_LIFE`, giving a smooth curve that reaches
/// half of its value after exactly one half-life.
pub struct CoarseExponentialDecay {
    clock: SharedClock,
    decay_interval_nanos: u64,
    decay_factor: f64,
    value: AtomicU64,
    last_decay: AtomicU64,
}

impl CoarseExponentialDecay {
    /// Create a counter starting at zero
    pub fn new(clock: SharedClock, half_life: Duration) -> Self {
        let decay_interval_nanos =
            (half_life.as_nanos() as u64 / DECAYS_PER_HALF_LIFE as u64).max(1);
        let last_decay = AtomicU64::new(clock.nanos());
        Self {
            clock,
            decay_interval_nanos,
            decay_factor: 0.5f64.powf(1.0 / DECAYS_PER_HALF_LIFE as f64),
            value: AtomicU64::new(0f64.to_bits()),
            last_decay,
        }
    }

    /// Add `delta` to the counter after applying any pending decay
    pub fn update(&self, delta: f64) {
        self.decay_if_necessary();
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Current decayed value
    pub fn get(&self) -> f64 {
        self.decay_if_necessary();
        f64::from_bits(self.value.load(Ordering::Acquire))
    }

    fn decay_if_necessary(&self) {
        let decays = claim_decays(&self.clock, &self.last_decay, self.decay_interval_nanos);
        if decays == 0 {
            return;
        }

        let factor = self.decay_factor.powf(decays as f64);
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) * factor).to_bits())
            });
    }
}

impl fmt::Debug for CoarseExponentialDecay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoarseExponentialDecay")
            .field("value", &f64::from_bits(self.value.load(Ordering::Relaxed)))
            .field("decay_interval_nanos", &self.decay_interval_nanos)
            .finish()
    }
}

/// Integer counter that halves once per interval.
///
/// Cheaper and coarser than [`CoarseExponentialDecay`]; suited to plain event
/// counts such as "recent refusals".
pub struct HalvingCounter {
    clock: SharedClock,
    interval_nanos: u64,
    value: AtomicU64,
    last_decay: AtomicU64,
}

impl HalvingCounter {
    /// Create a counter starting at zero that halves every `interval`
    pub fn new(clock: SharedClock, interval: Duration) -> Self {
        let last_decay = AtomicU64::new(clock.nanos());
        Self {
            clock,
            interval_nanos: (interval.as_nanos() as u64).max(1),
            value: AtomicU64::new(0),
            last_decay,
        }
    }

    /// Add one
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add `n` after applying any pending decay
    pub fn add(&self, n: u64) {
        self.decay_if_necessary();
        self.value.fetch_add(n, Ordering::AcqRel);
    }

    /// Current decayed count
    pub fn get(&self) -> u64 {
        self.decay_if_necessary();
        self.value.load(Ordering::Acquire)
    }

    fn decay_if_necessary(&self) {
        let shifts = claim_decays(&self.clock, &self.last_decay, self.interval_nanos);
        if shifts == 0 {
            return;
        }

        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(if shifts >= u64::BITS as u64 { 0 } else { v >> shifts })
            });
    }
}

impl fmt::Debug for HalvingCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HalvingCounter")
            .field("value", &self.value.load(Ordering::Relaxed))
            .field("interval_nanos", &self.interval_nanos)
            .finish()
    }
}
