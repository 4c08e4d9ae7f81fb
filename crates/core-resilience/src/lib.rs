//! Switchyard Core Resilience: Pure-logic admission and health primitives
//!
//! # Overview
//!
//! This crate provides the lock-free building blocks the Switchyard routing
//! layer uses on every request:
//!
//! - **Clock**: injectable monotonic time source, with a manual clock for tests
//! - **Decaying counters**: time-windowed health signals (exponential and halving)
//! - **Concurrency limiter**: adaptive AIMD/CAID admission control with RAII permits
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transports (HTTP clients, connection pools)
//! - Metrics backends
//! - Routing policy
//!
//! # Architecture
//!
//! ```text
//!         request
//!            │
//!            ▼
//! ┌─────────────────────────────────────────┐
//! │       ConcurrencyLimiter                │  ← Admit or refuse
//! │  (inflight <= limit - 1, lock-free)     │
//! └─────────────┬───────────────────────────┘
//!               │ Permit
//!               ▼
//!         Upstream host
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │  Permit::success / dropped / ignore     │  ← Adapt the limit
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       CoarseExponentialDecay            │  ← Failure memory for scoring
//! │  (lazy decay driven by the Clock)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use switchyard_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! let clock: SharedClock = SystemClock::shared();
//! let failures = CoarseExponentialDecay::new(clock, Duration::from_secs(30));
//! let limiter = ConcurrencyLimiter::new(LimiterConfig::caid())?;
//!
//! if let Some(permit) = limiter.acquire() {
//!     // ...send the request, then report what happened
//!     failures.update(10.0);
//!     permit.dropped();
//! }
//! # Ok::<(), ResilienceError>(())
//! ```

pub mod clock;
pub mod decay;
pub mod error;
pub mod limiter;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use decay::{CoarseExponentialDecay, HalvingCounter, DECAYS_PER_HALF_LIFE};
pub use error::ResilienceError;
pub use limiter::{ConcurrencyLimiter, LimiterBuilder, LimiterConfig, LimiterKind, Permit};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use switchyard_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use super::decay::{CoarseExponentialDecay, HalvingCounter};
    pub use super::error::ResilienceError;
    pub use super::limiter::{ConcurrencyLimiter, LimiterConfig, LimiterKind, Permit};
}
