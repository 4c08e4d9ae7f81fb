//! Adaptive concurrency limiting for a single upstream
//!
//! A [`ConcurrencyLimiter`] bounds the number of in-flight requests against one
//! host and adapts that bound from request outcomes:
//!
//! - **success** with high utilization raises the limit (additively for
//!   [`LimiterKind::Aimd`], by `1/limit` for [`LimiterKind::Caid`])
//! - **dropped** (QoS response, server error, I/O failure) multiplies the limit
//!   by `backoff_ratio`
//! - **ignore** only releases the in-flight slot
//!
//! Admission and limit updates are lock-free compare-and-swap loops. The limit
//! is an `f64` stored as raw bits in an `AtomicU64`.
//!
//! # Example
//!
//! ```
//! use switchyard_core_resilience::limiter::{ConcurrencyLimiter, LimiterConfig};
//!
//! let limiter = ConcurrencyLimiter::new(LimiterConfig::default()).unwrap();
//!
//! let permit = limiter.acquire().expect("a fresh limiter has headroom");
//! assert_eq!(limiter.inflight(), 1);
//!
//! permit.success();
//! assert_eq!(limiter.inflight(), 0);
//! ```

use crate::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Limits closer than this to the ceiling are halved to recover headroom
const CEILING_EPSILON: f64 = 1e-6;

/// Utilization threshold for AIMD increases, as a fraction of the limit
const AIMD_UTILIZATION: f64 = 0.5;

/// Utilization threshold for CAID increases, as a fraction of the limit
const CAID_UTILIZATION: f64 = 0.9;

/// Limit adjustment algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Additive increase (+1), multiplicative decrease
    Aimd,
    /// Cautious increase (+1/limit), aggressive decrease
    #[default]
    Caid,
}

/// Configuration for a [`ConcurrencyLimiter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Adjustment algorithm
    #[serde(default)]
    pub kind: LimiterKind,

    /// Limit used before any feedback has been observed
    #[serde(default = "default_initial_limit")]
    pub initial_limit: f64,

    /// Floor for the limit; must be at least 1 so a host is never starved
    #[serde(default = "default_min_limit")]
    pub min_limit: f64,

    /// Ceiling for the limit
    #[serde(default = "default_max_limit")]
    pub max_limit: f64,

    /// Multiplier applied on a dropped request, in `[0.5, 1.0)`
    #[serde(default = "default_backoff_ratio")]
    pub backoff_ratio: f64,
}

fn default_initial_limit() -> f64 {
    20.0
}

fn default_min_limit() -> f64 {
    1.0
}

fn default_max_limit() -> f64 {
    1_000_000.0
}

fn default_backoff_ratio() -> f64 {
    0.9
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            kind: LimiterKind::default(),
            initial_limit: default_initial_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            backoff_ratio: default_backoff_ratio(),
        }
    }
}

impl LimiterConfig {
    /// AIMD configuration with default bounds
    pub fn aimd() -> Self {
        Self {
            kind: LimiterKind::Aimd,
            ..Default::default()
        }
    }

    /// CAID configuration with default bounds
    pub fn caid() -> Self {
        Self {
            kind: LimiterKind::Caid,
            ..Default::default()
        }
    }

    /// Check that the bounds are coherent
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !(self.min_limit >= 1.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "min_limit must be >= 1, got {}",
                self.min_limit
            )));
        }
        if !(self.max_limit >= self.min_limit) {
            return Err(ResilienceError::InvalidConfig(format!(
                "max_limit ({}) must be >= min_limit ({})",
                self.max_limit, self.min_limit
            )));
        }
        if !(self.initial_limit >= self.min_limit && self.initial_limit <= self.max_limit) {
            return Err(ResilienceError::InvalidConfig(format!(
                "initial_limit ({}) must lie within [{}, {}]",
                self.initial_limit, self.min_limit, self.max_limit
            )));
        }
        if !(self.backoff_ratio >= 0.5 && self.backoff_ratio < 1.0) {
            return Err(ResilienceError::InvalidConfig(format!(
                "backoff_ratio must be in [0.5, 1.0), got {}",
                self.backoff_ratio
            )));
        }
        Ok(())
    }
}

type LimitListener = Arc<dyn Fn(f64) + Send + Sync>;

struct LimiterInner {
    config: LimiterConfig,
    limit: AtomicU64,
    inflight: AtomicUsize,
    on_limit_change: Option<LimitListener>,
}

impl LimiterInner {
    fn limit(&self) -> f64 {
        f64::from_bits(self.limit.load(Ordering::Acquire))
    }

    fn release(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    fn on_success(&self, inflight_snapshot: usize) {
        let snapshot = inflight_snapshot as f64;
        let kind = self.config.kind;
        let max = self.config.max_limit;
        let min = self.config.min_limit;
        self.update_limit(|limit| {
            let increased = match kind {
                LimiterKind::Aimd if snapshot >= limit * AIMD_UTILIZATION => limit + 1.0,
                LimiterKind::Caid if snapshot >= (limit * CAID_UTILIZATION).floor() => {
                    limit + 1.0 / limit
                }
                _ => return None,
            };
            let clamped = increased.min(max);
            if max - clamped < CEILING_EPSILON {
                Some((clamped / 2.0).max(min))
            } else {
                Some(clamped)
            }
        });
    }

    fn on_dropped(&self) {
        let ratio = self.config.backoff_ratio;
        let min = self.config.min_limit;
        self.update_limit(|limit| Some((limit * ratio).max(min)));
    }

    fn update_limit(&self, f: impl Fn(f64) -> Option<f64>) {
        let result = self
            .limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                f(f64::from_bits(bits)).map(f64::to_bits)
            });

        if let Ok(previous) = result {
            let updated = self.limit();
            if updated.to_bits() != previous {
                if let Some(listener) = &self.on_limit_change {
                    listener(updated);
                }
            }
        }
    }
}

/// Builder allowing a limit listener to be attached before construction
pub struct LimiterBuilder {
    config: LimiterConfig,
    on_limit_change: Option<LimitListener>,
}

impl LimiterBuilder {
    /// Invoke `f` with the new limit whenever it changes.
    ///
    /// Useful for exporting the limit as a gauge without coupling this crate
    /// to a metrics backend.
    pub fn on_limit_change(mut self, f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_limit_change = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the limiter
    pub fn build(self) -> Result<ConcurrencyLimiter, ResilienceError> {
        self.config.validate()?;
        let initial = self.config.initial_limit;
        Ok(ConcurrencyLimiter {
            inner: Arc::new(LimiterInner {
                config: self.config,
                limit: AtomicU64::new(initial.to_bits()),
                inflight: AtomicUsize::new(0),
                on_limit_change: self.on_limit_change,
            }),
        })
    }
}

/// Lock-free adaptive concurrency limiter.
///
/// Cloning is cheap and yields a handle to the same limiter.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// Create a limiter from a validated configuration
    pub fn new(config: LimiterConfig) -> Result<Self, ResilienceError> {
        Self::builder(config).build()
    }

    /// Start building a limiter
    pub fn builder(config: LimiterConfig) -> LimiterBuilder {
        LimiterBuilder {
            config,
            on_limit_change: None,
        }
    }

    /// Try to admit one request.
    ///
    /// Admits iff `inflight <= limit - 1`, i.e. there is room for one whole
    /// request under a possibly fractional limit. Returns `None` when the host
    /// is saturated; that is a capacity signal, not an error.
    pub fn acquire(&self) -> Option<Permit> {
        let limit = self.inner.limit();
        let mut current = self.inner.inflight.load(Ordering::Acquire);
        loop {
            if current as f64 > limit - 1.0 {
                return None;
            }
            match self.inner.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(Permit {
            inner: Some(Arc::clone(&self.inner)),
            inflight_snapshot: current + 1,
        })
    }

    /// Current limit
    pub fn limit(&self) -> f64 {
        self.inner.limit()
    }

    /// Requests currently holding a permit
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    /// Configuration this limiter was built with
    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("kind", &self.inner.config.kind)
            .field("limit", &self.limit())
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// One admitted in-flight request.
///
/// Exactly one disposition must be reported; each disposition consumes the
/// permit so a second report cannot compile. A permit dropped without a
/// disposition (for example when the request future is cancelled) is released
/// as [`Permit::ignore`].
#[must_use = "a permit must be released with success(), dropped() or ignore()"]
pub struct Permit {
    inner: Option<Arc<LimiterInner>>,
    inflight_snapshot: usize,
}

impl Permit {
    /// In-flight count observed when this permit was issued (including itself)
    pub fn inflight_snapshot(&self) -> usize {
        self.inflight_snapshot
    }

    /// The request completed and the host had headroom
    pub fn success(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
            inner.on_success(self.inflight_snapshot);
        }
    }

    /// The host signalled overload or failed; back off
    pub fn dropped(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
            inner.on_dropped();
        }
    }

    /// The outcome carries no information about the host's capacity
    pub fn ignore(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("inflight_snapshot", &self.inflight_snapshot)
            .field("released", &self.inner.is_none())
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!(
                inflight_snapshot = self.inflight_snapshot,
                "Permit dropped without a disposition, releasing as ignored"
            );
            inner.release();
        }
    }
}
