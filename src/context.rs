//! Shared resources injected into every routing component

use prometheus::Registry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::{Arc, Mutex};
use switchyard_core_resilience::{SharedClock, SystemClock};
use switchyard_observability::RoutingMetrics;
use tokio::runtime::Handle;

use crate::error::{Result, RoutingError};

/// Random source used for shuffles and jitter
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Time, randomness, metrics and the runtime that drives queued requests.
///
/// Constructed once and cloned into every channel of a service; nothing in
/// the routing layer reaches for ambient globals.
#[derive(Clone)]
pub struct RoutingContext {
    clock: SharedClock,
    rng: SharedRng,
    metrics: Arc<RoutingMetrics>,
    runtime: Handle,
}

impl RoutingContext {
    /// Context reporting metrics into `registry`
    pub fn new(runtime: Handle, registry: &Registry) -> Result<Self> {
        let metrics = Arc::new(RoutingMetrics::new(registry)?);
        Ok(Self::with_parts(runtime, metrics))
    }

    /// Context whose metrics are not exported anywhere
    pub fn detached(runtime: Handle) -> Self {
        Self::with_parts(runtime, RoutingMetrics::detached())
    }

    /// Detached context on the runtime of the calling task
    pub fn current() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RoutingError::Config(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::detached(runtime))
    }

    fn with_parts(runtime: Handle, metrics: Arc<RoutingMetrics>) -> Self {
        Self {
            clock: SystemClock::shared(),
            rng: Arc::new(Mutex::new(StdRng::from_os_rng())),
            metrics,
            runtime,
        }
    }

    /// Replace the clock (tests use a manual clock)
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Make shuffles and jitter deterministic
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Report into metrics shared with other services
    pub fn with_metrics(mut self, metrics: Arc<RoutingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn rng(&self) -> &SharedRng {
        &self.rng
    }

    pub fn metrics(&self) -> &Arc<RoutingMetrics> {
        &self.metrics
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

impl fmt::Debug for RoutingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingContext")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
