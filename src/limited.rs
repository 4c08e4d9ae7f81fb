//! Per-host adaptive concurrency limiting

use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core_resilience::{
    ConcurrencyLimiter, HalvingCounter, LimiterConfig, Permit, SharedClock,
};
use switchyard_observability::{HostMetrics, RoutingMetrics};
use tracing::debug;

use crate::channel::{on_completion, Admission, Channel, HostInfo, LimitedChannel, ResponseClass};
use crate::error::Result;
use crate::request::{Endpoint, Request};

/// Interval at which the recent-refusals count halves
const REFUSAL_DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// A transport channel guarded by an adaptive [`ConcurrencyLimiter`].
///
/// Requests beyond the current limit are refused. Completed requests feed
/// the limiter: success and client errors count as success, 429/503/5xx and
/// transport failures back the limit off, and cancelled requests only
/// release their slot.
pub struct ConcurrencyLimitedChannel {
    host: HostInfo,
    delegate: Arc<dyn Channel>,
    limiter: ConcurrencyLimiter,
    refusals: HalvingCounter,
    metrics: HostMetrics,
}

impl ConcurrencyLimitedChannel {
    pub fn new(
        channel_name: &str,
        host: HostInfo,
        host_count: usize,
        delegate: Arc<dyn Channel>,
        config: LimiterConfig,
        clock: SharedClock,
        metrics: &Arc<RoutingMetrics>,
    ) -> Result<Self> {
        let host_metrics = metrics.host(channel_name, host.index(), host_count);
        let gauge = host_metrics.clone();
        let limiter = ConcurrencyLimiter::builder(config)
            .on_limit_change(move |limit| gauge.set_limit(limit))
            .build()?;
        host_metrics.set_limit(limiter.limit());

        Ok(Self {
            host,
            delegate,
            limiter,
            refusals: HalvingCounter::new(clock, REFUSAL_DECAY_INTERVAL),
            metrics: host_metrics,
        })
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Refusals over roughly the last second
    pub fn recent_refusals(&self) -> u64 {
        self.refusals.get()
    }

    /// Remove this host's metric series
    pub fn unregister_metrics(&self) {
        self.metrics.unregister();
    }

    fn release(permit: Permit, outcome: Option<ResponseClass>) {
        match outcome {
            Some(ResponseClass::Success | ResponseClass::ClientError) => permit.success(),
            Some(_) => permit.dropped(),
            None => permit.ignore(),
        }
    }
}

impl LimitedChannel for ConcurrencyLimitedChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: Request) -> Admission {
        let Some(permit) = self.limiter.acquire() else {
            self.refusals.increment();
            self.metrics.record_refusal();
            debug!(
                host = %self.host,
                limit = self.limiter.limit(),
                inflight = self.limiter.inflight(),
                "Host at concurrency limit, refusing request"
            );
            return Admission::Refused(request);
        };
        self.metrics.set_inflight(self.limiter.inflight());

        let limiter = self.limiter.clone();
        let metrics = self.metrics.clone();
        let future = self.delegate.execute(endpoint, request);
        Admission::Admitted(
            on_completion(future, move |result| {
                let outcome = result.map(ResponseClass::of);
                Self::release(permit, outcome);
                if let Some(class) = outcome {
                    metrics.record_outcome(class.as_str());
                }
                metrics.set_inflight(limiter.inflight());
            })
            .boxed(),
        )
    }
}

impl fmt::Debug for ConcurrencyLimitedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimitedChannel")
            .field("host", &self.host)
            .field("limiter", &self.limiter)
            .finish()
    }
}
