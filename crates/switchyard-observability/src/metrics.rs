//! Prometheus metrics for the routing layer
//!
//! Metric families are registered into a caller-owned [`Registry`] so that
//! several clients in one process never collide and tests stay isolated.
//!
//! Per-host series carry a `host_index` label. Services with more than
//! [`MAX_HOSTS_FOR_INDEX_TAG`] hosts are tagged [`UNTAGGED_HOST`] instead so
//! cardinality stays bounded. Series for a host are removed explicitly with
//! [`HostMetrics::unregister`] when the host leaves its service.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use thiserror::Error;

/// Services with more hosts than this are not tagged per host index
pub const MAX_HOSTS_FOR_INDEX_TAG: usize = 10;

/// Label value used when per-host tagging is disabled
pub const UNTAGGED_HOST: &str = "untagged";

/// Outcome label values recorded by [`HostMetrics::record_outcome`]
pub const OUTCOMES: &[&str] = &[
    "success",
    "client_error",
    "too_many_requests",
    "unavailable",
    "server_error",
    "transport_failure",
];

/// Errors raised while registering or encoding metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics text is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Label value for a host at `index` in a service of `host_count` hosts
pub fn host_index_tag(index: usize, host_count: usize) -> String {
    if host_count > MAX_HOSTS_FOR_INDEX_TAG {
        UNTAGGED_HOST.to_string()
    } else {
        index.to_string()
    }
}

/// All metric families emitted by the routing layer
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    requests: CounterVec,
    concurrency_limit: GaugeVec,
    inflight: IntGaugeVec,
    limiter_refusals: CounterVec,
    queued: IntGaugeVec,
    queue_time: HistogramVec,
    queue_rejections: CounterVec,
    pin_changes: CounterVec,
    reshuffles: CounterVec,
    sticky_discoveries: CounterVec,
    channel_panics: CounterVec,
}

impl RoutingMetrics {
    /// Create the metric families and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests = CounterVec::new(
            Opts::new(
                "switchyard_requests_total",
                "Completed requests per host, by classified outcome",
            ),
            &["channel", "host_index", "outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let concurrency_limit = GaugeVec::new(
            Opts::new(
                "switchyard_concurrency_limit",
                "Current adaptive concurrency limit per host",
            ),
            &["channel", "host_index"],
        )?;
        registry.register(Box::new(concurrency_limit.clone()))?;

        let inflight = IntGaugeVec::new(
            Opts::new(
                "switchyard_inflight_requests",
                "Requests currently holding a concurrency permit per host",
            ),
            &["channel", "host_index"],
        )?;
        registry.register(Box::new(inflight.clone()))?;

        let limiter_refusals = CounterVec::new(
            Opts::new(
                "switchyard_limiter_refusals_total",
                "Requests refused because a host had no concurrency headroom",
            ),
            &["channel", "host_index"],
        )?;
        registry.register(Box::new(limiter_refusals.clone()))?;

        let queued = IntGaugeVec::new(
            Opts::new(
                "switchyard_queued_requests",
                "Requests waiting in the fair queue",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(queued.clone()))?;

        let queue_time = HistogramVec::new(
            HistogramOpts::new(
                "switchyard_queue_time_seconds",
                "Time a request spent queued before dispatch",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["channel"],
        )?;
        registry.register(Box::new(queue_time.clone()))?;

        let queue_rejections = CounterVec::new(
            Opts::new(
                "switchyard_queue_rejections_total",
                "Requests rejected or discarded by the fair queue",
            ),
            &["channel", "reason"],
        )?;
        registry.register(Box::new(queue_rejections.clone()))?;

        let pin_changes = CounterVec::new(
            Opts::new(
                "switchyard_pin_changes_total",
                "Pin-until-error moves to the next host",
            ),
            &["channel", "reason"],
        )?;
        registry.register(Box::new(pin_changes.clone()))?;

        let reshuffles = CounterVec::new(
            Opts::new(
                "switchyard_pin_reshuffles_total",
                "Periodic reshuffles of the pin-until-error host order",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(reshuffles.clone()))?;

        let sticky_discoveries = CounterVec::new(
            Opts::new(
                "switchyard_sticky_discoveries_total",
                "Sticky session host discoveries, by result",
            ),
            &["channel", "result"],
        )?;
        registry.register(Box::new(sticky_discoveries.clone()))?;

        let channel_panics = CounterVec::new(
            Opts::new(
                "switchyard_channel_panics_total",
                "Panics caught while executing a transport channel",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(channel_panics.clone()))?;

        Ok(Self {
            requests,
            concurrency_limit,
            inflight,
            limiter_refusals,
            queued,
            queue_time,
            queue_rejections,
            pin_changes,
            reshuffles,
            sticky_discoveries,
            channel_panics,
        })
    }

    /// Metrics registered into a private registry nobody scrapes
    pub fn detached() -> Arc<Self> {
        Arc::new(
            Self::new(&Registry::new())
                .expect("a fresh registry accepts every switchyard metric family"),
        )
    }

    /// Resolve the per-host series for one host of a service
    pub fn host(
        self: &Arc<Self>,
        channel: &str,
        host_index: usize,
        host_count: usize,
    ) -> HostMetrics {
        let tag = host_index_tag(host_index, host_count);
        HostMetrics {
            metrics: Arc::clone(self),
            requests: OUTCOMES
                .iter()
                .map(|outcome| self.requests.with_label_values(&[channel, &tag, *outcome]))
                .collect(),
            limit: self.concurrency_limit.with_label_values(&[channel, &tag]),
            inflight: self.inflight.with_label_values(&[channel, &tag]),
            refusals: self.limiter_refusals.with_label_values(&[channel, &tag]),
            channel: channel.to_string(),
            host_index: tag,
        }
    }

    /// Resolve the queue series for one channel
    pub fn queue(&self, channel: &str) -> QueueMetrics {
        QueueMetrics {
            queued: self.queued.with_label_values(&[channel]),
            queue_time: self.queue_time.with_label_values(&[channel]),
            rejections: self.queue_rejections.clone(),
            channel: channel.to_string(),
        }
    }

    /// Remove every per-host series for `host_index` under `channel`.
    ///
    /// Shared [`UNTAGGED_HOST`] series are left in place since other hosts
    /// still report into them.
    pub fn remove_host(&self, channel: &str, host_index: &str) {
        if host_index == UNTAGGED_HOST {
            return;
        }
        let labels = [channel, host_index];
        let _ = self.concurrency_limit.remove_label_values(&labels);
        let _ = self.inflight.remove_label_values(&labels);
        let _ = self.limiter_refusals.remove_label_values(&labels);
        for outcome in OUTCOMES {
            let _ = self
                .requests
                .remove_label_values(&[channel, host_index, outcome]);
        }
        tracing::debug!(channel, host_index, "Unregistered host metrics");
    }

    /// Count a pin-until-error move
    pub fn record_pin_change(&self, channel: &str, reason: &str) {
        self.pin_changes.with_label_values(&[channel, reason]).inc();
    }

    /// Count a pin-until-error reshuffle
    pub fn record_reshuffle(&self, channel: &str) {
        self.reshuffles.with_label_values(&[channel]).inc();
    }

    /// Count a sticky session discovery attempt
    pub fn record_sticky_discovery(&self, channel: &str, result: &str) {
        self.sticky_discoveries
            .with_label_values(&[channel, result])
            .inc();
    }

    /// Count a panic caught in a transport channel
    pub fn record_channel_panic(&self, channel: &str) {
        self.channel_panics.with_label_values(&[channel]).inc();
    }

    /// Current value of a pin change counter
    pub fn pin_changes(&self, channel: &str, reason: &str) -> u64 {
        self.pin_changes.with_label_values(&[channel, reason]).get() as u64
    }

    /// Current value of a sticky discovery counter
    pub fn sticky_discoveries(&self, channel: &str, result: &str) -> u64 {
        self.sticky_discoveries
            .with_label_values(&[channel, result])
            .get() as u64
    }
}

/// Pre-resolved series for one host
#[derive(Debug, Clone)]
pub struct HostMetrics {
    metrics: Arc<RoutingMetrics>,
    /// Indexed like [`OUTCOMES`]
    requests: Vec<Counter>,
    limit: Gauge,
    inflight: IntGauge,
    refusals: Counter,
    channel: String,
    host_index: String,
}

impl HostMetrics {
    /// Label value identifying this host
    pub fn host_index(&self) -> &str {
        &self.host_index
    }

    fn outcome_counter(&self, outcome: &str) -> Option<&Counter> {
        OUTCOMES
            .iter()
            .position(|known| *known == outcome)
            .map(|position| &self.requests[position])
    }

    /// Count a completed request with one of [`OUTCOMES`]; other values are
    /// ignored.
    ///
    /// Series are resolved when the host is created, so a completion that
    /// lands after [`HostMetrics::unregister`] never re-creates them.
    pub fn record_outcome(&self, outcome: &str) {
        match self.outcome_counter(outcome) {
            Some(counter) => counter.inc(),
            None => tracing::debug!(outcome, "Unknown request outcome"),
        }
    }

    /// Requests recorded for this host with `outcome`
    pub fn requests(&self, outcome: &str) -> u64 {
        self.outcome_counter(outcome).map_or(0, |c| c.get() as u64)
    }

    /// Publish the current concurrency limit
    pub fn set_limit(&self, limit: f64) {
        self.limit.set(limit);
    }

    /// Publish the current in-flight count
    pub fn set_inflight(&self, inflight: usize) {
        self.inflight.set(inflight as i64);
    }

    /// Count a request refused for lack of headroom
    pub fn record_refusal(&self) {
        self.refusals.inc();
    }

    /// Total refusals recorded for this host
    pub fn refusals(&self) -> u64 {
        self.refusals.get() as u64
    }

    /// Remove this host's series
    pub fn unregister(&self) {
        self.metrics.remove_host(&self.channel, &self.host_index);
    }
}

/// Pre-resolved series for one queue
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queued: IntGauge,
    queue_time: Histogram,
    rejections: CounterVec,
    channel: String,
}

impl QueueMetrics {
    /// Publish the current queue size
    pub fn set_queued(&self, size: usize) {
        self.queued.set(size as i64);
    }

    /// Record how long a request waited before dispatch
    pub fn record_queue_time(&self, seconds: f64) {
        self.queue_time.observe(seconds);
    }

    /// Count a rejected or discarded request (`queue_full`, `cancelled`)
    pub fn record_rejection(&self, reason: &str) {
        self.rejections
            .with_label_values(&[&self.channel, reason])
            .inc();
    }

    /// Current value of a rejection counter
    pub fn rejections(&self, reason: &str) -> u64 {
        self.rejections
            .with_label_values(&[&self.channel, reason])
            .get() as u64
    }
}

/// Encode every family in `registry` in Prometheus text format
pub fn metrics_text(registry: &Registry) -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
