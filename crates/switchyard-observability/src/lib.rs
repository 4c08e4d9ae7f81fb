//! Switchyard Observability
//!
//! Prometheus metric families for the routing layer: per-host request
//! outcomes, adaptive concurrency limits, in-flight counts, fair-queue depth
//! and wait time, pin-until-error moves and sticky session discoveries.
//!
//! ## Quick Start
//!
//! ```
//! use prometheus::Registry;
//! use std::sync::Arc;
//! use switchyard_observability::{metrics_text, RoutingMetrics};
//!
//! let registry = Registry::new();
//! let metrics = Arc::new(RoutingMetrics::new(&registry).unwrap());
//!
//! let host = metrics.host("billing-service", 0, 3);
//! host.set_limit(20.0);
//! host.record_outcome("success");
//!
//! assert!(metrics_text(&registry).unwrap().contains("switchyard_requests_total"));
//! ```
//!
//! ## Cardinality
//!
//! The `host_index` label is only populated for services with at most
//! [`MAX_HOSTS_FOR_INDEX_TAG`] hosts; larger services share a single
//! [`UNTAGGED_HOST`] series.

pub mod metrics;

pub use metrics::{
    host_index_tag, metrics_text, HostMetrics, MetricsError, QueueMetrics, RoutingMetrics,
    MAX_HOSTS_FOR_INDEX_TAG, OUTCOMES, UNTAGGED_HOST,
};
