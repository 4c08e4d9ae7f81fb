/*!
 * Switchyard - client-side RPC routing
 *
 * Decides, for every outgoing request of a service, which upstream host
 * serves it and when:
 * - Adaptive per-host concurrency limits (AIMD / CAID)
 * - Node selection: pin-until-error with periodic reshuffle, or score-based balancing
 * - Bounded round-robin fair queue when every host is saturated
 * - Sticky sessions that bind a sequence of requests to one host
 * - Live reload of the host set without losing per-host state
 * - Prometheus metrics and tracing logs throughout
 *
 * Transports are supplied by the caller as `Channel` implementations.
 */

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod limited;
pub mod logging;
pub mod queue;
pub mod request;
pub mod selection;
pub mod sticky;

mod sync;

// Re-export commonly used types
pub use channel::{
    Admission, Channel, HostChannel, HostInfo, LimitedChannel, NeverFailChannel, ResponseClass,
    ResponseFuture,
};
pub use client::{ChannelFactory, ServiceChannel};
pub use config::{LogFormat, LogLevel, LoggingConfig, ServiceConfig};
pub use context::RoutingContext;
pub use error::{ErrorCategory, Result, RoutingError};
pub use limited::ConcurrencyLimitedChannel;
pub use queue::{QueueKey, QueuedChannel};
pub use request::{Endpoint, Request, Response, RoutingKey, StickyTarget};
pub use selection::{NodeSelectionChannel, NodeSelectionStrategy, SelectionSettings};
pub use sticky::{StickyChannels, StickySession};
pub use switchyard_core_resilience::{LimiterConfig, LimiterKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenience re-exports for callers building a service channel
pub mod prelude {
    pub use crate::channel::{Channel, LimitedChannel};
    pub use crate::client::{ChannelFactory, ServiceChannel};
    pub use crate::config::ServiceConfig;
    pub use crate::context::RoutingContext;
    pub use crate::error::{Result, RoutingError};
    pub use crate::request::{Endpoint, Request, Response, RoutingKey};
}
