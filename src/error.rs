/*!
 * Error types for Switchyard
 */

use std::fmt;
use std::io;
use std::time::Duration;
use switchyard_core_resilience::ResilienceError;
use switchyard_observability::MetricsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    /// The fair queue reached its configured bound
    #[error("Request queue is full (max size {max_size})")]
    QueueFull { max_size: usize },

    /// The service has no hosts configured
    #[error("No hosts available for service")]
    NoHosts,

    /// The caller went away before a response was produced
    #[error("Request was cancelled")]
    Cancelled,

    /// I/O error raised by the transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport gave up waiting for a response
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A transport channel panicked; the panic was contained
    #[error("Channel panicked: {0}")]
    ChannelPanicked(String),

    /// A sticky session targets a host that left the service
    #[error("Sticky target {0} is no longer part of the service")]
    StickyTargetGone(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RoutingError {
    /// True when the error reflects exhausted local capacity rather than a
    /// backend failure
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, RoutingError::QueueFull { .. } | RoutingError::NoHosts)
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            RoutingError::QueueFull { .. } => true,
            RoutingError::Timeout(_) => true,
            RoutingError::Transport(_) => true,
            RoutingError::Io(io_err) => Self::is_io_transient(io_err),
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
        )
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            RoutingError::QueueFull { .. } | RoutingError::NoHosts => ErrorCategory::Capacity,
            RoutingError::Io(_)
            | RoutingError::Timeout(_)
            | RoutingError::Transport(_)
            | RoutingError::StickyTargetGone(_) => ErrorCategory::Transport,
            RoutingError::Cancelled | RoutingError::ChannelPanicked(_) => ErrorCategory::Internal,
            RoutingError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

impl From<ResilienceError> for RoutingError {
    fn from(err: ResilienceError) -> Self {
        RoutingError::Config(err.to_string())
    }
}

impl From<MetricsError> for RoutingError {
    fn from(err: MetricsError) -> Self {
        RoutingError::Config(format!("Failed to register metrics: {}", err))
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local capacity exhausted (queue full, no hosts)
    Capacity,
    /// Failures reported by or about the transport
    Transport,
    /// Cancellation and contained panics
    Internal,
    /// Invalid configuration
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Capacity => write!(f, "capacity"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Internal => write!(f, "internal"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}
