/*!
 * Logging for routing decisions
 *
 * Every crate of the workspace logs under its own target (`switchyard`,
 * `switchyard_core_resilience`, `switchyard_observability`). The configured
 * level applies to all three; `directives` narrow or widen individual
 * modules, e.g. `switchyard::queue=trace` to follow queue scheduling.
 */

use std::fs::File;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, LoggingConfig, ServiceConfig};
use crate::error::{Result, RoutingError};

const TARGETS: [&str; 3] = [
    "switchyard",
    "switchyard_core_resilience",
    "switchyard_observability",
];

/// Resolve the effective level for `config`
fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Filter directives derived from `config`
fn filter_directives(config: &LoggingConfig) -> String {
    let level = effective_level(config);
    TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .chain(config.directives.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

fn config_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_new(filter_directives(config))
        .map_err(|e| RoutingError::Config(format!("Invalid log filter: {}", e)))
}

fn subscriber(
    config: &LoggingConfig,
    filter: EnvFilter,
    writer: BoxMakeWriter,
    ansi: bool,
) -> impl Subscriber + Send + Sync + 'static {
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .with_span_events(FmtSpan::NONE)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .json()
            .boxed(),
    };
    tracing_subscriber::registry().with(layer).with(filter)
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level and directives,
/// which are still validated.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let configured = config_filter(config)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| RoutingError::Config(format!("Failed to create log file: {}", e)))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    subscriber(config, filter, writer, ansi)
        .try_init()
        .map_err(|e| RoutingError::Config(format!("Failed to install subscriber: {}", e)))
}

/// Install the subscriber from a service's `[logging]` table
pub fn init_service_logging(config: &ServiceConfig) -> Result<()> {
    init_logging(&config.logging)
}

/// Install a test-writer subscriber once per process
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let config = LoggingConfig {
            verbose: true,
            ..Default::default()
        };
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| config_filter(&config))
            .unwrap_or_else(|_| EnvFilter::new("switchyard=debug"));
        let layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .ok(); // Another test harness may own the global subscriber
    });
}
