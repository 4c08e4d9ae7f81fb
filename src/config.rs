/*!
 * Configuration types for Switchyard
 */

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_core_resilience::LimiterConfig;

use crate::error::{Result, RoutingError};
use crate::selection::NodeSelectionStrategy;

/// Routing configuration for one logical service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Logical service name, used as the channel label in logs and metrics
    pub service_name: String,

    /// Upstream host URIs
    #[serde(default)]
    pub uris: Vec<String>,

    /// How requests are spread across hosts
    #[serde(default)]
    pub node_selection_strategy: NodeSelectionStrategy,

    /// Bound on requests waiting for capacity; overflow fails immediately
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-host adaptive concurrency limiter
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Half-life of the failure memory used to score hosts
    #[serde(default = "default_failure_half_life_secs")]
    pub failure_half_life_secs: u64,

    /// Base interval between pin-until-error reshuffles
    #[serde(default = "default_reshuffle_interval_secs")]
    pub reshuffle_interval_secs: u64,

    /// Random jitter (+/-) applied to each reshuffle interval
    #[serde(default = "default_reshuffle_jitter_secs")]
    pub reshuffle_jitter_secs: u64,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_queue_size() -> usize {
    100_000
}

fn default_failure_half_life_secs() -> u64 {
    30
}

fn default_reshuffle_interval_secs() -> u64 {
    600
}

fn default_reshuffle_jitter_secs() -> u64 {
    30
}

impl ServiceConfig {
    /// Configuration with defaults for `service_name` and `uris`
    pub fn new(service_name: impl Into<String>, uris: Vec<String>) -> Self {
        Self {
            service_name: service_name.into(),
            uris,
            node_selection_strategy: NodeSelectionStrategy::default(),
            max_queue_size: default_max_queue_size(),
            limiter: LimiterConfig::default(),
            failure_half_life_secs: default_failure_half_life_secs(),
            reshuffle_interval_secs: default_reshuffle_interval_secs(),
            reshuffle_jitter_secs: default_reshuffle_jitter_secs(),
            logging: LoggingConfig::default(),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(contents)
            .map_err(|e| RoutingError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RoutingError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RoutingError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check that the configuration is coherent
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(RoutingError::Config(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(RoutingError::Config(
                "max_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.failure_half_life_secs == 0 {
            return Err(RoutingError::Config(
                "failure_half_life_secs must be greater than 0".to_string(),
            ));
        }
        if self.reshuffle_interval_secs == 0 {
            return Err(RoutingError::Config(
                "reshuffle_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.reshuffle_jitter_secs >= self.reshuffle_interval_secs {
            return Err(RoutingError::Config(format!(
                "reshuffle_jitter_secs ({}) must be less than reshuffle_interval_secs ({})",
                self.reshuffle_jitter_secs, self.reshuffle_interval_secs
            )));
        }

        let mut seen = HashSet::new();
        for uri in &self.uris {
            if uri.trim().is_empty() {
                return Err(RoutingError::Config("uris must not be empty".to_string()));
            }
            if !seen.insert(uri.as_str()) {
                return Err(RoutingError::Config(format!("duplicate uri: {}", uri)));
            }
        }

        self.limiter.validate()?;
        Ok(())
    }

    pub fn failure_half_life(&self) -> Duration {
        Duration::from_secs(self.failure_half_life_secs)
    }

    pub fn reshuffle_interval(&self) -> Duration {
        Duration::from_secs(self.reshuffle_interval_secs)
    }

    pub fn reshuffle_jitter(&self) -> Duration {
        Duration::from_secs(self.reshuffle_jitter_secs)
    }
}

/// Log output configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,

    /// Line format
    #[serde(default)]
    pub format: LogFormat,

    /// Extra filter directives, e.g. `switchyard::queue=trace`
    #[serde(default)]
    pub directives: Vec<String>,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,

    /// One JSON object per event
    Json,
}

/// Logging level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core_resilience::LimiterKind;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            service_name = "billing"
            uris = ["https://billing-1:8443", "https://billing-2:8443"]
            "#,
        )
        .unwrap();

        assert_eq!(config.uris.len(), 2);
        assert_eq!(
            config.node_selection_strategy,
            NodeSelectionStrategy::PinUntilError
        );
        assert_eq!(config.max_queue_size, 100_000);
        assert_eq!(config.failure_half_life(), Duration::from_secs(30));
        assert_eq!(config.reshuffle_interval(), Duration::from_secs(600));
        assert_eq!(config.reshuffle_jitter(), Duration::from_secs(30));
        assert_eq!(config.limiter.kind, LimiterKind::Caid);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_full_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
            service_name = "search"
            uris = ["https://a", "https://b", "https://c"]
            node_selection_strategy = "ROUND_ROBIN"
            max_queue_size = 500

            [limiter]
            kind = "aimd"
            initial_limit = 10.0

            [logging]
            level = "debug"
            format = "json"
            directives = ["switchyard::queue=trace"]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.node_selection_strategy,
            NodeSelectionStrategy::RoundRobin
        );
        assert_eq!(config.max_queue_size, 500);
        assert_eq!(config.limiter.kind, LimiterKind::Aimd);
        assert_eq!(config.limiter.initial_limit, 10.0);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.directives, vec!["switchyard::queue=trace"]);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = ServiceConfig::new("svc", vec!["https://a".to_string()]);
        assert!(config.validate().is_ok());

        config.max_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::new("svc", vec!["https://a".into(), "https://a".into()]);
        assert!(config.validate().is_err());
        config.uris.pop();
        config.reshuffle_jitter_secs = config.reshuffle_interval_secs;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::new(" ", vec![]);
        assert!(config.validate().is_err());
        config.service_name = "svc".to_string();
        config.limiter.min_limit = 0.0;
        assert!(matches!(config.validate(), Err(RoutingError::Config(_))));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = ServiceConfig::from_toml_str(
            r#"
            service_name = "svc"
            node_selection_strategy = "RANDOM"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let config = ServiceConfig::new("svc", vec!["https://a".to_string()]);
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config.to_toml_string().unwrap()).unwrap();

        let loaded = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = ServiceConfig::from_file(Path::new("/nonexistent/switchyard.toml"));
        assert!(matches!(result, Err(RoutingError::Config(_))));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
