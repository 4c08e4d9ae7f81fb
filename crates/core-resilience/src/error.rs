//! Error types for the core resilience primitives

use thiserror::Error;

/// Errors raised while configuring resilience primitives
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// A configuration value is outside its allowed range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ResilienceError::InvalidConfig("min_limit must be >= 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: min_limit must be >= 1"
        );
    }
}
