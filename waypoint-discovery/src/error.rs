//! Error types for the discovery module

use thiserror::Error;

/// Discovery error types
///
/// `Clone` so that a cached unresolved outcome can be returned to every caller
/// until the next re-evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Service '{service}' is not deployed in environment(s): {environments}")]
    EnvironmentNotFound {
        service: String,
        environments: String,
    },

    #[error("No endpoints available for service '{0}'")]
    NoEndpointsAvailable(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery for '{0}' has been shut down")]
    Disposed(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Registry(format!("Failed to decode registry response: {err}"))
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;
