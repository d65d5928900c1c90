//! # Configuration Modules
//!
//! This module holds the serde configuration tree for the transport layer and
//! the error type used when loading it.

/// Transport configuration: endpoints, timings and media settings.
pub mod transport_config;

use thiserror::Error;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid JSON for [`TransportConfig`].
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    /// A value is present but unusable.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Offending field (camelCase path).
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

// --- Public API Re-exports ---
pub use transport_config::{
    ChannelConfig, MediaConfig, PollingConfig, RestConfig, SamplerConfig, TransportConfig,
};
