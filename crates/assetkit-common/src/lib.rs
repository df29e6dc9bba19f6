//! # AssetKit Common
//!
//! Shared error type, logging setup and retry helpers for the AssetKit crates.
//!
//! ## Features
//!
//! - Error type for configuration and timeout failures
//! - Logging configuration built on `tracing-subscriber`
//! - Retry with exponential backoff, and timeouts

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for AssetKit.
#[derive(Error, Debug)]
pub enum AssetKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl AssetKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for AssetKit operations.
pub type Result<T> = std::result::Result<T, AssetKitError>;
