//! # AssetKit Service Worker
//!
//! A cache worker for a web application's static assets, driven without a browser.
//!
//! ## Features
//!
//! - **Precache**: fetch and store a manifest of assets at install time (all or nothing)
//! - **Versioned buckets**: activation deletes every bucket but the current one
//! - **Routing**: API and non-GET requests pass through, navigations go network-first,
//!   static assets go cache-first
//! - **Host model**: lifecycle events arrive on a channel, side effects leave on another
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (inbound HostMessage channel)
//!     │
//!     └── Registration
//!             ├── installing (AssetCacheWorker)
//!             ├── waiting    (AssetCacheWorker)
//!             └── active     (AssetCacheWorker) ── Fetcher (network)
//!
//! CacheStorage
//!     └── Cache (bucket, named by version)
//!             └── RequestKey → CacheEntry
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use assetkit_common::AssetKitError;
use assetkit_net::NetError;

pub mod cache;
pub mod config;
pub mod host;
pub mod registration;
pub mod route;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey, StorageSnapshot};
pub use config::WorkerConfig;
pub use host::{HostHandle, HostMessage, WorkerHost};
pub use registration::Registration;
pub use route::{classify, PassthroughReason, RequestClass};
pub use worker::{AssetCacheWorker, FetchOutcome, WorkerEvent, WorkerId};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded for cache {cache}: limit {limit} entries")]
    QuotaExceeded { cache: String, limit: usize },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Config error: {0}")]
    Config(#[from] AssetKitError),

    #[error("Worker host has stopped")]
    HostClosed,
}

// ==================== State ====================

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, not yet installed.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Pruning stale buckets.
    Activating,
    /// Active and intercepting requests.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::default(), WorkerState::Parsed);
        assert_eq!(WorkerState::Activated.to_string(), "activated");
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&WorkerState::Redundant).unwrap();
        assert_eq!(json, "\"redundant\"");
    }

    #[test]
    fn test_error_from_net() {
        let err: WorkerError = NetError::BodyUsed.into();
        assert!(err.to_string().contains("body already used"));
    }
}
