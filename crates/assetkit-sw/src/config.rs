//! Worker configuration.

use std::path::Path;
use std::time::Duration;

use assetkit_common::{AssetKitError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_ORIGIN: &str = "http://localhost:3000/";

/// Configuration for one worker version.
///
/// `cache_name` is the version. Bump it whenever `precache` changes, otherwise clients keep
/// the old assets forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the manifest paths are resolved against.
    pub origin: Url,
    /// Name of the current cache bucket.
    pub cache_name: String,
    /// Asset paths stored at install time.
    pub precache: Vec<String>,
    /// Requests under this path prefix are never cached.
    pub api_prefix: String,
    /// Upper bound for a background cache write.
    pub store_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            cache_name: "assetkit-v2".to_string(),
            precache: vec![
                "/".to_string(),
                "/static/js/bundle.js".to_string(),
                "/static/css/main.css".to_string(),
                "/manifest.json".to_string(),
                "/favicon.ico".to_string(),
            ],
            api_prefix: "/api/".to_string(),
            store_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AssetKitError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Set the cache name.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Set the precache manifest.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(AssetKitError::config("cache_name must not be empty"));
        }
        if !self.api_prefix.starts_with('/') || !self.api_prefix.ends_with('/') {
            return Err(AssetKitError::config(format!(
                "api_prefix must start and end with '/': {:?}",
                self.api_prefix
            )));
        }
        if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
            return Err(AssetKitError::config(format!(
                "precache path must be absolute: {path:?}"
            )));
        }
        if self.origin.cannot_be_a_base() {
            return Err(AssetKitError::config(format!(
                "origin cannot resolve paths: {}",
                self.origin
            )));
        }
        Ok(())
    }

    /// Resolve the manifest against the origin.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.precache
            .iter()
            .map(|path| {
                self.origin.join(path).map_err(|e| {
                    AssetKitError::config_with_source(format!("bad precache path {path:?}"), e)
                })
            })
            .collect()
    }
}
