//! The asset cache worker: install, activate and per-request routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use assetkit_common::with_timeout;
use assetkit_net::{Fetcher, NetError, Request, RequestMode, Response};
use futures::future::try_join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::route::{classify, RequestClass};
use crate::{WorkerError, WorkerState};

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Side effects published by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        worker_id: WorkerId,
        cache_name: String,
        new_state: WorkerState,
    },
    /// A stale bucket was deleted on activation.
    CachePruned { cache_name: String },
    /// A background store finished.
    EntryStored { cache_name: String, key: RequestKey },
    /// A background store failed. Never surfaced to the page.
    StoreFailed {
        cache_name: String,
        key: RequestKey,
        error: String,
    },
    /// A request was handled.
    FetchHandled {
        url: Url,
        class: RequestClass,
        outcome: &'static str,
    },
}

/// Result of intercepting one request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs its normal network fetch.
    Passthrough,
    /// Respond with this response (network or cache, see `Response::from_cache`).
    Respond(Response),
    /// Intercepted, but there is nothing to respond with.
    NoResponse,
    /// Intercepted network fetch failed.
    NetworkError(NetError),
}

impl FetchOutcome {
    /// Short label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Passthrough => "passthrough",
            FetchOutcome::Respond(r) if r.from_cache => "cache",
            FetchOutcome::Respond(_) => "network",
            FetchOutcome::NoResponse => "no-response",
            FetchOutcome::NetworkError(_) => "network-error",
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }

    /// The response, if any.
    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }
}

/// One version of the asset cache worker.
pub struct AssetCacheWorker {
    id: WorkerId,
    config: Arc<WorkerConfig>,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    state: watch::Sender<WorkerState>,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl AssetCacheWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(config: WorkerConfig, fetcher: Arc<dyn Fetcher>, caches: CacheStorage) -> Self {
        let (state, _) = watch::channel(WorkerState::Parsed);
        Self {
            id: WorkerId::new(),
            config: Arc::new(config),
            fetcher,
            caches,
            state,
            events: None,
        }
    }

    /// Publish side effects on this channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn set_state(&self, new_state: WorkerState) {
        self.state.send_replace(new_state);
        self.emit(WorkerEvent::StateChange {
            worker_id: self.id,
            cache_name: self.config.cache_name.clone(),
            new_state,
        });
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), WorkerError> {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(WorkerError::StateError(format!(
                "expected {from}, worker is {}",
                self.state()
            )));
        }
        self.emit(WorkerEvent::StateChange {
            worker_id: self.id,
            cache_name: self.config.cache_name.clone(),
            new_state: to,
        });
        Ok(())
    }

    pub(crate) fn make_redundant(&self) {
        if self.state() != WorkerState::Redundant {
            self.set_state(WorkerState::Redundant);
        }
    }

    // ==================== Install ====================

    /// Precache the manifest. Nothing is stored unless every asset is fetched.
    pub async fn install(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)?;
        info!(worker = self.id.raw(), cache = %self.config.cache_name, "Installing worker");

        match self.precache().await {
            Ok(count) => {
                self.transition(WorkerState::Installing, WorkerState::Installed)?;
                info!(cache = %self.config.cache_name, entries = count, "Worker installed");
                Ok(())
            }
            Err(e @ WorkerError::StateError(_)) => {
                debug!(worker = self.id.raw(), error = %e, "Install superseded");
                Err(e)
            }
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "Install failed");
                self.make_redundant();
                Err(match e {
                    WorkerError::InstallFailed(_) => e,
                    other => WorkerError::InstallFailed(other.to_string()),
                })
            }
        }
    }

    async fn precache(&self) -> Result<usize, WorkerError> {
        let urls = self.config.precache_urls()?;
        let fetches = urls.into_iter().map(|url| self.fetch_for_precache(url));
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        // A version replaced mid-install must not write its bucket.
        if self.state() != WorkerState::Installing {
            return Err(WorkerError::StateError(format!(
                "install superseded, worker is {}",
                self.state()
            )));
        }

        self.caches.open(&self.config.cache_name).await;
        self.caches.put_all(&self.config.cache_name, entries).await?;
        Ok(count)
    }

    async fn fetch_for_precache(&self, url: Url) -> Result<CacheEntry, WorkerError> {
        let request = Request::get(url).mode(RequestMode::SameOrigin);
        let key = RequestKey::from_request(&request);

        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| WorkerError::InstallFailed(format!("{key}: {e}")))?;
        if !response.ok() {
            return Err(WorkerError::InstallFailed(format!(
                "{key}: status {}",
                response.status
            )));
        }

        debug!(%key, "Precached");
        CacheEntry::from_response(&key, response)
    }

    /// Resume a version whose bucket is already in storage, without precaching again.
    ///
    /// Used when a host restarts with the current bucket intact. Goes straight from
    /// `Parsed` to `Activated`.
    pub async fn resume(&self) -> Result<(), WorkerError> {
        if !self.caches.has(&self.config.cache_name).await {
            return Err(WorkerError::StateError(format!(
                "no stored cache named {}",
                self.config.cache_name
            )));
        }
        self.transition(WorkerState::Parsed, WorkerState::Activated)?;
        info!(worker = self.id.raw(), cache = %self.config.cache_name, "Worker resumed");
        Ok(())
    }

    // ==================== Activate ====================

    /// Delete stale buckets and start intercepting. Returns the deleted bucket names.
    pub async fn activate(&self) -> Result<Vec<String>, WorkerError> {
        self.transition(WorkerState::Installed, WorkerState::Activating)?;
        let deleted = self.prune_stale_caches().await;
        self.set_state(WorkerState::Activated);
        info!(
            cache = %self.config.cache_name,
            pruned = deleted.len(),
            "Worker activated"
        );
        Ok(deleted)
    }

    /// Delete every bucket whose name is not the current cache name.
    pub async fn prune_stale_caches(&self) -> Vec<String> {
        let mut deleted = Vec::new();
        for name in self.caches.keys().await {
            if name == self.config.cache_name {
                continue;
            }
            if self.caches.delete(&name).await {
                debug!(cache = %name, "Deleted stale cache");
                self.emit(WorkerEvent::CachePruned {
                    cache_name: name.clone(),
                });
                deleted.push(name);
            }
        }
        deleted
    }

    // ==================== Fetch ====================

    /// Handle an intercepted request.
    ///
    /// Unexpected errors degrade to `Passthrough`. So does every request while the worker
    /// is not active.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let url = request.url.clone();

        if self.state() != WorkerState::Activated {
            debug!(%url, state = %self.state(), "Worker not active, passing through");
            return FetchOutcome::Passthrough;
        }

        let class = classify(&request, &self.config.api_prefix);
        let outcome = match self.route(class, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%url, error = %e, "Fetch handling failed, passing through");
                FetchOutcome::Passthrough
            }
        };

        debug!(%url, ?class, outcome = outcome.kind(), "Fetch handled");
        self.emit(WorkerEvent::FetchHandled {
            url,
            class,
            outcome: outcome.kind(),
        });
        outcome
    }

    async fn route(&self, class: RequestClass, request: Request) -> Result<FetchOutcome, WorkerError> {
        match class {
            RequestClass::Passthrough(_) => Ok(FetchOutcome::Passthrough),
            RequestClass::Navigation => self.network_first(request).await,
            RequestClass::StaticAsset => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: Request) -> Result<FetchOutcome, WorkerError> {
        let key = RequestKey::from_request(&request);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                let copy = response.try_clone()?;
                self.store_detached(key, copy);
                Ok(FetchOutcome::Respond(response))
            }
            Err(e) => {
                debug!(%key, error = %e, "Navigation fetch failed, trying cache");
                match self.caches.match_in(&self.config.cache_name, &key).await {
                    Some(entry) => Ok(FetchOutcome::Respond(entry.to_response()?)),
                    None => Ok(FetchOutcome::NoResponse),
                }
            }
        }
    }

    async fn cache_first(&self, request: Request) -> Result<FetchOutcome, WorkerError> {
        let key = RequestKey::from_request(&request);

        if let Some(entry) = self.caches.match_in(&self.config.cache_name, &key).await {
            return Ok(FetchOutcome::Respond(entry.to_response()?));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(FetchOutcome::Respond(response)),
            Err(e) => Ok(FetchOutcome::NetworkError(e)),
        }
    }

    /// Store a response in the background. The caller never waits for it.
    fn store_detached(&self, key: RequestKey, response: Response) {
        let caches = self.caches.clone();
        let cache_name = self.config.cache_name.clone();
        let timeout = self.config.store_timeout();
        let events = self.events.clone();

        tokio::spawn(async move {
            let stored = match CacheEntry::from_response(&key, response) {
                Ok(entry) => match with_timeout(timeout, caches.put(&cache_name, entry)).await {
                    Ok(result) => result,
                    Err(e) => Err(WorkerError::CacheError(e.to_string())),
                },
                Err(e) => Err(e),
            };

            let event = match stored {
                Ok(()) => {
                    debug!(cache = %cache_name, %key, "Stored navigation response");
                    WorkerEvent::EntryStored { cache_name, key }
                }
                Err(e) => {
                    warn!(cache = %cache_name, %key, error = %e, "Cache store failed");
                    WorkerEvent::StoreFailed {
                        cache_name,
                        key,
                        error: e.to_string(),
                    }
                }
            };
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        });
    }
}

impl std::fmt::Debug for AssetCacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCacheWorker")
            .field("id", &self.id)
            .field("cache_name", &self.config.cache_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use http::StatusCode;

    /// Serves a body for every URL, or fails everything.
    struct EchoFetcher {
        online: bool,
    }

    impl Fetcher for EchoFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            let online = self.online;
            Box::pin(async move {
                if online {
                    let body = format!("body of {}", request.url.path());
                    Ok(Response::new(request.url, StatusCode::OK, body))
                } else {
                    Err(NetError::RequestFailed("offline".to_string()))
                }
            })
        }
    }

    /// Answers every request after a delay.
    struct SlowFetcher;

    impl Fetcher for SlowFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(Response::new(request.url, StatusCode::OK, "slow"))
            })
        }
    }

    fn worker(online: bool) -> AssetCacheWorker {
        let config = WorkerConfig::default()
            .with_origin(Url::parse("https://example.com/").unwrap())
            .with_precache(["/", "/app.js"]);
        AssetCacheWorker::new(config, Arc::new(EchoFetcher { online }), CacheStorage::new())
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let worker = worker(true);
        assert_eq!(worker.state(), WorkerState::Parsed);

        worker.install().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Installed);

        worker.activate().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_install_twice_is_state_error() {
        let worker = worker(true);
        worker.install().await.unwrap();
        assert!(matches!(
            worker.install().await,
            Err(WorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_before_install_is_state_error() {
        let worker = worker(true);
        assert!(matches!(
            worker.activate().await,
            Err(WorkerError::StateError(_))
        ));
        assert_eq!(worker.state(), WorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_failed_install_is_redundant() {
        let worker = worker(false);
        let mut state = worker.subscribe_state();

        assert!(matches!(
            worker.install().await,
            Err(WorkerError::InstallFailed(_))
        ));
        assert_eq!(*state.borrow_and_update(), WorkerState::Redundant);
        assert!(!worker.caches().has(worker.cache_name()).await);
    }

    #[tokio::test]
    async fn test_redundant_during_install_stays_redundant() {
        let config = WorkerConfig::default()
            .with_origin(Url::parse("https://example.com/").unwrap())
            .with_precache(["/"]);
        let worker = Arc::new(AssetCacheWorker::new(
            config,
            Arc::new(SlowFetcher),
            CacheStorage::new(),
        ));
        let mut state = worker.subscribe_state();

        let installing = worker.clone();
        let task = tokio::spawn(async move { installing.install().await });
        state
            .wait_for(|s| *s == WorkerState::Installing)
            .await
            .unwrap();
        worker.make_redundant();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(WorkerError::StateError(_))));
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert!(!worker.caches().has(worker.cache_name()).await);
    }

    #[tokio::test]
    async fn test_resume_requires_stored_bucket() {
        let worker = worker(false);
        assert!(matches!(
            worker.resume().await,
            Err(WorkerError::StateError(_))
        ));
        assert_eq!(worker.state(), WorkerState::Parsed);

        worker.caches().open(worker.cache_name()).await;
        worker.resume().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_not_active_passes_through() {
        let worker = worker(true);
        worker.install().await.unwrap();

        let request = Request::get(Url::parse("https://example.com/app.js").unwrap());
        assert!(worker.handle_fetch(request).await.is_passthrough());
    }

    #[tokio::test]
    async fn test_outcome_kinds() {
        let url = Url::parse("https://example.com/").unwrap();
        let mut cached = Response::new(url.clone(), StatusCode::OK, "");
        cached.from_cache = true;

        assert_eq!(FetchOutcome::Passthrough.kind(), "passthrough");
        assert_eq!(FetchOutcome::Respond(cached).kind(), "cache");
        assert_eq!(
            FetchOutcome::Respond(Response::new(url, StatusCode::OK, "")).kind(),
            "network"
        );
        assert_eq!(FetchOutcome::NoResponse.kind(), "no-response");
        assert!(FetchOutcome::NoResponse.into_response().is_none());
    }
}
