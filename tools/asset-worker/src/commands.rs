//! Command implementations, kept apart from argument parsing so they can be tested.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use assetkit_common::{retry_with_backoff, RetryConfig};
use assetkit_net::{Fetcher, Request, RequestMode};
use assetkit_sw::{
    classify, AssetCacheWorker, CacheStorage, FetchOutcome, HostHandle, Registration,
    RequestClass, StorageSnapshot, WorkerConfig, WorkerEvent, WorkerHost,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct PrecacheReport {
    pub cache_name: String,
    pub entries: Vec<String>,
    pub pruned: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub outcome: &'static str,
    pub status: Option<u16>,
    pub body_len: Option<usize>,
    pub error: Option<String>,
    /// Whether the background store succeeded, for navigations served from the network.
    pub stored: Option<bool>,
}

/// A running host with an active worker.
pub struct Session {
    pub handle: HostHandle,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub config: WorkerConfig,
    pub report: PrecacheReport,
}

pub async fn load_storage(path: Option<&Path>) -> anyhow::Result<CacheStorage> {
    let caches = CacheStorage::new();
    if let Some(path) = path.filter(|p| p.exists()) {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: StorageSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        caches.restore(snapshot).await?;
        debug!(path = %path.display(), "Cache storage loaded");
    }
    Ok(caches)
}

pub async fn save_storage(caches: &CacheStorage, path: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(&caches.snapshot().await)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "Cache storage saved");
    }
    Ok(())
}

/// Install and activate a worker, retrying the install with a fresh worker each time.
pub async fn precache(
    config: WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
    retry: &RetryConfig,
) -> anyhow::Result<Session> {
    let (registration, events) = Registration::new();
    let (handle, _task) = WorkerHost::spawn(Arc::new(registration), 32);

    retry_with_backoff(retry, || {
        let worker = AssetCacheWorker::new(config.clone(), fetcher.clone(), caches.clone());
        let handle = handle.clone();
        async move { handle.install(worker).await }
    })
    .await?;
    let pruned = handle.activate().await?;

    let entries = caches
        .keys_in(&config.cache_name)
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    info!(cache = %config.cache_name, "Worker active");

    Ok(Session {
        handle,
        events,
        report: PrecacheReport {
            cache_name: config.cache_name.clone(),
            entries,
            pruned,
        },
        config,
    })
}

/// Start a session for routing requests.
///
/// If storage already holds the current bucket, the worker is resumed from it and the
/// origin is not contacted. Otherwise the worker is installed and activated.
pub async fn open_session(
    config: WorkerConfig,
    fetcher: Arc<dyn Fetcher>,
    caches: CacheStorage,
) -> anyhow::Result<Session> {
    if !caches.has(&config.cache_name).await {
        return precache(config, fetcher, caches, &RetryConfig::none()).await;
    }

    let (registration, events) = Registration::new();
    let (handle, _task) = WorkerHost::spawn(Arc::new(registration), 32);
    let worker = AssetCacheWorker::new(config.clone(), fetcher, caches.clone());
    handle.registration().resume(worker).await?;

    let entries = caches
        .keys_in(&config.cache_name)
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    info!(cache = %config.cache_name, "Worker resumed from storage");

    Ok(Session {
        handle,
        events,
        report: PrecacheReport {
            cache_name: config.cache_name.clone(),
            entries,
            pruned: Vec::new(),
        },
        config,
    })
}

pub fn build_request(method: &str, url: &str, navigate: bool) -> anyhow::Result<Request> {
    let request = Request::parse(method, url)?;
    Ok(if navigate {
        request.mode(RequestMode::Navigate)
    } else {
        request
    })
}

pub fn classify_request(
    config: &WorkerConfig,
    method: &str,
    url: &str,
    navigate: bool,
) -> anyhow::Result<RequestClass> {
    let request = build_request(method, url, navigate)?;
    Ok(classify(&request, &config.api_prefix))
}

/// Route one request and wait for any background store it started.
pub async fn fetch(session: &mut Session, request: Request) -> anyhow::Result<FetchReport> {
    let class = classify(&request, &session.config.api_prefix);
    let outcome = session.handle.fetch(request).await?;
    let kind = outcome.kind();

    let mut report = FetchReport {
        outcome: kind,
        status: None,
        body_len: None,
        error: None,
        stored: None,
    };

    match outcome {
        FetchOutcome::Respond(response) => {
            report.status = Some(response.status.as_u16());
            report.body_len = Some(response.bytes().await?.len());
        }
        FetchOutcome::NetworkError(e) => report.error = Some(e.to_string()),
        FetchOutcome::Passthrough | FetchOutcome::NoResponse => {}
    }

    if class == RequestClass::Navigation && kind == "network" {
        let wait = session.config.store_timeout() + Duration::from_millis(100);
        report.stored = wait_for_store(&mut session.events, wait).await;
    }

    Ok(report)
}

async fn wait_for_store(
    events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
    wait: Duration,
) -> Option<bool> {
    let result = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::EntryStored { .. } => return Some(true),
                WorkerEvent::StoreFailed { .. } => return Some(false),
                _ => continue,
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}
