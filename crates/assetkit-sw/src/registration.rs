//! Worker registration: installing, waiting and active versions.

use std::sync::Arc;

use assetkit_net::Request;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::worker::{AssetCacheWorker, FetchOutcome, WorkerEvent};
use crate::WorkerError;

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<AssetCacheWorker>>,
    waiting: Option<Arc<AssetCacheWorker>>,
    active: Option<Arc<AssetCacheWorker>>,
}

/// Holds the worker versions for one scope.
///
/// A version that fails to install never displaces the active one.
#[derive(Debug)]
pub struct Registration {
    slots: RwLock<Slots>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Registration {
    /// Create an empty registration and the receiver for its workers' events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                slots: RwLock::new(Slots::default()),
                events,
            },
            event_rx,
        )
    }

    /// Install a new worker version. On success it becomes the waiting version.
    pub async fn update(
        &self,
        worker: AssetCacheWorker,
    ) -> Result<Arc<AssetCacheWorker>, WorkerError> {
        let worker = Arc::new(worker.with_events(self.events.clone()));

        if let Some(previous) = self.slots.write().await.installing.replace(worker.clone()) {
            previous.make_redundant();
        }

        let result = worker.install().await;

        let mut slots = self.slots.write().await;
        let current = slots
            .installing
            .as_ref()
            .is_some_and(|w| Arc::ptr_eq(w, &worker));
        if current {
            slots.installing = None;
        }
        result?;

        if !current {
            worker.make_redundant();
            return Err(WorkerError::StateError(
                "install superseded by a newer version".to_string(),
            ));
        }

        if let Some(previous) = slots.waiting.replace(worker.clone()) {
            previous.make_redundant();
        }
        info!(worker = worker.id().raw(), cache = %worker.cache_name(), "Worker waiting");
        Ok(worker)
    }

    /// Activate the waiting version, replacing the active one.
    pub async fn activate(&self) -> Result<Vec<String>, WorkerError> {
        let waiting = self
            .slots
            .write()
            .await
            .waiting
            .take()
            .ok_or_else(|| WorkerError::StateError("no waiting worker".to_string()))?;

        let pruned = match waiting.activate().await {
            Ok(pruned) => pruned,
            Err(e) => {
                waiting.make_redundant();
                return Err(e);
            }
        };

        if let Some(previous) = self.slots.write().await.active.replace(waiting) {
            previous.make_redundant();
        }
        Ok(pruned)
    }

    /// Make a version whose bucket is already stored the active one, skipping install.
    pub async fn resume(
        &self,
        worker: AssetCacheWorker,
    ) -> Result<Arc<AssetCacheWorker>, WorkerError> {
        let worker = Arc::new(worker.with_events(self.events.clone()));
        worker.resume().await?;

        if let Some(previous) = self.slots.write().await.active.replace(worker.clone()) {
            previous.make_redundant();
        }
        Ok(worker)
    }

    pub async fn installing(&self) -> Option<Arc<AssetCacheWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<AssetCacheWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<AssetCacheWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Route a request to the active version, or pass it through.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        match self.active().await {
            Some(worker) => worker.handle_fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Drop every version.
    pub async fn unregister(&self) {
        let mut slots = self.slots.write().await;
        for worker in [
            slots.installing.take(),
            slots.waiting.take(),
            slots.active.take(),
        ]
        .into_iter()
        .flatten()
        {
            worker.make_redundant();
        }
    }
}
