//! Event-driven host: lifecycle events in on one channel, replies out on one-shots.

use std::sync::Arc;

use assetkit_net::Request;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registration::Registration;
use crate::worker::{AssetCacheWorker, FetchOutcome};
use crate::WorkerError;

/// Inbound lifecycle events.
#[derive(Debug)]
pub enum HostMessage {
    /// Install a new worker version.
    Install {
        worker: Box<AssetCacheWorker>,
        reply: oneshot::Sender<Result<(), WorkerError>>,
    },
    /// Activate the waiting version.
    Activate {
        reply: oneshot::Sender<Result<Vec<String>, WorkerError>>,
    },
    /// Intercept a page request.
    Fetch {
        request: Request,
        reply: oneshot::Sender<FetchOutcome>,
    },
}

/// Dispatcher for [`HostMessage`]s.
///
/// Install and activate run one at a time, in arrival order. Each fetch runs in its own
/// task, so slow requests never hold up the others.
pub struct WorkerHost {
    registration: Arc<Registration>,
    rx: mpsc::Receiver<HostMessage>,
}

impl WorkerHost {
    /// Start the dispatcher on the current runtime.
    pub fn spawn(registration: Arc<Registration>, capacity: usize) -> (HostHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let host = Self {
            registration: registration.clone(),
            rx,
        };
        let task = tokio::spawn(host.run());
        (HostHandle { tx, registration }, task)
    }

    async fn run(mut self) {
        info!("Worker host started");
        while let Some(message) = self.rx.recv().await {
            match message {
                HostMessage::Install { worker, reply } => {
                    let result = self.registration.update(*worker).await.map(|_| ());
                    let _ = reply.send(result);
                }
                HostMessage::Activate { reply } => {
                    let result = self.registration.activate().await;
                    let _ = reply.send(result);
                }
                HostMessage::Fetch { request, reply } => {
                    let registration = self.registration.clone();
                    tokio::spawn(async move {
                        let outcome = registration.handle_fetch(request).await;
                        if reply.send(outcome).is_err() {
                            debug!("Fetch requester went away");
                        }
                    });
                }
            }
        }
        info!("Worker host stopped");
    }
}

/// Sending side of a running [`WorkerHost`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostMessage>,
    registration: Arc<Registration>,
}

impl HostHandle {
    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    /// Send a message without waiting for its reply.
    pub async fn send(&self, message: HostMessage) -> Result<(), WorkerError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| WorkerError::HostClosed)
    }

    pub async fn install(&self, worker: AssetCacheWorker) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Install {
            worker: Box::new(worker),
            reply,
        })
        .await?;
        rx.await.map_err(|_| WorkerError::HostClosed)?
    }

    pub async fn activate(&self) -> Result<Vec<String>, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Activate { reply }).await?;
        rx.await.map_err(|_| WorkerError::HostClosed)?
    }

    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Fetch { request, reply }).await?;
        rx.await.map_err(|_| WorkerError::HostClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheStorage, WorkerConfig, WorkerState};
    use assetkit_net::{Fetcher, NetError, Response};
    use futures::future::BoxFuture;
    use http::StatusCode;
    use url::Url;

    struct OkFetcher;

    impl Fetcher for OkFetcher {
        fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
            Box::pin(async move { Ok(Response::new(request.url, StatusCode::OK, "ok")) })
        }
    }

    fn worker(caches: &CacheStorage) -> AssetCacheWorker {
        let config = WorkerConfig::default()
            .with_origin(Url::parse("https://example.com/").unwrap())
            .with_precache(["/"]);
        AssetCacheWorker::new(config, Arc::new(OkFetcher), caches.clone())
    }

    #[tokio::test]
    async fn test_host_lifecycle() {
        let caches = CacheStorage::new();
        let (registration, _events) = Registration::new();
        let (handle, _task) = WorkerHost::spawn(Arc::new(registration), 16);

        handle.install(worker(&caches)).await.unwrap();
        assert!(handle.registration().waiting().await.is_some());

        handle.activate().await.unwrap();
        let active = handle.registration().active().await.unwrap();
        assert_eq!(active.state(), WorkerState::Activated);

        let request = Request::get(Url::parse("https://example.com/api/me").unwrap());
        let outcome = handle.fetch(request).await.unwrap();
        assert!(outcome.is_passthrough());
    }

    #[tokio::test]
    async fn test_host_closed() {
        let (registration, _events) = Registration::new();
        let (handle, task) = WorkerHost::spawn(Arc::new(registration), 1);
        task.abort();
        let _ = task.await;

        let request = Request::get(Url::parse("https://example.com/").unwrap());
        assert!(matches!(
            handle.fetch(request).await,
            Err(WorkerError::HostClosed)
        ));
    }
}
