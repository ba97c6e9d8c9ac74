//! Runner builder: assembles the controller and its collaborators
//!
//! The socket binary and the tests go through the same builder, so both
//! wire up storage, the peer cache, streaming and the broker the same way.

use std::sync::Arc;

use super::controller::{ControllerParts, ControllerTimings, TaskController};
use super::error::RunnerError;
use super::shutdown::ShutdownManager;
use crate::algorithm::{Algorithm, AlgorithmCallbacks, LoadError};
use crate::broker::RemoteExecutionBroker;
use crate::cache::{PeerClient, PeerDataCache};
use crate::config::RunnerConfig;
use crate::storage::{DataAdapter, FsStore, MemoryStore, ObjectStore};
use crate::streaming::{FlowRouter, StreamingManager, WorkerRelayRouter};
use crate::transport::WorkerChannel;

pub struct RunnerBuilder {
    config: RunnerConfig,
    channel: Arc<dyn WorkerChannel>,
    algorithm: Result<Algorithm, LoadError>,
    store: Option<Arc<dyn ObjectStore>>,
    router: Option<Arc<dyn FlowRouter>>,
    shutdown: Option<Arc<ShutdownManager>>,
}

impl RunnerBuilder {
    pub fn new(config: RunnerConfig, channel: Arc<dyn WorkerChannel>) -> Self {
        Self {
            config,
            channel,
            algorithm: Err(LoadError::MissingMethod("start")),
            store: None,
            router: None,
            shutdown: None,
        }
    }

    /// Use an already bound algorithm, or the error that prevented binding
    pub fn with_algorithm(mut self, algorithm: Result<Algorithm, LoadError>) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_callbacks(self, callbacks: AlgorithmCallbacks) -> Self {
        self.with_algorithm(callbacks.bind())
    }

    /// Replace the filesystem store
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_memory_store(self) -> Self {
        self.with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_flow_router(mut self, router: Arc<dyn FlowRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub async fn build(self) -> Result<Arc<TaskController>, RunnerError> {
        let mode = self.config.effective_storage_mode();
        tracing::info!(storage = mode.as_str(), "building task controller");

        let data = if mode.is_indirect() {
            let store = self.store.unwrap_or_else(|| {
                Arc::new(FsStore::new(&self.config.storage.base_directory)) as Arc<dyn ObjectStore>
            });
            let peers = PeerClient::new(self.config.discovery.timeout());
            Some(Arc::new(DataAdapter::new(store, peers, self.config.storage.enable_cache)))
        } else {
            None
        };

        let cache = if mode.is_indirect() && self.config.discovery.enable {
            let cache = PeerDataCache::bind(&self.config.discovery.host, self.config.discovery.port).await?;
            tracing::info!(discovery = %cache.discovery(), "peer cache listening");
            Some(cache)
        } else {
            None
        };

        let router = self.router.unwrap_or_else(|| {
            Arc::new(WorkerRelayRouter::new(Arc::clone(&self.channel))) as Arc<dyn FlowRouter>
        });
        let streaming = Arc::new(StreamingManager::new(router));
        let broker = Arc::new(RemoteExecutionBroker::new(
            Arc::clone(&self.channel),
            data.clone(),
            Arc::clone(&streaming),
        ));

        Ok(TaskController::new(ControllerParts {
            channel: self.channel,
            algorithm: self.algorithm,
            broker,
            streaming,
            data,
            cache,
            shutdown: self.shutdown.unwrap_or_default(),
            timings: ControllerTimings {
                stopping_heartbeat: self.config.stop.heartbeat_interval(),
                serving_report: self.config.discovery.serving_report_interval(),
            },
        }))
    }
}
