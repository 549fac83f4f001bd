// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tidepool-core.
//!
//! [`TaskHubRuntime`] wires the cache engine, the checkpoint worker, the task hub
//! and the work-item pipeline together inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidepool_core::config::Config;
//! use tidepool_core::orchestration::LocalInstanceConnection;
//! use tidepool_core::runtime::TaskHubRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = tidepool_core::store::connect(&config).await?;
//!     let connection = Arc::new(LocalInstanceConnection::new());
//!
//!     let runtime = TaskHubRuntime::builder()
//!         .store(store)
//!         .connection(connection.clone())
//!         .cache_config(config.cache_config())
//!         .worker_config(config.worker_config())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run execution workers against `connection` ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{
    CacheConfig, CacheEngine, CheckpointStats, CheckpointWorker, CheckpointWorkerConfig,
};
use crate::orchestration::{InstanceConnection, PipelineConfig, TaskHub, WorkItemPipeline};
use crate::store::CheckpointStore;

/// Builder for creating a [`TaskHubRuntime`].
#[derive(Default)]
pub struct TaskHubRuntimeBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    connection: Option<Arc<dyn InstanceConnection>>,
    cache: CacheConfig,
    worker: CheckpointWorkerConfig,
    pipeline: PipelineConfig,
}

impl std::fmt::Debug for TaskHubRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHubRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("connection", &self.connection.as_ref().map(|_| "..."))
            .field("cache", &self.cache)
            .field("worker", &self.worker)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl TaskHubRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint store (required).
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the instance connection work is dispatched to (required).
    pub fn connection(mut self, connection: Arc<dyn InstanceConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Set the cache engine settings.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Set the checkpoint worker settings.
    pub fn worker_config(mut self, config: CheckpointWorkerConfig) -> Self {
        self.worker = config;
        self
    }

    /// Set the work-item pipeline settings.
    pub fn pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TaskHubRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let connection = self
            .connection
            .ok_or_else(|| anyhow::anyhow!("connection is required"))?;

        Ok(TaskHubRuntimeConfig {
            store,
            connection,
            cache: self.cache,
            worker: self.worker,
            pipeline: self.pipeline,
        })
    }
}

/// Configuration for a [`TaskHubRuntime`].
pub struct TaskHubRuntimeConfig {
    store: Arc<dyn CheckpointStore>,
    connection: Arc<dyn InstanceConnection>,
    cache: CacheConfig,
    worker: CheckpointWorkerConfig,
    pipeline: PipelineConfig,
}

impl std::fmt::Debug for TaskHubRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHubRuntimeConfig")
            .field("store", &"...")
            .field("connection", &"...")
            .field("cache", &self.cache)
            .field("worker", &self.worker)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl TaskHubRuntimeConfig {
    /// Open the engine and task hub, then spawn the checkpoint worker and the pipeline.
    pub async fn start(self) -> Result<TaskHubRuntime> {
        let engine = CacheEngine::open(self.cache, self.store).await?;

        // The worker subscribes to partition commits; it must exist before the hub
        // starts committing.
        let worker = Arc::new(CheckpointWorker::new(engine.clone(), self.worker));
        let worker_shutdown = worker.shutdown_handle();
        let stats = worker.stats();

        let hub = TaskHub::open(engine.clone()).await?;
        let pipeline = WorkItemPipeline::new(hub.clone(), self.connection.clone(), self.pipeline);
        let pipeline_shutdown = pipeline.shutdown_handle();

        let worker_handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        let pipeline_handle = tokio::spawn(async move { pipeline.run().await });

        info!(
            partition_count = engine.partition_count(),
            last_checkpoint = ?engine.last_checkpoint(),
            "TaskHubRuntime started"
        );

        Ok(TaskHubRuntime {
            hub,
            worker,
            stats,
            connection: self.connection,
            worker_handle,
            worker_shutdown,
            pipeline_handle,
            pipeline_shutdown,
        })
    }
}

/// A running task hub embedded in an application.
///
/// The runtime manages:
/// - the checkpoint worker writing committed state to the store
/// - the work-item pipeline dispatching messages to the instance connection
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TaskHubRuntime {
    hub: TaskHub,
    worker: Arc<CheckpointWorker>,
    stats: Arc<CheckpointStats>,
    connection: Arc<dyn InstanceConnection>,
    worker_handle: JoinHandle<()>,
    worker_shutdown: CancellationToken,
    pipeline_handle: JoinHandle<()>,
    pipeline_shutdown: CancellationToken,
}

impl std::fmt::Debug for TaskHubRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHubRuntime")
            .field("hub", &self.hub)
            .field("connection", &"...")
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskHubRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TaskHubRuntimeBuilder {
        TaskHubRuntimeBuilder::new()
    }

    /// The task hub clients talk to.
    pub fn hub(&self) -> &TaskHub {
        &self.hub
    }

    /// Checkpoint worker counters.
    pub fn stats(&self) -> &Arc<CheckpointStats> {
        &self.stats
    }

    /// Ask the checkpoint worker for a cycle without waiting for a commit.
    pub fn request_checkpoint(&self) {
        self.worker.request_checkpoint();
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the pipeline, closes the connection so in-flight executions resolve,
    /// then stops the checkpoint worker after its final flush.
    pub async fn shutdown(self) -> Result<()> {
        info!("TaskHubRuntime shutting down...");

        self.pipeline_shutdown.cancel();
        self.connection.close("task hub shutting down").await;
        if let Err(e) = self.pipeline_handle.await {
            error!("Work-item pipeline task panicked: {}", e);
            return Err(anyhow::anyhow!("pipeline task panicked: {}", e));
        }

        self.worker_shutdown.cancel();
        if let Err(e) = self.worker_handle.await {
            error!("Checkpoint worker task panicked: {}", e);
            return Err(anyhow::anyhow!("checkpoint worker task panicked: {}", e));
        }

        info!(
            checkpoints = self.stats.checkpoints(),
            "TaskHubRuntime shutdown complete"
        );
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.pipeline_handle.is_finished() && !self.worker_handle.is_finished()
    }
}
