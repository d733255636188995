//! Daemon wiring and main loop
//!
//! Builds the store, catalog, encoder and scheduler from configuration and
//! runs periodic scheduler passes alongside the status server.

use crate::catalog::{CatalogError, MemoryCatalog};
use crate::concurrency::EncoderThreads;
use crate::encode::{Encoder, FfmpegEncoder};
use crate::overlay::{ImageMagickRenderer, OverlayRenderer};
use crate::pipeline::{PipelineEnv, PipelineExecutor};
use crate::progress::ProgressMonitor;
use crate::reconciler::StuckJobReconciler;
use crate::scheduler::{Dispatch, Scheduler, SchedulerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::{run_status_server, ServerError, StatusState};
use crate::store::{FileJobStore, JobStore, StoreError};
use encode_queue_config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

pub struct Daemon {
    pub config: Config,
    pub threads: EncoderThreads,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<ProgressMonitor>,
    executor: Arc<PipelineExecutor>,
    catalog: Arc<MemoryCatalog>,
    catalog_path: Option<PathBuf>,
}

impl Daemon {
    /// Run the startup checks, then wire up every component.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config.encoder)?;
        Self::new_without_checks(config)
    }

    /// Wire up every component without probing the external tools.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let threads = EncoderThreads::derive(&config);
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.paths.state_dir)?);
        let catalog = match &config.paths.catalog {
            Some(path) if path.exists() => Arc::new(MemoryCatalog::from_json_file(path)?),
            Some(path) => {
                warn!(path = %path.display(), "Catalog file not found, starting empty");
                Arc::new(MemoryCatalog::default())
            }
            None => Arc::new(MemoryCatalog::default()),
        };
        let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::new(&config, &threads));
        let renderer: Arc<dyn OverlayRenderer> = Arc::new(ImageMagickRenderer::new(&config));
        info!(
            cores = threads.total_cores,
            threads = threads.threads,
            state_dir = %config.paths.state_dir.display(),
            "Daemon initialized"
        );
        Ok(Self::with_components(config, threads, store, catalog, encoder, renderer))
    }

    pub fn with_components(
        config: Config,
        threads: EncoderThreads,
        store: Arc<dyn JobStore>,
        catalog: Arc<MemoryCatalog>,
        encoder: Arc<dyn Encoder>,
        renderer: Arc<dyn OverlayRenderer>,
    ) -> Self {
        let catalog_path = config.paths.catalog.clone();
        let monitor = Arc::new(ProgressMonitor::new(&config.paths.log_dir));
        let env = Arc::new(PipelineEnv::new(
            config.clone(),
            catalog.clone(),
            encoder,
            renderer,
        ));
        let executor = Arc::new(PipelineExecutor::new(env, store.clone()));
        let reconciler = StuckJobReconciler::new(
            store.clone(),
            executor.clone(),
            ProgressMonitor::new(&config.paths.log_dir),
        );
        let scheduler = Arc::new(Scheduler::new(store, executor.clone(), reconciler));

        Self {
            config,
            threads,
            scheduler,
            monitor,
            executor,
            catalog,
            catalog_path,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.scheduler.store()
    }

    pub fn status_state(&self) -> StatusState {
        StatusState {
            store: self.store().clone(),
            monitor: self.monitor.clone(),
        }
    }

    /// Write catalog changes back to the configured catalog file.
    pub fn persist_catalog(&self) -> Result<(), DaemonError> {
        if let Some(path) = &self.catalog_path {
            self.catalog.save_json_file(path)?;
        }
        Ok(())
    }

    /// One concurrent scheduler pass over every project, then persist the catalog.
    pub async fn pass(&self) -> Result<Vec<(crate::jobs::Project, Dispatch)>, DaemonError> {
        let results = self.scheduler.run_concurrently().await?;
        self.persist_catalog()?;
        Ok(results)
    }

    /// Run scheduler passes every `poll_interval_secs` until `shutdown`.
    ///
    /// Cancelling `shutdown` also cancels running encoder processes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let interval = Duration::from_secs(self.config.scheduler.poll_interval_secs.max(1));
        let cancel_jobs = self.executor.cancel_token();
        loop {
            tokio::select! {
                result = self.pass() => {
                    if let Err(e) = result {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    cancel_jobs.cancel();
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Daemon stopped");
        Ok(())
    }

    /// Start the status server as a background task.
    pub fn start_status_server(
        &self,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), ServerError>> {
        let state = self.status_state();
        let bind = self.config.status.bind.clone();
        tokio::spawn(async move { run_status_server(&bind, state, shutdown).await })
    }

    /// Status server plus the scheduler loop.
    pub async fn run_with_server(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let server = self.start_status_server(shutdown.clone());
        self.run(shutdown.clone()).await?;
        shutdown.cancel();
        match server.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Status server task did not finish cleanly"),
        }
        Ok(())
    }
}
