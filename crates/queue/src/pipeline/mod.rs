//! Pipeline executor
//!
//! Every project type is a [`Pipeline`]: an ordered list of named stages run
//! against a typed request. [`PipelineRegistry`] maps projects to pipelines
//! and [`PipelineExecutor`] runs one job through its pipeline, recording task
//! progress and the terminal job status.

pub mod clip_set;
pub mod clip_set_finalize;
pub mod scene;
pub mod trailer;
pub mod trailer_cut;
pub mod tube_clip;

use crate::assets::{AssetError, DerivedAssetCache};
use crate::catalog::{Catalog, CatalogError, Dvd, Scene};
use crate::clips::ClipPlanError;
use crate::encode::{EncodeError, Encoder, VideoDetails};
use crate::jobs::{Job, JobRequest, Project, RequestError, TaskUpdate};
use crate::overlay::OverlayRenderer;
use crate::placement::PlacementError;
use crate::store::{JobStore, StoreError};
use async_trait::async_trait;
use encode_queue_config::Config;
use futures::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use clip_set::ClipSetPipeline;
pub use clip_set_finalize::ClipSetFinalizePipeline;
pub use scene::ScenePipeline;
pub use trailer::TrailerPipeline;
pub use trailer_cut::TrailerCutPipeline;
pub use tube_clip::TubeClipPipeline;

/// Error type for pipeline runs
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or inconsistent input, detected before any side effect
    #[error("{0}")]
    Validation(String),

    /// A required directory or file could not be prepared
    #[error("Unable to prepare {path}: {source}")]
    Environment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The encoder failed or did not produce its outputs
    #[error(transparent)]
    Tool(#[from] EncodeError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    /// A referenced catalog entity does not exist
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The job is already being run by this process; nothing was recorded
    #[error("Job {0} is already running in this process")]
    AlreadyRunning(String),
}

impl PipelineError {
    /// Legacy numeric result code: the encoder exit code when there is one.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::Tool(e) | PipelineError::Asset(AssetError::Encode(e)) => {
                e.exit_code().unwrap_or(1)
            }
            _ => 1,
        }
    }

    pub fn environment(path: &Path, source: io::Error) -> Self {
        PipelineError::Environment {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<PlacementError> for PipelineError {
    fn from(err: PlacementError) -> Self {
        let path = err.path().to_path_buf();
        match err {
            PlacementError::CreateDir { source, .. } | PlacementError::Transfer { source, .. } => {
                PipelineError::Environment { path, source }
            }
        }
    }
}

impl From<RequestError> for PipelineError {
    fn from(err: RequestError) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

impl From<ClipPlanError> for PipelineError {
    fn from(err: ClipPlanError) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

/// Collaborators shared by every pipeline run.
pub struct PipelineEnv {
    pub config: Config,
    pub catalog: Arc<dyn Catalog>,
    pub encoder: Arc<dyn Encoder>,
    pub assets: DerivedAssetCache,
}

impl PipelineEnv {
    pub fn new(
        config: Config,
        catalog: Arc<dyn Catalog>,
        encoder: Arc<dyn Encoder>,
        renderer: Arc<dyn OverlayRenderer>,
    ) -> Self {
        let assets = DerivedAssetCache::new(&config, catalog.clone(), encoder.clone(), renderer);
        Self {
            config,
            catalog,
            encoder,
            assets,
        }
    }

    pub fn dvd(&self, dvd_id: u64, site_id: u64) -> Result<Dvd, PipelineError> {
        self.catalog.dvd(dvd_id, site_id)?.ok_or_else(|| {
            PipelineError::NotFound(format!("Could not find dvd #{} for site {}", dvd_id, site_id))
        })
    }

    pub fn scene(&self, scene_id: u64, site_id: u64) -> Result<Scene, PipelineError> {
        self.catalog.scene(scene_id, site_id)?.ok_or_else(|| {
            PipelineError::NotFound(format!(
                "Could not find scene #{} for site {}",
                scene_id, site_id
            ))
        })
    }

    /// Probed frame size, falling back to the configured default.
    pub fn frame_size(&self, details: &VideoDetails) -> (u32, u32) {
        details.size_or((
            self.config.scene.default_width,
            self.config.scene.default_height,
        ))
    }
}

/// State of one pipeline run.
pub struct RunContext {
    pub job_id: String,
    /// `{work_dir}/{job_id}`, created before the first stage.
    pub work_dir: PathBuf,
    pub env: Arc<PipelineEnv>,
    pub cancel: CancellationToken,
    store: Arc<dyn JobStore>,
    rng: Mutex<StdRng>,
}

impl RunContext {
    pub fn new(
        job_id: &str,
        env: Arc<PipelineEnv>,
        store: Arc<dyn JobStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            work_dir: env.config.paths.work_dir.join(job_id),
            env,
            cancel,
            store,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Fix the clip placement RNG.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock()
    }

    pub fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn ensure_work_dir(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.work_dir)
            .map_err(|source| PipelineError::environment(&self.work_dir, source))
    }

    /// Delete an intermediate file that a later step has consumed.
    pub fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(job_id = %self.job_id, path = %path.display(), error = %e, "Failed to remove intermediate file");
        }
    }

    /// Coarse progress for the job's task.
    pub fn report(&self, percent: u8, message: impl Into<String>) -> Result<(), PipelineError> {
        let message = message.into();
        info!(job_id = %self.job_id, percent, %message, "Progress");
        self.store
            .update_task(&self.job_id, &TaskUpdate::progress(percent, message))?;
        Ok(())
    }
}

pub type StageFuture<'a> = BoxFuture<'a, Result<(), PipelineError>>;

/// One named step of a pipeline over its run state `S`.
pub struct Stage<S> {
    pub name: &'static str,
    /// Task percent reported when the stage starts.
    pub percent: u8,
    pub run: for<'a> fn(&'a mut S, &'a RunContext) -> StageFuture<'a>,
}

/// Run `stages` in order, stopping at the first failure.
pub async fn run_stages<S: Send>(
    project: Project,
    stages: &[Stage<S>],
    state: &mut S,
    ctx: &RunContext,
) -> Result<(), PipelineError> {
    for stage in stages {
        if ctx.cancel.is_cancelled() {
            return Err(EncodeError::Cancelled.into());
        }
        info!(job_id = %ctx.job_id, %project, stage = stage.name, "Starting stage");
        ctx.report(stage.percent, stage.name)?;
        (stage.run)(state, ctx).await?;
    }
    Ok(())
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    fn project(&self) -> Project;

    /// Stage names in execution order.
    fn stage_names(&self) -> Vec<&'static str>;

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError>;
}

/// `"1280x720"` -> `(1280, 720)`
pub fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once('x')?;
    match (w.trim().parse(), h.trim().parse()) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => Some((w, h)),
        _ => None,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn mismatched(project: Project, request: &JobRequest) -> PipelineError {
    PipelineError::Validation(format!(
        "{} pipeline cannot run a {} request",
        project,
        request.project()
    ))
}

/// Explicit project -> pipeline mapping.
pub struct PipelineRegistry {
    pipelines: HashMap<Project, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    /// All six built-in pipelines.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ScenePipeline));
        registry.register(Arc::new(TrailerPipeline));
        registry.register(Arc::new(TrailerCutPipeline));
        registry.register(Arc::new(ClipSetPipeline));
        registry.register(Arc::new(ClipSetFinalizePipeline));
        registry.register(Arc::new(TubeClipPipeline));
        registry
    }

    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>) {
        self.pipelines.insert(pipeline.project(), pipeline);
    }

    pub fn get(&self, project: Project) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(&project).cloned()
    }
}

/// Removes a job id from the in-flight set when dropped.
pub(crate) struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.job_id);
    }
}

pub struct PipelineExecutor {
    env: Arc<PipelineEnv>,
    store: Arc<dyn JobStore>,
    registry: PipelineRegistry,
    in_flight: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    seed: Option<u64>,
}

impl PipelineExecutor {
    pub fn new(env: Arc<PipelineEnv>, store: Arc<dyn JobStore>) -> Self {
        Self::with_registry(env, store, PipelineRegistry::standard())
    }

    pub fn with_registry(
        env: Arc<PipelineEnv>,
        store: Arc<dyn JobStore>,
        registry: PipelineRegistry,
    ) -> Self {
        Self {
            env,
            store,
            registry,
            in_flight: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            seed: None,
        }
    }

    /// Use a fixed RNG seed for every run.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Cancelling this token stops every running pipeline at its next tool call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn env(&self) -> &Arc<PipelineEnv> {
        &self.env
    }

    /// Whether this process is currently running or finalizing `job_id`.
    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.lock().contains(job_id)
    }

    pub(crate) fn begin(&self, job_id: &str) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(job_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            job_id: job_id.to_string(),
        })
    }

    fn context(&self, job_id: &str) -> RunContext {
        let ctx = RunContext::new(
            job_id,
            self.env.clone(),
            self.store.clone(),
            self.cancel.child_token(),
        );
        match self.seed {
            Some(seed) => ctx.with_seed(seed),
            None => ctx,
        }
    }

    /// Run a claimed job to completion and record the outcome on the job.
    ///
    /// The error is returned after it has been recorded, except for
    /// [`PipelineError::AlreadyRunning`], which leaves the job untouched.
    pub async fn execute(&self, job: &Job) -> Result<(), PipelineError> {
        let Some(_guard) = self.begin(&job.id) else {
            warn!(job_id = %job.id, "Job is already running in this process");
            return Err(PipelineError::AlreadyRunning(job.id.clone()));
        };

        let ctx = self.context(&job.id);
        info!(job_id = %job.id, project = %job.project, "Executing job");
        let result = self.run_pipeline(job, &ctx).await;
        self.record_outcome(&job.id, &ctx.work_dir, &result)?;
        result
    }

    async fn run_pipeline(&self, job: &Job, ctx: &RunContext) -> Result<(), PipelineError> {
        job.params.validate()?;
        if job.params.project() != job.project {
            return Err(mismatched(job.project, &job.params));
        }
        let pipeline = self.registry.get(job.project).ok_or_else(|| {
            PipelineError::Validation(format!("No pipeline registered for {}", job.project))
        })?;

        ctx.report(0, "Started")?;
        ctx.ensure_work_dir()?;
        pipeline.run(&job.params, ctx).await
    }

    /// Finalize a Scene job whose encode finished but whose files were never
    /// placed. Returns `false` when the job is busy in this process.
    ///
    /// Success or failure is recorded on the job, as for [`execute`](Self::execute).
    pub async fn finalize_stuck(&self, job: &Job) -> Result<bool, PipelineError> {
        let JobRequest::Scene(request) = &job.params else {
            return Err(mismatched(Project::Scene, &job.params));
        };
        let Some(_guard) = self.begin(&job.id) else {
            return Ok(false);
        };

        let ctx = self.context(&job.id);
        let result = scene::finalize(request, &ctx).await;
        self.record_outcome(&job.id, &ctx.work_dir, &result)?;
        result.map(|()| true)
    }

    fn record_outcome(
        &self,
        job_id: &str,
        work_dir: &Path,
        result: &Result<(), PipelineError>,
    ) -> Result<(), StoreError> {
        match result {
            Ok(()) => {
                if work_dir.exists() {
                    if let Err(e) = fs::remove_dir_all(work_dir) {
                        warn!(job_id, path = %work_dir.display(), error = %e, "Failed to remove working directory");
                    }
                }
                self.store.update_task(job_id, &TaskUpdate::completed())?;
                self.store.mark_complete(job_id)?;
                info!(job_id, "Job complete");
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id, error = %message, path = %work_dir.display(), "Job failed, working directory left in place");
                self.store.update_task(job_id, &TaskUpdate::failed(&message))?;
                self.store.mark_failed(job_id, &message, e.code())?;
            }
        }
        Ok(())
    }
}
