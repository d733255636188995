//! Scheduler passes
//!
//! There is no background scheduler thread. Each pass reconciles stuck jobs,
//! then claims at most one job per project and runs it to completion on the
//! calling task. Running passes for different projects concurrently is the
//! caller's choice.

use crate::jobs::{JobRequest, Project};
use crate::pipeline::{PipelineError, PipelineExecutor};
use crate::reconciler::StuckJobReconciler;
use crate::store::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for scheduler passes
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a pass did for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing eligible, or the project already has a running job.
    Idle,
    Completed(String),
    Failed(String),
}

impl Dispatch {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Dispatch::Idle => None,
            Dispatch::Completed(id) | Dispatch::Failed(id) => Some(id),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<PipelineExecutor>,
    reconciler: StuckJobReconciler,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<PipelineExecutor>,
        reconciler: StuckJobReconciler,
    ) -> Self {
        Self {
            store,
            executor,
            reconciler,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Insert or update a job, then run a pass for its project.
    pub async fn enqueue(
        &self,
        request: JobRequest,
        job_id: Option<String>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<(String, Dispatch), SchedulerError> {
        let project = request.project();
        let id = self.store.enqueue(request, job_id, scheduled)?;
        info!(job_id = %id, %project, ?scheduled, "Job enqueued");
        let dispatch = self.run_project(project).await?;
        Ok((id, dispatch))
    }

    /// Reconcile, then dispatch the next eligible job of `project`.
    pub async fn run_project(&self, project: Project) -> Result<Dispatch, SchedulerError> {
        self.reconcile().await?;
        self.dispatch(project).await
    }

    /// Reconcile, then dispatch one job for every project with jobs, one
    /// project after another.
    pub async fn run_once(&self) -> Result<Vec<(Project, Dispatch)>, SchedulerError> {
        self.reconcile().await?;
        let mut results = Vec::new();
        for project in self.store.list_distinct_projects()? {
            results.push((project, self.dispatch(project).await?));
        }
        Ok(results)
    }

    /// Like [`run_once`](Self::run_once) but dispatches every project concurrently.
    pub async fn run_concurrently(&self) -> Result<Vec<(Project, Dispatch)>, SchedulerError> {
        self.reconcile().await?;
        let projects: Vec<Project> = self.store.list_distinct_projects()?.into_iter().collect();
        let results = join_all(projects.iter().map(|&p| self.dispatch(p))).await;
        projects
            .into_iter()
            .zip(results)
            .map(|(project, result)| Ok((project, result?)))
            .collect()
    }

    async fn reconcile(&self) -> Result<(), SchedulerError> {
        let finalized = self.reconciler.reconcile().await?;
        if finalized > 0 {
            info!(finalized, "Reconciled stuck jobs");
        }
        Ok(())
    }

    async fn dispatch(&self, project: Project) -> Result<Dispatch, SchedulerError> {
        let Some(job) = self.store.claim_next(project, Utc::now())? else {
            debug!(%project, "Nothing to dispatch");
            return Ok(Dispatch::Idle);
        };

        info!(job_id = %job.id, %project, "Dispatching job");
        match self.executor.execute(&job).await {
            Ok(()) => Ok(Dispatch::Completed(job.id)),
            Err(PipelineError::AlreadyRunning(_)) => {
                debug!(job_id = %job.id, %project, "Job already in flight here");
                Ok(Dispatch::Idle)
            }
            // Already recorded on the job by the executor.
            Err(e) => {
                warn!(job_id = %job.id, %project, error = %e, "Job did not complete");
                Ok(Dispatch::Failed(job.id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::{scene_request, t};
    use crate::jobs::{Job, JobStatus, SceneRequest, TaskStatus, TrailerRequest};
    use crate::pipeline::tests::{harness, Harness};
    use crate::progress::ProgressMonitor;
    use crate::store::{FileJobStore, MemoryJobStore};
    use crate::testutil::EncoderCall;
    use std::path::Path;

    /// Scheduler whose executor records outcomes in `store`.
    fn scheduler_for(h: &Harness, store: Arc<dyn JobStore>) -> Scheduler {
        let executor = Arc::new(
            PipelineExecutor::new(h.executor.env().clone(), store.clone()).with_seed(5),
        );
        let reconciler = StuckJobReconciler::new(
            store.clone(),
            executor.clone(),
            ProgressMonitor::new(&h.config().paths.log_dir),
        );
        Scheduler::new(store, executor, reconciler)
    }

    fn scheduler(h: &Harness) -> Scheduler {
        scheduler_for(h, h.store.clone())
    }

    fn scene_at(file: &Path) -> JobRequest {
        JobRequest::Scene(SceneRequest {
            scene_id: 42,
            dvd_id: 7,
            site_id: 1,
            file_location: file.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_enqueue_runs_scene_end_to_end() {
        let h = harness();
        let source = h.touch("incoming/scene.mov");
        let scheduler = scheduler(&h);

        let (id, dispatch) = scheduler.enqueue(scene_at(&source), None, None).await.unwrap();

        assert_eq!(dispatch, Dispatch::Completed(id.clone()));
        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.task.status, TaskStatus::Completed);
        assert_eq!(job.task.percent, Some(100));
        assert!(!h.config().paths.work_dir.join(&id).exists());

        let calls = h.encoder.calls();
        assert!(matches!(calls[1], EncoderCall::Thumbnails { .. }));
        assert_eq!(h.encoder.transcodes().len(), 2);
    }

    #[tokio::test]
    async fn test_unscheduled_jobs_run_newest_first() {
        let h = harness();
        let older = h.touch("incoming/older.mov");
        let newer = h.touch("incoming/newer.mov");
        let store = Arc::new(MemoryJobStore::from_jobs(vec![
            Job::new("j1".into(), 1, scene_at(&older), None, t(0)),
            Job::new("j2".into(), 2, scene_at(&newer), None, t(1)),
        ]));
        let scheduler = scheduler_for(&h, store.clone());

        let first = scheduler.run_project(Project::Scene).await.unwrap();
        assert_eq!(first.job_id(), Some("j2"));
        assert_eq!(store.get("j1").unwrap().unwrap().status, JobStatus::Queue);

        let second = scheduler.run_project(Project::Scene).await.unwrap();
        assert_eq!(second.job_id(), Some("j1"));
        assert_eq!(scheduler.run_project(Project::Scene).await.unwrap(), Dispatch::Idle);
    }

    #[tokio::test]
    async fn test_due_scheduled_job_beats_unscheduled() {
        let h = harness();
        let source = h.touch("incoming/scene.mov");
        // Both tiers use real timestamps in the past, so the scheduled job is due.
        let store = Arc::new(MemoryJobStore::from_jobs(vec![
            Job::new("j1".into(), 1, scene_at(&source), Some(t(10)), t(0)),
            Job::new("j2".into(), 2, scene_at(&source), None, t(5)),
        ]));
        let scheduler = scheduler_for(&h, store.clone());

        let dispatch = scheduler.run_project(Project::Scene).await.unwrap();

        assert_eq!(dispatch.job_id(), Some("j1"));
        assert_eq!(store.get("j2").unwrap().unwrap().status, JobStatus::Queue);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_fail_the_pass() {
        let h = harness();
        let scheduler = scheduler(&h);
        let missing = h.path("incoming/missing.mov");

        let (id, dispatch) = scheduler.enqueue(scene_at(&missing), None, None).await.unwrap();

        assert_eq!(dispatch, Dispatch::Failed(id.clone()));
        assert_eq!(h.store.get(&id).unwrap().unwrap().status, JobStatus::Fail);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_at_enqueue() {
        let h = harness();
        let request = JobRequest::Trailer(TrailerRequest {
            scene_id: 42,
            dvd_id: 7,
            site_id: 0,
            file_location: h.path("x.mov"),
        });

        let err = scheduler(&h).enqueue(request, None, None).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Store(StoreError::InvalidRequest(_))));
        assert!(h.store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_in_flight_here_dispatches_idle() {
        let h = harness();
        let source = h.touch("incoming/scene.mov");
        let store = Arc::new(MemoryJobStore::from_jobs(vec![Job::new(
            "j1".into(),
            1,
            scene_at(&source),
            None,
            t(0),
        )]));
        let scheduler = scheduler_for(&h, store.clone());
        let _busy = scheduler.executor.begin("j1").unwrap();

        let dispatch = scheduler.dispatch(Project::Scene).await.unwrap();

        assert_eq!(dispatch, Dispatch::Idle);
        assert!(h.encoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_running_job_is_failed_and_project_unblocked() {
        let h = harness();
        let source = h.touch("incoming/scene.mov");
        let state_dir = h.config().paths.state_dir.clone();
        let orphan = {
            let store = FileJobStore::open(&state_dir).unwrap();
            let id = store.enqueue(scene_at(&source), None, None).unwrap();
            store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
            id
        };

        let store = Arc::new(FileJobStore::open(&state_dir).unwrap());
        let fresh = store.enqueue(scene_at(&source), None, None).unwrap();
        let dispatch = scheduler_for(&h, store.clone())
            .run_project(Project::Scene)
            .await
            .unwrap();

        assert_eq!(dispatch, Dispatch::Completed(fresh));
        let job = store.get(&orphan).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert!(job.currently.starts_with("Interrupted"));
    }

    #[tokio::test]
    async fn test_run_once_visits_every_project() {
        let h = harness();
        let source = h.touch("incoming/scene.mov");
        h.store.enqueue(scene_at(&source), None, None).unwrap();
        h.store
            .enqueue(
                JobRequest::Trailer(TrailerRequest {
                    scene_id: 42,
                    dvd_id: 7,
                    site_id: 1,
                    file_location: source.clone(),
                }),
                None,
                None,
            )
            .unwrap();
        h.store.enqueue(scene_request(42), None, None).unwrap();

        let results = scheduler(&h).run_concurrently().await.unwrap();

        let projects: Vec<Project> = results.iter().map(|(p, _)| *p).collect();
        assert_eq!(projects, vec![Project::Scene, Project::Trailer]);
        assert!(results.iter().all(|(_, d)| d.job_id().is_some()));
        // One Scene job per pass: the other stays queued.
        let queued = h
            .store
            .list()
            .unwrap()
            .into_iter()
            .filter(|j| j.status == JobStatus::Queue)
            .count();
        assert_eq!(queued, 1);

        let second = scheduler(&h).run_once().await.unwrap();
        assert_eq!(second.len(), 2);
    }
}
