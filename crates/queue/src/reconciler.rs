//! Recovery of jobs left RUNNING by a runner that went away.
//!
//! Scene jobs whose encode finished are finalized. Every other orphaned
//! RUNNING job is failed so its project can move on.

use crate::jobs::Project;
use crate::pipeline::PipelineExecutor;
use crate::progress::ProgressMonitor;
use crate::store::{JobStore, StoreError};
use std::sync::Arc;

/// Recorded on a RUNNING job whose runner exited before finishing it.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted: runner exited before finishing";
use tracing::{debug, info, warn};

pub struct StuckJobReconciler {
    store: Arc<dyn JobStore>,
    executor: Arc<PipelineExecutor>,
    monitor: ProgressMonitor,
}

impl StuckJobReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<PipelineExecutor>,
        monitor: ProgressMonitor,
    ) -> Self {
        Self {
            store,
            executor,
            monitor,
        }
    }

    /// Finalize every orphaned Scene job whose encoder log reports 100%,
    /// then fail the remaining orphaned RUNNING jobs of any project.
    ///
    /// Jobs busy in this process, or owned by another live process, are left
    /// alone. A failed finalize is recorded on the job. Returns the number of
    /// jobs finalized.
    pub async fn reconcile(&self) -> Result<usize, StoreError> {
        let mut finalized = 0;
        for job in self.store.list_running_by_project(Project::Scene)? {
            if self.executor.is_in_flight(&job.id) {
                continue;
            }
            let progress = self.monitor.progress(&job.id);
            if !progress.is_done() {
                debug!(job_id = %job.id, state = progress.state(), percent = progress.as_percent(), "Running job not finished");
                continue;
            }
            if !self.store.adopt(&job.id)? {
                debug!(job_id = %job.id, "Finished encode owned by another process");
                continue;
            }

            info!(job_id = %job.id, "Encode finished without finalize, finalizing");
            match self.executor.finalize_stuck(&job).await {
                Ok(true) => finalized += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Finalize failed, job marked failed"),
            }
        }

        let in_flight = |id: &str| self.executor.is_in_flight(id);
        for id in self.store.fail_interrupted(INTERRUPTED_MESSAGE, &in_flight)? {
            warn!(job_id = %id, "Running job has no live runner, marked failed");
        }
        Ok(finalized)
    }
}
