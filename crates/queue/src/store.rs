//! Durable job records.
//!
//! [`JobStore`] is the repository the scheduler, executor and reconciler
//! depend on. Every read-modify-write happens under a single lock, which is
//! what makes [`JobStore::claim_next`] a real per-project claim rather than
//! an advisory status check. For [`FileJobStore`] that lock is an OS file
//! lock, so separate processes sharing a state directory see each other's
//! jobs and never claim the same project twice.

use crate::jobs::{
    new_job_id, select_next, Job, JobRequest, JobStatus, Project, RequestError, Task, TaskUpdate,
};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock file guarding every read-modify-write of a state directory.
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
}

pub trait JobStore: Send + Sync {
    /// Insert a job, or update it in place when `job_id` names an existing one.
    fn enqueue(
        &self,
        request: JobRequest,
        job_id: Option<String>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError>;

    fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    fn list(&self) -> Result<Vec<Job>, StoreError>;

    fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        currently: Option<&str>,
    ) -> Result<(), StoreError>;

    fn mark_complete(&self, job_id: &str) -> Result<(), StoreError>;

    fn mark_failed(&self, job_id: &str, message: &str, code: i32) -> Result<(), StoreError>;

    /// Apply a task update and mirror its message into `currently`.
    fn update_task(&self, job_id: &str, update: &TaskUpdate) -> Result<(), StoreError>;

    /// Advisory check: any queued or running job for `project` (or any project).
    fn has_active_job(&self, project: Option<Project>) -> Result<bool, StoreError>;

    /// The job [`claim_next`](JobStore::claim_next) would take, without claiming it.
    fn next_eligible(&self, project: Project, now: DateTime<Utc>)
        -> Result<Option<Job>, StoreError>;

    /// Select and move the next eligible job to RUNNING in one step.
    ///
    /// Returns `None` while the project already has a running job.
    fn claim_next(&self, project: Project, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    fn list_distinct_projects(&self) -> Result<BTreeSet<Project>, StoreError>;

    fn list_running_by_project(&self, project: Project) -> Result<Vec<Job>, StoreError>;

    /// Take over a RUNNING job so this process may finish it.
    ///
    /// Returns `false` when the job is not running or another live process
    /// still owns it.
    fn adopt(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Fail every RUNNING job that no live runner owns.
    ///
    /// `in_flight` reports jobs this process is working on right now; those
    /// are never touched. Returns the ids that were failed.
    fn fail_interrupted(
        &self,
        message: &str,
        in_flight: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, StoreError>;
}

/// In-memory job table shared by both store implementations.
///
/// Mutating methods return the changed job so callers can persist it.
#[derive(Debug, Default)]
struct JobTable {
    jobs: Vec<Job>,
    next_seq: u64,
}

impl JobTable {
    fn from_jobs(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by_key(|j| j.seq);
        let next_seq = jobs.iter().map(|j| j.seq + 1).max().unwrap_or(1);
        Self { jobs, next_seq }
    }

    fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    fn find_mut(&mut self, job_id: &str) -> Result<&mut Job, StoreError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    fn enqueue(
        &mut self,
        request: JobRequest,
        job_id: Option<String>,
        scheduled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<&Job, StoreError> {
        request.validate()?;

        let existing = job_id
            .as_deref()
            .and_then(|id| self.jobs.iter().position(|j| j.id == id));

        let index = match existing {
            Some(index) => {
                let job = &mut self.jobs[index];
                job.project = request.project();
                job.params = request;
                if scheduled.is_some() {
                    job.scheduled = scheduled;
                }
                if job.status != JobStatus::Running {
                    job.status = JobStatus::Queue;
                    job.currently = "Queued".to_string();
                    job.code = 0;
                    job.task = Task::default();
                    job.completed_at = None;
                }
                job.updated_at = now;
                index
            }
            None => {
                let id = job_id.unwrap_or_else(new_job_id);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.jobs.push(Job::new(id, seq, request, scheduled, now));
                self.jobs.len() - 1
            }
        };

        Ok(&self.jobs[index])
    }

    fn set_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        currently: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<&Job, StoreError> {
        let job = self.find_mut(job_id)?;
        job.status = status;
        if let Some(text) = currently {
            job.currently = text.to_string();
        }
        if job.is_terminal() {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Ok(job)
    }

    fn mark_failed(
        &mut self,
        job_id: &str,
        message: &str,
        code: i32,
        now: DateTime<Utc>,
    ) -> Result<&Job, StoreError> {
        let job = self.find_mut(job_id)?;
        job.status = JobStatus::Fail;
        job.currently = message.to_string();
        job.code = code;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job)
    }

    fn update_task(
        &mut self,
        job_id: &str,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<&Job, StoreError> {
        let job = self.find_mut(job_id)?;
        job.task.apply(update, now);
        if let Some(message) = &update.message {
            job.currently = message.clone();
        }
        job.updated_at = now;
        Ok(job)
    }

    fn has_active_job(&self, project: Option<Project>) -> bool {
        self.jobs
            .iter()
            .any(|j| j.is_active() && project.map_or(true, |p| j.project == p))
    }

    fn has_running(&self, project: Project) -> bool {
        self.jobs
            .iter()
            .any(|j| j.project == project && j.status == JobStatus::Running)
    }

    fn is_running(&self, job_id: &str) -> bool {
        self.get(job_id)
            .is_some_and(|j| j.status == JobStatus::Running)
    }

    fn running_ids(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id.clone())
            .collect()
    }

    fn claim_next(&mut self, project: Project, now: DateTime<Utc>) -> Option<&Job> {
        if self.has_running(project) {
            return None;
        }
        let id = select_next(&self.jobs, project, now)?.id.clone();
        let job = self.jobs.iter_mut().find(|j| j.id == id)?;
        job.status = JobStatus::Running;
        job.currently = "Started".to_string();
        job.updated_at = now;
        Some(job)
    }

    fn list_distinct_projects(&self) -> BTreeSet<Project> {
        self.jobs.iter().map(|j| j.project).collect()
    }

    fn list_running_by_project(&self, project: Project) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|j| j.project == project && j.status == JobStatus::Running)
            .cloned()
            .collect()
    }
}

/// Job store that lives only for the lifetime of the process.
///
/// Only one process ever sees these jobs, so a RUNNING job is owned exactly
/// when the caller reports it in flight.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing set of jobs, keeping their ids, sequence numbers and timestamps.
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self {
            table: Mutex::new(JobTable::from_jobs(jobs)),
        }
    }
}

impl JobStore for MemoryJobStore {
    fn enqueue(
        &self,
        request: JobRequest,
        job_id: Option<String>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError> {
        let mut table = self.table.lock();
        let job = table.enqueue(request, job_id, scheduled, Utc::now())?;
        Ok(job.id.clone())
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().jobs.clone())
    }

    fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        currently: Option<&str>,
    ) -> Result<(), StoreError> {
        self.table
            .lock()
            .set_status(job_id, status, currently, Utc::now())
            .map(|_| ())
    }

    fn mark_complete(&self, job_id: &str) -> Result<(), StoreError> {
        self.set_status(job_id, JobStatus::Complete, Some("Complete"))
    }

    fn mark_failed(&self, job_id: &str, message: &str, code: i32) -> Result<(), StoreError> {
        self.table
            .lock()
            .mark_failed(job_id, message, code, Utc::now())
            .map(|_| ())
    }

    fn update_task(&self, job_id: &str, update: &TaskUpdate) -> Result<(), StoreError> {
        self.table
            .lock()
            .update_task(job_id, update, Utc::now())
            .map(|_| ())
    }

    fn has_active_job(&self, project: Option<Project>) -> Result<bool, StoreError> {
        Ok(self.table.lock().has_active_job(project))
    }

    fn next_eligible(
        &self,
        project: Project,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        Ok(select_next(&self.table.lock().jobs, project, now).cloned())
    }

    fn claim_next(&self, project: Project, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        Ok(self.table.lock().claim_next(project, now).cloned())
    }

    fn list_distinct_projects(&self) -> Result<BTreeSet<Project>, StoreError> {
        Ok(self.table.lock().list_distinct_projects())
    }

    fn list_running_by_project(&self, project: Project) -> Result<Vec<Job>, StoreError> {
        Ok(self.table.lock().list_running_by_project(project))
    }

    fn adopt(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.table.lock().is_running(job_id))
    }

    fn fail_interrupted(
        &self,
        message: &str,
        in_flight: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        let mut table = self.table.lock();
        let now = Utc::now();
        let mut failed = Vec::new();
        for id in table.running_ids() {
            if in_flight(&id) {
                continue;
            }
            table.mark_failed(&id, message, 1, now)?;
            failed.push(id);
        }
        Ok(failed)
    }
}

/// Job store persisted as one JSON file per job in a state directory.
///
/// Every operation takes an exclusive lock on `{state_dir}/.lock` and
/// re-reads the job files before touching them, so several processes can
/// share one directory.
///
/// A claimed job also holds a lock on `{state_dir}/{job_id}.lease` until it
/// reaches a terminal status. The OS drops that lock when the owning process
/// exits, which is how a RUNNING job left behind by a dead process is told
/// apart from one that is still being worked on elsewhere.
#[derive(Debug)]
pub struct FileJobStore {
    state_dir: PathBuf,
    leases: Mutex<HashMap<String, File>>,
}

impl FileJobStore {
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        let count = load_jobs(&state_dir)?.len();
        debug!(state_dir = %state_dir.display(), count, "Opened job store");
        Ok(Self {
            state_dir,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Run `f` on a fresh copy of the table while holding the directory lock.
    ///
    /// Changes are only durable if `f` saves them.
    fn locked<T>(
        &self,
        f: impl FnOnce(&mut JobTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        fs::create_dir_all(&self.state_dir)?;
        let lock = open_lock_file(&self.state_dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;
        let mut table = JobTable::from_jobs(load_jobs(&self.state_dir)?);
        f(&mut table)
    }

    fn lease_path(&self, job_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.lease", job_id))
    }

    /// Hold the run lease for `job_id`. Returns `false` if another process
    /// holds it. Call with the directory lock held.
    fn take_lease(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock();
        if leases.contains_key(job_id) {
            return Ok(true);
        }
        let file = open_lock_file(&self.lease_path(job_id))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                leases.insert(job_id.to_string(), file);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Give up the run lease for a job that reached a terminal status.
    /// Call with the directory lock held.
    fn release_lease(&self, job_id: &str) {
        if self.leases.lock().remove(job_id).is_none() {
            return;
        }
        let path = self.lease_path(job_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(job_id, path = %path.display(), error = %e, "Failed to remove lease file");
            }
        }
    }
}

impl JobStore for FileJobStore {
    fn enqueue(
        &self,
        request: JobRequest,
        job_id: Option<String>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<String, StoreError> {
        self.locked(|table| {
            let job = table.enqueue(request, job_id, scheduled, Utc::now())?;
            save_job(job, &self.state_dir)?;
            Ok(job.id.clone())
        })
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        self.locked(|table| Ok(table.get(job_id).cloned()))
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.locked(|table| Ok(std::mem::take(&mut table.jobs)))
    }

    fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        currently: Option<&str>,
    ) -> Result<(), StoreError> {
        self.locked(|table| {
            let job = table.set_status(job_id, status, currently, Utc::now())?;
            save_job(job, &self.state_dir)?;
            if job.is_terminal() {
                self.release_lease(job_id);
            }
            Ok(())
        })
    }

    fn mark_complete(&self, job_id: &str) -> Result<(), StoreError> {
        self.set_status(job_id, JobStatus::Complete, Some("Complete"))
    }

    fn mark_failed(&self, job_id: &str, message: &str, code: i32) -> Result<(), StoreError> {
        self.locked(|table| {
            let job = table.mark_failed(job_id, message, code, Utc::now())?;
            save_job(job, &self.state_dir)?;
            self.release_lease(job_id);
            Ok(())
        })
    }

    fn update_task(&self, job_id: &str, update: &TaskUpdate) -> Result<(), StoreError> {
        self.locked(|table| {
            let job = table.update_task(job_id, update, Utc::now())?;
            save_job(job, &self.state_dir)
        })
    }

    fn has_active_job(&self, project: Option<Project>) -> Result<bool, StoreError> {
        self.locked(|table| Ok(table.has_active_job(project)))
    }

    fn next_eligible(
        &self,
        project: Project,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.locked(|table| Ok(select_next(&table.jobs, project, now).cloned()))
    }

    fn claim_next(&self, project: Project, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        self.locked(|table| {
            let Some(job) = table.claim_next(project, now) else {
                return Ok(None);
            };
            if !self.take_lease(&job.id)? {
                warn!(job_id = %job.id, %project, "Queued job is leased by another process, not claiming");
                return Ok(None);
            }
            save_job(job, &self.state_dir)?;
            Ok(Some(job.clone()))
        })
    }

    fn list_distinct_projects(&self) -> Result<BTreeSet<Project>, StoreError> {
        self.locked(|table| Ok(table.list_distinct_projects()))
    }

    fn list_running_by_project(&self, project: Project) -> Result<Vec<Job>, StoreError> {
        self.locked(|table| Ok(table.list_running_by_project(project)))
    }

    fn adopt(&self, job_id: &str) -> Result<bool, StoreError> {
        self.locked(|table| {
            if !table.is_running(job_id) {
                return Ok(false);
            }
            self.take_lease(job_id)
        })
    }

    fn fail_interrupted(
        &self,
        message: &str,
        in_flight: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, StoreError> {
        self.locked(|table| {
            let now = Utc::now();
            let mut failed = Vec::new();
            for id in table.running_ids() {
                if in_flight(&id) || !self.take_lease(&id)? {
                    continue;
                }
                let job = table.mark_failed(&id, message, 1, now)?;
                save_job(job, &self.state_dir)?;
                self.release_lease(&id);
                failed.push(id);
            }
            Ok(failed)
        })
    }
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}

/// Saves a job to `{state_dir}/{job_id}.json`.
pub fn save_job(job: &Job, state_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(state_dir)?;
    let file_path = state_dir.join(format!("{}.json", job.id));
    let json = serde_json::to_string_pretty(job)?;
    fs::write(file_path, json)?;
    Ok(())
}

/// Loads all jobs from JSON files in the state directory.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_jobs(state_dir: &Path) -> Result<Vec<Job>, StoreError> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();
    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job file"),
        }
    }

    Ok(jobs)
}

fn load_job_from_file(path: &Path) -> Result<Job, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::{scene_request, t};
    use crate::jobs::TaskStatus;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn queued(id: &str, seq: u64, created: i64, scheduled: Option<i64>) -> Job {
        Job::new(id.to_string(), seq, scene_request(seq), scheduled.map(t), t(created))
    }

    #[test]
    fn test_enqueue_generates_id_and_queues() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(scene_request(1), None, None).unwrap();
        assert!(!id.is_empty());

        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queue);
        assert_eq!(job.project, Project::Scene);
        assert!(store.has_active_job(Some(Project::Scene)).unwrap());
        assert!(!store.has_active_job(Some(Project::Trailer)).unwrap());
        assert!(store.has_active_job(None).unwrap());
    }

    #[test]
    fn test_enqueue_with_existing_id_updates_in_place() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(scene_request(1), Some("enc-1".to_string()), None)
            .unwrap();
        store.mark_failed(&id, "boom", 3).unwrap();

        let again = store
            .enqueue(scene_request(2), Some("enc-1".to_string()), Some(t(5)))
            .unwrap();
        assert_eq!(again, "enc-1");

        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Queue);
        assert_eq!(jobs[0].code, 0);
        assert_eq!(jobs[0].params.scene_id(), 2);
        assert_eq!(jobs[0].scheduled, Some(t(5)));
    }

    #[test]
    fn test_resubmitting_running_job_keeps_status() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(scene_request(1), None, None).unwrap();
        store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();

        store.enqueue(scene_request(9), Some(id.clone()), None).unwrap();
        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.params.scene_id(), 9);
    }

    #[test]
    fn test_enqueue_rejects_invalid_request() {
        let store = MemoryJobStore::new();
        let err = store.enqueue(scene_request(0), None, None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_claim_is_exclusive_per_project() {
        let store = MemoryJobStore::from_jobs(vec![
            queued("a", 1, 0, None),
            queued("b", 2, 1, None),
        ]);

        let first = store.claim_next(Project::Scene, t(10)).unwrap().unwrap();
        assert_eq!(first.id, "b");
        assert_eq!(first.status, JobStatus::Running);

        assert!(store.claim_next(Project::Scene, t(10)).unwrap().is_none());
        assert_eq!(store.list_running_by_project(Project::Scene).unwrap().len(), 1);

        store.mark_complete("b").unwrap();
        let second = store.claim_next(Project::Scene, t(11)).unwrap().unwrap();
        assert_eq!(second.id, "a");
    }

    #[test]
    fn test_concurrent_claims_never_run_two_jobs() {
        let jobs = (0..20).map(|i| queued(&format!("j{}", i), i, i as i64, None)).collect();
        let store = Arc::new(MemoryJobStore::from_jobs(jobs));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.claim_next(Project::Scene, t(100)).unwrap())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(claimed, 1);
        assert_eq!(store.list_running_by_project(Project::Scene).unwrap().len(), 1);
    }

    #[test]
    fn test_next_eligible_does_not_claim() {
        let store = MemoryJobStore::from_jobs(vec![queued("a", 1, 0, None)]);
        let job = store.next_eligible(Project::Scene, t(5)).unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(store.get("a").unwrap().unwrap().status, JobStatus::Queue);
    }

    #[test]
    fn test_update_task_mirrors_currently() {
        let store = MemoryJobStore::from_jobs(vec![queued("a", 1, 0, None)]);
        store
            .update_task("a", &TaskUpdate::progress(50, "Encoding finals"))
            .unwrap();
        let job = store.get("a").unwrap().unwrap();
        assert_eq!(job.currently, "Encoding finals");
        assert_eq!(job.task.percent, Some(50));
        assert_eq!(job.task.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.mark_complete("missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_distinct_projects() {
        let store = MemoryJobStore::new();
        store.enqueue(scene_request(1), None, None).unwrap();
        store.enqueue(scene_request(2), None, None).unwrap();
        let projects = store.list_distinct_projects().unwrap();
        assert_eq!(projects.into_iter().collect::<Vec<_>>(), vec![Project::Scene]);
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = FileJobStore::open(dir.path()).unwrap();
            let id = store.enqueue(scene_request(4), None, None).unwrap();
            store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
            id
        };

        assert!(dir.path().join(format!("{}.json", id)).exists());

        let reopened = FileJobStore::open(dir.path()).unwrap();
        let job = reopened.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let next = reopened.enqueue(scene_request(5), None, None).unwrap();
        let next_job = reopened.get(&next).unwrap().unwrap();
        assert!(next_job.seq > job.seq);
    }

    #[test]
    fn test_memory_store_fails_running_jobs_not_in_flight() {
        let store = MemoryJobStore::from_jobs(vec![queued("a", 1, 0, None)]);
        store.claim_next(Project::Scene, t(5)).unwrap().unwrap();

        assert!(store.fail_interrupted("Interrupted", &|id: &str| id == "a").unwrap().is_empty());
        assert!(store.adopt("a").unwrap());

        assert_eq!(store.fail_interrupted("Interrupted", &|_: &str| false).unwrap(), vec!["a"]);
        let job = store.get("a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert_eq!(job.currently, "Interrupted");
        assert_eq!(job.code, 1);
        assert!(!store.adopt("a").unwrap());
    }

    #[test]
    fn test_two_file_stores_see_each_others_jobs() {
        let dir = TempDir::new().unwrap();
        let service = FileJobStore::open(dir.path()).unwrap();
        let cli = FileJobStore::open(dir.path()).unwrap();

        let id = cli.enqueue(scene_request(4), None, None).unwrap();

        assert_eq!(service.get(&id).unwrap().unwrap().status, JobStatus::Queue);
        assert_eq!(service.list().unwrap().len(), 1);
        assert!(service.list_distinct_projects().unwrap().contains(&Project::Scene));

        let claimed = service.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(cli.get(&id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_two_file_stores_claim_one_job_per_project() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(FileJobStore::open(dir.path()).unwrap());
        let second = Arc::new(FileJobStore::open(dir.path()).unwrap());
        for i in 1..=4 {
            first.enqueue(scene_request(i), None, None).unwrap();
        }

        let handles: Vec<_> = [first.clone(), second.clone(), first.clone(), second.clone()]
            .into_iter()
            .map(|store| std::thread::spawn(move || store.claim_next(Project::Scene, Utc::now()).unwrap()))
            .collect();
        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();

        assert_eq!(claimed, 1);
        assert_eq!(first.list_running_by_project(Project::Scene).unwrap().len(), 1);
        assert_eq!(second.list_running_by_project(Project::Scene).unwrap().len(), 1);
    }

    #[test]
    fn test_live_lease_protects_running_job() {
        let dir = TempDir::new().unwrap();
        let owner = FileJobStore::open(dir.path()).unwrap();
        let other = FileJobStore::open(dir.path()).unwrap();
        let id = owner.enqueue(scene_request(4), None, None).unwrap();
        owner.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();

        assert!(!other.adopt(&id).unwrap());
        assert!(other.fail_interrupted("Interrupted", &|_: &str| false).unwrap().is_empty());
        assert_eq!(other.get(&id).unwrap().unwrap().status, JobStatus::Running);

        owner.mark_complete(&id).unwrap();
        assert!(!dir.path().join(format!("{}.lease", id)).exists());
        assert!(other.fail_interrupted("Interrupted", &|_: &str| false).unwrap().is_empty());
    }

    #[test]
    fn test_restart_fails_orphaned_running_job_and_unblocks_project() {
        let dir = TempDir::new().unwrap();
        let orphan = {
            let store = FileJobStore::open(dir.path()).unwrap();
            let id = store.enqueue(scene_request(4), None, None).unwrap();
            store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
            id
        };

        let store = FileJobStore::open(dir.path()).unwrap();
        let fresh = store.enqueue(scene_request(5), None, None).unwrap();
        assert!(store.claim_next(Project::Scene, Utc::now()).unwrap().is_none());

        let failed = store
            .fail_interrupted("Interrupted: runner exited before finishing", &|_: &str| false)
            .unwrap();

        assert_eq!(failed, vec![orphan.clone()]);
        let job = store.get(&orphan).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert_eq!(job.currently, "Interrupted: runner exited before finishing");
        let claimed = store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, fresh);
    }

    #[test]
    fn test_adopt_takes_over_orphaned_job() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = FileJobStore::open(dir.path()).unwrap();
            let id = store.enqueue(scene_request(4), None, None).unwrap();
            store.claim_next(Project::Scene, Utc::now()).unwrap().unwrap();
            id
        };

        let store = FileJobStore::open(dir.path()).unwrap();
        let other = FileJobStore::open(dir.path()).unwrap();
        assert!(store.adopt(&id).unwrap());
        assert!(!other.adopt(&id).unwrap());
        assert!(!store.adopt("missing").unwrap());
    }

    #[test]
    fn test_load_jobs_skips_invalid_files() {
        let dir = TempDir::new().unwrap();
        save_job(&queued("good", 1, 0, None), dir.path()).unwrap();
        fs::write(dir.path().join("bad.json"), "not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join(LOCK_FILE), "").unwrap();
        fs::write(dir.path().join("good.lease"), "").unwrap();

        let jobs = load_jobs(dir.path()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "good");
    }

    #[test]
    fn test_load_jobs_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let jobs = load_jobs(&dir.path().join("nope")).unwrap();
        assert!(jobs.is_empty());
    }
}
