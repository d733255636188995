//! Job model: projects, job and task status, typed requests, and the
//! queue selection rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Pipeline type a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Project {
    Scene,
    Trailer,
    TrailerCut,
    ClipSet,
    ClipSetFinalize,
    TubeClip,
}

impl Project {
    pub const ALL: [Project; 6] = [
        Project::Scene,
        Project::Trailer,
        Project::TrailerCut,
        Project::ClipSet,
        Project::ClipSetFinalize,
        Project::TubeClip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Project::Scene => "Scene",
            Project::Trailer => "Trailer",
            Project::TrailerCut => "TrailerCut",
            Project::ClipSet => "ClipSet",
            Project::ClipSetFinalize => "ClipSetFinalize",
            Project::TubeClip => "TubeClip",
        }
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown project: {0}")]
pub struct ParseProjectError(String);

impl FromStr for Project {
    type Err = ParseProjectError;

    /// Case-insensitive; accepts `TrailerCut`, `trailer_cut` and `trailer-cut`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        Project::ALL
            .into_iter()
            .find(|p| p.as_str().to_lowercase() == normalized)
            .ok_or_else(|| ParseProjectError(s.to_string()))
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be selected.
    Queue,
    /// Claimed by the scheduler and handed to a pipeline.
    Running,
    Complete,
    Fail,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queue
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queue => write!(f, "queue"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Status of the live task record attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Coarse progress record written by the pipeline executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub percent: Option<u8>,
    pub status: TaskStatus,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A change to a [`Task`]. `None` fields leave the current value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub percent: Option<u8>,
    pub status: TaskStatus,
    pub message: Option<String>,
}

impl TaskUpdate {
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            status: TaskStatus::InProgress,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            percent: None,
            status: TaskStatus::Failed,
            message: Some(message.into()),
        }
    }

    pub fn completed() -> Self {
        Self {
            percent: Some(100),
            status: TaskStatus::Completed,
            message: Some("Complete".to_string()),
        }
    }
}

impl Task {
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        if let Some(percent) = update.percent {
            self.percent = Some(percent.min(100));
        }
        if let Some(message) = &update.message {
            self.message = message.clone();
        }
        if update.status == TaskStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if matches!(update.status, TaskStatus::Completed | TaskStatus::Failed) {
            self.started_at.get_or_insert(now);
            self.completed_at = Some(now);
        }
        self.status = update.status;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRequest {
    pub scene_id: u64,
    pub dvd_id: u64,
    pub site_id: u64,
    pub file_location: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailerRequest {
    pub scene_id: u64,
    pub dvd_id: u64,
    pub site_id: u64,
    pub file_location: PathBuf,
}

/// Trailer cut from the stored original. Unset numbers use the configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailerCutRequest {
    pub scene_id: u64,
    pub site_id: u64,
    #[serde(default)]
    pub duration_full: Option<u32>,
    #[serde(default)]
    pub clip_length: Option<u32>,
    #[serde(default)]
    pub trim_front: Option<u32>,
    #[serde(default)]
    pub trim_back: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSetRequest {
    pub scene_id: u64,
    pub dvd_id: u64,
    pub site_id: u64,
    #[serde(default)]
    pub num_clips: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSetFinalizeRequest {
    pub scene_id: u64,
    pub dvd_id: u64,
    pub site_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TubeClipRequest {
    pub scene_id: u64,
    pub dvd_id: u64,
    pub site_id: u64,
    pub tubes: Vec<u64>,
}

/// Typed parameters of a job, one variant per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    Scene(SceneRequest),
    Trailer(TrailerRequest),
    TrailerCut(TrailerCutRequest),
    ClipSet(ClipSetRequest),
    ClipSetFinalize(ClipSetFinalizeRequest),
    TubeClip(TubeClipRequest),
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("No file specified")]
    MissingFile,
    #[error("No {0} specified")]
    MissingId(&'static str),
    #[error("No tube channels selected")]
    NoTubes,
    #[error("{field} must be at most {max}")]
    OutOfRange { field: &'static str, max: u32 },
}

/// Most clips one clip set may ask for.
pub const MAX_CLIPS: u32 = 100;

/// Upper bound for any trailer length or trim, in seconds.
pub const MAX_TRAILER_SECONDS: u32 = 86_400;

fn at_most(field: &'static str, value: Option<u32>, max: u32) -> Result<(), RequestError> {
    match value {
        Some(v) if v > max => Err(RequestError::OutOfRange { field, max }),
        _ => Ok(()),
    }
}

impl JobRequest {
    pub fn project(&self) -> Project {
        match self {
            JobRequest::Scene(_) => Project::Scene,
            JobRequest::Trailer(_) => Project::Trailer,
            JobRequest::TrailerCut(_) => Project::TrailerCut,
            JobRequest::ClipSet(_) => Project::ClipSet,
            JobRequest::ClipSetFinalize(_) => Project::ClipSetFinalize,
            JobRequest::TubeClip(_) => Project::TubeClip,
        }
    }

    pub fn site_id(&self) -> u64 {
        match self {
            JobRequest::Scene(r) => r.site_id,
            JobRequest::Trailer(r) => r.site_id,
            JobRequest::TrailerCut(r) => r.site_id,
            JobRequest::ClipSet(r) => r.site_id,
            JobRequest::ClipSetFinalize(r) => r.site_id,
            JobRequest::TubeClip(r) => r.site_id,
        }
    }

    pub fn scene_id(&self) -> u64 {
        match self {
            JobRequest::Scene(r) => r.scene_id,
            JobRequest::Trailer(r) => r.scene_id,
            JobRequest::TrailerCut(r) => r.scene_id,
            JobRequest::ClipSet(r) => r.scene_id,
            JobRequest::ClipSetFinalize(r) => r.scene_id,
            JobRequest::TubeClip(r) => r.scene_id,
        }
    }

    /// Reject requests missing identifiers or paths, or asking for more
    /// clips or seconds than any source could hold, before a job is created.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.scene_id() == 0 {
            return Err(RequestError::MissingId("scene"));
        }
        if self.site_id() == 0 {
            return Err(RequestError::MissingId("site"));
        }
        match self {
            JobRequest::Scene(SceneRequest { file_location, .. })
            | JobRequest::Trailer(TrailerRequest { file_location, .. }) => {
                if file_location.as_os_str().is_empty() {
                    return Err(RequestError::MissingFile);
                }
            }
            JobRequest::TubeClip(r) if r.tubes.is_empty() => return Err(RequestError::NoTubes),
            JobRequest::ClipSet(r) => at_most("num_clips", r.num_clips, MAX_CLIPS)?,
            JobRequest::TrailerCut(r) => {
                at_most("duration_full", r.duration_full, MAX_TRAILER_SECONDS)?;
                at_most("clip_length", r.clip_length, MAX_TRAILER_SECONDS)?;
                at_most("trim_front", r.trim_front, MAX_TRAILER_SECONDS)?;
                at_most("trim_back", r.trim_back, MAX_TRAILER_SECONDS)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// One queued-and-tracked encoding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier; also names the encoder log and working directory.
    pub id: String,
    /// Insertion order, used to break ties between equal timestamps.
    pub seq: u64,
    pub project: Project,
    pub status: JobStatus,
    /// Human-readable progress description, last write wins.
    pub currently: String,
    /// `None` means "run whenever dispatched".
    pub scheduled: Option<DateTime<Utc>>,
    pub params: JobRequest,
    /// Legacy result code, 0 = unset/success.
    pub code: i32,
    pub task: Task,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: String,
        seq: u64,
        params: JobRequest,
        scheduled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            seq,
            project: params.project(),
            status: JobStatus::Queue,
            currently: "Queued".to_string(),
            scheduled,
            params,
            code: 0,
            task: Task::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queue | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Complete | JobStatus::Fail)
    }
}

/// Generate a fresh opaque job identifier.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Pick the next job to dispatch for `project`.
///
/// Due scheduled jobs win, earliest `scheduled` first. Otherwise the most
/// recently created unscheduled job is taken. Jobs scheduled in the future
/// are not eligible.
pub fn select_next<'a>(jobs: &'a [Job], project: Project, now: DateTime<Utc>) -> Option<&'a Job> {
    let queued = || {
        jobs.iter()
            .filter(move |j| j.project == project && j.status == JobStatus::Queue)
    };

    let due = queued()
        .filter_map(|j| j.scheduled.filter(|at| *at <= now).map(|at| (at, j)))
        .min_by_key(|(at, j)| (*at, j.seq))
        .map(|(_, j)| j);

    due.or_else(|| {
        queued()
            .filter(|j| j.scheduled.is_none())
            .max_by_key(|j| (j.created_at, j.seq))
    })
}
