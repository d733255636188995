//! Encode Queue
//!
//! Per-project job queue that drives ffmpeg transcodes for scenes, trailers,
//! clip sets and tube encodes, and records the produced files in the catalog.

pub mod assets;
pub mod catalog;
pub mod clips;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod overlay;
pub mod pipeline;
pub mod placement;
pub mod progress;
pub mod reconciler;
pub mod scheduler;
pub mod startup;
pub mod status_server;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use encode_queue_config as config;
pub use encode_queue_config::Config;
pub use catalog::{Catalog, CatalogData, CatalogError, MemoryCatalog};
pub use concurrency::EncoderThreads;
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, Encoder, FfmpegEncoder, VideoDetails};
pub use jobs::{Job, JobRequest, JobStatus, Project, Task, TaskStatus};
pub use pipeline::{PipelineError, PipelineExecutor};
pub use progress::{Progress, ProgressMonitor, ProgressReport};
pub use scheduler::{Dispatch, Scheduler, SchedulerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError, StatusState};
pub use store::{FileJobStore, JobStore, MemoryJobStore, StoreError};
