//! CLI entry point for the encode queue
//!
//! Enqueues jobs, runs scheduler passes, reports encoder progress and starts
//! the long-running service.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use encode_queue::{Config, Daemon, DaemonError, Dispatch, JobRequest, Project};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Encode queue - per-project ffmpeg job queue
#[derive(Parser, Debug)]
#[command(name = "encode-queue")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, qt-faststart, convert). For testing only.
    #[arg(long, default_value = "false", global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scheduler pass for one project, or for every project
    Process {
        /// Project name, e.g. Scene or trailer_cut
        #[arg(short, long)]
        project: Option<Project>,
    },
    /// Insert or update a job from a JSON request file, then run its project
    Enqueue {
        /// JSON file holding a tagged job request
        #[arg(long)]
        params: PathBuf,

        /// Update this job instead of creating a new one
        #[arg(long)]
        job_id: Option<String>,

        /// Earliest start time (RFC 3339)
        #[arg(long)]
        scheduled: Option<DateTime<Utc>>,
    },
    /// Print the encoder progress of a job as JSON
    Progress {
        job_id: String,
    },
    /// Run scheduler passes and the status server until interrupted
    Serve,
}

fn load_config(path: &Path) -> Result<Config, String> {
    if path.exists() {
        return Config::load(path).map_err(|e| format!("Failed to load {}: {}", path.display(), e));
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn read_request(path: &Path) -> Result<JobRequest, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid job request {}: {}", path.display(), e))
}

fn report(project: Project, dispatch: &Dispatch) {
    match dispatch {
        Dispatch::Idle => info!(%project, "Nothing to run"),
        Dispatch::Completed(id) => info!(%project, job_id = %id, "Job completed"),
        Dispatch::Failed(id) => warn!(%project, job_id = %id, "Job failed"),
    }
}

async fn run(args: Args) -> Result<(), String> {
    let config = load_config(&args.config)?;

    if let Command::Progress { job_id } = &args.command {
        let monitor = encode_queue::ProgressMonitor::new(&config.paths.log_dir);
        let report = encode_queue::ProgressReport::new(job_id, monitor.progress(job_id));
        let json = serde_json::to_string(&report).map_err(|e| e.to_string())?;
        println!("{}", json);
        return Ok(());
    }

    let daemon = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    }
    .map_err(|e: DaemonError| format!("Failed to initialize: {}", e))?;

    match args.command {
        Command::Process { project } => {
            let results = match project {
                Some(project) => {
                    let dispatch = daemon
                        .scheduler
                        .run_project(project)
                        .await
                        .map_err(|e| e.to_string())?;
                    vec![(project, dispatch)]
                }
                None => daemon.scheduler.run_once().await.map_err(|e| e.to_string())?,
            };
            for (project, dispatch) in &results {
                report(*project, dispatch);
            }
            daemon.persist_catalog().map_err(|e| e.to_string())?;
        }
        Command::Enqueue {
            params,
            job_id,
            scheduled,
        } => {
            let request = read_request(&params)?;
            let project = request.project();
            let (id, dispatch) = daemon
                .scheduler
                .enqueue(request, job_id, scheduled)
                .await
                .map_err(|e| e.to_string())?;
            report(project, &dispatch);
            daemon.persist_catalog().map_err(|e| e.to_string())?;
            println!("{}", id);
        }
        Command::Serve => {
            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                }
                on_signal.cancel();
            });
            info!(bind = %daemon.config.status.bind, "Starting encode queue service");
            daemon.run_with_server(shutdown).await.map_err(|e| e.to_string())?;
        }
        Command::Progress { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
