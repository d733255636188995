//! Clip set: cut evenly spread clips out of a scene and record them.

use super::{file_name_of, mismatched, run_stages, Pipeline, PipelineError, RunContext, Stage, StageFuture};
use crate::catalog::ClipRecord;
use crate::clips::plan_clip_set;
use crate::encode::{ClipCut, ClipWindow};
use crate::jobs::{ClipSetRequest, JobRequest, Project};
use crate::placement::{move_into_place, recreate_dir};
use async_trait::async_trait;
use encode_queue_config::Config;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ClipSetPipeline;

/// `{clips}/{site}/{volume}/{dvd}/{scene}`, the root of every clip product of a scene.
pub fn clip_root(cfg: &Config, site_id: u64, volume: u32, dvd_id: u64, scene_id: u64) -> PathBuf {
    cfg.paths
        .clips
        .join(site_id.to_string())
        .join(volume.to_string())
        .join(dvd_id.to_string())
        .join(scene_id.to_string())
}

struct ClipSetRun {
    request: ClipSetRequest,
    volume: u32,
    root: PathBuf,
    source: PathBuf,
    windows: Vec<ClipWindow>,
}

const STAGES: &[Stage<ClipSetRun>] = &[
    Stage { name: "Planning clips", percent: 0, run: plan },
    Stage { name: "Cutting clips", percent: 10, run: cut },
];

#[async_trait]
impl Pipeline for ClipSetPipeline {
    fn project(&self) -> Project {
        Project::ClipSet
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::ClipSet(request) = request else {
            return Err(mismatched(Project::ClipSet, request));
        };
        run(request, ctx).await
    }
}

/// Cut and record a fresh clip set, replacing any earlier one.
///
/// Also the first step of the clip-set finalize and tube pipelines.
pub async fn run(request: &ClipSetRequest, ctx: &RunContext) -> Result<(), PipelineError> {
    let mut state = ClipSetRun::prepare(request, ctx)?;
    run_stages(Project::ClipSet, STAGES, &mut state, ctx).await
}

impl ClipSetRun {
    fn prepare(request: &ClipSetRequest, ctx: &RunContext) -> Result<Self, PipelineError> {
        let cfg = ctx.config();
        let catalog = &ctx.env.catalog;
        let scene_files = catalog.scene_files(request.scene_id, request.site_id)?;
        let volume = scene_files
            .first()
            .map(|f| f.volume)
            .unwrap_or(cfg.clips.default_volume);

        let original = catalog
            .original_file(request.scene_id, request.site_id)?
            .map(|o| {
                cfg.paths
                    .originals
                    .join(request.site_id.to_string())
                    .join(o.volume.to_string())
                    .join(request.dvd_id.to_string())
                    .join(o.filename)
            })
            .filter(|path| path.is_file());

        // Fall back to the largest placed encode.
        let source = match original {
            Some(path) => path,
            None => scene_files
                .iter()
                .map(|f| {
                    let path = cfg
                        .paths
                        .storage
                        .join(request.site_id.to_string())
                        .join(f.volume.to_string())
                        .join(request.dvd_id.to_string())
                        .join(&f.filename);
                    (f.size, path)
                })
                .filter(|(_, path)| path.is_file())
                .max_by_key(|(size, _)| *size)
                .map(|(_, path)| path)
                .ok_or_else(|| {
                    PipelineError::NotFound(format!(
                        "No source video for scene #{}",
                        request.scene_id
                    ))
                })?,
        };

        Ok(Self {
            request: request.clone(),
            volume,
            root: clip_root(cfg, request.site_id, volume, request.dvd_id, request.scene_id),
            source,
            windows: Vec::new(),
        })
    }
}

fn plan<'a>(s: &'a mut ClipSetRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let clips = &ctx.config().clips;
        let details = ctx.env.encoder.probe(&s.source).await?;
        s.windows = plan_clip_set(
            details.duration,
            s.request.num_clips.unwrap_or(clips.num_clips),
            clips.clip_length_secs,
            clips.trim_secs,
            clips.jitter_secs,
            &mut *ctx.rng(),
        )?;
        debug!(job_id = %ctx.job_id, windows = ?s.windows, "Planned clip set");
        Ok(())
    })
}

fn cut<'a>(s: &'a mut ClipSetRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let req = &s.request;
        let clips_dir = s.root.join("clips");
        recreate_dir(&clips_dir)?;
        ctx.env.catalog.purge_clips(req.scene_id, req.site_id)?;

        let work = ctx.work_path("clips");
        recreate_dir(&work)?;
        let cut = ClipCut {
            source: s.source.clone(),
            windows: s.windows.clone(),
            formats: ctx.config().formats.clip_cut.clone(),
            dest_dir: work,
            log_id: ctx.job_id.clone(),
        };
        let clips = ctx.env.encoder.cut_clips(&cut, &ctx.cancel).await?;

        for clip in clips {
            for output in clip.outputs {
                let dest = clips_dir
                    .join(&output.format)
                    .join(placed_name(clip.place, &output.path));
                move_into_place(&output.path, &dest)?;
                ctx.env.catalog.insert_clip(ClipRecord {
                    scene_id: req.scene_id,
                    site_id: req.site_id,
                    dvd_id: req.dvd_id,
                    place: clip.place,
                    format: output.format,
                    filename: file_name_of(&dest),
                    volume: s.volume,
                    timecode: clip.window.start,
                })?;
            }
        }
        info!(job_id = %ctx.job_id, dir = %clips_dir.display(), "Clip set recorded");
        Ok(())
    })
}

/// `clip-{place}.{ext}`
fn placed_name(place: u32, cut: &Path) -> String {
    match cut.extension() {
        Some(ext) => format!("clip-{}.{}", place, ext.to_string_lossy()),
        None => format!("clip-{}", place),
    }
}

/// Path of a recorded clip on disk.
pub fn clip_path(cfg: &Config, clip: &ClipRecord) -> PathBuf {
    clip_root(cfg, clip.site_id, clip.volume, clip.dvd_id, clip.scene_id)
        .join("clips")
        .join(&clip.format)
        .join(&clip.filename)
}
