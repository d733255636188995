//! Scene pipeline: store the original, encode every final format and place
//! the results in durable storage.

use super::{file_name_of, mismatched, run_stages, Pipeline, PipelineError, RunContext, Stage, StageFuture};
use crate::catalog::{Dvd, OriginalFile, Scene, SceneFile, WatermarkKind};
use crate::encode::{EncodeError, FormatOutput, TranscodeJob, FORMAT_PLACEHOLDER};
use crate::jobs::{JobRequest, Project, SceneRequest};
use crate::placement::{copy_into_place, ensure_dir, file_size, highest_volume, move_into_place};
use async_trait::async_trait;
use encode_queue_config::FormatSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ScenePipeline;

struct SceneRun {
    request: SceneRequest,
    dvd: Dvd,
    scene: Scene,
    size: (u32, u32),
    /// Current input of the next encode.
    intermediate: PathBuf,
}

const STAGES: &[Stage<SceneRun>] = &[
    Stage { name: "Storing original", percent: 0, run: store_original },
    Stage { name: "Generating tooltips", percent: 5, run: generate_tooltips },
    Stage { name: "Encoding intermediate", percent: 10, run: encode_intermediate },
    Stage { name: "Adding intro and outro", percent: 50, run: splice_intros },
    Stage { name: "Encoding final formats", percent: 50, run: encode_finals },
    Stage { name: "Placing files", percent: 90, run: place_files },
    Stage { name: "Removing working directory", percent: 100, run: remove_work_dir },
];

#[async_trait]
impl Pipeline for ScenePipeline {
    fn project(&self) -> Project {
        Project::Scene
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::Scene(request) = request else {
            return Err(mismatched(Project::Scene, request));
        };
        let mut state = SceneRun::prepare(request, ctx).await?;
        run_stages(Project::Scene, STAGES, &mut state, ctx).await
    }
}

impl SceneRun {
    async fn prepare(request: &SceneRequest, ctx: &RunContext) -> Result<Self, PipelineError> {
        let dvd = ctx.env.dvd(request.dvd_id, request.site_id)?;
        let scene = ctx.env.scene(request.scene_id, request.site_id)?;
        if !request.file_location.is_file() {
            return Err(PipelineError::Validation(format!(
                "File not found: {}",
                request.file_location.display()
            )));
        }

        let details = ctx.env.encoder.probe(&request.file_location).await?;
        let size = ctx.env.frame_size(&details);
        debug!(job_id = %ctx.job_id, ?details, "Probed source");

        Ok(Self {
            request: request.clone(),
            dvd,
            scene,
            size,
            intermediate: request.file_location.clone(),
        })
    }

    fn base_name(&self) -> String {
        base_name(&self.dvd, &self.scene)
    }
}

fn base_name(dvd: &Dvd, scene: &Scene) -> String {
    format!("{}-scene{}", dvd.slug, scene.id_place)
}

/// Files the final encode writes into the working directory.
fn final_outputs(formats: &FormatSet, work_dir: &Path, dvd: &Dvd, scene: &Scene) -> Vec<FormatOutput> {
    let template = work_dir.join(format!("{}{}.mpg", base_name(dvd, scene), FORMAT_PLACEHOLDER));
    TranscodeJob::new(PathBuf::new(), template, formats.clone(), "").outputs()
}

fn store_original<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let req = &s.request;
        let volume = cfg.scene.originals_volume;
        let dir = cfg
            .paths
            .originals
            .join(req.site_id.to_string())
            .join(volume.to_string())
            .join(req.dvd_id.to_string());
        let filename = file_name_of(&req.file_location);
        let canonical = dir.join(&filename);

        ctx.env.catalog.upsert_original_file(OriginalFile {
            scene_id: req.scene_id,
            site_id: req.site_id,
            dvd_id: req.dvd_id,
            format_id: cfg.scene.original_format_id,
            filename,
            volume,
            size: file_size(&req.file_location),
            encode_status: "pending".to_string(),
            encode_id: ctx.job_id.clone(),
        })?;

        if req.file_location == canonical {
            ctx.report(0, "Using stored original")?;
            return Ok(());
        }
        ensure_dir(&dir)?;
        ctx.report(0, "Copying original to storage")?;
        copy_into_place(&req.file_location, &canonical)?;
        Ok(())
    })
}

fn generate_tooltips<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let req = &s.request;
        let dir = ctx
            .config()
            .paths
            .screenshots
            .join(req.site_id.to_string())
            .join(req.dvd_id.to_string())
            .join(req.scene_id.to_string())
            .join("tooltip");
        ensure_dir(&dir)?;
        ctx.env
            .encoder
            .thumbnails(&req.file_location, &dir, &ctx.cancel)
            .await?;
        Ok(())
    })
}

fn encode_intermediate<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let (width, height) = s.size;
        let watermark = ctx
            .env
            .assets
            .watermark(s.request.site_id, WatermarkKind::Scene, width, height)
            .await?;
        let formats: FormatSet = ctx
            .config()
            .formats
            .scene_intermediate
            .iter()
            .map(|(name, spec)| (name.clone(), spec.with_size(width, height)))
            .collect();

        let dest = ctx.work_path(&format!("{}-tmp.mpg", s.base_name()));
        let job = TranscodeJob::new(&s.request.file_location, &dest, formats, &ctx.job_id)
            .with_watermark(Some(watermark));
        ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
        s.intermediate = dest;
        Ok(())
    })
}

fn splice_intros<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let (width, height) = s.size;
        let Some(intros) = ctx
            .env
            .assets
            .intro_outro(s.request.site_id, width, height, &ctx.cancel)
            .await?
        else {
            info!(job_id = %ctx.job_id, site_id = s.request.site_id, "No intro/outro, skipping");
            return Ok(());
        };

        let concat = ctx.work_path("concat.mpg");
        ctx.env
            .encoder
            .concat(&intros.around(&s.intermediate), &concat, None, &ctx.job_id, &ctx.cancel)
            .await?;
        ctx.discard(&s.intermediate);

        let spliced = ctx.work_path(&format!("{}.mpg", s.base_name()));
        fs::rename(&concat, &spliced).map_err(|e| PipelineError::environment(&spliced, e))?;
        s.intermediate = spliced;
        Ok(())
    })
}

fn encode_finals<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let template = ctx.work_path(&format!("{}{}.mpg", s.base_name(), FORMAT_PLACEHOLDER));
        let job = TranscodeJob::new(
            &s.intermediate,
            template,
            ctx.config().formats.scene.clone(),
            &ctx.job_id,
        );
        ctx.report(
            50,
            format!("Encoding video files: {}-{}", s.request.dvd_id, s.request.scene_id),
        )?;
        ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
        Ok(())
    })
}

fn place_files<'a>(s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move { place_outputs(&s.request, &s.dvd, &s.scene, ctx) })
}

fn remove_work_dir<'a>(_s: &'a mut SceneRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        if ctx.work_dir.exists() {
            fs::remove_dir_all(&ctx.work_dir)
                .map_err(|e| PipelineError::environment(&ctx.work_dir, e))?;
        }
        Ok(())
    })
}

/// Move the final encodes into storage and record them.
///
/// Every expected file must be either still in the working directory or
/// already in storage, so a repeated call after a partial placement is safe.
fn place_outputs(
    request: &SceneRequest,
    dvd: &Dvd,
    scene: &Scene,
    ctx: &RunContext,
) -> Result<(), PipelineError> {
    let cfg = ctx.config();
    let site_root = cfg.paths.storage.join(request.site_id.to_string());
    let volume = highest_volume(&site_root, 1);
    let dest_dir = site_root
        .join(volume.to_string())
        .join(request.dvd_id.to_string());

    let outputs = final_outputs(&cfg.formats.scene, &ctx.work_dir, dvd, scene);
    let mut placements = Vec::with_capacity(outputs.len());
    for output in outputs {
        let filename = file_name_of(&output.path);
        let dest = dest_dir.join(&filename);
        if !output.path.is_file() && !dest.is_file() {
            return Err(EncodeError::MissingOutput(output.path).into());
        }
        placements.push((output, filename, dest));
    }

    let mut files = Vec::with_capacity(placements.len());
    for (output, filename, dest) in placements {
        if output.path.is_file() {
            debug!(from = %output.path.display(), to = %dest.display(), "Placing file");
            move_into_place(&output.path, &dest)?;
        }
        files.push(SceneFile {
            scene_id: request.scene_id,
            site_id: request.site_id,
            dvd_id: request.dvd_id,
            format: output.format,
            filename,
            volume,
            size: file_size(&dest),
        });
    }

    let catalog = &ctx.env.catalog;
    catalog.replace_scene_files(request.scene_id, request.site_id, files)?;
    if let Some(mut original) = catalog.original_file(request.scene_id, request.site_id)? {
        original.encode_status = "done".to_string();
        catalog.upsert_original_file(original)?;
    }
    catalog.set_tooltips_generated(request.scene_id, request.site_id)?;
    info!(job_id = %ctx.job_id, volume, dir = %dest_dir.display(), "Scene files placed");
    Ok(())
}

/// Place the outputs of an already finished encode and remove the working
/// directory. Used to recover jobs that stopped before placement.
pub async fn finalize(request: &SceneRequest, ctx: &RunContext) -> Result<(), PipelineError> {
    let dvd = ctx.env.dvd(request.dvd_id, request.site_id)?;
    let scene = ctx.env.scene(request.scene_id, request.site_id)?;
    place_outputs(request, &dvd, &scene, ctx)?;
    if ctx.work_dir.exists() {
        fs::remove_dir_all(&ctx.work_dir).map_err(|e| PipelineError::environment(&ctx.work_dir, e))?;
    }
    Ok(())
}
