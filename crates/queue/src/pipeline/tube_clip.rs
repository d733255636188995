//! Tube clips: a watermarked compilation of a scene's clips per tube channel.

use super::clip_set::{self, clip_path, clip_root};
use super::{
    file_name_of, mismatched, parse_size, run_stages, Pipeline, PipelineError, RunContext, Stage,
    StageFuture,
};
use crate::catalog::{ClipRecord, Tube, TubeEncode, WatermarkKind};
use crate::encode::TranscodeJob;
use crate::jobs::{ClipSetRequest, JobRequest, Project, TubeClipRequest};
use crate::placement::recreate_dir;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

pub struct TubeClipPipeline;

struct TubeRun {
    request: TubeClipRequest,
    tubes: Vec<Tube>,
    /// Clips per format, each in place order.
    by_format: BTreeMap<String, Vec<ClipRecord>>,
    volume: u32,
    slug: String,
    root: PathBuf,
}

const STAGES: &[Stage<TubeRun>] = &[
    Stage { name: "Cutting clip set", percent: 0, run: cut },
    Stage { name: "Loading clips", percent: 25, run: load },
    Stage { name: "Encoding tube clips", percent: 30, run: encode },
];

#[async_trait]
impl Pipeline for TubeClipPipeline {
    fn project(&self) -> Project {
        Project::TubeClip
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::TubeClip(request) = request else {
            return Err(mismatched(Project::TubeClip, request));
        };
        let mut state = TubeRun::prepare(request, ctx)?;
        run_stages(Project::TubeClip, STAGES, &mut state, ctx).await
    }
}

impl TubeRun {
    /// Resolve every requested tube before anything is cut or encoded.
    fn prepare(request: &TubeClipRequest, ctx: &RunContext) -> Result<Self, PipelineError> {
        let tubes = request
            .tubes
            .iter()
            .map(|&tube_id| {
                ctx.env.catalog.tube(tube_id)?.ok_or_else(|| {
                    PipelineError::NotFound(format!("Tube id {} not found", tube_id))
                })
            })
            .collect::<Result<Vec<Tube>, PipelineError>>()?;

        Ok(Self {
            request: request.clone(),
            tubes,
            by_format: BTreeMap::new(),
            volume: 0,
            slug: String::new(),
            root: PathBuf::new(),
        })
    }
}

fn cut<'a>(s: &'a mut TubeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let clip_request = ClipSetRequest {
            scene_id: s.request.scene_id,
            dvd_id: s.request.dvd_id,
            site_id: s.request.site_id,
            num_clips: None,
        };
        clip_set::run(&clip_request, ctx).await
    })
}

fn load<'a>(s: &'a mut TubeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let catalog = &ctx.env.catalog;
        let r = &s.request;
        let clips = catalog.clips(r.scene_id, r.site_id)?;
        s.volume = clips
            .first()
            .map(|c| c.volume)
            .ok_or_else(|| PipelineError::NotFound("Unable to retrieve volume".to_string()))?;

        for clip in clips {
            s.by_format.entry(clip.format.clone()).or_default().push(clip);
        }
        for list in s.by_format.values_mut() {
            list.sort_by_key(|c| c.place);
        }

        s.slug = catalog
            .dvd(r.dvd_id, r.site_id)?
            .map(|d| d.slug)
            .unwrap_or_else(|| "tube".to_string());
        s.root = clip_root(ctx.config(), r.site_id, s.volume, r.dvd_id, r.scene_id);
        Ok(())
    })
}

fn encode<'a>(s: &'a mut TubeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let r = &s.request;
        for tube in &s.tubes {
            for (format, clips) in &s.by_format {
                let dest = encode_for_tube(ctx, r, tube, format, clips, &s.slug).await?;
                let placed = s
                    .root
                    .join("tubes")
                    .join(tube.tube_id.to_string())
                    .join(format)
                    .join(file_name_of(&dest));
                ctx.env.encoder.fast_start(&dest, &placed, &ctx.cancel).await?;

                ctx.env.catalog.replace_tube_encode(TubeEncode {
                    scene_id: r.scene_id,
                    site_id: r.site_id,
                    dvd_id: r.dvd_id,
                    tube_id: tube.tube_id,
                    format: format.clone(),
                    filename: file_name_of(&placed),
                    volume: s.volume,
                })?;
                info!(job_id = %ctx.job_id, tube = %tube.name, %format, path = %placed.display(), "Tube clip placed");

                // Each encode starts from an empty working directory.
                recreate_dir(&ctx.work_dir)?;
            }
        }
        Ok(())
    })
}

/// Join one format's clips under the tube's watermark, add the site's intro
/// and outro, and encode the tube format. Returns the file in the working
/// directory.
async fn encode_for_tube(
    ctx: &RunContext,
    request: &TubeClipRequest,
    tube: &Tube,
    format: &str,
    clips: &[ClipRecord],
    slug: &str,
) -> Result<PathBuf, PipelineError> {
    let cfg = ctx.config();
    let (width, height) = cfg
        .formats
        .clip_cut
        .get(format)
        .and_then(|spec| parse_size(&spec.size))
        .unwrap_or((cfg.clips.frame_width, cfg.clips.frame_height));

    let watermark = ctx
        .env
        .assets
        .watermark(tube.tube_id, WatermarkKind::Tube, width, height)
        .await?;
    let files: Vec<PathBuf> = clips.iter().map(|c| clip_path(cfg, c)).collect();
    let joined = ctx.work_path("tmp.mpg");
    ctx.env
        .encoder
        .concat(&files, &joined, Some(&watermark), &ctx.job_id, &ctx.cancel)
        .await?;

    let source = match ctx
        .env
        .assets
        .intro_outro(request.site_id, width, height, &ctx.cancel)
        .await?
    {
        Some(intros) => {
            let spliced = ctx.work_path("concat.mpg");
            ctx.env
                .encoder
                .concat(&intros.around(&joined), &spliced, None, &ctx.job_id, &ctx.cancel)
                .await?;
            ctx.discard(&joined);
            spliced
        }
        None => joined,
    };

    let dest = ctx.work_path(&format!(
        "{}-{}-{}-{}.mp4",
        slug, request.dvd_id, request.site_id, tube.name
    ));
    let job = TranscodeJob::new(&source, &dest, cfg.formats.tube_final.clone(), &ctx.job_id);
    ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
    Ok(dest)
}
