//! Cut trailer: assemble a trailer from random windows of the stored original.

use super::trailer::{
    encode_trailer, publish_trailer, splice_intro_outro, trailer_base_name, trailer_tooltips,
    TrailerIds,
};
use super::{mismatched, run_stages, Pipeline, PipelineError, RunContext, Stage, StageFuture};
use crate::catalog::WatermarkKind;
use crate::clips::plan_trailer_cuts;
use crate::encode::{ClipCut, ClipWindow};
use crate::jobs::{JobRequest, Project, TrailerCutRequest};
use crate::placement::recreate_dir;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

pub struct TrailerCutPipeline;

/// Cut options after applying configured defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CutOptions {
    duration_full: u32,
    clip_length: u32,
    trim_front: u32,
    trim_back: u32,
}

struct CutRun {
    ids: TrailerIds,
    base: String,
    source: PathBuf,
    options: CutOptions,
    windows: Vec<ClipWindow>,
    clips: Vec<PathBuf>,
    joined: PathBuf,
}

const STAGES: &[Stage<CutRun>] = &[
    Stage { name: "Planning cuts", percent: 0, run: plan },
    Stage { name: "Cutting clips", percent: 10, run: cut },
    Stage { name: "Joining clips", percent: 40, run: join },
    Stage { name: "Adding intro and outro", percent: 50, run: splice },
    Stage { name: "Generating tooltips", percent: 55, run: tooltips },
    Stage { name: "Encoding trailer", percent: 60, run: encode },
    Stage { name: "Publishing trailer", percent: 90, run: publish },
];

#[async_trait]
impl Pipeline for TrailerCutPipeline {
    fn project(&self) -> Project {
        Project::TrailerCut
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::TrailerCut(request) = request else {
            return Err(mismatched(Project::TrailerCut, request));
        };
        let mut state = CutRun::prepare(request, ctx)?;
        run_stages(Project::TrailerCut, STAGES, &mut state, ctx).await
    }
}

impl CutRun {
    fn prepare(request: &TrailerCutRequest, ctx: &RunContext) -> Result<Self, PipelineError> {
        let scene = ctx.env.scene(request.scene_id, request.site_id)?;
        let dvd = ctx.env.dvd(scene.dvd_id, request.site_id)?;
        let cfg = ctx.config();

        let original = ctx
            .env
            .catalog
            .original_file(request.scene_id, request.site_id)?
            .ok_or_else(|| {
                PipelineError::NotFound(format!(
                    "No original file recorded for scene #{}",
                    request.scene_id
                ))
            })?;
        let source = cfg
            .paths
            .originals
            .join(request.site_id.to_string())
            .join(original.volume.to_string())
            .join(scene.dvd_id.to_string())
            .join(&original.filename);
        if !source.is_file() {
            return Err(PipelineError::NotFound(format!(
                "Original file not found: {}",
                source.display()
            )));
        }

        let defaults = &cfg.trailer;
        Ok(Self {
            ids: TrailerIds {
                scene_id: request.scene_id,
                site_id: request.site_id,
                dvd_id: scene.dvd_id,
            },
            base: trailer_base_name(&dvd, &scene, defaults.format_id),
            source,
            options: CutOptions {
                duration_full: request.duration_full.unwrap_or(defaults.duration_full),
                clip_length: request.clip_length.unwrap_or(defaults.clip_length),
                trim_front: request.trim_front.unwrap_or(defaults.trim_front),
                trim_back: request.trim_back.unwrap_or(defaults.trim_back),
            },
            windows: Vec::new(),
            clips: Vec::new(),
            joined: PathBuf::new(),
        })
    }
}

fn plan<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let details = ctx.env.encoder.probe(&s.source).await?;
        let o = s.options;
        s.windows = plan_trailer_cuts(
            details.duration,
            o.duration_full,
            o.clip_length,
            o.trim_front,
            o.trim_back,
            &mut *ctx.rng(),
        )?;
        debug!(job_id = %ctx.job_id, windows = ?s.windows, "Planned trailer cuts");
        Ok(())
    })
}

fn cut<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let dest_dir = ctx.work_path("cuts");
        recreate_dir(&dest_dir)?;
        let cut = ClipCut {
            source: s.source.clone(),
            windows: s.windows.clone(),
            formats: ctx.config().formats.trailer_intermediate.clone(),
            dest_dir,
            log_id: ctx.job_id.clone(),
        };
        let mut clips = ctx.env.encoder.cut_clips(&cut, &ctx.cancel).await?;
        clips.sort_by_key(|c| c.place);
        s.clips = clips
            .into_iter()
            .filter_map(|c| c.outputs.into_iter().next().map(|o| o.path))
            .collect();
        Ok(())
    })
}

fn join<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let trailer = &ctx.config().trailer;
        let watermark = ctx
            .env
            .assets
            .watermark(
                s.ids.site_id,
                WatermarkKind::Scene,
                trailer.intro_width,
                trailer.intro_height,
            )
            .await?;
        let dest = ctx.work_path("concat.mpg");
        ctx.env
            .encoder
            .concat(&s.clips, &dest, Some(&watermark), &ctx.job_id, &ctx.cancel)
            .await?;
        s.joined = dest;
        Ok(())
    })
}

fn splice<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let dest = ctx.work_path(&format!("{}.mpg", s.base));
        splice_intro_outro(ctx, s.ids.site_id, &s.joined, &dest).await?;
        s.joined = dest;
        Ok(())
    })
}

fn tooltips<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move { trailer_tooltips(ctx, s.ids, &s.joined).await })
}

fn encode<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        s.joined = encode_trailer(ctx, &s.joined, &s.base).await?;
        Ok(())
    })
}

fn publish<'a>(s: &'a mut CutRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        publish_trailer(ctx, s.ids, &s.joined).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OriginalFile;
    use crate::encode::VideoDetails;
    use crate::jobs::JobStatus;
    use crate::pipeline::tests::{catalog_data, harness_with, Harness};
    use crate::store::JobStore;
    use crate::testutil::EncoderCall;

    fn with_original() -> Harness {
        let mut data = catalog_data();
        data.originals.push(OriginalFile {
            scene_id: 42,
            site_id: 1,
            dvd_id: 7,
            format_id: 14,
            filename: "scene.mov".to_string(),
            volume: 2,
            size: 6,
            encode_status: "done".to_string(),
            encode_id: "earlier".to_string(),
        });
        let h = harness_with(data);
        h.touch("originals/1/2/7/scene.mov");
        h
    }

    fn request(clip_length: Option<u32>, duration_full: Option<u32>) -> JobRequest {
        JobRequest::TrailerCut(TrailerCutRequest {
            scene_id: 42,
            site_id: 1,
            duration_full,
            clip_length,
            trim_front: None,
            trim_back: None,
        })
    }

    #[tokio::test]
    async fn test_cut_trailer_from_stored_original() {
        let h = with_original();

        let id = h.run(request(Some(30), Some(120))).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete, "{}", job.task.message);

        let cuts: Vec<_> = h
            .encoder
            .transcodes()
            .into_iter()
            .filter_map(|c| match c {
                EncoderCall::Transcode { start: Some(start), duration, .. } => Some((start, duration)),
                _ => None,
            })
            .collect();
        assert_eq!(cuts.len(), 4);
        for (i, (start, duration)) in cuts.iter().enumerate() {
            assert_eq!(*duration, Some(30));
            assert!(*start >= 90 && start + 30 <= 1800 - 90, "cut {} at {}", i, start);
        }

        let concat = h
            .encoder
            .calls()
            .into_iter()
            .find_map(|c| match c {
                EncoderCall::Concat { files, watermark, .. } => Some((files, watermark)),
                _ => None,
            })
            .unwrap();
        assert_eq!(concat.0.len(), 4);
        assert!(concat.0[0].ends_with("cuts/clip-1-mpg.mpg"));
        assert!(concat.1.unwrap().ends_with("Sunset - scene - 1280x720.png"));

        assert!(h
            .config()
            .paths
            .trailers
            .join("1/1/7/summer-tour-trailer-scene3-2.mp4")
            .is_file());
        assert_eq!(h.catalog.snapshot().trailers.len(), 1);
    }

    #[tokio::test]
    async fn test_defaults_give_one_cut() {
        let h = with_original();
        let id = h.run(request(None, None)).await;

        assert_eq!(h.store.get(&id).unwrap().unwrap().status, JobStatus::Complete);
        let windows = h
            .encoder
            .transcodes()
            .into_iter()
            .filter(|c| matches!(c, EncoderCall::Transcode { start: Some(_), .. }))
            .count();
        assert_eq!(windows, 1);
    }

    #[tokio::test]
    async fn test_missing_original_record_fails() {
        let h = harness_with(catalog_data());
        let id = h.run(request(None, None)).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert!(job.task.message.contains("No original file"));
        assert!(h.encoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_short_original_fails_validation() {
        let h = with_original();
        h.encoder.set_details(VideoDetails {
            width: Some(1280),
            height: Some(720),
            duration: 200.0,
        });

        let id = h.run(request(None, None)).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert!(job.task.message.contains("need at least 300s"));
        assert!(h.encoder.transcodes().is_empty());
    }
}
