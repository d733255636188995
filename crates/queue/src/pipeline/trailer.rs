//! Trailer pipeline, plus the encode-and-publish steps shared with cut
//! trailers.

use super::{
    file_name_of, mismatched, run_stages, Pipeline, PipelineError, RunContext, Stage, StageFuture,
};
use crate::catalog::{Dvd, Scene, TrailerOriginal, TrailerRecord, WatermarkKind};
use crate::jobs::{JobRequest, Project, TrailerRequest};
use crate::placement::{copy_into_place, file_size, highest_volume, recreate_dir};
use crate::encode::TranscodeJob;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct TrailerPipeline;

/// Identifiers every trailer record carries.
#[derive(Debug, Clone, Copy)]
pub(super) struct TrailerIds {
    pub scene_id: u64,
    pub site_id: u64,
    pub dvd_id: u64,
}

/// `{slug}-trailer-scene{id_place}-{format_id}`
pub(super) fn trailer_base_name(dvd: &Dvd, scene: &Scene, format_id: u32) -> String {
    format!("{}-trailer-scene{}-{}", dvd.slug, scene.id_place, format_id)
}

/// Recreate the trailer tooltip directory and fill it from `source`.
pub(super) async fn trailer_tooltips(
    ctx: &RunContext,
    ids: TrailerIds,
    source: &Path,
) -> Result<(), PipelineError> {
    let dir = ctx
        .config()
        .paths
        .screenshots
        .join(ids.site_id.to_string())
        .join(ids.dvd_id.to_string())
        .join(ids.scene_id.to_string())
        .join("tooltip_trailer");
    recreate_dir(&dir)?;
    ctx.env.encoder.thumbnails(source, &dir, &ctx.cancel).await?;
    Ok(())
}

/// Wrap `input` in the site's intro and outro, writing `dest`.
///
/// Without intro/outro assets `input` is renamed to `dest`.
pub(super) async fn splice_intro_outro(
    ctx: &RunContext,
    site_id: u64,
    input: &Path,
    dest: &Path,
) -> Result<(), PipelineError> {
    let trailer = &ctx.config().trailer;
    let intros = ctx
        .env
        .assets
        .intro_outro(site_id, trailer.intro_width, trailer.intro_height, &ctx.cancel)
        .await?;

    match intros {
        Some(intros) => {
            let spliced = ctx.work_path("spliced.mpg");
            ctx.env
                .encoder
                .concat(&intros.around(input), &spliced, None, &ctx.job_id, &ctx.cancel)
                .await?;
            ctx.discard(input);
            fs::rename(&spliced, dest).map_err(|e| PipelineError::environment(dest, e))?;
        }
        None => {
            info!(job_id = %ctx.job_id, site_id, "No intro/outro, skipping");
            if input != dest {
                fs::rename(input, dest).map_err(|e| PipelineError::environment(dest, e))?;
            }
        }
    }
    Ok(())
}

/// Encode the joined trailer into its final container in the working directory.
pub(super) async fn encode_trailer(
    ctx: &RunContext,
    source: &Path,
    base: &str,
) -> Result<PathBuf, PipelineError> {
    let dest = ctx.work_path(&format!("{}.mp4", base));
    let job = TranscodeJob::new(source, &dest, ctx.config().formats.trailer.clone(), &ctx.job_id);
    ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
    Ok(dest)
}

/// Fast-start `mp4` into the highest trailer volume and replace the trailer record.
pub(super) async fn publish_trailer(
    ctx: &RunContext,
    ids: TrailerIds,
    mp4: &Path,
) -> Result<PathBuf, PipelineError> {
    let cfg = ctx.config();
    let site_root = cfg.paths.trailers.join(ids.site_id.to_string());
    let volume = highest_volume(&site_root, 1);
    let filename = file_name_of(mp4);
    let dest = site_root
        .join(volume.to_string())
        .join(ids.dvd_id.to_string())
        .join(&filename);

    ctx.report(90, format!("Fast-start {} into storage", filename))?;
    ctx.env.encoder.fast_start(mp4, &dest, &ctx.cancel).await?;

    let duration = match ctx.env.encoder.probe(&dest).await {
        Ok(details) if details.duration > 0.0 => Some(details.duration),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %dest.display(), error = %e, "Could not probe trailer duration");
            None
        }
    };

    ctx.env.catalog.replace_trailer(TrailerRecord {
        scene_id: ids.scene_id,
        site_id: ids.site_id,
        dvd_id: ids.dvd_id,
        format_id: cfg.trailer.format_id,
        filename,
        volume,
        size: file_size(&dest),
        duration,
    })?;
    Ok(dest)
}

struct TrailerRun {
    request: TrailerRequest,
    ids: TrailerIds,
    base: String,
    size: (u32, u32),
    intermediate: PathBuf,
}

const STAGES: &[Stage<TrailerRun>] = &[
    Stage { name: "Generating tooltips", percent: 0, run: tooltips },
    Stage { name: "Storing trailer original", percent: 5, run: store_original },
    Stage { name: "Encoding intermediate", percent: 10, run: encode_intermediate },
    Stage { name: "Adding intro and outro", percent: 50, run: splice },
    Stage { name: "Encoding trailer", percent: 50, run: encode },
    Stage { name: "Publishing trailer", percent: 90, run: publish },
];

#[async_trait]
impl Pipeline for TrailerPipeline {
    fn project(&self) -> Project {
        Project::Trailer
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::Trailer(request) = request else {
            return Err(mismatched(Project::Trailer, request));
        };

        let dvd = ctx.env.dvd(request.dvd_id, request.site_id)?;
        let scene = ctx.env.scene(request.scene_id, request.site_id)?;
        if !request.file_location.is_file() {
            return Err(PipelineError::Validation(format!(
                "File not found: {}",
                request.file_location.display()
            )));
        }
        let details = ctx.env.encoder.probe(&request.file_location).await?;

        let mut state = TrailerRun {
            request: request.clone(),
            ids: TrailerIds {
                scene_id: request.scene_id,
                site_id: request.site_id,
                dvd_id: request.dvd_id,
            },
            base: trailer_base_name(&dvd, &scene, ctx.config().trailer.format_id),
            size: ctx.env.frame_size(&details),
            intermediate: request.file_location.clone(),
        };
        run_stages(Project::Trailer, STAGES, &mut state, ctx).await
    }
}

fn tooltips<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move { trailer_tooltips(ctx, s.ids, &s.request.file_location).await })
}

fn store_original<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let ids = s.ids;
        let site_root = cfg.paths.trailer_originals.join(ids.site_id.to_string());
        let filename = format!("{}.mov", s.base);
        let dest = site_root.join("1").join(ids.dvd_id.to_string()).join(&filename);

        if s.request.file_location == dest {
            ctx.report(5, "Using stored trailer original")?;
            return Ok(());
        }
        ctx.report(5, "Copying trailer original to storage")?;
        let size = copy_into_place(&s.request.file_location, &dest)?;
        ctx.env.catalog.replace_trailer_original(TrailerOriginal {
            scene_id: ids.scene_id,
            site_id: ids.site_id,
            dvd_id: ids.dvd_id,
            format_id: cfg.trailer.original_format_id,
            filename,
            volume: highest_volume(&site_root, 1),
            size,
        })?;
        Ok(())
    })
}

fn encode_intermediate<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let (width, height) = s.size;
        let watermark = ctx
            .env
            .assets
            .watermark(s.ids.site_id, WatermarkKind::Scene, width, height)
            .await?;
        let dest = ctx.work_path(&format!("{}.mpg", s.base));
        let job = TranscodeJob::new(
            &s.request.file_location,
            &dest,
            ctx.config().formats.trailer_intermediate.clone(),
            &ctx.job_id,
        )
        .with_watermark(Some(watermark));
        ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
        s.intermediate = dest;
        Ok(())
    })
}

fn splice<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        splice_intro_outro(ctx, s.ids.site_id, &s.intermediate, &s.intermediate).await
    })
}

fn encode<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        s.intermediate = encode_trailer(ctx, &s.intermediate, &s.base).await?;
        Ok(())
    })
}

fn publish<'a>(s: &'a mut TrailerRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        publish_trailer(ctx, s.ids, &s.intermediate).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IntroAssets;
    use crate::jobs::JobStatus;
    use crate::pipeline::tests::{catalog_data, harness, harness_with};
    use crate::store::JobStore;
    use crate::testutil::EncoderCall;

    fn request(file: &Path) -> JobRequest {
        JobRequest::Trailer(TrailerRequest {
            scene_id: 42,
            dvd_id: 7,
            site_id: 1,
            file_location: file.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_trailer_is_published_with_fast_start() {
        let h = harness();
        let source = h.touch("incoming/trailer.mov");

        let id = h.run(request(&source)).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete, "{}", job.task.message);
        assert!(!h.config().paths.work_dir.join(&id).exists());

        let published = h
            .config()
            .paths
            .trailers
            .join("1/1/7/summer-tour-trailer-scene3-2.mp4");
        assert!(published.is_file());
        let original = h
            .config()
            .paths
            .trailer_originals
            .join("1/1/7/summer-tour-trailer-scene3-2.mov");
        assert!(original.is_file());

        let data = h.catalog.snapshot();
        assert_eq!(data.trailers.len(), 1);
        assert_eq!(data.trailers[0].filename, "summer-tour-trailer-scene3-2.mp4");
        assert_eq!(data.trailers[0].duration, Some(1800.0));
        assert_eq!(data.trailer_originals[0].format_id, 17);

        let calls = h.encoder.calls();
        let fast_start = calls
            .iter()
            .position(|c| matches!(c, EncoderCall::FastStart { dst, .. } if dst == &published))
            .unwrap();
        let last_transcode = calls
            .iter()
            .rposition(|c| matches!(c, EncoderCall::Transcode { .. }))
            .unwrap();
        assert!(fast_start > last_transcode);
        assert!(h
            .config()
            .paths
            .screenshots
            .join("1/7/42/tooltip_trailer/tooltip-001.jpg")
            .is_file());
    }

    #[tokio::test]
    async fn test_trailer_rerun_replaces_records() {
        let h = harness();
        let source = h.touch("incoming/trailer.mov");
        h.run(request(&source)).await;
        h.run(request(&source)).await;

        let data = h.catalog.snapshot();
        assert_eq!(data.trailers.len(), 1);
        assert_eq!(data.trailer_originals.len(), 1);
    }

    #[tokio::test]
    async fn test_trailer_uses_intro_at_trailer_size() {
        let mut data = catalog_data();
        data.intros.push(IntroAssets {
            site_id: 1,
            intro: "in.mov".to_string(),
            outro: "out.mov".to_string(),
            intro_duration: Some(4),
            outro_duration: Some(4),
        });
        let h = harness_with(data);
        h.touch("uploads/in.mov");
        h.touch("uploads/out.mov");
        let source = h.touch("incoming/trailer.mov");

        let id = h.run(request(&source)).await;
        assert_eq!(h.store.get(&id).unwrap().unwrap().status, JobStatus::Complete);

        let concat = h
            .encoder
            .calls()
            .into_iter()
            .find_map(|c| match c {
                EncoderCall::Concat { files, .. } => Some(files),
                _ => None,
            })
            .unwrap();
        assert!(concat[0].ends_with("in_1_1280_720.mpg"));
        assert!(concat[1].ends_with("summer-tour-trailer-scene3-2.mpg"));
    }

    #[tokio::test]
    async fn test_missing_trailer_file_is_validation_failure() {
        let h = harness();
        let id = h.run(request(&h.path("nowhere.mov"))).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert!(job.task.message.starts_with("File not found"));
    }
}
