//! Clip-set finalize: join a scene's clips into one watermarked preview in
//! every clip-set format.

use super::clip_set::{self, clip_path, clip_root};
use super::{mismatched, run_stages, Pipeline, PipelineError, RunContext, Stage, StageFuture};
use crate::catalog::{ClipRecord, ClipSetRecord, WatermarkKind};
use crate::encode::{FormatOutput, TranscodeJob, FORMAT_PLACEHOLDER};
use crate::jobs::{ClipSetFinalizeRequest, ClipSetRequest, JobRequest, Project};
use crate::placement::{copy_into_place, recreate_dir};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

pub struct ClipSetFinalizePipeline;

struct FinalizeRun {
    request: ClipSetFinalizeRequest,
    /// Place of the scene on its DVD, copied onto every clip-set record.
    place: u32,
    volume: u32,
    slug: String,
    /// Source-format clip files in place order.
    files: Vec<PathBuf>,
    fhg_dir: PathBuf,
    joined: PathBuf,
    outputs: Vec<FormatOutput>,
}

const STAGES: &[Stage<FinalizeRun>] = &[
    Stage { name: "Loading clips", percent: 0, run: load },
    Stage { name: "Joining clips", percent: 20, run: join },
    Stage { name: "Encoding clip set", percent: 50, run: encode },
    Stage { name: "Placing clip set", percent: 90, run: place },
];

#[async_trait]
impl Pipeline for ClipSetFinalizePipeline {
    fn project(&self) -> Project {
        Project::ClipSetFinalize
    }

    fn stage_names(&self) -> Vec<&'static str> {
        STAGES.iter().map(|s| s.name).collect()
    }

    async fn run(&self, request: &JobRequest, ctx: &RunContext) -> Result<(), PipelineError> {
        let JobRequest::ClipSetFinalize(request) = request else {
            return Err(mismatched(Project::ClipSetFinalize, request));
        };
        let mut state = FinalizeRun::prepare(request, ctx)?;
        run_stages(Project::ClipSetFinalize, STAGES, &mut state, ctx).await
    }
}

impl FinalizeRun {
    fn prepare(request: &ClipSetFinalizeRequest, ctx: &RunContext) -> Result<Self, PipelineError> {
        let scene = ctx.env.scene(request.scene_id, request.site_id)?;
        Ok(Self {
            request: request.clone(),
            place: scene.place,
            volume: 0,
            slug: String::new(),
            files: Vec::new(),
            fhg_dir: PathBuf::new(),
            joined: PathBuf::new(),
            outputs: Vec::new(),
        })
    }
}

/// Clips of the scene, cutting a fresh set first when none are recorded.
async fn load_clips(
    request: &ClipSetFinalizeRequest,
    ctx: &RunContext,
) -> Result<Vec<ClipRecord>, PipelineError> {
    let catalog = &ctx.env.catalog;
    let clips = catalog.clips(request.scene_id, request.site_id)?;
    if !clips.is_empty() {
        return Ok(clips);
    }

    info!(job_id = %ctx.job_id, scene_id = request.scene_id, "No clips recorded, cutting a clip set first");
    let clip_request = ClipSetRequest {
        scene_id: request.scene_id,
        dvd_id: request.dvd_id,
        site_id: request.site_id,
        num_clips: None,
    };
    clip_set::run(&clip_request, ctx).await?;

    let clips = catalog.clips(request.scene_id, request.site_id)?;
    if clips.is_empty() {
        return Err(PipelineError::NotFound(format!(
            "No clips for scene #{}",
            request.scene_id
        )));
    }
    Ok(clips)
}

fn load<'a>(s: &'a mut FinalizeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let clips = load_clips(&s.request, ctx).await?;
        s.volume = clips[0].volume;

        let mut sources: Vec<&ClipRecord> = clips
            .iter()
            .filter(|c| c.format == cfg.clips.source_format)
            .collect();
        sources.sort_by_key(|c| c.place);
        if sources.is_empty() {
            return Err(PipelineError::NotFound("No files in source folder".to_string()));
        }
        s.files = sources.iter().map(|c| clip_path(cfg, c)).collect();
        if let Some(missing) = s.files.iter().find(|f| !f.is_file()) {
            return Err(PipelineError::NotFound(format!(
                "Clip file missing: {}",
                missing.display()
            )));
        }

        let r = &s.request;
        s.slug = ctx
            .env
            .catalog
            .dvd(r.dvd_id, r.site_id)?
            .map(|d| d.slug)
            .unwrap_or_else(|| r.dvd_id.to_string());
        Ok(())
    })
}

fn join<'a>(s: &'a mut FinalizeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let r = &s.request;
        let (width, height) = (cfg.clips.frame_width, cfg.clips.frame_height);
        let watermark = ctx
            .env
            .assets
            .watermark(r.site_id, WatermarkKind::Fhg, width, height)
            .await?;
        let intros = ctx
            .env
            .assets
            .intro_outro(r.site_id, width, height, &ctx.cancel)
            .await?;

        s.fhg_dir = clip_root(cfg, r.site_id, s.volume, r.dvd_id, r.scene_id).join("fhg");
        recreate_dir(&s.fhg_dir)?;
        ctx.env.catalog.purge_clip_set(r.scene_id, r.site_id, r.dvd_id)?;

        let mut concat_list = Vec::with_capacity(s.files.len() + 2);
        if let Some(intros) = &intros {
            concat_list.push(intros.intro.clone());
        }
        concat_list.extend(s.files.iter().cloned());
        if let Some(intros) = &intros {
            concat_list.push(intros.outro.clone());
        }
        s.joined = ctx.work_path(&format!("{}-fhg.mpg", s.slug));
        ctx.env
            .encoder
            .concat(&concat_list, &s.joined, Some(&watermark), &ctx.job_id, &ctx.cancel)
            .await?;
        Ok(())
    })
}

fn encode<'a>(s: &'a mut FinalizeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let template = ctx.work_path(&format!("{}{}.mp4", s.slug, FORMAT_PLACEHOLDER));
        let job = TranscodeJob::new(&s.joined, template, cfg.formats.clip_set_final.clone(), &ctx.job_id);
        s.outputs = ctx.env.encoder.transcode(&job, &ctx.cancel).await?;
        Ok(())
    })
}

fn place<'a>(s: &'a mut FinalizeRun, ctx: &'a RunContext) -> StageFuture<'a> {
    Box::pin(async move {
        let cfg = ctx.config();
        let r = &s.request;
        for output in &s.outputs {
            let filename = format!("{}-{}.mp4", s.slug, output.format);
            copy_into_place(&output.path, &s.fhg_dir.join(&filename))?;
            let dimensions = cfg
                .formats
                .clip_set_final
                .get(&output.format)
                .map(|spec| spec.size.clone())
                .filter(|size| !size.is_empty())
                .unwrap_or_else(|| format!("{}x{}", cfg.clips.frame_width, cfg.clips.frame_height));
            ctx.env.catalog.insert_clip_set(ClipSetRecord {
                scene_id: r.scene_id,
                site_id: r.site_id,
                dvd_id: r.dvd_id,
                filename,
                volume: s.volume,
                dimensions,
                timecode: 0,
                place: s.place,
            })?;
        }
        info!(job_id = %ctx.job_id, dir = %s.fhg_dir.display(), "Clip set finalized");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogData, IntroAssets, SceneFile};
    use crate::jobs::JobStatus;
    use crate::pipeline::tests::{catalog_data, harness_with, Harness};
    use crate::store::JobStore;
    use crate::testutil::EncoderCall;

    fn request() -> JobRequest {
        JobRequest::ClipSetFinalize(ClipSetFinalizeRequest {
            scene_id: 42,
            dvd_id: 7,
            site_id: 1,
        })
    }

    fn clip(place: u32, format: &str) -> ClipRecord {
        ClipRecord {
            scene_id: 42,
            site_id: 1,
            dvd_id: 7,
            place,
            format: format.to_string(),
            filename: format!("clip-{}.mpg", place),
            volume: 5,
            timecode: place * 100,
        }
    }

    /// Three recorded hd clips, listed out of order, plus one sd clip.
    fn clip_data() -> CatalogData {
        let mut data = catalog_data();
        data.clips = vec![clip(3, "hd"), clip(1, "hd"), clip(2, "hd"), clip(1, "sd")];
        data
    }

    fn with_clips(data: CatalogData) -> Harness {
        let h = harness_with(data);
        for place in 1..=3 {
            h.touch(&format!("tubeclips/1/5/7/42/clips/hd/clip-{}.mpg", place));
        }
        h
    }

    #[tokio::test]
    async fn test_clip_set_joined_in_place_order() {
        let h = with_clips(clip_data());

        let id = h.run(request()).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete, "{}", job.task.message);

        let (files, watermark) = h
            .encoder
            .calls()
            .into_iter()
            .find_map(|c| match c {
                EncoderCall::Concat { files, watermark, .. } => Some((files, watermark)),
                _ => None,
            })
            .unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["clip-1.mpg", "clip-2.mpg", "clip-3.mpg"]);
        assert!(files.iter().all(|f| f.to_string_lossy().contains("/hd/")));
        assert!(watermark.unwrap().ends_with("Sunset - fhg - 1280x720.png"));

        let fhg = h.path("tubeclips/1/5/7/42/fhg");
        assert!(fhg.join("summer-tour-hd.mp4").is_file());
        assert!(fhg.join("summer-tour-sd.mp4").is_file());

        let sets = h.catalog.snapshot().clip_sets;
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| s.place == 2 && s.volume == 5 && s.timecode == 0));
    }

    #[tokio::test]
    async fn test_intro_and_outro_wrap_clips() {
        let mut data = clip_data();
        data.intros.push(IntroAssets {
            site_id: 1,
            intro: "in.mov".to_string(),
            outro: "out.mov".to_string(),
            intro_duration: None,
            outro_duration: None,
        });
        let h = with_clips(data);
        h.touch("uploads/in.mov");
        h.touch("uploads/out.mov");

        let id = h.run(request()).await;
        assert_eq!(h.store.get(&id).unwrap().unwrap().status, JobStatus::Complete);

        let files = h
            .encoder
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EncoderCall::Concat { files, .. } => Some(files),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(files.len(), 5);
        assert!(files[0].ends_with("intros/in_1_1280_720.mpg"));
        assert!(files[4].ends_with("intros/out_1_1280_720.mpg"));
    }

    #[tokio::test]
    async fn test_cuts_clip_set_when_none_recorded() {
        let mut data = catalog_data();
        data.scene_files.push(SceneFile {
            scene_id: 42,
            site_id: 1,
            dvd_id: 7,
            format: "720".to_string(),
            filename: "summer-tour-scene3-720.mp4".to_string(),
            volume: 1,
            size: 10,
        });
        let h = harness_with(data);
        h.touch("storage/1/1/7/summer-tour-scene3-720.mp4");

        let id = h.run(request()).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete, "{}", job.task.message);
        assert_eq!(h.catalog.clips(42, 1).unwrap().len(), 6);
        assert_eq!(h.catalog.snapshot().clip_sets.len(), 2);
        assert!(h.path("tubeclips/1/1/7/42/fhg/summer-tour-hd.mp4").is_file());
    }

    #[tokio::test]
    async fn test_unknown_scene_fails_before_cutting() {
        let mut data = catalog_data();
        data.scenes.clear();
        let h = harness_with(data);

        let id = h.run(request()).await;

        assert_eq!(h.store.get(&id).unwrap().unwrap().status, JobStatus::Fail);
        assert!(h.encoder.calls().is_empty());
        assert!(!h.path("tubeclips/1").exists());
    }

    #[tokio::test]
    async fn test_no_source_format_clips_fails() {
        let mut data = catalog_data();
        data.clips = vec![clip(1, "sd")];
        let h = harness_with(data);

        let id = h.run(request()).await;

        let job = h.store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Fail);
        assert_eq!(job.task.message, "No files in source folder");
    }
}
