//! Encoder process abstraction
//!
//! Pipelines talk to the transcoding tool only through [`Encoder`]; the
//! ffmpeg-backed implementation lives in [`ffmpeg`].

pub mod ffmpeg;

pub use ffmpeg::{parse_ffprobe_output, FfmpegEncoder};

use async_trait::async_trait;
use encode_queue_config::{FormatSet, FormatSpec};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Placeholder in a destination template that is replaced by `-{format}`.
pub const FORMAT_PLACEHOLDER: &str = "%d";

/// Error type for encoder operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The tool could not be started
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited with non-zero status
    #[error("{tool} failed with exit code: {code}")]
    Failed { tool: String, code: i32 },

    /// The tool was terminated by a signal
    #[error("{tool} was terminated by signal")]
    Terminated { tool: String },

    #[error("Encode cancelled")]
    Cancelled,

    /// An output the tool should have produced does not exist
    #[error("Expected output not found: {0}")]
    MissingOutput(PathBuf),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    /// Exit code of the failed tool, when there is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            EncodeError::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Source dimensions and length as reported by the probe tool.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VideoDetails {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds; 0 when unknown.
    pub duration: f64,
}

impl VideoDetails {
    /// Dimensions with `default` filling in whatever the probe could not report.
    pub fn size_or(&self, default: (u32, u32)) -> (u32, u32) {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => default,
        }
    }
}

/// One transcode invocation: a source into every format of a set.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub source: PathBuf,
    /// Output path, or a template containing [`FORMAT_PLACEHOLDER`].
    pub destination: PathBuf,
    pub formats: FormatSet,
    pub watermark: Option<PathBuf>,
    /// Seek offset in seconds.
    pub start: Option<u32>,
    /// Output length in seconds.
    pub duration: Option<u32>,
    /// Names the log file, `{log_dir}/{log_id}.txt`.
    pub log_id: String,
}

impl TranscodeJob {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        formats: FormatSet,
        log_id: &str,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            formats,
            watermark: None,
            start: None,
            duration: None,
            log_id: log_id.to_string(),
        }
    }

    pub fn with_watermark(mut self, watermark: Option<PathBuf>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn window(mut self, start: u32, duration: u32) -> Self {
        self.start = Some(start);
        self.duration = Some(duration);
        self
    }

    /// Every file this job is expected to produce, in format-name order.
    pub fn outputs(&self) -> Vec<FormatOutput> {
        self.formats
            .iter()
            .map(|(name, spec)| FormatOutput {
                format: name.clone(),
                path: expand_destination(&self.destination, name, spec),
            })
            .collect()
    }
}

/// A produced file and the logical format it was encoded as.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOutput {
    pub format: String,
    pub path: PathBuf,
}

/// Seconds into the source and length of one clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipWindow {
    pub start: u32,
    pub length: u32,
}

/// Cut a list of windows out of one source.
#[derive(Debug, Clone)]
pub struct ClipCut {
    pub source: PathBuf,
    pub windows: Vec<ClipWindow>,
    pub formats: FormatSet,
    pub dest_dir: PathBuf,
    pub log_id: String,
}

/// Files produced for one clip, numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct CutClip {
    pub place: u32,
    pub window: ClipWindow,
    pub outputs: Vec<FormatOutput>,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<VideoDetails, EncodeError>;

    /// Encode `job.source` into every format and return the produced files.
    async fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<Vec<FormatOutput>, EncodeError>;

    /// Join `files` in order into `dest`, burning in `watermark` when given.
    async fn concat(
        &self,
        files: &[PathBuf],
        dest: &Path,
        watermark: Option<&Path>,
        log_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError>;

    /// Relocate the container index of `src` for progressive playback, writing `dst`.
    async fn fast_start(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError>;

    /// Write tooltip thumbnails of `source` into `dest_dir`.
    async fn thumbnails(
        &self,
        source: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError>;

    /// Cut each window as `{dest_dir}/clip-{n}-{format}.{ext}`.
    async fn cut_clips(
        &self,
        cut: &ClipCut,
        cancel: &CancellationToken,
    ) -> Result<Vec<CutClip>, EncodeError> {
        let mut clips = Vec::with_capacity(cut.windows.len());
        for (i, window) in cut.windows.iter().enumerate() {
            let place = i as u32 + 1;
            let job = TranscodeJob::new(
                &cut.source,
                cut.dest_dir.join(format!("clip-{}{}", place, FORMAT_PLACEHOLDER)),
                cut.formats.clone(),
                &cut.log_id,
            )
            .window(window.start, window.length);
            let outputs = self.transcode(&job, cancel).await?;
            clips.push(CutClip {
                place,
                window: *window,
                outputs,
            });
        }
        Ok(clips)
    }
}

/// Resolve the output path for one format.
///
/// `/w/slug%d.mpg` becomes `/w/slug-hd.{ext}`; the format's extension
/// replaces whatever follows the placeholder. A destination without the
/// placeholder is used verbatim.
pub fn expand_destination(template: &Path, format: &str, spec: &FormatSpec) -> PathBuf {
    let Some(name) = template.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return template.to_path_buf();
    };
    match name.split_once(FORMAT_PLACEHOLDER) {
        Some((before, _)) => template.with_file_name(format!("{}-{}.{}", before, format, spec.ext)),
        None => template.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ext: &str) -> FormatSpec {
        FormatSpec::new("", ext, &[])
    }

    #[test]
    fn test_expand_destination_with_placeholder() {
        let out = expand_destination(Path::new("/work/j1/slug-scene3%d.mpg"), "1080", &spec("mp4"));
        assert_eq!(out, PathBuf::from("/work/j1/slug-scene3-1080.mp4"));

        let bare = expand_destination(Path::new("/work/j1/clip-2%d"), "hd", &spec("mpg"));
        assert_eq!(bare, PathBuf::from("/work/j1/clip-2-hd.mpg"));
    }

    #[test]
    fn test_expand_destination_without_placeholder_is_verbatim() {
        let out = expand_destination(Path::new("/work/j1/trailer.mp4"), "mp4", &spec("mov"));
        assert_eq!(out, PathBuf::from("/work/j1/trailer.mp4"));
    }

    #[test]
    fn test_transcode_job_outputs_follow_format_order() {
        let mut formats = FormatSet::new();
        formats.insert("720".to_string(), spec("mp4"));
        formats.insert("1080".to_string(), spec("mp4"));
        let job = TranscodeJob::new("/in.mpg", "/out/s%d.mp4", formats, "j");
        let outputs = job.outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].format, "1080");
        assert_eq!(outputs[0].path, PathBuf::from("/out/s-1080.mp4"));
        assert_eq!(outputs[1].path, PathBuf::from("/out/s-720.mp4"));
    }

    #[test]
    fn test_video_details_defaults() {
        let unknown = VideoDetails::default();
        assert_eq!(unknown.size_or((1920, 1080)), (1920, 1080));

        let zero = VideoDetails { width: Some(0), height: Some(720), duration: 1.0 };
        assert_eq!(zero.size_or((1920, 1080)), (1920, 1080));

        let known = VideoDetails { width: Some(1280), height: Some(720), duration: 1.0 };
        assert_eq!(known.size_or((1920, 1080)), (1280, 720));
    }

    #[test]
    fn test_exit_code_only_for_failures() {
        let failed = EncodeError::Failed { tool: "ffmpeg".into(), code: 3 };
        assert_eq!(failed.exit_code(), Some(3));
        assert_eq!(EncodeError::Cancelled.exit_code(), None);
    }
}
