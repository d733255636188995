//! Test doubles for the external tools.

use crate::encode::{EncodeError, Encoder, FormatOutput, TranscodeJob, VideoDetails};
use crate::overlay::{OverlayRenderer, OverlaySpec, RenderError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderCall {
    Probe(PathBuf),
    Transcode {
        source: PathBuf,
        outputs: Vec<PathBuf>,
        watermark: Option<PathBuf>,
        start: Option<u32>,
        duration: Option<u32>,
    },
    Concat {
        files: Vec<PathBuf>,
        dest: PathBuf,
        watermark: Option<PathBuf>,
    },
    FastStart {
        src: PathBuf,
        dst: PathBuf,
    },
    Thumbnails {
        source: PathBuf,
        dest_dir: PathBuf,
    },
}

/// Writes every expected output as a small file instead of encoding.
pub struct FakeEncoder {
    details: Mutex<VideoDetails>,
    calls: Mutex<Vec<EncoderCall>>,
    fail_transcode: Mutex<Option<i32>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self {
            details: Mutex::new(VideoDetails {
                width: Some(1280),
                height: Some(720),
                duration: 1800.0,
            }),
            calls: Mutex::new(Vec::new()),
            fail_transcode: Mutex::new(None),
        }
    }

    pub fn set_details(&self, details: VideoDetails) {
        *self.details.lock() = details;
    }

    /// Make every following transcode exit with `code`.
    pub fn fail_transcodes(&self, code: i32) {
        *self.fail_transcode.lock() = Some(code);
    }

    pub fn calls(&self) -> Vec<EncoderCall> {
        self.calls.lock().clone()
    }

    pub fn transcodes(&self) -> Vec<EncoderCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, EncoderCall::Transcode { .. }))
            .collect()
    }

    fn record(&self, call: EncoderCall) {
        self.calls.lock().push(call);
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), EncodeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), EncodeError> {
    if cancel.is_cancelled() {
        Err(EncodeError::Cancelled)
    } else {
        Ok(())
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn probe(&self, path: &Path) -> Result<VideoDetails, EncodeError> {
        self.record(EncoderCall::Probe(path.to_path_buf()));
        Ok(*self.details.lock())
    }

    async fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<Vec<FormatOutput>, EncodeError> {
        check_cancel(cancel)?;
        let outputs = job.outputs();
        self.record(EncoderCall::Transcode {
            source: job.source.clone(),
            outputs: outputs.iter().map(|o| o.path.clone()).collect(),
            watermark: job.watermark.clone(),
            start: job.start,
            duration: job.duration,
        });
        if !job.source.exists() {
            return Err(EncodeError::MissingOutput(job.source.clone()));
        }
        if let Some(code) = *self.fail_transcode.lock() {
            return Err(EncodeError::Failed {
                tool: "ffmpeg".to_string(),
                code,
            });
        }
        for output in &outputs {
            write_file(&output.path, output.format.as_bytes())?;
        }
        Ok(outputs)
    }

    async fn concat(
        &self,
        files: &[PathBuf],
        dest: &Path,
        watermark: Option<&Path>,
        _log_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        check_cancel(cancel)?;
        self.record(EncoderCall::Concat {
            files: files.to_vec(),
            dest: dest.to_path_buf(),
            watermark: watermark.map(Path::to_path_buf),
        });
        if let Some(missing) = files.iter().find(|f| !f.exists()) {
            return Err(EncodeError::MissingOutput(missing.clone()));
        }
        write_file(dest, b"concat")?;
        Ok(dest.to_path_buf())
    }

    async fn fast_start(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        check_cancel(cancel)?;
        self.record(EncoderCall::FastStart {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        let content = fs::read(src).map_err(|_| EncodeError::MissingOutput(src.to_path_buf()))?;
        write_file(dst, &content)?;
        Ok(dst.to_path_buf())
    }

    async fn thumbnails(
        &self,
        source: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        check_cancel(cancel)?;
        self.record(EncoderCall::Thumbnails {
            source: source.to_path_buf(),
            dest_dir: dest_dir.to_path_buf(),
        });
        write_file(&dest_dir.join("tooltip-001.jpg"), b"jpg")
    }
}

/// Records each render and writes an empty PNG.
#[derive(Default)]
pub struct FakeRenderer {
    calls: Mutex<Vec<OverlaySpec>>,
}

impl FakeRenderer {
    pub fn calls(&self) -> Vec<OverlaySpec> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl OverlayRenderer for FakeRenderer {
    async fn render(&self, spec: &OverlaySpec, dest: &Path) -> Result<(), RenderError> {
        self.calls.lock().push(spec.clone());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, b"png")?;
        Ok(())
    }
}
