//! ffmpeg / ffprobe / qt-faststart backed [`Encoder`].
//!
//! Command construction is kept in pure `build_*_command` functions so the
//! argument lists can be checked without running anything.

use super::{EncodeError, Encoder, FormatOutput, TranscodeJob, VideoDetails};
use crate::concurrency::EncoderThreads;
use crate::progress::encoder_log_path;
use async_trait::async_trait;
use encode_queue_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
    qt_faststart: String,
    log_dir: PathBuf,
    threads: u32,
}

impl FfmpegEncoder {
    pub fn new(cfg: &Config, threads: &EncoderThreads) -> Self {
        Self {
            ffmpeg: cfg.encoder.ffmpeg.clone(),
            ffprobe: cfg.encoder.ffprobe.clone(),
            qt_faststart: cfg.encoder.qt_faststart.clone(),
            log_dir: cfg.paths.log_dir.clone(),
            threads: threads.threads,
        }
    }

    fn log_path(&self, log_id: &str) -> PathBuf {
        encoder_log_path(&self.log_dir, log_id)
    }
}

/// Build the single ffmpeg invocation that writes every format of `job`.
///
/// With a watermark the overlay is applied once and split across outputs.
pub fn build_transcode_command(ffmpeg: &str, job: &TranscodeJob, threads: u32) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y");

    if let Some(start) = job.start {
        cmd.arg("-ss").arg(start.to_string());
    }
    cmd.arg("-i").arg(&job.source);

    let outputs = job.outputs();
    if let Some(watermark) = &job.watermark {
        cmd.arg("-i").arg(watermark);
        let labels: String = (0..outputs.len()).map(|i| format!("[v{}]", i)).collect();
        cmd.arg("-filter_complex").arg(format!(
            "[0:v][1:v]overlay=0:0,split={}{}",
            outputs.len(),
            labels
        ));
    }

    for (i, output) in outputs.iter().enumerate() {
        if job.watermark.is_some() {
            cmd.arg("-map").arg(format!("[v{}]", i));
            cmd.arg("-map").arg("0:a?");
        }
        if let Some(duration) = job.duration {
            cmd.arg("-t").arg(duration.to_string());
        }
        if let Some(spec) = job.formats.get(&output.format) {
            if !spec.size.is_empty() {
                cmd.arg("-s").arg(&spec.size);
            }
            for (key, value) in &spec.params {
                cmd.arg(format!("-{}", key));
                if !value.is_empty() {
                    cmd.arg(value);
                }
            }
        }
        cmd.arg("-threads").arg(threads.to_string());
        cmd.arg(&output.path);
    }

    cmd
}

/// Contents of an ffmpeg concat-demuxer list file.
pub fn concat_list(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| format!("file '{}'\n", f.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

pub fn build_concat_command(
    ffmpeg: &str,
    list_file: &Path,
    dest: &Path,
    watermark: Option<&Path>,
    threads: u32,
) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y");
    cmd.args(["-f", "concat", "-safe", "0"]);
    cmd.arg("-i").arg(list_file);

    match watermark {
        Some(wm) => {
            cmd.arg("-i").arg(wm);
            cmd.arg("-filter_complex").arg("[0:v][1:v]overlay=0:0[v]");
            cmd.args(["-map", "[v]", "-map", "0:a?", "-qscale:v", "2"]);
        }
        None => {
            cmd.args(["-c", "copy"]);
        }
    }

    cmd.arg("-threads").arg(threads.to_string());
    cmd.arg(dest);
    cmd
}

pub fn build_fast_start_command(qt_faststart: &str, src: &Path, dst: &Path) -> Command {
    let mut cmd = Command::new(qt_faststart);
    cmd.arg(src).arg(dst);
    cmd
}

/// One small frame per minute of source, as `tooltip-001.jpg`, `tooltip-002.jpg`, ...
pub fn build_thumbnails_command(ffmpeg: &str, source: &Path, dest_dir: &Path, threads: u32) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y");
    cmd.arg("-i").arg(source);
    cmd.arg("-vf").arg("fps=1/60,scale=160:-1");
    cmd.arg("-threads").arg(threads.to_string());
    cmd.arg(dest_dir.join("tooltip-%03d.jpg"));
    cmd
}

pub fn build_probe_command(ffprobe: &str, path: &Path) -> Command {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ]);
    cmd.arg(path);
    cmd
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses ffprobe JSON output; dimensions come from the first video stream.
pub fn parse_ffprobe_output(json_str: &str) -> Result<VideoDetails, EncodeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| EncodeError::Probe(e.to_string()))?;

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let duration = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoDetails {
        width: video.as_ref().and_then(|v| v.width),
        height: video.as_ref().and_then(|v| v.height),
        duration,
    })
}

fn status_to_result(tool: &str, status: ExitStatus) -> Result<(), EncodeError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(EncodeError::Failed {
            tool: tool.to_string(),
            code,
        }),
        None => Err(EncodeError::Terminated {
            tool: tool.to_string(),
        }),
    }
}

fn ensure_parent(path: &Path) -> Result<(), EncodeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Run a tool to completion, or kill it when `cancel` fires.
///
/// stderr goes to `log` (truncated first) so progress can be read while it runs.
async fn run_tool(
    cmd: Command,
    tool: &str,
    log: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<(), EncodeError> {
    if cancel.is_cancelled() {
        return Err(EncodeError::Cancelled);
    }

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null()).stdout(Stdio::null());
    match log {
        Some(path) => {
            ensure_parent(path)?;
            cmd.stderr(Stdio::from(fs::File::create(path)?));
        }
        None => {
            cmd.stderr(Stdio::null());
        }
    }
    cmd.kill_on_drop(true);

    debug!(tool, command = ?cmd.as_std(), "Running encoder tool");
    let mut child = cmd.spawn().map_err(|source| EncodeError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    let status = tokio::select! {
        status = child.wait() => status?,
        // Dropping the child kills it.
        _ = cancel.cancelled() => return Err(EncodeError::Cancelled),
    };
    status_to_result(tool, status)
}

fn require_exists(path: &Path) -> Result<(), EncodeError> {
    if path.exists() {
        Ok(())
    } else {
        Err(EncodeError::MissingOutput(path.to_path_buf()))
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe(&self, path: &Path) -> Result<VideoDetails, EncodeError> {
        let output = tokio::process::Command::from(build_probe_command(&self.ffprobe, path))
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                tool: self.ffprobe.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncodeError::Probe(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<Vec<FormatOutput>, EncodeError> {
        let outputs = job.outputs();
        for output in &outputs {
            ensure_parent(&output.path)?;
        }

        let cmd = build_transcode_command(&self.ffmpeg, job, self.threads);
        run_tool(cmd, &self.ffmpeg, Some(&self.log_path(&job.log_id)), cancel).await?;

        for output in &outputs {
            require_exists(&output.path)?;
        }
        Ok(outputs)
    }

    async fn concat(
        &self,
        files: &[PathBuf],
        dest: &Path,
        watermark: Option<&Path>,
        log_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        for file in files {
            require_exists(file)?;
        }
        ensure_parent(dest)?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "concat".to_string());
        let list_file = dest.with_file_name(format!("{}.list", file_name));
        fs::write(&list_file, concat_list(files))?;

        let cmd = build_concat_command(&self.ffmpeg, &list_file, dest, watermark, self.threads);
        let result = run_tool(cmd, &self.ffmpeg, Some(&self.log_path(log_id)), cancel).await;
        let _ = fs::remove_file(&list_file);
        result?;

        require_exists(dest)?;
        Ok(dest.to_path_buf())
    }

    async fn fast_start(
        &self,
        src: &Path,
        dst: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EncodeError> {
        require_exists(src)?;
        ensure_parent(dst)?;

        let cmd = build_fast_start_command(&self.qt_faststart, src, dst);
        run_tool(cmd, &self.qt_faststart, None, cancel).await?;

        require_exists(dst)?;
        Ok(dst.to_path_buf())
    }

    async fn thumbnails(
        &self,
        source: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        fs::create_dir_all(dest_dir)?;
        let cmd = build_thumbnails_command(&self.ffmpeg, source, dest_dir, self.threads);
        run_tool(cmd, &self.ffmpeg, None, cancel).await
    }
}
