//! Startup checks
//!
//! Preflight checks run before any job is processed:
//! - ffmpeg answers `-version` with a parseable version
//! - qt-faststart can be spawned
//! - ImageMagick `convert` answers `-version`

use encode_queue_config::EncoderConfig;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version check failed: {0}")]
    FfmpegVersion(String),
}

/// Parse FFmpeg version output and extract the major version number
///
/// Handles both release (`ffmpeg version 6.1.1 ...`) and git builds
/// (`ffmpeg version n6.1-12-gabcdef ...`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Run `{ffmpeg} -version` and return the major version
pub fn check_ffmpeg_version(ffmpeg: &str) -> Result<u32, StartupError> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::FfmpegVersion(format!("Failed to run {} -version: {}", ffmpeg, e)))?;

    if !output.status.success() {
        return Err(StartupError::FfmpegVersion(format!("{} -version failed", ffmpeg)));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Check that `program` can be started.
///
/// Some tools print usage and exit non-zero without arguments, so the exit
/// status is only checked when `require_success` is set.
pub fn check_invocable(
    program: &str,
    args: &[&str],
    require_success: bool,
) -> Result<(), StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: program.to_string(),
        reason,
    };

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| unavailable(format!("is it installed and in PATH? {}", e)))?;

    if require_success && !output.status.success() {
        return Err(unavailable(format!("exited with {}", output.status)));
    }
    Ok(())
}

/// Run all startup checks in order: ffmpeg, qt-faststart, convert
pub fn run_startup_checks(cfg: &EncoderConfig) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.ffmpeg)?;
    info!(ffmpeg = %cfg.ffmpeg, major, "FFmpeg found");
    check_invocable(&cfg.qt_faststart, &[], false)?;
    check_invocable(&cfg.convert, &["-version"], true)?;
    Ok(())
}
