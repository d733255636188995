//! Watermark image rendering.
//!
//! Only the sizing and text of an overlay are decided here; pixel work is
//! delegated to ImageMagick.

use async_trait::async_trait;
use encode_queue_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed with status {status}")]
    Failed { tool: String, status: String },
    #[error("Overlay was not written: {0}")]
    MissingOutput(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayStyle {
    /// Transparent frame with dark text at the bottom right.
    Transparent,
    /// Solid black band along the bottom with white text.
    Band,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    pub width: u32,
    pub height: u32,
    pub band_height: u32,
    pub point_size: u32,
    pub text: String,
    pub style: OverlayStyle,
}

#[async_trait]
pub trait OverlayRenderer: Send + Sync {
    /// Write a `width x height` PNG overlay to `dest`.
    async fn render(&self, spec: &OverlaySpec, dest: &Path) -> Result<(), RenderError>;
}

#[derive(Debug, Clone)]
pub struct ImageMagickRenderer {
    convert: String,
    composite: String,
}

impl ImageMagickRenderer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            convert: cfg.encoder.convert.clone(),
            composite: cfg.encoder.composite.clone(),
        }
    }
}

/// Right-aligned label text; the trailing spaces keep it off the frame edge.
fn label(text: &str) -> String {
    format!("label:{}          ", text)
}

/// The ImageMagick invocations that produce `dest`, using `scratch` for
/// intermediate images.
pub fn build_overlay_commands(
    convert: &str,
    composite: &str,
    spec: &OverlaySpec,
    scratch: &Path,
    dest: &Path,
) -> Vec<Command> {
    let band_top = spec.height.saturating_sub(spec.band_height);
    let empty = scratch.join("empty.png");
    let background = scratch.join("bg.png");
    let text = scratch.join("label.png");
    let mut commands = Vec::new();

    let mut canvas = Command::new(convert);
    canvas
        .arg("-size")
        .arg(format!("{}x{}", spec.width, spec.height))
        .args(["xc:none", "-depth", "8"])
        .arg(&empty);
    commands.push(canvas);

    let base = match spec.style {
        OverlayStyle::Transparent => empty,
        OverlayStyle::Band => {
            let mut band = Command::new(convert);
            band.arg(&empty)
                .args(["-strokewidth", "0", "-fill", "rgb(0, 0, 0)", "-draw"])
                .arg(format!(
                    "rectangle 0,{} {},{}",
                    band_top, spec.width, spec.height
                ))
                .arg(&background);
            commands.push(band);
            background
        }
    };

    let (bg_color, fg_color) = match spec.style {
        OverlayStyle::Transparent => ("transparent", "black"),
        OverlayStyle::Band => ("black", "white"),
    };
    let mut caption = Command::new(convert);
    caption
        .arg("-size")
        .arg(format!("{}x{}", spec.width, spec.band_height))
        .args(["-background", bg_color, "-depth", "8", "-gravity", "east"])
        .args(["-fill", fg_color, "-pointsize"])
        .arg(spec.point_size.to_string())
        .arg(label(&spec.text))
        .arg(&text);
    commands.push(caption);

    let mut merge = Command::new(composite);
    merge
        .arg("-geometry")
        .arg(format!("+0+{}", band_top))
        .arg(&text)
        .arg(&base)
        .arg(dest);
    commands.push(merge);

    commands
}

#[async_trait]
impl OverlayRenderer for ImageMagickRenderer {
    async fn render(&self, spec: &OverlaySpec, dest: &Path) -> Result<(), RenderError> {
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let stem = dest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "overlay".to_string());
        let scratch = dir.join(format!(".{}.parts", stem));
        fs::create_dir_all(&scratch)?;

        let result = async {
            for cmd in build_overlay_commands(&self.convert, &self.composite, spec, &scratch, dest) {
                run(cmd).await?;
            }
            Ok::<(), RenderError>(())
        }
        .await;
        let _ = fs::remove_dir_all(&scratch);
        result?;

        if !dest.exists() {
            return Err(RenderError::MissingOutput(dest.to_path_buf()));
        }
        Ok(())
    }
}

async fn run(cmd: Command) -> Result<(), RenderError> {
    let tool = cmd.get_program().to_string_lossy().into_owned();
    debug!(command = ?cmd, "Rendering overlay");
    let mut cmd = tokio::process::Command::from(cmd);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    let status = cmd
        .status()
        .await
        .map_err(|source| RenderError::Spawn {
            tool: tool.clone(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(RenderError::Failed {
            tool,
            status: status.to_string(),
        })
    }
}
