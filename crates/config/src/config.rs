//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Filesystem roots used by the queue and the pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding one JSON file per job.
    pub state_dir: PathBuf,
    /// Parent of the per-job working directories.
    pub work_dir: PathBuf,
    /// Encoder logs are written to `{log_dir}/{job_id}.txt`.
    pub log_dir: PathBuf,
    pub originals: PathBuf,
    pub trailer_originals: PathBuf,
    pub trailers: PathBuf,
    /// Final scene files.
    pub storage: PathBuf,
    pub screenshots: PathBuf,
    /// Root of the clip-set and tube clip tree.
    pub clips: PathBuf,
    pub watermarks: PathBuf,
    /// Raw intro/outro uploads referenced by the catalog.
    pub intro_uploads: PathBuf,
    /// Optional JSON seed for the in-process catalog.
    pub catalog: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/encode-queue");
        Self {
            state_dir: root.join("jobs"),
            work_dir: root.join("work"),
            log_dir: root.join("logs/ffmpeg"),
            originals: root.join("originals"),
            trailer_originals: root.join("trailers_originals"),
            trailers: root.join("trailers"),
            storage: root.join("storage"),
            screenshots: root.join("screenshots"),
            clips: root.join("tubeclips"),
            watermarks: root.join("watermarks"),
            intro_uploads: root.join("uploads/intro"),
            catalog: None,
        }
    }
}

/// External tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub qt_faststart: String,
    pub convert: String,
    pub composite: String,
    /// Encoder threads per invocation (0 = auto-derive)
    pub threads: u32,
    /// Target CPU utilization used when deriving threads (0.5-1.0, default 0.85)
    pub target_cpu_utilization: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            qt_faststart: "qt-faststart".to_string(),
            convert: "convert".to_string(),
            composite: "composite".to_string(),
            threads: 0,
            target_cpu_utilization: 0.85,
        }
    }
}

/// Scheduler trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between periodic queue passes when running as a service
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

/// Clip-set cutting defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClipsConfig {
    pub clip_length_secs: u32,
    /// Seconds skipped at the head and at the tail of the source
    pub trim_secs: u32,
    pub num_clips: u32,
    /// Volume used when no encoded file reveals one
    pub default_volume: u32,
    /// Clip format directory used as the concat source when finalizing
    pub source_format: String,
    /// Maximum clip length jitter in seconds, applied plus or minus
    pub jitter_secs: u32,
    /// Frame size of joined clip sets, used for their watermark and intro/outro
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for ClipsConfig {
    fn default() -> Self {
        Self {
            clip_length_secs: 97,
            trim_secs: 300,
            num_clips: 6,
            default_volume: 8,
            source_format: "hd".to_string(),
            jitter_secs: 20,
            frame_width: 1280,
            frame_height: 720,
        }
    }
}

/// Trailer pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrailerConfig {
    pub format_id: u32,
    pub original_format_id: u32,
    pub duration_full: u32,
    pub clip_length: u32,
    pub trim_front: u32,
    pub trim_back: u32,
    pub intro_width: u32,
    pub intro_height: u32,
}

impl Default for TrailerConfig {
    fn default() -> Self {
        Self {
            format_id: 2,
            original_format_id: 17,
            duration_full: 120,
            clip_length: 120,
            trim_front: 90,
            trim_back: 90,
            intro_width: 1280,
            intro_height: 720,
        }
    }
}

/// Scene pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SceneConfig {
    pub originals_volume: u32,
    pub original_format_id: u32,
    /// Used when the probe cannot report the source dimensions
    pub default_width: u32,
    pub default_height: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            originals_volume: 2,
            original_format_id: 14,
            default_width: 1920,
            default_height: 1080,
        }
    }
}

/// Watermark text layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrandingConfig {
    pub band_height: u32,
    pub point_size: u32,
    /// Prefix for tube channel watermark text, e.g. `example.com/`
    pub tube_url_prefix: String,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            band_height: 70,
            point_size: 34,
            tube_url_prefix: String::new(),
        }
    }
}

/// Read-only status server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
        }
    }
}

/// One output format handed to the encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatSpec {
    /// Frame size as `WxH`; empty means "keep the source size".
    #[serde(default)]
    pub size: String,
    pub ext: String,
    /// Encoder options, e.g. `vcodec = "libx264"` becomes `-vcodec libx264`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl FormatSpec {
    pub fn new(size: &str, ext: &str, params: &[(&str, &str)]) -> Self {
        Self {
            size: size.to_string(),
            ext: ext.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Copy of this format with the frame size replaced.
    pub fn with_size(&self, width: u32, height: u32) -> Self {
        let mut spec = self.clone();
        spec.size = format!("{}x{}", width, height);
        spec
    }

    /// Copy of this format with an extra encoder option.
    pub fn with_param(&self, key: &str, value: impl Into<String>) -> Self {
        let mut spec = self.clone();
        spec.params.insert(key.to_string(), value.into());
        spec
    }
}

/// Logical format name -> format
pub type FormatSet = BTreeMap<String, FormatSpec>;

fn set(entries: Vec<(&str, FormatSpec)>) -> FormatSet {
    entries
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect()
}

fn mpeg1(size: &str, bitrate: &str) -> FormatSpec {
    FormatSpec::new(
        size,
        "mpg",
        &[
            ("vcodec", "mpeg1video"),
            ("preset", "medium"),
            ("pix_fmt", "yuv420p"),
            ("b", bitrate),
        ],
    )
}

fn h264(size: &str, bitrate: &str) -> FormatSpec {
    FormatSpec::new(
        size,
        "mp4",
        &[
            ("vcodec", "libx264"),
            ("preset", "medium"),
            ("pix_fmt", "yuv420p"),
            ("b", bitrate),
            ("acodec", "aac"),
        ],
    )
}

fn default_scene_formats() -> FormatSet {
    set(vec![
        ("1080", h264("1920x1080", "6000k")),
        ("720", h264("1280x720", "3500k")),
        ("360", h264("640x360", "900k")),
    ])
}

fn default_scene_intermediate() -> FormatSet {
    set(vec![("mpg", mpeg1("", "10000k"))])
}

fn default_trailer_formats() -> FormatSet {
    set(vec![("mp4", h264("1280x720", "2500k"))])
}

fn default_trailer_intermediate() -> FormatSet {
    set(vec![("mpg", mpeg1("1280x720", "10000k"))])
}

fn default_clip_cut() -> FormatSet {
    set(vec![("hd", mpeg1("1280x720", "6000k"))])
}

fn default_clip_set_final() -> FormatSet {
    set(vec![
        ("hd", h264("1280x720", "2500k")),
        ("sd", h264("640x360", "900k")),
    ])
}

fn default_tube_final() -> FormatSet {
    set(vec![("mp4", h264("1280x720", "2500k"))])
}

fn default_intro() -> FormatSet {
    set(vec![("hd", mpeg1("", "3000000"))])
}

/// Named format sets used by the pipelines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormatsConfig {
    pub scene: FormatSet,
    pub scene_intermediate: FormatSet,
    pub trailer: FormatSet,
    pub trailer_intermediate: FormatSet,
    pub clip_cut: FormatSet,
    pub clip_set_final: FormatSet,
    pub tube_final: FormatSet,
    pub intro: FormatSet,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            scene: default_scene_formats(),
            scene_intermediate: default_scene_intermediate(),
            trailer: default_trailer_formats(),
            trailer_intermediate: default_trailer_intermediate(),
            clip_cut: default_clip_cut(),
            clip_set_final: default_clip_set_final(),
            tube_final: default_tube_final(),
            intro: default_intro(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub clips: ClipsConfig,
    #[serde(default)]
    pub trailer: TrailerConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub branding: BrandingConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub formats: FormatsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODE_QUEUE_STATE_DIR -> paths.state_dir
    /// - ENCODE_QUEUE_WORK_DIR -> paths.work_dir
    /// - ENCODE_QUEUE_LOG_DIR -> paths.log_dir
    /// - ENCODE_QUEUE_THREADS -> encoder.threads
    /// - ENCODE_QUEUE_POLL_SECS -> scheduler.poll_interval_secs
    /// - ENCODE_QUEUE_STATUS_BIND -> status.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_var("ENCODE_QUEUE_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("ENCODE_QUEUE_WORK_DIR") {
            self.paths.work_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("ENCODE_QUEUE_LOG_DIR") {
            self.paths.log_dir = PathBuf::from(dir);
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoder.threads = threads;
            }
        }

        if let Ok(val) = env::var("ENCODE_QUEUE_POLL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.scheduler.poll_interval_secs = secs;
            }
        }

        if let Some(bind) = non_empty_var("ENCODE_QUEUE_STATUS_BIND") {
            self.status.bind = bind;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
