//! Encoder progress from live log output.
//!
//! The encoder appends to `{log_dir}/{job_id}.txt`. Lines are fed through a
//! [`LogLineParser`] so the tool's exact output format stays in one place.

use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// One piece of progress information extracted from a log line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSample {
    /// Total media duration in seconds.
    Duration(f64),
    /// Position the encoder has reached, in seconds.
    Elapsed(f64),
    PermissionDenied,
}

pub trait LogLineParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<ProgressSample>;
}

/// Parser for ffmpeg's stderr (`Duration: 00:01:02.00, start: ...` and
/// repeated `... time=00:00:10.00 bitrate=...`).
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegLogParser;

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*([^,]+?),\s*start:").expect("valid regex"))
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(\S+)").expect("valid regex"))
}

impl LogLineParser for FfmpegLogParser {
    fn parse_line(&self, line: &str) -> Option<ProgressSample> {
        if line.contains("Permission denied") {
            return Some(ProgressSample::PermissionDenied);
        }
        if let Some(caps) = duration_re().captures(line) {
            return parse_timecode(&caps[1]).map(ProgressSample::Duration);
        }
        // Several status blocks can share one physical line; the last one counts.
        time_re()
            .captures_iter(line)
            .filter_map(|caps| parse_timecode(&caps[1]))
            .last()
            .map(ProgressSample::Elapsed)
    }
}

/// Convert `H:MM:SS.ff` to seconds. Hour and minute groups are optional.
pub fn parse_timecode(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = 0.0;
    let mut scale = 1.0;
    for (i, part) in s.rsplit(':').enumerate() {
        if i > 2 {
            return None;
        }
        let value: f64 = part.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        total += value * scale;
        scale *= 60.0;
    }
    Some(total)
}

/// Result of a progress query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Percent(u8),
    /// No log exists for the job.
    NotFound,
    /// The encoder could not read or write a file.
    PermissionDenied,
    /// No usable duration marker yet.
    Unknown,
}

impl Progress {
    /// Numeric view for callers that need a default; non-percent states are 0.
    pub fn as_percent(&self) -> u8 {
        match self {
            Progress::Percent(p) => *p,
            _ => 0,
        }
    }

    pub fn is_done(&self) -> bool {
        *self == Progress::Percent(100)
    }

    pub fn state(&self) -> &'static str {
        match self {
            Progress::Percent(_) => "percent",
            Progress::NotFound => "not_found",
            Progress::PermissionDenied => "permission_denied",
            Progress::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressReport {
    pub job_id: String,
    pub state: &'static str,
    pub percent: u8,
}

impl ProgressReport {
    pub fn new(job_id: &str, progress: Progress) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: progress.state(),
            percent: progress.as_percent(),
        }
    }
}

/// Percent of `total` reached at `current`, rounded and clamped to 0..=100.
pub fn percent_of(current: f64, total: f64) -> Option<u8> {
    if !(total > 0.0) || !current.is_finite() {
        return None;
    }
    let pct = (current / total * 100.0).round().clamp(0.0, 100.0);
    Some(pct as u8)
}

/// Compute progress from the full text of an encoder log.
pub fn progress_from_log(text: &str, parser: &dyn LogLineParser) -> Progress {
    let mut duration = None;
    let mut elapsed = None;

    // ffmpeg rewrites its status line with carriage returns.
    for line in text.split(['\n', '\r']) {
        match parser.parse_line(line) {
            Some(ProgressSample::PermissionDenied) => return Progress::PermissionDenied,
            Some(ProgressSample::Duration(d)) => duration = Some(d),
            Some(ProgressSample::Elapsed(e)) => elapsed = Some(e),
            None => {}
        }
    }

    let Some(total) = duration else {
        return Progress::Unknown;
    };
    match elapsed {
        None => Progress::Percent(0),
        Some(current) => percent_of(current, total)
            .map(Progress::Percent)
            .unwrap_or(Progress::Unknown),
    }
}

/// Reads encoder logs from the log directory and reports progress per job.
pub struct ProgressMonitor {
    log_dir: PathBuf,
    parser: Box<dyn LogLineParser>,
}

impl ProgressMonitor {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self::with_parser(log_dir, Box::new(FfmpegLogParser))
    }

    pub fn with_parser(log_dir: impl Into<PathBuf>, parser: Box<dyn LogLineParser>) -> Self {
        Self {
            log_dir: log_dir.into(),
            parser,
        }
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        encoder_log_path(&self.log_dir, job_id)
    }

    pub fn progress(&self, job_id: &str) -> Progress {
        let path = self.log_path(job_id);
        match fs::read(&path) {
            Ok(bytes) => progress_from_log(&String::from_utf8_lossy(&bytes), self.parser.as_ref()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Progress::NotFound,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read encoder log");
                if e.kind() == io::ErrorKind::PermissionDenied {
                    Progress::PermissionDenied
                } else {
                    Progress::Unknown
                }
            }
        }
    }
}

/// `{log_dir}/{log_id}.txt`
pub fn encoder_log_path(log_dir: &Path, log_id: &str) -> PathBuf {
    log_dir.join(format!("{}.txt", log_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const HEADER: &str = "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'in.mov':\n  Duration: 00:03:20.00, start: 0.000000, bitrate: 8000 kb/s\n";

    #[test]
    fn test_parse_timecode_full_and_partial() {
        assert_eq!(parse_timecode("01:02:03.50"), Some(3723.5));
        assert_eq!(parse_timecode("02:03.50"), Some(123.5));
        assert_eq!(parse_timecode("7.25"), Some(7.25));
        assert_eq!(parse_timecode(""), None);
        assert_eq!(parse_timecode("N/A"), None);
        assert_eq!(parse_timecode("1:2:3:4"), None);
    }

    #[test]
    fn test_percent_uses_last_time_marker() {
        let log = format!(
            "{}frame=10 fps=0 time=00:00:10.00 bitrate=100kbits/s\rframe=50 fps=25 time=00:00:50.00 bitrate=100kbits/s\r",
            HEADER
        );
        assert_eq!(progress_from_log(&log, &FfmpegLogParser), Progress::Percent(25));
    }

    #[test]
    fn test_missing_duration_is_unknown() {
        let log = "frame=50 time=00:00:50.00 bitrate=100kbits/s\n";
        assert_eq!(progress_from_log(log, &FfmpegLogParser), Progress::Unknown);
    }

    #[test]
    fn test_duration_without_time_is_zero() {
        assert_eq!(progress_from_log(HEADER, &FfmpegLogParser), Progress::Percent(0));
    }

    #[test]
    fn test_permission_denied_is_distinct() {
        let log = format!("{}/var/out.mp4: Permission denied\n", HEADER);
        assert_eq!(progress_from_log(&log, &FfmpegLogParser), Progress::PermissionDenied);
        assert_eq!(Progress::PermissionDenied.as_percent(), 0);
    }

    #[test]
    fn test_finished_log_reports_done() {
        let log = format!("{}frame=5000 time=00:03:20.00 bitrate=100kbits/s\n", HEADER);
        let progress = progress_from_log(&log, &FfmpegLogParser);
        assert!(progress.is_done());
    }

    #[test]
    fn test_monitor_reads_job_log() {
        let dir = TempDir::new().unwrap();
        let monitor = ProgressMonitor::new(dir.path());
        assert_eq!(monitor.progress("missing"), Progress::NotFound);

        fs::write(
            dir.path().join("job-1.txt"),
            format!("{}time=00:01:40.00 bitrate=1k\n", HEADER),
        )
        .unwrap();
        assert_eq!(monitor.progress("job-1"), Progress::Percent(50));
    }

    #[test]
    fn test_custom_parser_is_used() {
        struct Fixed;
        impl LogLineParser for Fixed {
            fn parse_line(&self, line: &str) -> Option<ProgressSample> {
                match line {
                    "total" => Some(ProgressSample::Duration(10.0)),
                    "half" => Some(ProgressSample::Elapsed(5.0)),
                    _ => None,
                }
            }
        }
        assert_eq!(progress_from_log("total\nhalf\n", &Fixed), Progress::Percent(50));
    }

    #[test]
    fn test_report_shape() {
        let report = ProgressReport::new("j", Progress::Percent(40));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "percent");
        assert_eq!(json["percent"], 40);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timecode_components(h in 0u32..24, m in 0u32..60, cs in 0u32..6000) {
            let text = format!("{:02}:{:02}:{:02}.{:02}", h, m, cs / 100, cs % 100);
            let expected = h as f64 * 3600.0 + m as f64 * 60.0 + cs as f64 / 100.0;
            let parsed = parse_timecode(&text).unwrap();
            prop_assert!((parsed - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_percent_is_bounded(current in 0.0f64..100_000.0, total in 0.001f64..100_000.0) {
            let pct = percent_of(current, total).unwrap();
            prop_assert!(pct <= 100);
            if current >= total {
                prop_assert_eq!(pct, 100);
            }
        }
    }
}
