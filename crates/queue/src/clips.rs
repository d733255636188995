//! Clip window planning for clip sets and cut trailers.
//!
//! Pure functions over an injected RNG so placements are reproducible in tests.

use crate::encode::ClipWindow;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ClipPlanError {
    #[error("At least one clip is required")]
    NoClips,
    #[error("Clip length must be positive")]
    ZeroLength,
    #[error("Source is {duration:.0}s long, need at least {needed}s")]
    SourceTooShort { duration: f64, needed: u64 },
}

/// Longest source a plan will use; anything past this is ignored.
/// `clamp` keeps NaN, so an unknown duration still fails the length check.
const MAX_SOURCE_SECONDS: f64 = u32::MAX as f64;

/// Seconds of source `num_clips` clips plus `padding` take up.
///
/// Saturates at `u64::MAX`, which no source is long enough to satisfy.
fn seconds_needed(num_clips: u32, clip_length: u32, padding: &[u32]) -> u64 {
    padding
        .iter()
        .try_fold(u64::from(num_clips) * u64::from(clip_length), |total, &p| {
            total.checked_add(u64::from(p))
        })
        .unwrap_or(u64::MAX)
}

fn check_length(duration: f64, needed: u64) -> Result<(), ClipPlanError> {
    if needed == u64::MAX || !(duration >= needed as f64) {
        return Err(ClipPlanError::SourceTooShort { duration, needed });
    }
    Ok(())
}

/// Plan `num_clips` windows across the source after trimming `trim` seconds
/// from both ends.
///
/// The trimmed span is split into equal sections and each non-final clip
/// starts at a random point inside its section. Each clip's length is the
/// base length moved by up to `jitter` seconds either way. The final clip
/// always ends exactly at the end of the source.
pub fn plan_clip_set<R: Rng + ?Sized>(
    duration: f64,
    num_clips: u32,
    clip_length: u32,
    trim: u32,
    jitter: u32,
    rng: &mut R,
) -> Result<Vec<ClipWindow>, ClipPlanError> {
    if num_clips == 0 {
        return Err(ClipPlanError::NoClips);
    }
    if clip_length == 0 {
        return Err(ClipPlanError::ZeroLength);
    }

    let duration = duration.clamp(0.0, MAX_SOURCE_SECONDS);
    check_length(duration, seconds_needed(num_clips, clip_length, &[trim, trim, jitter]))?;

    let whole = duration.floor() as u32;
    let section = (duration - 2.0 * trim as f64) / num_clips as f64;
    let mut windows = Vec::with_capacity(num_clips as usize);

    for clip in 1..=num_clips {
        let length = jittered(clip_length, jitter, rng);
        let start = if clip == num_clips {
            whole.saturating_sub(length)
        } else {
            let low = (trim as f64 + section * (clip - 1) as f64).round() as u32;
            let high = ((trim as f64 + section * clip as f64).round() as u32).saturating_sub(clip_length);
            rng.random_range(low..=high.max(low))
        };
        windows.push(ClipWindow { start, length });
    }

    Ok(windows)
}

/// Plan the fixed-length cuts a trailer is assembled from.
///
/// `floor(duration_full / clip_length)` clips (at least one), one per equal
/// section of `[trim_front, duration - trim_back]`.
pub fn plan_trailer_cuts<R: Rng + ?Sized>(
    duration: f64,
    duration_full: u32,
    clip_length: u32,
    trim_front: u32,
    trim_back: u32,
    rng: &mut R,
) -> Result<Vec<ClipWindow>, ClipPlanError> {
    if clip_length == 0 {
        return Err(ClipPlanError::ZeroLength);
    }

    let num_clips = (duration_full / clip_length).max(1);
    let duration = duration.clamp(0.0, MAX_SOURCE_SECONDS);
    check_length(
        duration,
        seconds_needed(num_clips, clip_length, &[trim_front, trim_back]),
    )?;

    // Whole seconds, so every section is at least one clip long.
    let whole = u64::from(duration.floor() as u32);
    let span = whole - u64::from(trim_front) - u64::from(trim_back);
    let boundary =
        |i: u32| (u64::from(trim_front) + span * u64::from(i) / u64::from(num_clips)) as u32;

    let windows = (1..=num_clips)
        .map(|clip| {
            let low = boundary(clip - 1);
            let high = boundary(clip) - clip_length;
            ClipWindow {
                start: rng.random_range(low..=high),
                length: clip_length,
            }
        })
        .collect();

    Ok(windows)
}

fn jittered<R: Rng + ?Sized>(base: u32, jitter: u32, rng: &mut R) -> u32 {
    if jitter == 0 {
        return base;
    }
    let delta = rng.random_range(0..=jitter);
    if rng.random_bool(0.5) {
        base.saturating_add(delta)
    } else {
        base.saturating_sub(delta).max(1)
    }
}
