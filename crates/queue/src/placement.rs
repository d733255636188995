//! Moving pipeline outputs into durable storage.
//!
//! Storage trees are sharded into numbered volume directories; new files go
//! to the highest numbered volume that exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// Destination directory could not be created.
    #[error("Failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Copy or rename into place failed.
    #[error("Failed to place {from} at {to}: {source}")]
    Transfer {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PlacementError {
    pub fn path(&self) -> &Path {
        match self {
            PlacementError::CreateDir { path, .. } => path,
            PlacementError::Transfer { to, .. } => to,
        }
    }
}

/// Highest numbered volume directory directly under `root`, or `default`.
///
/// Non-numeric entries are ignored.
pub fn highest_volume(root: &Path, default: u32) -> u32 {
    if !root.is_dir() {
        return default;
    }
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .max()
        .unwrap_or(default)
}

pub fn ensure_dir(path: &Path) -> Result<(), PlacementError> {
    fs::create_dir_all(path).map_err(|source| PlacementError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_parent(path: &Path) -> Result<(), PlacementError> {
    match path.parent() {
        Some(parent) => ensure_dir(parent),
        None => Ok(()),
    }
}

/// Move `src` to `dest`, replacing any existing file.
///
/// Falls back to copy and delete when a rename is not possible, e.g. across
/// filesystems.
pub fn move_into_place(src: &Path, dest: &Path) -> Result<(), PlacementError> {
    ensure_parent(dest)?;
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    let transfer = |source| PlacementError::Transfer {
        from: src.to_path_buf(),
        to: dest.to_path_buf(),
        source,
    };
    fs::copy(src, dest).map_err(transfer)?;
    fs::remove_file(src).map_err(transfer)?;
    Ok(())
}

/// Copy `src` to `dest`, leaving the source untouched.
pub fn copy_into_place(src: &Path, dest: &Path) -> Result<u64, PlacementError> {
    ensure_parent(dest)?;
    fs::copy(src, dest).map_err(|source| PlacementError::Transfer {
        from: src.to_path_buf(),
        to: dest.to_path_buf(),
        source,
    })
}

/// Empty `dir` and recreate it.
pub fn recreate_dir(dir: &Path) -> Result<(), PlacementError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|source| PlacementError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    ensure_dir(dir)
}

/// Size in bytes, 0 when the file cannot be read.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
