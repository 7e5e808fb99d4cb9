//! Staging and final path rules for target directories.
//!
//! A target file is only ever visible under its final name after the
//! staging file has been renamed onto it; these helpers are the single
//! place that knows how the two names relate.

use crate::defaults::STAGING_SUFFIX;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("source path has no file name: {0}")]
    NoFileName(String),
    #[error("source file name is not valid UTF-8: {0}")]
    NonUtf8Name(String),
}

/// Final path for a source file inside a target directory.
///
/// Final names are unique by source name; a collision with an existing,
/// unrelated file is a permanent failure decided by the copier.
pub fn final_path(target_dir: &Path, source_path: &Path) -> Result<PathBuf, PathError> {
    let name = file_name(source_path)?;
    Ok(target_dir.join(name))
}

/// Staging path for a source file inside a target directory:
/// `<final-name>.forker-tmp`.
pub fn staging_path(target_dir: &Path, source_path: &Path) -> Result<PathBuf, PathError> {
    let name = file_name(source_path)?;
    Ok(target_dir.join(format!("{name}{STAGING_SUFFIX}")))
}

/// Whether a path carries the staging suffix.
pub fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(|name| name.ends_with(STAGING_SUFFIX))
        .unwrap_or(false)
}

fn file_name(source_path: &Path) -> Result<&str, PathError> {
    let name = source_path
        .file_name()
        .ok_or_else(|| PathError::NoFileName(source_path.display().to_string()))?;
    name.to_str()
        .ok_or_else(|| PathError::NonUtf8Name(source_path.display().to_string()))
}
