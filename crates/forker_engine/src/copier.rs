//! Single-target copy with atomic commit.
//!
//! Bytes stream from the source (opened read-shared, so external tools can
//! keep reading it) into `<final-name>.forker-tmp`, hashed on the fly. On
//! success the staging file is flushed, fsynced and renamed onto the final
//! name - the rename is the one and only commit point. The final name is
//! never visible with partial content.

use crate::cancel::CancellationToken;
use crate::hasher;
use crate::retry::classify_io;
use forker_protocol::paths::{final_path, staging_path};
use forker_protocol::ErrorCategory;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Successful copy: the file is committed under its final name.
#[derive(Debug, Clone)]
pub struct CopySuccess {
    pub final_path: PathBuf,
    pub staging_path: PathBuf,
    /// Hex SHA-256 over the exact bytes written to the target
    pub hash: String,
    pub bytes_copied: u64,
    pub duration: Duration,
}

/// Failed copy with its retry classification. Staging remnants are
/// removed best-effort before this is returned.
#[derive(Debug, Clone)]
pub struct CopyFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl CopyFailure {
    fn from_io(stage: &str, err: &io::Error) -> Self {
        Self {
            category: classify_io(err),
            message: format!("{stage}: {err}"),
        }
    }
}

/// Copy one source file into one target directory.
///
/// `allow_overwrite` is set only when the existing final file is this
/// target's own earlier commit (quarantine release re-runs the copy);
/// an unrelated occupant of the final name is a permanent collision.
pub async fn copy_to_target(
    source: &Path,
    target_dir: &Path,
    buffer_size: usize,
    cancel: &CancellationToken,
    allow_overwrite: bool,
) -> Result<CopySuccess, CopyFailure> {
    let started = Instant::now();

    let staging = staging_path(target_dir, source).map_err(|e| CopyFailure {
        category: ErrorCategory::Configuration,
        message: e.to_string(),
    })?;
    let committed = final_path(target_dir, source).map_err(|e| CopyFailure {
        category: ErrorCategory::Configuration,
        message: e.to_string(),
    })?;

    // Final names are unique by source name; an unrelated file already
    // sitting there fails the target permanently.
    if !allow_overwrite && tokio::fs::try_exists(&committed).await.unwrap_or(false) {
        return Err(CopyFailure {
            category: ErrorCategory::PermanentIo,
            message: format!("final path already exists: {}", committed.display()),
        });
    }

    let mut reader = match tokio::fs::File::open(source).await {
        Ok(file) => file,
        Err(err) => return Err(CopyFailure::from_io("open source", &err)),
    };

    // Create-or-truncate clears any stale remnant from an earlier attempt.
    let mut writer = match tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging)
        .await
    {
        Ok(file) => file,
        Err(err) => return Err(CopyFailure::from_io("open staging", &err)),
    };

    let (bytes_copied, hash) =
        match hasher::tee_hash(&mut reader, &mut writer, buffer_size, cancel).await {
            Ok(result) => result,
            Err(err) => {
                drop(writer);
                remove_staging(&staging).await;
                return Err(CopyFailure::from_io("stream", &err));
            }
        };

    if let Err(err) = writer.sync_all().await {
        drop(writer);
        remove_staging(&staging).await;
        return Err(CopyFailure::from_io("fsync staging", &err));
    }
    drop(writer);

    if allow_overwrite {
        if let Err(err) = tokio::fs::remove_file(&committed).await {
            if err.kind() != io::ErrorKind::NotFound {
                remove_staging(&staging).await;
                return Err(CopyFailure::from_io("replace final", &err));
            }
        }
    }

    if let Err(err) = tokio::fs::rename(&staging, &committed).await {
        remove_staging(&staging).await;
        return Err(CopyFailure::from_io("commit rename", &err));
    }

    // Make the rename itself durable where the platform needs it.
    #[cfg(unix)]
    if let Err(err) = fsync_dir(target_dir) {
        warn!(dir = %target_dir.display(), error = %err, "Directory fsync failed after commit");
    }

    debug!(
        source = %source.display(),
        target = %committed.display(),
        bytes = bytes_copied,
        "Copy committed"
    );

    Ok(CopySuccess {
        final_path: committed,
        staging_path: staging,
        hash,
        bytes_copied,
        duration: started.elapsed(),
    })
}

async fn remove_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %err, "Failed to remove staging file");
        }
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}
