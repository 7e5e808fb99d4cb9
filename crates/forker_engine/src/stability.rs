//! Stability detection for newly appearing files.
//!
//! A candidate is safe to copy once two consecutive size samples across
//! the check interval agree, an opportunistic exclusive-open probe
//! succeeds, and the last-modified timestamp is old enough. Candidates
//! that stay unstable for `max_checks` observations are abandoned until a
//! fresh filesystem event brings them back.
//!
//! The detector never mutates the file: it reads metadata and briefly
//! opens for a lock probe.

use crate::cancel::CancellationToken;
use chrono::{DateTime, Utc};
use forker_protocol::MonitoringConfig;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// One observation of a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityVerdict {
    /// Size settled, no writer holds the file, minimum age reached
    Stable,
    /// Size changed between samples or the file is too young
    StillGrowing,
    /// The exclusive-open probe failed: a writer likely holds the file
    Locked,
    /// Too many consecutive non-stable observations
    Abandoned,
}

/// Emitted once a candidate is stable.
#[derive(Debug, Clone)]
pub struct ReadyFile {
    pub path: PathBuf,
    pub size: u64,
    pub first_seen: DateTime<Utc>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StabilityDetector {
    min_age: Duration,
    check_interval: Duration,
    max_checks: u32,
}

impl StabilityDetector {
    pub fn new(min_age: Duration, check_interval: Duration, max_checks: u32) -> Self {
        Self {
            min_age,
            check_interval,
            max_checks: max_checks.max(1),
        }
    }

    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_file_age_seconds),
            Duration::from_secs(config.stability_check_interval_seconds),
            config.max_stability_checks,
        )
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// One observation: compare the current size against the previous
    /// sample, probe for writers, check age. Metadata errors propagate
    /// (a vanished file is the caller's signal to drop the candidate).
    pub async fn assess(
        &self,
        path: &Path,
        previous_size: Option<u64>,
    ) -> io::Result<(u64, StabilityVerdict)> {
        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();

        if previous_size != Some(size) {
            return Ok((size, StabilityVerdict::StillGrowing));
        }

        let age = meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < self.min_age {
            return Ok((size, StabilityVerdict::StillGrowing));
        }

        if !probe_no_writer(path) {
            return Ok((size, StabilityVerdict::Locked));
        }

        Ok((size, StabilityVerdict::Stable))
    }

    /// Drive the observation loop for one candidate. Resolves to
    /// `Ok(Some(ready))` when stable, `Ok(None)` when abandoned or
    /// cancelled, `Err` when the file vanishes or metadata fails.
    pub async fn await_stability(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> io::Result<Option<ReadyFile>> {
        let first_seen = Utc::now();
        let mut previous_size = None;
        let mut failed_checks = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let (size, verdict) = self.assess(path, previous_size).await?;
            match verdict {
                StabilityVerdict::Stable => {
                    return Ok(Some(ReadyFile {
                        path: path.to_path_buf(),
                        size,
                        first_seen,
                        last_check: Utc::now(),
                    }));
                }
                StabilityVerdict::StillGrowing | StabilityVerdict::Locked => {
                    failed_checks += 1;
                    if failed_checks >= self.max_checks {
                        debug!(path = %path.display(), checks = failed_checks, "Candidate abandoned");
                        return Ok(None);
                    }
                }
                StabilityVerdict::Abandoned => return Ok(None),
            }
            previous_size = Some(size);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
    }
}

/// Opportunistic probe: opening read+write succeeds only when no writer
/// holds the file exclusively. Read-only consumers are unaffected.
///
/// Files delivered with the read-only bit set reject the write probe
/// outright; a plain read open stands in for them.
fn probe_no_writer(path: &Path) -> bool {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => true,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            OpenOptions::new().read(true).open(path).is_ok()
        }
        Err(_) => false,
    }
}
