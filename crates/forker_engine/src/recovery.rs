//! Startup recovery.
//!
//! Rebuilds in-memory work from the store and puts every non-terminal job
//! back on the pipeline at the right step:
//!
//! - `Pending` / `FailedRetryable` targets are simply re-queued.
//! - `Copying` targets crashed mid-copy: staging remnants are deleted and
//!   the target returns to `Pending`. The attempt count is left alone -
//!   the interrupted attempt was already counted when it started.
//! - `Copying` targets whose final file exists hit the narrow window
//!   between rename and commit: when the file rehashes to the job's source
//!   hash the commit is honoured as `Copied`; otherwise the unacknowledged
//!   file is removed and the copy restarts.
//! - `Copied` targets are re-queued for verification; `Verifying` targets
//!   are downgraded to `Copied` first (their committed file is intact).
//! - `Verified` targets are left untouched (re-running copy+verify on a
//!   verified target is a no-op).
//!
//! The final rename is the atomic commit, so a crash at any earlier point
//! leaves only a staging file; deleting it can never lose committed work.

use crate::cancel::CancellationToken;
use crate::hasher;
use forker_protocol::{ForkerConfig, JobState, TargetCopyState};
use forker_store::{JobWithTargets, Store, TargetOutcome, TargetPatch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub jobs_scanned: usize,
    pub targets_reset: usize,
    pub commits_honoured: usize,
    pub staging_removed: usize,
}

pub struct Recovery {
    store: Arc<Store>,
    config: Arc<ForkerConfig>,
}

impl Recovery {
    pub fn new(store: Arc<Store>, config: Arc<ForkerConfig>) -> Self {
        Self { store, config }
    }

    /// Reconcile persisted state with the filesystem and return the jobs
    /// to resume, freshly re-read.
    pub async fn run(&self) -> anyhow::Result<(Vec<JobWithTargets>, RecoveryReport)> {
        let mut report = RecoveryReport::default();
        let jobs = self.store.find_resumable_jobs().await?;
        report.jobs_scanned = jobs.len();

        for job in &jobs {
            for target in &job.targets {
                self.fix_target(job, target, &mut report).await?;
            }

            // Crash between insert and queue: push the job forward so the
            // orchestrator picks it up.
            if job.job.state == JobState::Discovered {
                self.store
                    .update_job_state(
                        &job.job.id,
                        job.job.version,
                        JobState::Queued,
                        Some(serde_json::json!({ "recovered": true })),
                    )
                    .await?;
            }
        }

        let resumed = self.store.find_resumable_jobs().await?;
        info!(
            jobs = resumed.len(),
            targets_reset = report.targets_reset,
            commits_honoured = report.commits_honoured,
            staging_removed = report.staging_removed,
            "Recovery complete"
        );
        Ok((resumed, report))
    }

    async fn fix_target(
        &self,
        job: &JobWithTargets,
        target: &TargetOutcome,
        report: &mut RecoveryReport,
    ) -> anyhow::Result<()> {
        // Interrupted verification: the committed file is intact, so the
        // target re-queues as Copied and verification restarts. A live
        // session never leaves rows in Verifying, so seeing one here
        // always means a crash.
        if target.copy_state == TargetCopyState::Verifying {
            let next = if target.final_path.is_some() && target.target_hash.is_some() {
                TargetCopyState::Copied
            } else {
                TargetCopyState::Pending
            };
            self.store
                .update_target(
                    &job.job.id,
                    &target.target_id,
                    target.version,
                    next,
                    TargetPatch::default(),
                    Some(serde_json::json!({ "recovered": true })),
                )
                .await?;
            report.targets_reset += 1;
            return Ok(());
        }

        if target.copy_state != TargetCopyState::Copying {
            return Ok(());
        }

        let source = PathBuf::from(&job.job.source_path);
        let Some(target_cfg) = self
            .config
            .targets
            .iter()
            .find(|cfg| cfg.id == target.target_id)
        else {
            warn!(
                job_id = %job.job.id,
                target = %target.target_id,
                "No configuration for persisted target; leaving as-is"
            );
            return Ok(());
        };

        let staging = target
            .staging_path
            .clone()
            .map(PathBuf::from)
            .or_else(|| forker_protocol::staging_path(&target_cfg.path, &source).ok());
        let committed = forker_protocol::final_path(&target_cfg.path, &source).ok();

        // Rename-before-commit window: the file made it to its final name
        // but the store never heard about it.
        if let Some(committed) = &committed {
            if committed.exists() {
                if let Some(expected) = job.job.source_hash.as_deref() {
                    let cancel = CancellationToken::new();
                    let rehash = hasher::hash_file(
                        committed,
                        self.config.copy.buffer_size_bytes,
                        &cancel,
                    )
                    .await;
                    if let Ok((_, hash)) = rehash {
                        if hash == expected {
                            self.store
                                .update_target(
                                    &job.job.id,
                                    &target.target_id,
                                    target.version,
                                    TargetCopyState::Copied,
                                    TargetPatch {
                                        final_path: Some(committed.display().to_string()),
                                        target_hash: Some(hash),
                                        ..TargetPatch::default()
                                    },
                                    Some(serde_json::json!({ "recovered": true })),
                                )
                                .await?;
                            report.commits_honoured += 1;
                            debug!(
                                job_id = %job.job.id,
                                target = %target.target_id,
                                "Unrecorded commit honoured after rehash"
                            );
                            return Ok(());
                        }
                    }
                }
                // The file cannot be vouched for; it never became an
                // acknowledged commit, so removing it loses nothing.
                remove_quietly(committed, report);
            }
        }

        if let Some(staging) = &staging {
            if staging.exists() {
                remove_quietly(staging, report);
            }
        }

        self.store
            .update_target(
                &job.job.id,
                &target.target_id,
                target.version,
                TargetCopyState::Pending,
                TargetPatch::default(),
                Some(serde_json::json!({ "recovered": true })),
            )
            .await?;
        report.targets_reset += 1;
        debug!(
            job_id = %job.job.id,
            target = %target.target_id,
            attempts = target.attempts,
            "Interrupted copy reset to Pending"
        );
        Ok(())
    }
}

fn remove_quietly(path: &Path, report: &mut RecoveryReport) {
    match std::fs::remove_file(path) {
        Ok(()) => report.staging_removed += 1,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove remnant"),
    }
}
