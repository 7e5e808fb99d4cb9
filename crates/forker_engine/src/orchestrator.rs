//! Dual-target orchestration.
//!
//! Each job gets one task per target; the two advance independently and
//! only the final rendezvous is joint - progress on one target never
//! gates the other. A task owns its target row: it is the
//! only writer between manual operations, persisting every transition
//! through the store before moving on.
//!
//! Concurrency is bounded per target directory by a semaphore sized from
//! `max_concurrent_copies_per_target`; verifications share one engine-wide
//! semaphore.

use crate::cancel::CancellationToken;
use crate::copier::{copy_to_target, CopyFailure, CopySuccess};
use crate::events::EngineEvent;
use crate::metrics::METRICS;
use crate::retry::RetryPolicy;
use crate::verifier::{verify_target, VerifyOutcome};
use forker_protocol::{
    now_millis, ErrorCategory, ForkerConfig, JobId, TargetCopyState, TargetConfig, TargetId,
};
use forker_store::{JobWithTargets, Store, StoreError, TargetOutcome, TargetPatch, TargetSnapshot};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<Store>,
    config: Arc<ForkerConfig>,
    copy_slots: HashMap<TargetId, Arc<Semaphore>>,
    verify_slots: Arc<Semaphore>,
    retry: RetryPolicy,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        config: Arc<ForkerConfig>,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let copy_slots = config
            .targets
            .iter()
            .map(|target| {
                (
                    target.id.clone(),
                    Arc::new(Semaphore::new(config.copy.max_concurrent_copies_per_target)),
                )
            })
            .collect();
        let verify_slots = Arc::new(Semaphore::new(config.copy.max_concurrent_verifications));
        let retry = RetryPolicy::from_config(&config.copy);
        Self {
            store,
            config,
            copy_slots,
            verify_slots,
            retry,
            events,
            cancel,
        }
    }

    /// Spawn one task per non-terminal target. Higher-priority targets are
    /// spawned first so they queue first on their copy slots.
    ///
    /// `Copying` and `Verifying` rows are skipped: in-session they belong
    /// to a live task (recovery downgrades crash-left rows before any task
    /// is spawned), and a second task on the same row would race it.
    pub fn spawn_job(&self, job: &JobWithTargets) {
        for target_cfg in self.config.targets_by_priority() {
            let Some(outcome) = job.target(&target_cfg.id) else {
                error!(job_id = %job.job.id, target = %target_cfg.id, "Job has no outcome row for configured target");
                continue;
            };
            if outcome.copy_state.is_terminal()
                || matches!(
                    outcome.copy_state,
                    TargetCopyState::Copying | TargetCopyState::Verifying
                )
            {
                continue;
            }
            let this = self.clone();
            let job_id = job.job.id;
            let target_cfg = target_cfg.clone();
            tokio::spawn(async move {
                this.run_target(job_id, target_cfg).await;
            });
        }
    }

    /// Drive one target from its current persisted state to a terminal
    /// state, re-reading the row at each step.
    async fn run_target(&self, job_id: JobId, target_cfg: TargetConfig) {
        let target_id = target_cfg.id.clone();
        let mut prev_delay = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let target = match self.store.get_target(&job_id, &target_id).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    error!(job_id = %job_id, target = %target_id, "Target row vanished");
                    return;
                }
                Err(err) => {
                    error!(job_id = %job_id, target = %target_id, error = %err, "Store read failed; leaving target for recovery");
                    return;
                }
            };

            let committed = target.final_path.is_some() && target.target_hash.is_some();
            let step = match target.copy_state {
                TargetCopyState::Verified | TargetCopyState::FailedPermanent => return,
                // A live task owns the row; rows left behind by a crash are
                // downgraded by recovery before tasks exist.
                TargetCopyState::Copying | TargetCopyState::Verifying => return,
                TargetCopyState::Copied => Step::Verify,
                TargetCopyState::FailedRetryable if committed => Step::Verify,
                _ => Step::Copy,
            };

            let outcome = match step {
                Step::Copy => self.copy_step(&job_id, &target_cfg, &target).await,
                Step::Verify => self.verify_step(&job_id, &target_cfg, &target).await,
            };

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::RetryAfter(delay) => {
                    let delay = delay.max(prev_delay);
                    prev_delay = delay;
                    METRICS.inc_retries_scheduled();
                    debug!(job_id = %job_id, target = %target_id, ?delay, "Retry scheduled");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                StepOutcome::Done => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Copy
    // ------------------------------------------------------------------

    async fn copy_step(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        target: &TargetOutcome,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;
        let Some(slots) = self.copy_slots.get(target_id) else {
            error!(target = %target_id, "No copy slots configured for target");
            return StepOutcome::Done;
        };
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return StepOutcome::Done,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return StepOutcome::Done,
            },
        };

        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            _ => return StepOutcome::Done,
        };
        let source = PathBuf::from(&job.source_path);
        let staging = match forker_protocol::staging_path(&target_cfg.path, &source) {
            Ok(path) => path,
            Err(err) => {
                return self
                    .fail_permanent(
                        job_id,
                        target_cfg,
                        target.version,
                        target.attempts,
                        "COPY",
                        ErrorCategory::Configuration,
                        err.to_string(),
                    )
                    .await;
            }
        };

        let attempts = target.attempts + 1;
        let version = match self
            .store
            .update_target(
                job_id,
                target_id,
                target.version,
                TargetCopyState::Copying,
                TargetPatch {
                    staging_path: Some(staging.display().to_string()),
                    attempts: Some(attempts),
                    ..TargetPatch::default()
                },
                Some(serde_json::json!({ "attempt": attempts })),
            )
            .await
        {
            Ok(version) => version,
            Err(StoreError::VersionConflict { .. }) => return StepOutcome::Continue,
            Err(err) => {
                error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist Copying");
                return StepOutcome::Done;
            }
        };

        METRICS.inc_copies_started();
        if self
            .events
            .send(EngineEvent::CopyStarted { job_id: *job_id })
            .await
            .is_err()
        {
            return StepOutcome::Done;
        }

        // Re-copy over our own committed file only (quarantine release);
        // an unrelated occupant of the final name stays a collision.
        let expected_final = forker_protocol::final_path(&target_cfg.path, &source)
            .map(|p| p.display().to_string())
            .ok();
        let allow_overwrite = target.final_path.is_some() && target.final_path == expected_final;

        let started = Instant::now();
        let result = copy_to_target(
            &source,
            &target_cfg.path,
            self.config.copy.buffer_size_bytes,
            &self.cancel,
            allow_overwrite,
        )
        .await;
        drop(permit);

        match result {
            Ok(success) => {
                self.after_copy_success(job_id, target_cfg, version, attempts, started, success)
                    .await
            }
            Err(failure) => {
                METRICS.inc_copies_failed();
                if self.cancel.is_cancelled() {
                    // Recovery resets the Copying row on next start.
                    return StepOutcome::Done;
                }
                self.handle_failure(job_id, target_cfg, version, attempts, "COPY", failure)
                    .await
            }
        }
    }

    async fn after_copy_success(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        version: i64,
        attempts: i64,
        started: Instant,
        success: CopySuccess,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;

        // First copy to finish donates the source hash; the loser's hash
        // is checked against it at verification.
        match self.store.set_source_hash(job_id, &success.hash).await {
            Ok(true) => debug!(job_id = %job_id, target = %target_id, "Source hash persisted"),
            Ok(false) => {}
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Failed to persist source hash");
                return StepOutcome::Done;
            }
        }

        let context = serde_json::json!({
            "bytes_copied": success.bytes_copied,
            "duration_ms": success.duration.as_millis() as u64,
            "hash": success.hash,
        });
        let version = match self
            .store
            .update_target(
                job_id,
                target_id,
                version,
                TargetCopyState::Copied,
                TargetPatch {
                    final_path: Some(success.final_path.display().to_string()),
                    target_hash: Some(success.hash.clone()),
                    ..TargetPatch::default()
                },
                Some(context),
            )
            .await
        {
            Ok(version) => version,
            Err(err) => {
                error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist Copied");
                return StepOutcome::Done;
            }
        };
        METRICS.record_copy_committed(success.bytes_copied, started);
        info!(
            job_id = %job_id,
            target = %target_id,
            bytes = success.bytes_copied,
            "Copy committed"
        );

        if target_cfg.verify_after_copy {
            return StepOutcome::Continue;
        }

        // Verification skipped by configuration: the copy-pass hash is
        // trusted, but it still has to agree with the job's source hash
        // before the target may claim Verified.
        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            _ => return StepOutcome::Done,
        };
        match job.source_hash.as_deref() {
            Some(expected) if expected == success.hash => {
                match self
                    .store
                    .update_target(
                        job_id,
                        target_id,
                        version,
                        TargetCopyState::Verified,
                        TargetPatch::default(),
                        Some(serde_json::json!({ "verify_after_copy": false })),
                    )
                    .await
                {
                    Ok(_) => {
                        let _ = self
                            .events
                            .send(EngineEvent::TargetVerified {
                                job_id: *job_id,
                                target_id: target_id.clone(),
                            })
                            .await;
                        StepOutcome::Done
                    }
                    Err(err) => {
                        error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist Verified");
                        StepOutcome::Done
                    }
                }
            }
            Some(expected) => {
                self.report_mismatch(
                    job_id,
                    target_cfg,
                    version,
                    expected.to_string(),
                    success.hash,
                    Some(success.final_path.display().to_string()),
                )
                .await
            }
            None => {
                self.fail_permanent(
                    job_id,
                    target_cfg,
                    version,
                    attempts,
                    "COPY",
                    ErrorCategory::Unknown,
                    "source hash missing after successful copy".to_string(),
                )
                .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Verify
    // ------------------------------------------------------------------

    async fn verify_step(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        target: &TargetOutcome,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;
        let Some(final_path) = target.final_path.clone() else {
            error!(job_id = %job_id, target = %target_id, "Verify step without a committed path");
            return StepOutcome::Done;
        };

        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            _ => return StepOutcome::Done,
        };
        let Some(expected) = job.source_hash.clone() else {
            return self
                .fail_permanent(
                    job_id,
                    target_cfg,
                    target.version,
                    target.attempts,
                    "VERIFY",
                    ErrorCategory::Unknown,
                    "job has no source hash to verify against".to_string(),
                )
                .await;
        };

        // Re-entry after a retryable verify failure is a fresh attempt;
        // the first verification rides on the copy's attempt.
        let attempts = if target.copy_state == TargetCopyState::FailedRetryable {
            target.attempts + 1
        } else {
            target.attempts
        };

        let mut version = target.version;
        if target.copy_state != TargetCopyState::Verifying {
            version = match self
                .store
                .update_target(
                    job_id,
                    target_id,
                    version,
                    TargetCopyState::Verifying,
                    TargetPatch {
                        attempts: Some(attempts),
                        ..TargetPatch::default()
                    },
                    None,
                )
                .await
            {
                Ok(version) => version,
                Err(StoreError::VersionConflict { .. }) => return StepOutcome::Continue,
                Err(err) => {
                    error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist Verifying");
                    return StepOutcome::Done;
                }
            };
        }

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return StepOutcome::Done,
            permit = self.verify_slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return StepOutcome::Done,
            },
        };

        let started = Instant::now();
        let outcome = verify_target(
            std::path::Path::new(&final_path),
            &expected,
            self.config.copy.buffer_size_bytes,
            &self.cancel,
        )
        .await;

        match outcome {
            VerifyOutcome::Match { hash, .. } => {
                METRICS.inc_verifications_passed();
                METRICS.record_verify_time(started);
                match self
                    .store
                    .update_target(
                        job_id,
                        target_id,
                        version,
                        TargetCopyState::Verified,
                        TargetPatch::default(),
                        Some(serde_json::json!({ "hash": hash })),
                    )
                    .await
                {
                    Ok(_) => {
                        info!(job_id = %job_id, target = %target_id, "Target verified");
                        let _ = self
                            .events
                            .send(EngineEvent::TargetVerified {
                                job_id: *job_id,
                                target_id: target_id.clone(),
                            })
                            .await;
                        StepOutcome::Done
                    }
                    Err(err) => {
                        error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist Verified");
                        StepOutcome::Done
                    }
                }
            }
            VerifyOutcome::Mismatch {
                expected, computed, ..
            } => {
                METRICS.inc_verifications_failed();
                self.report_mismatch(
                    job_id,
                    target_cfg,
                    version,
                    expected,
                    computed,
                    Some(final_path),
                )
                .await
            }
            VerifyOutcome::IoError { category, message } => {
                METRICS.inc_verifications_failed();
                if self.cancel.is_cancelled() {
                    return StepOutcome::Done;
                }
                self.handle_failure(
                    job_id,
                    target_cfg,
                    version,
                    attempts,
                    "VERIFY",
                    CopyFailure { category, message },
                )
                .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure routing
    // ------------------------------------------------------------------

    async fn handle_failure(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        version: i64,
        attempts: i64,
        operation: &'static str,
        failure: CopyFailure,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;
        warn!(
            job_id = %job_id,
            target = %target_id,
            operation,
            category = %failure.category,
            attempts,
            "{}",
            failure.message
        );

        if self.retry.can_retry(failure.category, attempts as u32) {
            match self
                .store
                .update_target(
                    job_id,
                    target_id,
                    version,
                    TargetCopyState::FailedRetryable,
                    TargetPatch {
                        last_error_category: Some(failure.category),
                        last_error: Some(failure.message.clone()),
                        ..TargetPatch::default()
                    },
                    Some(serde_json::json!({ "operation": operation })),
                )
                .await
            {
                Ok(_) => {
                    let delay = self
                        .retry
                        .next_delay(attempts as u32 + 1, Duration::ZERO);
                    StepOutcome::RetryAfter(delay)
                }
                Err(err) => {
                    error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist FailedRetryable");
                    StepOutcome::Done
                }
            }
        } else {
            self.fail_permanent(
                job_id,
                target_cfg,
                version,
                attempts,
                operation,
                failure.category,
                failure.message,
            )
            .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_permanent(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        version: i64,
        attempts: i64,
        operation: &'static str,
        category: ErrorCategory,
        message: String,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;
        match self
            .store
            .update_target(
                job_id,
                target_id,
                version,
                TargetCopyState::FailedPermanent,
                TargetPatch {
                    last_error_category: Some(category),
                    last_error: Some(message.clone()),
                    ..TargetPatch::default()
                },
                Some(serde_json::json!({ "operation": operation })),
            )
            .await
        {
            Ok(_) => {
                let _ = self
                    .events
                    .send(EngineEvent::TargetFailedPermanent {
                        job_id: *job_id,
                        target_id: target_id.clone(),
                        operation,
                        category,
                        message,
                        attempts,
                    })
                    .await;
                StepOutcome::Done
            }
            Err(err) => {
                error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist FailedPermanent");
                StepOutcome::Done
            }
        }
    }

    async fn report_mismatch(
        &self,
        job_id: &JobId,
        target_cfg: &TargetConfig,
        version: i64,
        expected: String,
        computed: String,
        path: Option<String>,
    ) -> StepOutcome {
        let target_id = &target_cfg.id;
        let message = format!("hash mismatch: expected {expected}, computed {computed}");
        match self
            .store
            .update_target(
                job_id,
                target_id,
                version,
                TargetCopyState::FailedPermanent,
                TargetPatch {
                    last_error_category: Some(ErrorCategory::Integrity),
                    last_error: Some(message.clone()),
                    ..TargetPatch::default()
                },
                Some(serde_json::json!({ "expected": expected, "computed": computed })),
            )
            .await
        {
            Ok(_) => {
                warn!(job_id = %job_id, target = %target_id, "{message}");
                let snapshot = TargetSnapshot {
                    target_id: target_id.clone(),
                    path,
                    expected_hash: Some(expected),
                    computed_hash: Some(computed),
                    error: Some(message),
                    timestamp_ms: now_millis(),
                };
                let _ = self
                    .events
                    .send(EngineEvent::TargetMismatch {
                        job_id: *job_id,
                        target_id: target_id.clone(),
                        snapshot,
                    })
                    .await;
                StepOutcome::Done
            }
            Err(err) => {
                error!(job_id = %job_id, target = %target_id, error = %err, "Failed to persist mismatch");
                StepOutcome::Done
            }
        }
    }
}

enum Step {
    Copy,
    Verify,
}

enum StepOutcome {
    /// Re-read the target row and take the next step
    Continue,
    /// Sleep, then re-read and retry
    RetryAfter(Duration),
    /// This task is finished (terminal state or unrecoverable store error)
    Done,
}
