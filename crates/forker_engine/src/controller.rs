//! Job controller: the top-level state machine.
//!
//! ```text
//! Discovered -> Queued -> InProgress -> Partial -> Verified
//!                                    \          \
//!                                     Failed     Quarantined
//! ```
//!
//! The controller is the only writer of job-level state. It consumes
//! engine events serially, re-reads the job on every decision, and commits
//! each transition under optimistic versioning with a small bounded retry
//! on conflict.

use crate::cancel::CancellationToken;
use crate::events::EngineEvent;
use crate::metrics::METRICS;
use crate::orchestrator::Orchestrator;
use forker_protocol::{ErrorCategory, JobId, JobState, TargetCopyState, TargetId};
use forker_store::{
    JobWithTargets, NewDeadLetter, NewJob, Store, StoreError, TargetSnapshot,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bounded re-read-and-retry on version conflicts before logging an anomaly.
const MAX_TRANSITION_RETRIES: u32 = 3;

pub struct JobController {
    store: Arc<Store>,
    orchestrator: Orchestrator,
    target_ids: [TargetId; 2],
    cancel: CancellationToken,
}

impl JobController {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Orchestrator,
        target_ids: [TargetId; 2],
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            orchestrator,
            target_ids,
            cancel,
        }
    }

    /// Consume engine events until cancellation closes the channel side.
    pub async fn run(&self, mut events: mpsc::Receiver<EngineEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.handle_event(event).await {
                error!(error = %err, "Event handling failed; recovery will reconcile");
            }
        }
        debug!("Controller loop stopped");
    }

    pub async fn handle_event(&self, event: EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::FileReady { path, size } => self.on_file_ready(&path, size).await,
            EngineEvent::CopyStarted { job_id } => self.on_copy_started(&job_id).await,
            EngineEvent::TargetVerified { job_id, target_id } => {
                debug!(job_id = %job_id, target = %target_id, "Target verified");
                self.reconcile_job(&job_id).await
            }
            EngineEvent::TargetMismatch {
                job_id,
                target_id,
                snapshot,
            } => self.on_mismatch(&job_id, &target_id, snapshot).await,
            EngineEvent::TargetFailedPermanent {
                job_id, target_id, ..
            } => {
                warn!(job_id = %job_id, target = %target_id, "Target failed permanently");
                self.reconcile_job(&job_id).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery intake
    // ------------------------------------------------------------------

    async fn on_file_ready(&self, path: &Path, size: u64) -> anyhow::Result<()> {
        let source_path = path.display().to_string();

        // One job per source path: a restart re-emits FileReady for files
        // already replicated, and re-running copy+verify on a completed
        // job must be a no-op.
        if let Some(existing) = self.store.find_job_by_source_path(&source_path).await? {
            debug!(
                job_id = %existing.id,
                state = %existing.state,
                "Source path already tracked; ignoring FileReady"
            );
            return Ok(());
        }

        let inserted = self
            .store
            .insert_job(NewJob {
                id: JobId::generate(),
                source_path: source_path.clone(),
                expected_size: size as i64,
                target_ids: self.target_ids.clone(),
            })
            .await?;
        METRICS.inc_jobs_discovered();

        self.store
            .update_job_state(
                &inserted.job.id,
                inserted.job.version,
                JobState::Queued,
                Some(serde_json::json!({ "size": size })),
            )
            .await?;
        info!(job_id = %inserted.job.id, source = %source_path, size, "Job queued");

        let job = self
            .store
            .get_job_with_targets(&inserted.job.id)
            .await?
            .ok_or(StoreError::JobNotFound(inserted.job.id))?;
        self.orchestrator.spawn_job(&job);
        Ok(())
    }

    async fn on_copy_started(&self, job_id: &JobId) -> anyhow::Result<()> {
        // Both target tasks report the start; only the first one moves the
        // job out of Queued.
        for _ in 0..MAX_TRANSITION_RETRIES {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Ok(());
            };
            if job.state != JobState::Queued {
                return Ok(());
            }
            match self
                .store
                .update_job_state(job_id, job.version, JobState::InProgress, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        warn!(job_id = %job_id, "Gave up moving job to InProgress after version conflicts");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integrity failures
    // ------------------------------------------------------------------

    async fn on_mismatch(
        &self,
        job_id: &JobId,
        target_id: &TargetId,
        snapshot: TargetSnapshot,
    ) -> anyhow::Result<()> {
        for _ in 0..MAX_TRANSITION_RETRIES {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Ok(());
            };
            if job.state.is_terminal() {
                // Already settled: a second mismatch on a quarantined job,
                // or the reconcile path quarantined from the persisted
                // rows first. The existing entry holds the job; this one
                // is recorded in the log only.
                warn!(
                    job_id = %job_id,
                    target = %target_id,
                    state = %job.state,
                    "Mismatch on already-terminal job"
                );
                return Ok(());
            }
            match self
                .store
                .quarantine_job(job_id, job.version, "hash mismatch", &[snapshot.clone()])
                .await
            {
                Ok(entry) => {
                    METRICS.inc_jobs_quarantined();
                    warn!(
                        job_id = %job_id,
                        target = %target_id,
                        entry = %entry.id,
                        "Job quarantined on hash mismatch"
                    );
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        error!(job_id = %job_id, "Gave up quarantining job after version conflicts");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joint rendezvous
    // ------------------------------------------------------------------

    /// Recompute the job state from its target states and commit the
    /// transition if one is due. Also used at startup for jobs whose
    /// targets all finished before a crash.
    pub async fn reconcile_job(&self, job_id: &JobId) -> anyhow::Result<()> {
        for _ in 0..MAX_TRANSITION_RETRIES {
            let Some(job) = self.store.get_job_with_targets(job_id).await? else {
                return Ok(());
            };
            if job.job.state.is_terminal() {
                return Ok(());
            }

            let Some(next) = derive_job_state(&job) else {
                return Ok(());
            };
            if next == job.job.state {
                return Ok(());
            }

            let result = match next {
                JobState::Failed => {
                    let dead_letters = dead_letters_for(&job);
                    self.store
                        .fail_job_with_dead_letters(job_id, job.job.version, dead_letters)
                        .await
                        .map(|_| ())
                }
                // Reached when the sibling target's terminal event lands
                // before the mismatch event: quarantine from the persisted
                // rows instead of failing the job.
                JobState::Quarantined => {
                    let snapshots = snapshots_from_rows(&job);
                    self.store
                        .quarantine_job(job_id, job.job.version, "hash mismatch", &snapshots)
                        .await
                        .map(|_| ())
                }
                _ => self
                    .store
                    .update_job_state(job_id, job.job.version, next, None)
                    .await
                    .map(|_| ()),
            };

            match result {
                Ok(()) => {
                    match next {
                        JobState::Verified => {
                            METRICS.inc_jobs_verified();
                            info!(job_id = %job_id, "Job verified on both targets");
                        }
                        JobState::Failed => {
                            METRICS.inc_jobs_failed();
                            warn!(job_id = %job_id, "Job failed");
                        }
                        JobState::Quarantined => {
                            METRICS.inc_jobs_quarantined();
                            warn!(job_id = %job_id, "Job quarantined on hash mismatch");
                        }
                        JobState::Partial => {
                            debug!(job_id = %job_id, "Job partial: one target verified");
                        }
                        _ => {}
                    }
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        error!(job_id = %job_id, "Gave up reconciling job after version conflicts");
        Ok(())
    }
}

/// Job state implied by the target states, if a transition is due.
///
/// An integrity failure on any target forces `Quarantined` no matter what
/// the sibling did - a hash mismatch is never dead-letter material.
/// Otherwise `Verified` requires both targets verified; `Partial` requires
/// at least one verified with the other still in flight; `Failed` requires
/// all targets terminal with at least one permanent failure.
pub fn derive_job_state(job: &JobWithTargets) -> Option<JobState> {
    if job.targets.iter().any(is_integrity_failure) {
        return Some(JobState::Quarantined);
    }
    if job.all_targets_verified() {
        return Some(JobState::Verified);
    }
    if job.all_targets_terminal() && job.any_target_failed_permanent() {
        return Some(JobState::Failed);
    }
    let any_verified = job
        .targets
        .iter()
        .any(|t| t.copy_state == TargetCopyState::Verified);
    if any_verified {
        return Some(JobState::Partial);
    }
    None
}

fn is_integrity_failure(target: &forker_store::TargetOutcome) -> bool {
    target.copy_state == TargetCopyState::FailedPermanent
        && target.error_category() == Some(ErrorCategory::Integrity)
}

/// Dead-letter entries for a job settling in `Failed`. Integrity failures
/// are excluded: those belong to quarantine, not the dead-letter set.
fn dead_letters_for(job: &JobWithTargets) -> Vec<NewDeadLetter> {
    job.targets
        .iter()
        .filter(|t| t.copy_state == TargetCopyState::FailedPermanent && !is_integrity_failure(t))
        .map(|t| NewDeadLetter {
            job_id: job.job.id,
            target_id: Some(t.target_id.clone()),
            operation: if t.target_hash.is_some() {
                "VERIFY".to_string()
            } else {
                "COPY".to_string()
            },
            error_category: t.error_category().unwrap_or(ErrorCategory::Unknown),
            error_message: t
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
            attempts: t.attempts,
        })
        .collect()
}

/// Forensic snapshots reconstructed from persisted rows, for the case
/// where the job quarantines off the rendezvous path and the original
/// mismatch event has not been processed yet.
fn snapshots_from_rows(job: &JobWithTargets) -> Vec<TargetSnapshot> {
    job.targets
        .iter()
        .filter(|t| is_integrity_failure(t))
        .map(|t| TargetSnapshot {
            target_id: t.target_id.clone(),
            path: t.final_path.clone(),
            expected_hash: job.job.source_hash.clone(),
            computed_hash: None,
            error: t.last_error.clone(),
            timestamp_ms: forker_protocol::now_millis(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_protocol::defaults::{TARGET_A_ID, TARGET_B_ID};
    use forker_store::{FileJob, TargetOutcome};

    fn job_with(states: [TargetCopyState; 2]) -> JobWithTargets {
        let job_id = JobId::generate();
        let target = |id: &str, state: TargetCopyState| TargetOutcome {
            job_id,
            target_id: TargetId::new(id),
            copy_state: state,
            staging_path: None,
            final_path: None,
            target_hash: None,
            attempts: 0,
            last_error_category: None,
            last_error: None,
            version: 1,
            created_at: 0,
            updated_at: 0,
        };
        JobWithTargets {
            job: FileJob {
                id: job_id,
                source_path: "/source/slide.svs".into(),
                expected_size: 0,
                source_hash: None,
                state: JobState::InProgress,
                version: 3,
                created_at: 0,
                updated_at: 0,
            },
            targets: vec![
                target(TARGET_A_ID, states[0]),
                target(TARGET_B_ID, states[1]),
            ],
        }
    }

    #[test]
    fn both_verified_means_verified() {
        let job = job_with([TargetCopyState::Verified, TargetCopyState::Verified]);
        assert_eq!(derive_job_state(&job), Some(JobState::Verified));
    }

    #[test]
    fn one_verified_one_running_means_partial() {
        let job = job_with([TargetCopyState::Verified, TargetCopyState::Copying]);
        assert_eq!(derive_job_state(&job), Some(JobState::Partial));
    }

    #[test]
    fn one_verified_one_permanent_means_failed() {
        let job = job_with([TargetCopyState::Verified, TargetCopyState::FailedPermanent]);
        assert_eq!(derive_job_state(&job), Some(JobState::Failed));
    }

    #[test]
    fn both_running_means_no_transition() {
        let job = job_with([TargetCopyState::Copying, TargetCopyState::Pending]);
        assert_eq!(derive_job_state(&job), None);
    }

    #[test]
    fn permanent_with_other_still_running_waits() {
        // The failed target never gates the other; the job only settles
        // once both are terminal.
        let job = job_with([TargetCopyState::FailedPermanent, TargetCopyState::Copying]);
        assert_eq!(derive_job_state(&job), None);
    }

    #[test]
    fn dead_letters_cover_each_permanent_target() {
        let mut job = job_with([TargetCopyState::FailedPermanent, TargetCopyState::Verified]);
        job.targets[0].last_error = Some("access denied".into());
        job.targets[0].last_error_category = Some("PERMANENT_IO".into());
        job.targets[0].attempts = 3;

        let entries = dead_letters_for(&job);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_id.as_ref().unwrap().as_str(), TARGET_A_ID);
        assert_eq!(entries[0].error_category, ErrorCategory::PermanentIo);
        assert_eq!(entries[0].attempts, 3);
    }

    #[test]
    fn integrity_failure_outranks_failed_when_both_targets_are_permanent() {
        // One hash mismatch, one genuine permanent failure: the job must
        // quarantine, and the mismatch never becomes a dead letter.
        let mut job = job_with([
            TargetCopyState::FailedPermanent,
            TargetCopyState::FailedPermanent,
        ]);
        job.targets[0].last_error_category = Some("INTEGRITY".into());
        job.targets[0].last_error = Some("hash mismatch: expected aaaa, computed bbbb".into());
        job.targets[1].last_error_category = Some("PERMANENT_IO".into());
        job.targets[1].last_error = Some("access denied".into());

        assert_eq!(derive_job_state(&job), Some(JobState::Quarantined));

        let entries = dead_letters_for(&job);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_id.as_ref().unwrap().as_str(), TARGET_B_ID);
        assert_eq!(entries[0].error_category, ErrorCategory::PermanentIo);
    }

    #[test]
    fn integrity_failure_forces_quarantine_while_sibling_runs() {
        let mut job = job_with([TargetCopyState::FailedPermanent, TargetCopyState::Copying]);
        job.targets[0].last_error_category = Some("INTEGRITY".into());

        assert_eq!(derive_job_state(&job), Some(JobState::Quarantined));
    }

    #[test]
    fn row_snapshots_cover_only_integrity_targets() {
        let mut job = job_with([
            TargetCopyState::FailedPermanent,
            TargetCopyState::FailedPermanent,
        ]);
        job.job.source_hash = Some("aaaa".into());
        job.targets[0].last_error_category = Some("INTEGRITY".into());
        job.targets[0].last_error = Some("hash mismatch: expected aaaa, computed bbbb".into());
        job.targets[0].final_path = Some("/targets/a/slide.svs".into());
        job.targets[1].last_error_category = Some("PERMANENT_IO".into());

        let snapshots = snapshots_from_rows(&job);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].target_id.as_str(), TARGET_A_ID);
        assert_eq!(snapshots[0].expected_hash.as_deref(), Some("aaaa"));
        assert_eq!(
            snapshots[0].path.as_deref(),
            Some("/targets/a/slide.svs")
        );
    }

    mod rendezvous {
        use super::*;
        use crate::orchestrator::Orchestrator;
        use forker_protocol::{DeadLetterStatus, ForkerConfig, QuarantineStatus};
        use forker_store::TargetPatch;
        use std::path::PathBuf;
        use std::sync::Arc;
        use tokio::sync::mpsc;

        fn controller(store: Arc<Store>) -> JobController {
            let config = Arc::new(ForkerConfig::with_default_targets(
                PathBuf::from("/source"),
                PathBuf::from("/targets/a"),
                PathBuf::from("/targets/b"),
                PathBuf::from("/quarantine"),
            ));
            let cancel = CancellationToken::new();
            let (events_tx, _events_rx) = mpsc::channel(16);
            let orchestrator =
                Orchestrator::new(store.clone(), config, events_tx, cancel.clone());
            JobController::new(
                store,
                orchestrator,
                [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
                cancel,
            )
        }

        async fn seed_mixed_failures(store: &Store) -> (JobId, TargetSnapshot) {
            let inserted = store
                .insert_job(NewJob {
                    id: JobId::generate(),
                    source_path: "/source/slide-01.svs".into(),
                    expected_size: 1024,
                    target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
                })
                .await
                .unwrap();
            let id = inserted.job.id;
            let mut version = 1;
            for state in [JobState::Queued, JobState::InProgress] {
                version = store
                    .update_job_state(&id, version, state, None)
                    .await
                    .unwrap();
            }
            let _ = version;
            store.set_source_hash(&id, "aaaa").await.unwrap();

            // TargetA: hash mismatch committed as a permanent integrity
            // failure by its task.
            store
                .update_target(
                    &id,
                    &TargetId::new(TARGET_A_ID),
                    1,
                    TargetCopyState::FailedPermanent,
                    TargetPatch {
                        final_path: Some("/targets/a/slide-01.svs".into()),
                        target_hash: Some("aaaa".into()),
                        last_error_category: Some(ErrorCategory::Integrity),
                        last_error: Some("hash mismatch: expected aaaa, computed bbbb".into()),
                        ..TargetPatch::default()
                    },
                    None,
                )
                .await
                .unwrap();

            // TargetB: genuine permanent failure.
            store
                .update_target(
                    &id,
                    &TargetId::new(TARGET_B_ID),
                    1,
                    TargetCopyState::FailedPermanent,
                    TargetPatch {
                        attempts: Some(1),
                        last_error_category: Some(ErrorCategory::PermanentIo),
                        last_error: Some("access denied".into()),
                        ..TargetPatch::default()
                    },
                    None,
                )
                .await
                .unwrap();

            let snapshot = TargetSnapshot {
                target_id: TargetId::new(TARGET_A_ID),
                path: Some("/targets/a/slide-01.svs".into()),
                expected_hash: Some("aaaa".into()),
                computed_hash: Some("bbbb".into()),
                error: Some("hash mismatch".into()),
                timestamp_ms: forker_protocol::now_millis(),
            };
            (id, snapshot)
        }

        #[tokio::test]
        async fn sibling_failure_event_first_still_quarantines() {
            // The reported race: TargetB's permanent-failure event reaches
            // the controller before TargetA's mismatch event.
            let store = Arc::new(Store::open_in_memory().await.unwrap());
            let controller = controller(store.clone());
            let (id, snapshot) = seed_mixed_failures(&store).await;

            controller
                .handle_event(EngineEvent::TargetFailedPermanent {
                    job_id: id,
                    target_id: TargetId::new(TARGET_B_ID),
                    operation: "COPY",
                    category: ErrorCategory::PermanentIo,
                    message: "access denied".into(),
                    attempts: 1,
                })
                .await
                .unwrap();

            let job = store.get_job(&id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Quarantined);

            let entries = store
                .list_quarantine(Some(QuarantineStatus::Active))
                .await
                .unwrap();
            assert_eq!(entries.len(), 1);
            let snapshots = entries[0].snapshots().unwrap();
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].target_id.as_str(), TARGET_A_ID);

            // The mismatch is not in the dead-letter set.
            let dead = store.list_dead_letters(None).await.unwrap();
            assert!(dead.is_empty());

            // The late mismatch event neither fails the job nor doubles
            // the quarantine entry.
            controller
                .handle_event(EngineEvent::TargetMismatch {
                    job_id: id,
                    target_id: TargetId::new(TARGET_A_ID),
                    snapshot,
                })
                .await
                .unwrap();
            let job = store.get_job(&id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Quarantined);
            assert_eq!(store.list_quarantine(None).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn mismatch_event_first_then_sibling_failure_keeps_quarantine() {
            let store = Arc::new(Store::open_in_memory().await.unwrap());
            let controller = controller(store.clone());
            let (id, snapshot) = seed_mixed_failures(&store).await;

            controller
                .handle_event(EngineEvent::TargetMismatch {
                    job_id: id,
                    target_id: TargetId::new(TARGET_A_ID),
                    snapshot,
                })
                .await
                .unwrap();
            assert_eq!(
                store.get_job(&id).await.unwrap().unwrap().state,
                JobState::Quarantined
            );

            controller
                .handle_event(EngineEvent::TargetFailedPermanent {
                    job_id: id,
                    target_id: TargetId::new(TARGET_B_ID),
                    operation: "COPY",
                    category: ErrorCategory::PermanentIo,
                    message: "access denied".into(),
                    attempts: 1,
                })
                .await
                .unwrap();

            let job = store.get_job(&id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Quarantined, "quarantine is sticky");
            assert!(store
                .list_dead_letters(Some(DeadLetterStatus::Active))
                .await
                .unwrap()
                .is_empty());
        }
    }
}
