//! Integrity-failure flow: a corrupted target is caught at verification,
//! the job quarantines with a forensic entry, and nothing auto-recovers.

use forker_engine::{CancellationToken, EngineEvent, JobController, Orchestrator};
use forker_protocol::defaults::{TARGET_A_ID, TARGET_B_ID};
use forker_protocol::{
    ForkerConfig, JobId, JobState, QuarantineStatus, TargetCopyState, TargetId,
};
use forker_store::{NewJob, Store, TargetPatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_for_state(store: &Store, id: &JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let job = store.get_job(id).await.unwrap().unwrap();
        if job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {state}, job is {}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn corrupted_target_quarantines_job_and_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let source_dir = dir.path().join("source");
    let target_a = dir.path().join("target-a");
    let target_b = dir.path().join("target-b");
    for d in [&source_dir, &target_a, &target_b] {
        std::fs::create_dir_all(d).unwrap();
    }
    let config = Arc::new(ForkerConfig::with_default_targets(
        source_dir.clone(),
        target_a.clone(),
        target_b.clone(),
        dir.path().join("quarantine"),
    ));

    let source = source_dir.join("slide-01.svs");
    std::fs::write(&source, b"pristine slide content").unwrap();

    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let inserted = store
        .insert_job(NewJob {
            id: JobId::generate(),
            source_path: source.display().to_string(),
            expected_size: 22,
            target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
        })
        .await
        .unwrap();
    let job_id = inserted.job.id;
    let mut version = 1;
    for state in [JobState::Queued, JobState::InProgress] {
        version = store
            .update_job_state(&job_id, version, state, None)
            .await
            .unwrap();
    }
    let _ = version;

    // Source hash persisted from the (imaginary) first copy.
    let expected_hash = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"pristine slide content");
        hex::encode(hasher.finalize())
    };
    store.set_source_hash(&job_id, &expected_hash).await.unwrap();

    // TargetA committed, but the bytes on disk were corrupted afterwards.
    let committed = target_a.join("slide-01.svs");
    std::fs::write(&committed, b"pristine slide cOntent").unwrap();
    store
        .update_target(
            &job_id,
            &TargetId::new(TARGET_A_ID),
            1,
            TargetCopyState::Copied,
            TargetPatch {
                final_path: Some(committed.display().to_string()),
                target_hash: Some(expected_hash.clone()),
                ..TargetPatch::default()
            },
            None,
        )
        .await
        .unwrap();

    // TargetB already finished cleanly.
    store
        .update_target(
            &job_id,
            &TargetId::new(TARGET_B_ID),
            1,
            TargetCopyState::Verified,
            TargetPatch {
                final_path: Some(target_b.join("slide-01.svs").display().to_string()),
                target_hash: Some(expected_hash.clone()),
                ..TargetPatch::default()
            },
            None,
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<EngineEvent>(64);
    let orchestrator = Orchestrator::new(
        store.clone(),
        config.clone(),
        events_tx,
        cancel.clone(),
    );
    let controller = JobController::new(
        store.clone(),
        orchestrator.clone(),
        [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
        cancel.clone(),
    );
    tokio::spawn(async move { controller.run(events_rx).await });

    let job = store.get_job_with_targets(&job_id).await.unwrap().unwrap();
    orchestrator.spawn_job(&job);

    wait_for_state(&store, &job_id, JobState::Quarantined).await;

    // Forensic entry with computed vs expected hash.
    let entries = store
        .list_quarantine(Some(QuarantineStatus::Active))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job_id);
    let snapshots = entries[0].snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].target_id.as_str(), TARGET_A_ID);
    assert_eq!(snapshots[0].expected_hash.as_deref(), Some(expected_hash.as_str()));
    assert_ne!(
        snapshots[0].computed_hash.as_deref(),
        Some(expected_hash.as_str())
    );

    // The mismatching target is terminal with an integrity error.
    let target = store
        .get_target(&job_id, &TargetId::new(TARGET_A_ID))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target.copy_state, TargetCopyState::FailedPermanent);
    assert_eq!(target.last_error_category.as_deref(), Some("INTEGRITY"));

    // The corrupted file stays in place for inspection.
    assert!(committed.exists());

    // No auto-recovery: the job stays quarantined.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = store.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Quarantined);

    cancel.cancel();
}
