//! End-to-end service scenarios: drop files into a watched source
//! directory and observe the dual-target pipeline through the store.

use forker::{Monitor, Service};
use forker_protocol::defaults::{TARGET_A_ID, TARGET_B_ID};
use forker_protocol::{DeadLetterStatus, ForkerConfig, JobState, TargetCopyState, TargetId};
use forker_store::{NewJob, Store, TargetPatch};
use std::path::{Path, PathBuf};
use std::time::Duration;

struct Sandbox {
    _dir: tempfile::TempDir,
    config: ForkerConfig,
    source: PathBuf,
    target_a: PathBuf,
    target_b: PathBuf,
}

fn sandbox() -> Sandbox {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let target_a = dir.path().join("target-a");
    let target_b = dir.path().join("target-b");
    for d in [&source, &target_a, &target_b] {
        std::fs::create_dir_all(d).unwrap();
    }

    let mut config = ForkerConfig::with_default_targets(
        source.clone(),
        target_a.clone(),
        target_b.clone(),
        dir.path().join("quarantine"),
    );
    config.database.path = dir.path().join("state").join("forker.sqlite3");
    config.monitoring.min_file_age_seconds = 0;
    config.monitoring.stability_check_interval_seconds = 1;
    config.monitoring.rescan_interval_seconds = 1;
    config.copy.retry_delay_ms = 10;
    config.copy.retry_delay_cap_ms = 50;

    Sandbox {
        _dir: dir,
        config,
        source,
        target_a,
        target_b,
    }
}

async fn wait_for_job_state(
    store: &Store,
    source_path: &Path,
    state: JobState,
    timeout: Duration,
) -> forker_store::JobWithTargets {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = store
            .find_job_by_source_path(&source_path.display().to_string())
            .await
            .unwrap()
        {
            if job.state == state {
                return store.get_job_with_targets(&job.id).await.unwrap().unwrap();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {state}; job is {}",
                job.state
            );
        } else {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a job for {}",
                source_path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn happy_path_replicates_to_both_targets() {
    let sandbox = sandbox();
    let payload = vec![0x5Au8; 1024 * 1024 + 37];
    let source_file = sandbox.source.join("slide-01.svs");
    std::fs::write(&source_file, &payload).unwrap();

    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    let job = wait_for_job_state(&store, &source_file, JobState::Verified, Duration::from_secs(30))
        .await;

    // Both finals exist with identical bytes; no staging remnants.
    let final_a = sandbox.target_a.join("slide-01.svs");
    let final_b = sandbox.target_b.join("slide-01.svs");
    assert_eq!(std::fs::read(&final_a).unwrap(), payload);
    assert_eq!(std::fs::read(&final_b).unwrap(), payload);
    assert!(!sandbox.target_a.join("slide-01.svs.forker-tmp").exists());
    assert!(!sandbox.target_b.join("slide-01.svs.forker-tmp").exists());

    // Both target hashes equal the persisted source hash.
    let source_hash = job.job.source_hash.clone().expect("source hash persisted");
    for target in &job.targets {
        assert_eq!(target.copy_state, TargetCopyState::Verified);
        assert_eq!(target.target_hash.as_deref(), Some(source_hash.as_str()));
    }

    // Audit trail: a VERIFIED transition per target and one for the job.
    let history = store.history_for_job(&job.job.id).await.unwrap();
    let target_verified = history
        .iter()
        .filter(|e| e.new_state == "VERIFIED" && e.target_id.is_some())
        .count();
    let job_verified = history
        .iter()
        .filter(|e| e.new_state == "VERIFIED" && e.target_id.is_none())
        .count();
    assert_eq!(target_verified, 2);
    assert_eq!(job_verified, 1);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_file_verifies_with_empty_digest() {
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    let sandbox = sandbox();
    let source_file = sandbox.source.join("empty.svs");
    std::fs::write(&source_file, b"").unwrap();

    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    let job = wait_for_job_state(&store, &source_file, JobState::Verified, Duration::from_secs(30))
        .await;
    assert_eq!(job.job.source_hash.as_deref(), Some(EMPTY_SHA256));
    assert!(sandbox.target_a.join("empty.svs").exists());
    assert!(sandbox.target_b.join("empty.svs").exists());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn crash_mid_copy_recovers_to_verified() {
    let sandbox = sandbox();
    let payload = vec![0xC3u8; 256 * 1024];
    let source_file = sandbox.source.join("slide-01.svs");
    std::fs::write(&source_file, &payload).unwrap();

    // Simulate the pre-crash store: job in flight, TargetA mid-copy with a
    // ~30% staging file, TargetB still pending.
    {
        let store = Store::open(&sandbox.config.database, &sandbox.config.state_log)
            .await
            .unwrap();
        let inserted = store
            .insert_job(NewJob {
                id: forker_protocol::JobId::generate(),
                source_path: source_file.display().to_string(),
                expected_size: payload.len() as i64,
                target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
            })
            .await
            .unwrap();
        let id = inserted.job.id;
        let mut version = 1;
        for state in [JobState::Queued, JobState::InProgress] {
            version = store.update_job_state(&id, version, state, None).await.unwrap();
        }

        let staging = sandbox.target_a.join("slide-01.svs.forker-tmp");
        std::fs::write(&staging, &payload[..payload.len() / 3]).unwrap();
        store
            .update_target(
                &id,
                &TargetId::new(TARGET_A_ID),
                1,
                TargetCopyState::Copying,
                TargetPatch {
                    staging_path: Some(staging.display().to_string()),
                    attempts: Some(1),
                    ..TargetPatch::default()
                },
                None,
            )
            .await
            .unwrap();
        store.close().await;
    }

    // Restart.
    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    let job = wait_for_job_state(&store, &source_file, JobState::Verified, Duration::from_secs(30))
        .await;

    // Exactly one final file, no staging remnant, hashes agree.
    assert!(!sandbox.target_a.join("slide-01.svs.forker-tmp").exists());
    let finals: Vec<_> = std::fs::read_dir(&sandbox.target_a)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(
        std::fs::read(sandbox.target_a.join("slide-01.svs")).unwrap(),
        payload
    );

    // The crash-interrupted attempt was not double-counted.
    let target_a = job.target(&TargetId::new(TARGET_A_ID)).unwrap();
    assert_eq!(target_a.attempts, 2, "one crashed attempt + one resumed attempt");

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn blocked_target_fails_job_into_dead_letter() {
    let sandbox = sandbox();
    let payload = vec![0x77u8; 64 * 1024];
    let source_file = sandbox.source.join("slide-01.svs");
    std::fs::write(&source_file, &payload).unwrap();

    // An unrelated occupant of TargetB's final name: every copy attempt
    // fails permanently while TargetA proceeds on its own.
    std::fs::write(sandbox.target_b.join("slide-01.svs"), b"unrelated data").unwrap();

    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    let job =
        wait_for_job_state(&store, &source_file, JobState::Failed, Duration::from_secs(30)).await;

    let target_a = job.target(&TargetId::new(TARGET_A_ID)).unwrap();
    assert_eq!(target_a.copy_state, TargetCopyState::Verified);
    assert_eq!(
        std::fs::read(sandbox.target_a.join("slide-01.svs")).unwrap(),
        payload
    );

    let target_b = job.target(&TargetId::new(TARGET_B_ID)).unwrap();
    assert_eq!(target_b.copy_state, TargetCopyState::FailedPermanent);

    let entries = store
        .list_dead_letters(Some(DeadLetterStatus::Active))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job.job.id);
    assert_eq!(entries[0].target_id.as_deref(), Some(TARGET_B_ID));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn released_quarantine_recopies_and_verifies() {
    let sandbox = sandbox();
    let payload = vec![0x9Eu8; 128 * 1024];
    let source_file = sandbox.source.join("slide-01.svs");
    std::fs::write(&source_file, &payload).unwrap();

    let cancel = forker_engine::CancellationToken::new();
    let entry_id;
    let job_id;
    {
        // Seed a quarantined job: TargetA committed corrupt bytes and
        // mismatched, TargetB verified cleanly.
        let store = Store::open(&sandbox.config.database, &sandbox.config.state_log)
            .await
            .unwrap();
        let (_, source_hash) =
            forker_engine::hasher::hash_file(&source_file, 1024 * 1024, &cancel)
                .await
                .unwrap();

        let inserted = store
            .insert_job(NewJob {
                id: forker_protocol::JobId::generate(),
                source_path: source_file.display().to_string(),
                expected_size: payload.len() as i64,
                target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
            })
            .await
            .unwrap();
        job_id = inserted.job.id;
        let mut version = 1;
        for state in [JobState::Queued, JobState::InProgress] {
            version = store
                .update_job_state(&job_id, version, state, None)
                .await
                .unwrap();
        }
        store.set_source_hash(&job_id, &source_hash).await.unwrap();
        version += 1;

        let final_a = sandbox.target_a.join("slide-01.svs");
        std::fs::write(&final_a, b"corrupt bytes").unwrap();
        store
            .update_target(
                &job_id,
                &TargetId::new(TARGET_A_ID),
                1,
                TargetCopyState::FailedPermanent,
                TargetPatch {
                    final_path: Some(final_a.display().to_string()),
                    target_hash: Some(source_hash.clone()),
                    last_error: Some("hash mismatch".into()),
                    ..TargetPatch::default()
                },
                None,
            )
            .await
            .unwrap();

        let final_b = sandbox.target_b.join("slide-01.svs");
        std::fs::write(&final_b, &payload).unwrap();
        store
            .update_target(
                &job_id,
                &TargetId::new(TARGET_B_ID),
                1,
                TargetCopyState::Verified,
                TargetPatch {
                    final_path: Some(final_b.display().to_string()),
                    target_hash: Some(source_hash.clone()),
                    ..TargetPatch::default()
                },
                None,
            )
            .await
            .unwrap();

        let entry = store
            .quarantine_job(
                &job_id,
                version,
                "hash mismatch",
                &[forker_store::TargetSnapshot {
                    target_id: TargetId::new(TARGET_A_ID),
                    path: Some(final_a.display().to_string()),
                    expected_hash: Some(source_hash.clone()),
                    computed_hash: Some("0000".into()),
                    error: Some("hash mismatch".into()),
                    timestamp_ms: forker_protocol::now_millis(),
                }],
            )
            .await
            .unwrap();
        entry_id = entry.id;
        store.close().await;
    }

    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    // Quarantine holds until the operator acts.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.get_job(&job_id).await.unwrap().unwrap().state,
        JobState::Quarantined
    );

    service.release_quarantine(&entry_id, "operator").await.unwrap();

    wait_for_job_state(&store, &source_file, JobState::Verified, Duration::from_secs(30)).await;
    assert_eq!(
        std::fs::read(sandbox.target_a.join("slide-01.svs")).unwrap(),
        payload,
        "released target must be re-copied from source"
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn external_reader_does_not_block_the_pipeline() {
    let sandbox = sandbox();
    let payload = vec![0x11u8; 512 * 1024];
    let source_file = sandbox.source.join("slide-01.svs");
    std::fs::write(&source_file, &payload).unwrap();

    // An external consumer holds the source open read-only throughout.
    let _reader = std::fs::File::open(&source_file).unwrap();

    let service = Service::start(sandbox.config.clone()).await.unwrap();
    let store = service.store();

    wait_for_job_state(&store, &source_file, JobState::Verified, Duration::from_secs(30)).await;

    let monitor = Monitor::new(store);
    let health = monitor.health().await;
    assert!(health.database_reachable);
    assert_eq!(health.jobs_by_state.get(&JobState::Verified), Some(&1));

    service.shutdown().await.unwrap();
}
