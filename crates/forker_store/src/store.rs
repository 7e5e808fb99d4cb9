//! Core store: pool management, job and target operations.
//!
//! Mutations follow one discipline: take the write mutex, open a
//! transaction, verify the expected version, apply the row update with a
//! `WHERE ... AND version = ?` guard, append the audit row, commit. A
//! guard that matches zero rows is a version conflict and nothing is
//! mutated.

use crate::error::{Result, StoreError};
use crate::models::{FileJob, JobWithTargets, NewJob, TargetOutcome, TargetPatch};
use crate::schema::SCHEMA_SQL;
use forker_protocol::{
    now_millis, DatabaseConfig, EntityType, JobId, JobState, StateLogConfig, TargetCopyState,
    TargetId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub struct Store {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
    log_enabled: bool,
    log_context: bool,
}

impl Store {
    /// Open (creating if missing) the database at the configured path and
    /// apply the schema.
    pub async fn open(db: &DatabaseConfig, log: &StateLogConfig) -> Result<Self> {
        if let Some(parent) = db.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let journal_mode = if db.wal_enabled {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&db.path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(db.foreign_keys)
            .busy_timeout(Duration::from_millis(db.command_timeout_ms))
            .pragma("cache_size", db.cache_size.to_string());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            log_enabled: log.enabled,
            log_context: log.include_context,
        };
        store.init_schema().await?;
        info!("State store opened at {}", db.path.display());
        Ok(store)
    }

    /// In-memory store for tests. One connection so the database is shared.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Sqlx)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
            log_enabled: true,
            log_context: true,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, releasing the database file.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // ------------------------------------------------------------------
    // Job + target creation
    // ------------------------------------------------------------------

    /// Insert a job with its two pending targets atomically. Fails if the
    /// id already exists. Targets are created together with the job and
    /// are never orphaned.
    pub async fn insert_job(&self, new: NewJob) -> Result<JobWithTargets> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM file_jobs WHERE id = ?")
                .bind(new.id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(StoreError::DuplicateJob(new.id));
        }

        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO file_jobs (id, source_path, expected_size, source_hash, state, version, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, 1, ?, ?)
            "#,
        )
        .bind(new.id.to_string())
        .bind(&new.source_path)
        .bind(new.expected_size)
        .bind(JobState::Discovered.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for target_id in &new.target_ids {
            sqlx::query(
                r#"
                INSERT INTO target_outcomes
                    (job_id, target_id, copy_state, attempts, version, created_at, updated_at)
                VALUES (?, ?, ?, 0, 1, ?, ?)
                "#,
            )
            .bind(new.id.to_string())
            .bind(target_id.as_str())
            .bind(TargetCopyState::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        self.append_log_tx(
            &mut tx,
            &new.id,
            EntityType::Job,
            None,
            None,
            JobState::Discovered.as_str(),
            None,
            None,
        )
        .await?;
        for target_id in &new.target_ids {
            self.append_log_tx(
                &mut tx,
                &new.id,
                EntityType::Target,
                Some(target_id),
                None,
                TargetCopyState::Pending.as_str(),
                None,
                None,
            )
            .await?;
        }

        tx.commit().await?;
        info!(job_id = %new.id, source = %new.source_path, "Job inserted");

        self.get_job_with_targets(&new.id)
            .await?
            .ok_or(StoreError::JobNotFound(new.id))
    }

    // ------------------------------------------------------------------
    // Optimistic updates
    // ------------------------------------------------------------------

    /// Transition a job to `new_state` under optimistic versioning.
    /// Returns the new version on success.
    pub async fn update_job_state(
        &self,
        id: &JobId,
        expected_version: i64,
        new_state: JobState,
        context: Option<serde_json::Value>,
    ) -> Result<i64> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;
        let job = fetch_job_tx(&mut tx, id).await?;
        if job.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: format!("job {id}"),
                expected: expected_version,
                found: job.version,
            });
        }

        let now = now_millis();
        let rows = sqlx::query(
            "UPDATE file_jobs SET state = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
        )
        .bind(new_state.as_str())
        .bind(now)
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(StoreError::VersionConflict {
                entity: format!("job {id}"),
                expected: expected_version,
                found: job.version,
            });
        }

        self.append_log_tx(
            &mut tx,
            id,
            EntityType::Job,
            None,
            Some(job.state.as_str()),
            new_state.as_str(),
            Some(now - job.updated_at),
            context,
        )
        .await?;
        tx.commit().await?;
        Ok(expected_version + 1)
    }

    /// Record the source hash from the first copy to finish. Compare-and-set
    /// on NULL: returns true for the winner, false when a hash is already
    /// persisted.
    pub async fn set_source_hash(&self, id: &JobId, hash: &str) -> Result<bool> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;
        let job = fetch_job_tx(&mut tx, id).await?;

        let now = now_millis();
        let rows = sqlx::query(
            "UPDATE file_jobs SET source_hash = ?, version = version + 1, updated_at = ? WHERE id = ? AND source_hash IS NULL",
        )
        .bind(hash)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Ok(false);
        }

        self.append_log_tx(
            &mut tx,
            id,
            EntityType::Job,
            None,
            Some(job.state.as_str()),
            job.state.as_str(),
            Some(now - job.updated_at),
            Some(serde_json::json!({ "source_hash": hash })),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Transition a target to `new_state`, applying the patch, under
    /// optimistic versioning. Returns the new version.
    pub async fn update_target(
        &self,
        job_id: &JobId,
        target_id: &TargetId,
        expected_version: i64,
        new_state: TargetCopyState,
        patch: TargetPatch,
        context: Option<serde_json::Value>,
    ) -> Result<i64> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool.begin().await?;
        let target = fetch_target_tx(&mut tx, job_id, target_id).await?;
        if target.version != expected_version {
            return Err(StoreError::VersionConflict {
                entity: format!("target {job_id}/{target_id}"),
                expected: expected_version,
                found: target.version,
            });
        }

        let now = now_millis();
        let rows = apply_target_patch_tx(
            &mut tx,
            job_id,
            target_id,
            expected_version,
            new_state,
            &patch,
            now,
        )
        .await?;
        if rows == 0 {
            return Err(StoreError::VersionConflict {
                entity: format!("target {job_id}/{target_id}"),
                expected: expected_version,
                found: target.version,
            });
        }

        self.append_log_tx(
            &mut tx,
            job_id,
            EntityType::Target,
            Some(target_id),
            Some(target.copy_state.as_str()),
            new_state.as_str(),
            Some(now - target.updated_at),
            context,
        )
        .await?;
        tx.commit().await?;
        Ok(expected_version + 1)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_job(&self, id: &JobId) -> Result<Option<FileJob>> {
        let job = sqlx::query_as::<_, FileJob>("SELECT * FROM file_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn get_job_with_targets(&self, id: &JobId) -> Result<Option<JobWithTargets>> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(None);
        };
        let targets = sqlx::query_as::<_, TargetOutcome>(
            "SELECT * FROM target_outcomes WHERE job_id = ? ORDER BY target_id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(JobWithTargets { job, targets }))
    }

    pub async fn get_target(
        &self,
        job_id: &JobId,
        target_id: &TargetId,
    ) -> Result<Option<TargetOutcome>> {
        let target = sqlx::query_as::<_, TargetOutcome>(
            "SELECT * FROM target_outcomes WHERE job_id = ? AND target_id = ?",
        )
        .bind(job_id.to_string())
        .bind(target_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(target)
    }

    pub async fn find_jobs_by_state(&self, state: JobState) -> Result<Vec<FileJob>> {
        let jobs = sqlx::query_as::<_, FileJob>(
            "SELECT * FROM file_jobs WHERE state = ? ORDER BY created_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Most recent job for a source path, if any.
    pub async fn find_job_by_source_path(&self, source_path: &str) -> Result<Option<FileJob>> {
        let job = sqlx::query_as::<_, FileJob>(
            "SELECT * FROM file_jobs WHERE source_path = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(source_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn find_targets_by_copy_state(
        &self,
        state: TargetCopyState,
    ) -> Result<Vec<TargetOutcome>> {
        let targets = sqlx::query_as::<_, TargetOutcome>(
            "SELECT * FROM target_outcomes WHERE copy_state = ? ORDER BY created_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    /// Jobs that recovery must look at: everything not terminal.
    pub async fn find_resumable_jobs(&self) -> Result<Vec<JobWithTargets>> {
        let jobs = sqlx::query_as::<_, FileJob>(
            "SELECT * FROM file_jobs WHERE state NOT IN (?, ?, ?) ORDER BY created_at ASC",
        )
        .bind(JobState::Verified.as_str())
        .bind(JobState::Failed.as_str())
        .bind(JobState::Quarantined.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let targets = sqlx::query_as::<_, TargetOutcome>(
                "SELECT * FROM target_outcomes WHERE job_id = ? ORDER BY target_id ASC",
            )
            .bind(job.id.to_string())
            .fetch_all(&self.pool)
            .await?;
            out.push(JobWithTargets { job, targets });
        }
        Ok(out)
    }

    pub async fn count_jobs_by_state(&self) -> Result<HashMap<JobState, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM file_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = HashMap::new();
        for (state, count) in rows {
            let state = JobState::from_str(&state)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.insert(state, count);
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Audit append (shared by every mutating call)
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn append_log_tx(
        &self,
        tx: &mut SqliteConnection,
        job_id: &JobId,
        entity_type: EntityType,
        target_id: Option<&TargetId>,
        old_state: Option<&str>,
        new_state: &str,
        duration_ms: Option<i64>,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        if !self.log_enabled {
            return Ok(());
        }
        let context_text = if self.log_context {
            context.map(|value| value.to_string())
        } else {
            None
        };
        sqlx::query(
            r#"
            INSERT INTO state_change_log
                (job_id, entity_type, target_id, old_state, new_state, timestamp, duration_ms, context)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.to_string())
        .bind(entity_type.as_str())
        .bind(target_id.map(|t| t.as_str().to_string()))
        .bind(old_state)
        .bind(new_state)
        .bind(now_millis())
        .bind(duration_ms.map(|d| d.max(0)))
        .bind(context_text)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Transaction-scoped helpers shared with the quarantine / dead-letter ops
// ----------------------------------------------------------------------

pub(crate) async fn fetch_job_tx(tx: &mut SqliteConnection, id: &JobId) -> Result<FileJob> {
    sqlx::query_as::<_, FileJob>("SELECT * FROM file_jobs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::JobNotFound(*id))
}

pub(crate) async fn fetch_target_tx(
    tx: &mut SqliteConnection,
    job_id: &JobId,
    target_id: &TargetId,
) -> Result<TargetOutcome> {
    sqlx::query_as::<_, TargetOutcome>(
        "SELECT * FROM target_outcomes WHERE job_id = ? AND target_id = ?",
    )
    .bind(job_id.to_string())
    .bind(target_id.as_str())
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| StoreError::TargetNotFound {
        job_id: *job_id,
        target_id: target_id.clone(),
    })
}

/// CAS job-state bump keyed on the row's current version.
pub(crate) async fn bump_job_state_tx(
    tx: &mut SqliteConnection,
    job: &FileJob,
    new_state: JobState,
    now: i64,
) -> Result<()> {
    let rows = sqlx::query(
        "UPDATE file_jobs SET state = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
    )
    .bind(new_state.as_str())
    .bind(now)
    .bind(job.id.to_string())
    .bind(job.version)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(StoreError::VersionConflict {
            entity: format!("job {}", job.id),
            expected: job.version,
            found: job.version,
        });
    }
    Ok(())
}

/// Reset a target to Pending with attempts zeroed (quarantine release,
/// dead-letter requeue).
pub(crate) async fn reset_target_tx(
    tx: &mut SqliteConnection,
    target: &TargetOutcome,
    now: i64,
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE target_outcomes
        SET copy_state = ?, attempts = 0, version = version + 1, updated_at = ?
        WHERE job_id = ? AND target_id = ? AND version = ?
        "#,
    )
    .bind(TargetCopyState::Pending.as_str())
    .bind(now)
    .bind(target.job_id.to_string())
    .bind(target.target_id.as_str())
    .bind(target.version)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(StoreError::VersionConflict {
            entity: format!("target {}/{}", target.job_id, target.target_id),
            expected: target.version,
            found: target.version,
        });
    }
    Ok(())
}

pub(crate) async fn apply_target_patch_tx(
    tx: &mut SqliteConnection,
    job_id: &JobId,
    target_id: &TargetId,
    expected_version: i64,
    new_state: TargetCopyState,
    patch: &TargetPatch,
    now: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE target_outcomes
        SET copy_state = ?,
            staging_path = COALESCE(?, staging_path),
            final_path = COALESCE(?, final_path),
            target_hash = COALESCE(?, target_hash),
            attempts = COALESCE(?, attempts),
            last_error_category = COALESCE(?, last_error_category),
            last_error = COALESCE(?, last_error),
            version = version + 1,
            updated_at = ?
        WHERE job_id = ? AND target_id = ? AND version = ?
        "#,
    )
    .bind(new_state.as_str())
    .bind(patch.staging_path.as_deref())
    .bind(patch.final_path.as_deref())
    .bind(patch.target_hash.as_deref())
    .bind(patch.attempts)
    .bind(patch.last_error_category.map(|c| c.as_str()))
    .bind(patch.last_error.as_deref())
    .bind(now)
    .bind(job_id.to_string())
    .bind(target_id.as_str())
    .bind(expected_version)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_protocol::defaults::{TARGET_A_ID, TARGET_B_ID};

    pub(crate) fn new_job() -> NewJob {
        NewJob {
            id: JobId::generate(),
            source_path: "/source/slide-01.svs".to_string(),
            expected_size: 104_857_600,
            target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
        }
    }

    #[tokio::test]
    async fn insert_creates_exactly_two_pending_targets() {
        let store = Store::open_in_memory().await.unwrap();
        let inserted = store.insert_job(new_job()).await.unwrap();

        assert_eq!(inserted.job.state, JobState::Discovered);
        assert_eq!(inserted.targets.len(), 2);
        assert!(inserted
            .targets
            .iter()
            .all(|t| t.copy_state == TargetCopyState::Pending && t.attempts == 0));
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = Store::open_in_memory().await.unwrap();
        let job = new_job();
        store.insert_job(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert_job(job).await,
            Err(StoreError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn job_state_update_bumps_version_and_logs() {
        let store = Store::open_in_memory().await.unwrap();
        let inserted = store.insert_job(new_job()).await.unwrap();
        let id = inserted.job.id;

        let v2 = store
            .update_job_state(&id, 1, JobState::Queued, None)
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.version, 2);

        let history = store.history_for_job(&id).await.unwrap();
        // creation (job + 2 targets) + queued transition
        assert_eq!(history.len(), 4);
        let last = history.last().unwrap();
        assert_eq!(last.new_state, "QUEUED");
        assert_eq!(last.old_state.as_deref(), Some("DISCOVERED"));
    }

    #[tokio::test]
    async fn stale_version_conflicts_and_does_not_mutate() {
        let store = Store::open_in_memory().await.unwrap();
        let inserted = store.insert_job(new_job()).await.unwrap();
        let id = inserted.job.id;

        store
            .update_job_state(&id, 1, JobState::Queued, None)
            .await
            .unwrap();

        // Replay the same transition with the stale expected version.
        let err = store
            .update_job_state(&id, 1, JobState::InProgress, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.version, 2);
    }

    #[tokio::test]
    async fn target_patch_persists_fields() {
        let store = Store::open_in_memory().await.unwrap();
        let inserted = store.insert_job(new_job()).await.unwrap();
        let id = inserted.job.id;
        let target_a = TargetId::new(TARGET_A_ID);

        let v2 = store
            .update_target(
                &id,
                &target_a,
                1,
                TargetCopyState::Copying,
                TargetPatch {
                    staging_path: Some("/a/slide-01.svs.forker-tmp".into()),
                    attempts: Some(1),
                    ..TargetPatch::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(v2, 2);

        store
            .update_target(
                &id,
                &target_a,
                2,
                TargetCopyState::Copied,
                TargetPatch {
                    final_path: Some("/a/slide-01.svs".into()),
                    target_hash: Some("abc123".into()),
                    ..TargetPatch::default()
                },
                None,
            )
            .await
            .unwrap();

        let target = store.get_target(&id, &target_a).await.unwrap().unwrap();
        assert_eq!(target.copy_state, TargetCopyState::Copied);
        assert_eq!(target.attempts, 1);
        assert_eq!(target.target_hash.as_deref(), Some("abc123"));
        // Patch fields left None are untouched.
        assert_eq!(
            target.staging_path.as_deref(),
            Some("/a/slide-01.svs.forker-tmp")
        );
    }

    #[tokio::test]
    async fn source_hash_is_first_writer_wins() {
        let store = Store::open_in_memory().await.unwrap();
        let inserted = store.insert_job(new_job()).await.unwrap();
        let id = inserted.job.id;

        assert!(store.set_source_hash(&id, "hash-a").await.unwrap());
        assert!(!store.set_source_hash(&id, "hash-b").await.unwrap());

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.source_hash.as_deref(), Some("hash-a"));
    }

    #[tokio::test]
    async fn find_queries_filter_by_state() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.insert_job(new_job()).await.unwrap();
        let mut other = new_job();
        other.source_path = "/source/slide-02.svs".to_string();
        store.insert_job(other).await.unwrap();

        store
            .update_job_state(&a.job.id, 1, JobState::Queued, None)
            .await
            .unwrap();

        let queued = store.find_jobs_by_state(JobState::Queued).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.job.id);

        let pending = store
            .find_targets_by_copy_state(TargetCopyState::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 4);

        let by_path = store
            .find_job_by_source_path("/source/slide-02.svs")
            .await
            .unwrap();
        assert!(by_path.is_some());

        let counts = store.count_jobs_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Queued), Some(&1));
        assert_eq!(counts.get(&JobState::Discovered), Some(&1));
    }

    #[tokio::test]
    async fn resumable_jobs_exclude_terminal_states() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.insert_job(new_job()).await.unwrap();
        let mut other = new_job();
        other.source_path = "/source/slide-03.svs".to_string();
        let b = store.insert_job(other).await.unwrap();

        // Drive job B to Verified through the legal chain.
        let mut version = 1;
        for state in [
            JobState::Queued,
            JobState::InProgress,
            JobState::Partial,
            JobState::Verified,
        ] {
            version = store
                .update_job_state(&b.job.id, version, state, None)
                .await
                .unwrap();
        }

        let resumable = store.find_resumable_jobs().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].job.id, a.job.id);
        assert_eq!(resumable[0].targets.len(), 2);
    }
}
