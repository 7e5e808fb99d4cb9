//! Quarantine operations.
//!
//! A hash mismatch flips the job to `Quarantined` and records a forensic
//! entry in the same transaction, so the invariant "mismatch implies an
//! active quarantine entry" holds at every commit point. Quarantined jobs
//! never move on their own; release and purge are operator actions.

use crate::error::{Result, StoreError};
use crate::models::{QuarantineEntry, TargetSnapshot};
use crate::store::{bump_job_state_tx, fetch_job_tx, fetch_target_tx, Store};
use forker_protocol::{now_millis, EntityType, JobId, JobState, QuarantineStatus, TargetCopyState};
use tracing::{info, warn};
use uuid::Uuid;

impl Store {
    /// Quarantine a job: transition it to `Quarantined` (optimistic) and
    /// create the forensic entry atomically.
    pub async fn quarantine_job(
        &self,
        job_id: &JobId,
        expected_job_version: i64,
        reason: &str,
        snapshots: &[TargetSnapshot],
    ) -> Result<QuarantineEntry> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let job = fetch_job_tx(&mut tx, job_id).await?;
        if job.version != expected_job_version {
            return Err(StoreError::VersionConflict {
                entity: format!("job {job_id}"),
                expected: expected_job_version,
                found: job.version,
            });
        }
        // A settled job never re-enters quarantine through this path; only
        // the manual release/purge operations move terminal jobs.
        if job.state.is_terminal() {
            return Err(StoreError::InvalidStatus(format!(
                "job {job_id} is {}, cannot quarantine a terminal job",
                job.state
            )));
        }

        let now = now_millis();
        bump_job_state_tx(&mut tx, &job, JobState::Quarantined, now).await?;

        let entry_id = Uuid::new_v4().to_string();
        let snapshots_json = serde_json::to_string(snapshots)?;
        sqlx::query(
            r#"
            INSERT INTO quarantine_entries
                (id, job_id, reason, status, target_snapshots, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry_id)
        .bind(job_id.to_string())
        .bind(reason)
        .bind(QuarantineStatus::Active.as_str())
        .bind(&snapshots_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        self.append_log_tx(
            &mut tx,
            job_id,
            EntityType::Job,
            None,
            Some(job.state.as_str()),
            JobState::Quarantined.as_str(),
            Some(now - job.updated_at),
            Some(serde_json::json!({ "quarantine_entry": entry_id, "reason": reason })),
        )
        .await?;
        tx.commit().await?;
        warn!(job_id = %job_id, entry = %entry_id, reason, "Job quarantined");

        self.get_quarantine(&entry_id)
            .await?
            .ok_or_else(|| StoreError::EntryNotFound(entry_id))
    }

    /// Operator release: offending targets back to `Pending` with attempts
    /// zeroed, job back to `Queued`, entry marked `Released`.
    pub async fn release_quarantine(&self, entry_id: &str, actor: &str) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let entry = fetch_quarantine_tx(&mut tx, entry_id).await?;
        if entry.status != QuarantineStatus::Active {
            return Err(StoreError::InvalidStatus(format!(
                "quarantine entry {entry_id} is {}, expected ACTIVE",
                entry.status
            )));
        }
        let job = fetch_job_tx(&mut tx, &entry.job_id).await?;
        if job.state != JobState::Quarantined {
            return Err(StoreError::InvalidStatus(format!(
                "job {} is {}, expected QUARANTINED",
                job.id, job.state
            )));
        }

        let now = now_millis();
        let snapshots = entry
            .snapshots()
            .map_err(|e| StoreError::Corrupt(format!("quarantine snapshots: {e}")))?;
        for snapshot in &snapshots {
            let target = fetch_target_tx(&mut tx, &entry.job_id, &snapshot.target_id).await?;
            let old_state = target.copy_state;
            crate::store::reset_target_tx(&mut tx, &target, now).await?;
            self.append_log_tx(
                &mut tx,
                &entry.job_id,
                EntityType::Target,
                Some(&snapshot.target_id),
                Some(old_state.as_str()),
                TargetCopyState::Pending.as_str(),
                Some(now - target.updated_at),
                Some(serde_json::json!({ "released_by": actor })),
            )
            .await?;
        }

        bump_job_state_tx(&mut tx, &job, JobState::Queued, now).await?;
        self.append_log_tx(
            &mut tx,
            &entry.job_id,
            EntityType::Job,
            None,
            Some(job.state.as_str()),
            JobState::Queued.as_str(),
            Some(now - job.updated_at),
            Some(serde_json::json!({ "released_by": actor, "quarantine_entry": entry_id })),
        )
        .await?;

        update_quarantine_status_tx(&mut tx, entry_id, QuarantineStatus::Released, actor, now)
            .await?;
        tx.commit().await?;
        info!(job_id = %entry.job_id, entry = entry_id, actor, "Quarantine released");
        Ok(())
    }

    /// Operator purge: the entry is closed and the job lands in `Failed`.
    pub async fn purge_quarantine(&self, entry_id: &str, actor: &str) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let entry = fetch_quarantine_tx(&mut tx, entry_id).await?;
        if entry.status != QuarantineStatus::Active {
            return Err(StoreError::InvalidStatus(format!(
                "quarantine entry {entry_id} is {}, expected ACTIVE",
                entry.status
            )));
        }
        let job = fetch_job_tx(&mut tx, &entry.job_id).await?;

        let now = now_millis();
        if job.state == JobState::Quarantined {
            bump_job_state_tx(&mut tx, &job, JobState::Failed, now).await?;
            self.append_log_tx(
                &mut tx,
                &entry.job_id,
                EntityType::Job,
                None,
                Some(job.state.as_str()),
                JobState::Failed.as_str(),
                Some(now - job.updated_at),
                Some(serde_json::json!({ "purged_by": actor, "quarantine_entry": entry_id })),
            )
            .await?;
        }

        update_quarantine_status_tx(&mut tx, entry_id, QuarantineStatus::Purged, actor, now)
            .await?;
        tx.commit().await?;
        info!(job_id = %entry.job_id, entry = entry_id, actor, "Quarantine purged");
        Ok(())
    }

    pub async fn get_quarantine(&self, entry_id: &str) -> Result<Option<QuarantineEntry>> {
        let entry =
            sqlx::query_as::<_, QuarantineEntry>("SELECT * FROM quarantine_entries WHERE id = ?")
                .bind(entry_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(entry)
    }

    pub async fn list_quarantine(
        &self,
        status: Option<QuarantineStatus>,
    ) -> Result<Vec<QuarantineEntry>> {
        let entries = match status {
            Some(status) => {
                sqlx::query_as::<_, QuarantineEntry>(
                    "SELECT * FROM quarantine_entries WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, QuarantineEntry>(
                    "SELECT * FROM quarantine_entries ORDER BY created_at DESC",
                )
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(entries)
    }

    /// Active quarantine entries for a job (monitor surface).
    pub async fn quarantine_for_job(&self, job_id: &JobId) -> Result<Vec<QuarantineEntry>> {
        let entries = sqlx::query_as::<_, QuarantineEntry>(
            "SELECT * FROM quarantine_entries WHERE job_id = ? ORDER BY created_at DESC",
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(entries)
    }
}

async fn fetch_quarantine_tx(
    tx: &mut sqlx::SqliteConnection,
    entry_id: &str,
) -> Result<QuarantineEntry> {
    sqlx::query_as::<_, QuarantineEntry>("SELECT * FROM quarantine_entries WHERE id = ?")
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::EntryNotFound(entry_id.to_string()))
}

async fn update_quarantine_status_tx(
    tx: &mut sqlx::SqliteConnection,
    entry_id: &str,
    status: QuarantineStatus,
    actor: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE quarantine_entries SET status = ?, updated_at = ?, resolved_at = ?, resolved_by = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .bind(actor)
    .bind(entry_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}
