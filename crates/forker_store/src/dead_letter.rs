//! Dead-letter operations.
//!
//! A target that exhausts its retry budget (or fails permanently outright)
//! ends the job in `Failed`; the dead-letter entry is written in the same
//! transaction so the exhaustion is never observable without its record.

use crate::error::{Result, StoreError};
use crate::models::DeadLetterEntry;
use crate::store::{bump_job_state_tx, fetch_job_tx, fetch_target_tx, Store};
use forker_protocol::{
    now_millis, DeadLetterStatus, EntityType, ErrorCategory, JobId, JobState, TargetCopyState,
    TargetId,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters for one dead-letter entry.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub job_id: JobId,
    pub target_id: Option<TargetId>,
    /// Operation that exhausted its budget, e.g. "COPY" or "VERIFY"
    pub operation: String,
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub attempts: i64,
}

impl Store {
    /// Final failure: transition the job to `Failed` (optimistic) and write
    /// one dead-letter entry per permanently failed target, atomically.
    pub async fn fail_job_with_dead_letters(
        &self,
        job_id: &JobId,
        expected_job_version: i64,
        entries: Vec<NewDeadLetter>,
    ) -> Result<Vec<DeadLetterEntry>> {
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
        // A quarantined (or otherwise settled) job never falls through to
        // the dead-letter set; quarantine outranks failure.
        if job.state.is_terminal() {
            return Err(StoreError::InvalidStatus(format!(
                "job {job_id} is {}, cannot fail a terminal job",
                job.state
            )));
        }

        let now = now_millis();
        bump_job_state_tx(&mut tx, &job, JobState::Failed, now).await?;

        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            let entry_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO dead_letter_entries
                    (id, job_id, target_id, operation, error_category, error_message,
                     attempts, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry_id)
            .bind(job_id.to_string())
            .bind(entry.target_id.as_ref().map(|t| t.as_str().to_string()))
            .bind(&entry.operation)
            .bind(entry.error_category.as_str())
            .bind(&entry.error_message)
            .bind(entry.attempts)
            .bind(DeadLetterStatus::Active.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(entry_id);
        }

        self.append_log_tx(
            &mut tx,
            job_id,
            EntityType::Job,
            None,
            Some(job.state.as_str()),
            JobState::Failed.as_str(),
            Some(now - job.updated_at),
            Some(serde_json::json!({ "dead_letter_entries": ids })),
        )
        .await?;
        tx.commit().await?;
        warn!(job_id = %job_id, entries = ids.len(), "Job failed, dead-lettered");

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(
                self.get_dead_letter(&id)
                    .await?
                    .ok_or(StoreError::EntryNotFound(id))?,
            );
        }
        Ok(out)
    }

    /// Operator requeue: attempts reset, target back to `Pending`, job back
    /// to `Queued`, entry marked `Requeued`.
    pub async fn requeue_dead_letter(&self, entry_id: &str, actor: &str) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let entry = fetch_dead_letter_tx(&mut tx, entry_id).await?;
        if !matches!(
            entry.status,
            DeadLetterStatus::Active | DeadLetterStatus::UnderInvestigation
        ) {
            return Err(StoreError::InvalidStatus(format!(
                "dead letter entry {entry_id} is {}, expected ACTIVE or UNDER_INVESTIGATION",
                entry.status
            )));
        }
        let job = fetch_job_tx(&mut tx, &entry.job_id).await?;

        let now = now_millis();
        if let Some(raw_target) = &entry.target_id {
            let target_id = TargetId::new(raw_target.clone());
            let target = fetch_target_tx(&mut tx, &entry.job_id, &target_id).await?;
            let old_state = target.copy_state;
            crate::store::reset_target_tx(&mut tx, &target, now).await?;
            self.append_log_tx(
                &mut tx,
                &entry.job_id,
                EntityType::Target,
                Some(&target_id),
                Some(old_state.as_str()),
                TargetCopyState::Pending.as_str(),
                Some(now - target.updated_at),
                Some(serde_json::json!({ "requeued_by": actor })),
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
            Some(serde_json::json!({ "requeued_by": actor, "dead_letter_entry": entry_id })),
        )
        .await?;

        update_dead_letter_status_tx(&mut tx, entry_id, DeadLetterStatus::Requeued, actor, now)
            .await?;
        tx.commit().await?;
        info!(job_id = %entry.job_id, entry = entry_id, actor, "Dead letter requeued");
        Ok(())
    }

    /// Terminal close-out; the job stays `Failed`.
    pub async fn purge_dead_letter(&self, entry_id: &str, actor: &str) -> Result<()> {
        self.close_dead_letter(entry_id, actor, DeadLetterStatus::Purged)
            .await
    }

    pub async fn resolve_dead_letter(&self, entry_id: &str, actor: &str) -> Result<()> {
        self.close_dead_letter(entry_id, actor, DeadLetterStatus::Resolved)
            .await
    }

    pub async fn mark_dead_letter_under_investigation(
        &self,
        entry_id: &str,
        actor: &str,
    ) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let entry = fetch_dead_letter_tx(&mut tx, entry_id).await?;
        if entry.status != DeadLetterStatus::Active {
            return Err(StoreError::InvalidStatus(format!(
                "dead letter entry {entry_id} is {}, expected ACTIVE",
                entry.status
            )));
        }
        sqlx::query("UPDATE dead_letter_entries SET status = ?, updated_at = ? WHERE id = ?")
            .bind(DeadLetterStatus::UnderInvestigation.as_str())
            .bind(now_millis())
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(entry = entry_id, actor, "Dead letter under investigation");
        Ok(())
    }

    async fn close_dead_letter(
        &self,
        entry_id: &str,
        actor: &str,
        status: DeadLetterStatus,
    ) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let entry = fetch_dead_letter_tx(&mut tx, entry_id).await?;
        if !matches!(
            entry.status,
            DeadLetterStatus::Active | DeadLetterStatus::UnderInvestigation
        ) {
            return Err(StoreError::InvalidStatus(format!(
                "dead letter entry {entry_id} is {}, expected ACTIVE or UNDER_INVESTIGATION",
                entry.status
            )));
        }
        update_dead_letter_status_tx(&mut tx, entry_id, status, actor, now_millis()).await?;
        tx.commit().await?;
        info!(entry = entry_id, actor, status = %status, "Dead letter closed");
        Ok(())
    }

    pub async fn get_dead_letter(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        let entry =
            sqlx::query_as::<_, DeadLetterEntry>("SELECT * FROM dead_letter_entries WHERE id = ?")
                .bind(entry_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(entry)
    }

    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetterEntry>> {
        let entries = match status {
            Some(status) => {
                sqlx::query_as::<_, DeadLetterEntry>(
                    "SELECT * FROM dead_letter_entries WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, DeadLetterEntry>(
                    "SELECT * FROM dead_letter_entries ORDER BY created_at DESC",
                )
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(entries)
    }
}

async fn fetch_dead_letter_tx(
    tx: &mut sqlx::SqliteConnection,
    entry_id: &str,
) -> Result<DeadLetterEntry> {
    sqlx::query_as::<_, DeadLetterEntry>("SELECT * FROM dead_letter_entries WHERE id = ?")
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::EntryNotFound(entry_id.to_string()))
}

async fn update_dead_letter_status_tx(
    tx: &mut sqlx::SqliteConnection,
    entry_id: &str,
    status: DeadLetterStatus,
    actor: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE dead_letter_entries SET status = ?, updated_at = ?, resolved_at = ?, resolved_by = ? WHERE id = ?",
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
