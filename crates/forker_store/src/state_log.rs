//! Audit-log queries and retention.
//!
//! Rows are normally appended inside the transaction of the domain update
//! they describe; the standalone append exists for host tooling that wants
//! to drop a marker into the trail.

use crate::error::Result;
use crate::models::StateChangeLogEntry;
use crate::store::Store;
use forker_protocol::{now_millis, EntityType, JobId, TargetId};
use tracing::info;

/// Parameters for a standalone audit append.
#[derive(Debug, Clone)]
pub struct NewStateChange {
    pub job_id: JobId,
    pub entity_type: EntityType,
    pub target_id: Option<TargetId>,
    pub old_state: Option<String>,
    pub new_state: String,
    pub duration_ms: Option<i64>,
    pub context: Option<serde_json::Value>,
}

impl Store {
    /// Append a state-change row outside a domain transaction.
    pub async fn append_state_change(&self, new: NewStateChange) -> Result<()> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        self.append_log_tx(
            &mut tx,
            &new.job_id,
            new.entity_type,
            new.target_id.as_ref(),
            new.old_state.as_deref(),
            &new.new_state,
            new.duration_ms,
            new.context,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Full transition history for a job, oldest first (job and target rows).
    pub async fn history_for_job(&self, job_id: &JobId) -> Result<Vec<StateChangeLogEntry>> {
        let rows = sqlx::query_as::<_, StateChangeLogEntry>(
            "SELECT * FROM state_change_log WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Transition history for one target of a job, oldest first.
    pub async fn history_for_target(
        &self,
        job_id: &JobId,
        target_id: &TargetId,
    ) -> Result<Vec<StateChangeLogEntry>> {
        let rows = sqlx::query_as::<_, StateChangeLogEntry>(
            r#"
            SELECT * FROM state_change_log
            WHERE entity_type = ? AND job_id = ? AND target_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(EntityType::Target.as_str())
        .bind(job_id.to_string())
        .bind(target_id.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn state_log_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM state_change_log")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Retention: drop rows older than `retention_days`, then enforce the
    /// row-count cap keeping the newest rows. Returns how many rows went.
    pub async fn trim_state_log(&self, retention_days: u32, max_records: u64) -> Result<u64> {
        let _guard = self.write_guard().await;
        let mut tx = self.pool().begin().await?;

        let cutoff = now_millis() - i64::from(retention_days) * 24 * 60 * 60 * 1_000;
        let aged_out = sqlx::query("DELETE FROM state_change_log WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let over_cap = sqlx::query(
            r#"
            DELETE FROM state_change_log
            WHERE id NOT IN (SELECT id FROM state_change_log ORDER BY id DESC LIMIT ?)
            "#,
        )
        .bind(max_records as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        let trimmed = aged_out + over_cap;
        if trimmed > 0 {
            info!(aged_out, over_cap, "State-change log trimmed");
        }
        Ok(trimmed)
    }
}
