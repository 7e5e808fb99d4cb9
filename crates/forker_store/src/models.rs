//! Database models mapped with sqlx `FromRow`.
//!
//! Enum columns are TEXT and decode through the canonical `TryFrom<String>`
//! impls in `forker_protocol`; a bad value surfaces as a column-decode
//! error rather than a silent default.

use forker_protocol::{
    DeadLetterStatus, EntityType, ErrorCategory, JobId, JobState, QuarantineStatus,
    TargetCopyState, TargetId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// One discovered source file and its replication lifecycle.
#[derive(Debug, Clone, FromRow)]
pub struct FileJob {
    #[sqlx(try_from = "String")]
    pub id: JobId,
    pub source_path: String,
    pub expected_size: i64,
    pub source_hash: Option<String>,
    #[sqlx(try_from = "String")]
    pub state: JobState,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-target copy outcome. Composite identity: (job_id, target_id).
#[derive(Debug, Clone, FromRow)]
pub struct TargetOutcome {
    #[sqlx(try_from = "String")]
    pub job_id: JobId,
    #[sqlx(try_from = "String")]
    pub target_id: TargetId,
    #[sqlx(try_from = "String")]
    pub copy_state: TargetCopyState,
    pub staging_path: Option<String>,
    pub final_path: Option<String>,
    pub target_hash: Option<String>,
    pub attempts: i64,
    pub last_error_category: Option<String>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TargetOutcome {
    /// Parsed error category of the last failure, if any.
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.last_error_category
            .as_deref()
            .and_then(|raw| ErrorCategory::from_str(raw).ok())
    }
}

/// A job together with its two target outcomes, targets ordered by id.
#[derive(Debug, Clone)]
pub struct JobWithTargets {
    pub job: FileJob,
    pub targets: Vec<TargetOutcome>,
}

impl JobWithTargets {
    pub fn target(&self, target_id: &TargetId) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| &t.target_id == target_id)
    }

    pub fn all_targets_terminal(&self) -> bool {
        self.targets.iter().all(|t| t.copy_state.is_terminal())
    }

    pub fn all_targets_verified(&self) -> bool {
        self.targets
            .iter()
            .all(|t| t.copy_state == TargetCopyState::Verified)
    }

    pub fn any_target_failed_permanent(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.copy_state == TargetCopyState::FailedPermanent)
    }
}

/// Parameters for creating a job row with its two pending targets.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub source_path: String,
    pub expected_size: i64,
    pub target_ids: [TargetId; 2],
}

/// Fields updated alongside a target copy-state transition. `None` leaves
/// the stored value untouched; no field is ever reset to NULL.
#[derive(Debug, Clone, Default)]
pub struct TargetPatch {
    pub staging_path: Option<String>,
    pub final_path: Option<String>,
    pub target_hash: Option<String>,
    pub attempts: Option<i64>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_error: Option<String>,
}

/// Forensic snapshot of one target at quarantine time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub target_id: TargetId,
    pub path: Option<String>,
    pub expected_hash: Option<String>,
    pub computed_hash: Option<String>,
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

/// Quarantine row: an integrity failure held for manual action.
#[derive(Debug, Clone, FromRow)]
pub struct QuarantineEntry {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub job_id: JobId,
    pub reason: String,
    #[sqlx(try_from = "String")]
    pub status: QuarantineStatus,
    pub target_snapshots: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
}

impl QuarantineEntry {
    pub fn snapshots(&self) -> serde_json::Result<Vec<TargetSnapshot>> {
        serde_json::from_str(&self.target_snapshots)
    }
}

/// Dead-letter row: a permanently failed operation held for manual action.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterEntry {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub job_id: JobId,
    pub target_id: Option<String>,
    pub operation: String,
    #[sqlx(try_from = "String")]
    pub error_category: ErrorCategory,
    pub error_message: String,
    pub attempts: i64,
    #[sqlx(try_from = "String")]
    pub status: DeadLetterStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
}

/// One audit-trail row. Append-only; trimmed by the retention task.
#[derive(Debug, Clone, FromRow)]
pub struct StateChangeLogEntry {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub job_id: JobId,
    #[sqlx(try_from = "String")]
    pub entity_type: EntityType,
    pub target_id: Option<String>,
    pub old_state: Option<String>,
    pub new_state: String,
    pub timestamp: i64,
    pub duration_ms: Option<i64>,
    pub context: Option<String>,
}
