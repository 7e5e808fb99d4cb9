//! Database schema for the replication state store.
//!
//! All timestamps are stored as INTEGER milliseconds since the Unix epoch.

pub(crate) const SCHEMA_SQL: &str = r#"
-- Jobs: one row per discovered source file
CREATE TABLE IF NOT EXISTS file_jobs (
    id TEXT PRIMARY KEY,
    source_path TEXT NOT NULL,
    expected_size INTEGER NOT NULL,
    source_hash TEXT,
    state TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_jobs_state ON file_jobs(state);
CREATE INDEX IF NOT EXISTS idx_file_jobs_source_path ON file_jobs(source_path);

-- Target outcomes: exactly two per job, created with the job
CREATE TABLE IF NOT EXISTS target_outcomes (
    job_id TEXT NOT NULL REFERENCES file_jobs(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL,
    copy_state TEXT NOT NULL,
    staging_path TEXT,
    final_path TEXT,
    target_hash TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error_category TEXT,
    last_error TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (job_id, target_id)
);

CREATE INDEX IF NOT EXISTS idx_target_outcomes_copy_state ON target_outcomes(copy_state);

-- Quarantine: hash-mismatch outcomes awaiting manual action
CREATE TABLE IF NOT EXISTS quarantine_entries (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES file_jobs(id),
    reason TEXT NOT NULL,
    status TEXT NOT NULL,
    target_snapshots TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    resolved_at INTEGER,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_quarantine_status ON quarantine_entries(status);

-- Dead letter: exhausted-retry and permanent-failure outcomes
CREATE TABLE IF NOT EXISTS dead_letter_entries (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES file_jobs(id),
    target_id TEXT,
    operation TEXT NOT NULL,
    error_category TEXT NOT NULL,
    error_message TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    resolved_at INTEGER,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_dead_letter_status ON dead_letter_entries(status);

-- Append-only audit trail of every job and target transition
CREATE TABLE IF NOT EXISTS state_change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    target_id TEXT,
    old_state TEXT,
    new_state TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    duration_ms INTEGER,
    context TEXT
);

CREATE INDEX IF NOT EXISTS idx_state_change_log_job ON state_change_log(job_id);
CREATE INDEX IF NOT EXISTS idx_state_change_log_timestamp ON state_change_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_state_change_log_entity ON state_change_log(entity_type, job_id, target_id);
"#;
