//! Read-only monitoring surface.
//!
//! Everything here reads committed state from the store; it is eventually
//! consistent with in-flight transitions and never mutates anything.
//! External hosts wrap these calls in whatever wire surface they expose.

use forker_engine::metrics::MetricsSnapshot;
use forker_engine::METRICS;
use forker_protocol::{DeadLetterStatus, JobId, JobState, QuarantineStatus, TargetId};
use forker_store::{
    DeadLetterEntry, FileJob, JobWithTargets, QuarantineEntry, StateChangeLogEntry, Store,
    StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub database_reachable: bool,
    pub jobs_by_state: HashMap<JobState, i64>,
    pub state_log_rows: i64,
    pub metrics: MetricsSnapshot,
}

#[derive(Clone)]
pub struct Monitor {
    store: Arc<Store>,
}

impl Monitor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<JobWithTargets>, StoreError> {
        self.store.get_job_with_targets(id).await
    }

    pub async fn jobs_by_state(&self, state: JobState) -> Result<Vec<FileJob>, StoreError> {
        self.store.find_jobs_by_state(state).await
    }

    pub async fn job_history(&self, id: &JobId) -> Result<Vec<StateChangeLogEntry>, StoreError> {
        self.store.history_for_job(id).await
    }

    pub async fn target_history(
        &self,
        id: &JobId,
        target_id: &TargetId,
    ) -> Result<Vec<StateChangeLogEntry>, StoreError> {
        self.store.history_for_target(id, target_id).await
    }

    pub async fn targets_by_copy_state(
        &self,
        state: forker_protocol::TargetCopyState,
    ) -> Result<Vec<forker_store::TargetOutcome>, StoreError> {
        self.store.find_targets_by_copy_state(state).await
    }

    pub async fn quarantine_entries(
        &self,
        status: Option<QuarantineStatus>,
    ) -> Result<Vec<QuarantineEntry>, StoreError> {
        self.store.list_quarantine(status).await
    }

    pub async fn dead_letter_entries(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store.list_dead_letters(status).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        METRICS.snapshot()
    }

    pub fn metrics_prometheus(&self) -> String {
        METRICS.prometheus_format()
    }

    /// Health signal for the host: store reachability plus job counts.
    pub async fn health(&self) -> HealthSnapshot {
        let counts = self.store.count_jobs_by_state().await;
        let state_log_rows = self.store.state_log_count().await;
        HealthSnapshot {
            database_reachable: counts.is_ok() && state_log_rows.is_ok(),
            jobs_by_state: counts.unwrap_or_default(),
            state_log_rows: state_log_rows.unwrap_or(0),
            metrics: METRICS.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_protocol::defaults::{TARGET_A_ID, TARGET_B_ID};
    use forker_store::NewJob;

    #[tokio::test]
    async fn health_reports_counts() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store
            .insert_job(NewJob {
                id: JobId::generate(),
                source_path: "/source/slide-01.svs".into(),
                expected_size: 1,
                target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
            })
            .await
            .unwrap();

        let monitor = Monitor::new(store);
        let health = monitor.health().await;
        assert!(health.database_reachable);
        assert_eq!(health.jobs_by_state.get(&JobState::Discovered), Some(&1));
        assert!(health.state_log_rows >= 3);
    }

    #[tokio::test]
    async fn history_is_queryable_per_target() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let inserted = store
            .insert_job(NewJob {
                id: JobId::generate(),
                source_path: "/source/slide-01.svs".into(),
                expected_size: 1,
                target_ids: [TargetId::new(TARGET_A_ID), TargetId::new(TARGET_B_ID)],
            })
            .await
            .unwrap();

        let monitor = Monitor::new(store);
        let history = monitor
            .target_history(&inserted.job.id, &TargetId::new(TARGET_A_ID))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].new_state, "PENDING");
    }
}
