//! Service wiring: store, recovery, discovery, orchestrator, controller.
//!
//! Startup order matters: recovery reconciles persisted state with the
//! filesystem before discovery or the controller can create new work, so
//! a restart never duplicates a committed copy.

use anyhow::Context;
use forker_engine::{
    CancellationToken, Discovery, EngineEvent, JobController, Orchestrator, Recovery,
};
use forker_protocol::ForkerConfig;
use forker_store::Store;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Service {
    store: Arc<Store>,
    config: Arc<ForkerConfig>,
    orchestrator: Orchestrator,
    cancel: CancellationToken,
    controller_handle: tokio::task::JoinHandle<()>,
}

impl Service {
    /// Validate configuration, open the store, recover persisted work,
    /// then start discovery and the controller loop.
    pub async fn start(config: ForkerConfig) -> anyhow::Result<Self> {
        config.validate().context("Configuration rejected")?;
        ensure_directories(&config)?;
        let config = Arc::new(config);

        let store = Arc::new(
            Store::open(&config.database, &config.state_log)
                .await
                .context("Failed to open state store")?,
        );
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel::<EngineEvent>(EVENT_CHANNEL_CAPACITY);

        let orchestrator = Orchestrator::new(
            store.clone(),
            config.clone(),
            events_tx.clone(),
            cancel.clone(),
        );
        let target_ids = [config.targets[0].id.clone(), config.targets[1].id.clone()];
        let controller = JobController::new(
            store.clone(),
            orchestrator.clone(),
            target_ids,
            cancel.clone(),
        );

        // Recovery first: reconcile rows with the filesystem, finalize jobs
        // whose targets all finished before the crash, resume the rest.
        let recovery = Recovery::new(store.clone(), config.clone());
        let (resumed, _report) = recovery.run().await.context("Recovery failed")?;
        for job in &resumed {
            controller.reconcile_job(&job.job.id).await?;
            if let Some(fresh) = store.get_job_with_targets(&job.job.id).await? {
                if !fresh.job.state.is_terminal() {
                    orchestrator.spawn_job(&fresh);
                }
            }
        }

        let discovery = Discovery::new(config.clone(), events_tx, cancel.clone())
            .context("Failed to build discovery")?;
        discovery.start().context("Failed to start discovery")?;

        spawn_retention(store.clone(), config.clone(), cancel.clone());

        let controller_handle = tokio::spawn(async move { controller.run(events_rx).await });

        info!(
            source = %config.directories.source.display(),
            database = %config.database.path.display(),
            "Forker service started"
        );
        Ok(Self {
            store,
            config,
            orchestrator,
            cancel,
            controller_handle,
        })
    }

    /// Operator action: release a quarantined job back into the pipeline.
    /// The offending targets restart from `Pending` with attempts zeroed.
    pub async fn release_quarantine(&self, entry_id: &str, actor: &str) -> anyhow::Result<()> {
        let entry = self
            .store
            .get_quarantine(entry_id)
            .await?
            .with_context(|| format!("quarantine entry not found: {entry_id}"))?;
        self.store.release_quarantine(entry_id, actor).await?;
        if let Some(job) = self.store.get_job_with_targets(&entry.job_id).await? {
            self.orchestrator.spawn_job(&job);
        }
        Ok(())
    }

    /// Operator action: requeue a dead-lettered job with attempts reset.
    pub async fn requeue_dead_letter(&self, entry_id: &str, actor: &str) -> anyhow::Result<()> {
        let entry = self
            .store
            .get_dead_letter(entry_id)
            .await?
            .with_context(|| format!("dead letter entry not found: {entry_id}"))?;
        self.store.requeue_dead_letter(entry_id, actor).await?;
        if let Some(job) = self.store.get_job_with_targets(&entry.job_id).await? {
            self.orchestrator.spawn_job(&job);
        }
        Ok(())
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn config(&self) -> Arc<ForkerConfig> {
        self.config.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until ctrl-c, then shut down cleanly.
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");
        self.shutdown().await
    }

    /// Propagate cancellation and wait for the controller to drain.
    /// In-flight copies observe the token at chunk boundaries; whatever
    /// they leave behind is recovered on next start.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let _ = self.controller_handle.await;
        info!("Forker service stopped");
        Ok(())
    }
}

fn ensure_directories(config: &ForkerConfig) -> anyhow::Result<()> {
    let mut dirs = vec![
        config.directories.source.clone(),
        config.directories.quarantine.clone(),
    ];
    if let Some(processing) = &config.directories.processing {
        dirs.push(processing.clone());
    }
    for target in &config.targets {
        dirs.push(target.path.clone());
    }
    for dir in dirs {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Periodic audit-log retention. A compare-and-set gate makes overlapping
/// ticks impossible even when a trim outlives the interval.
fn spawn_retention(store: Arc<Store>, config: Arc<ForkerConfig>, cancel: CancellationToken) {
    if !config.state_log.enabled || !config.state_log.auto_cleanup {
        return;
    }
    let interval = Duration::from_secs(config.state_log.cleanup_interval_seconds.max(60));
    let running = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Retention tick skipped; previous trim still running");
                continue;
            }
            let store = store.clone();
            let running = running.clone();
            let retention_days = config.state_log.retention_days;
            let max_records = config.state_log.max_records;
            tokio::spawn(async move {
                if let Err(err) = store.trim_state_log(retention_days, max_records).await {
                    error!(error = %err, "State-change log trim failed");
                }
                running.store(false, Ordering::SeqCst);
            });
        }
        debug!("Retention task stopped");
    });
}
