//! File discovery: live watcher plus periodic rescan.
//!
//! Both sources feed one deduplicating candidate set keyed by path; each
//! new candidate gets its own stability loop task. The rescan is the
//! source of truth - watcher events only shorten latency, because
//! filesystem notifications are unreliable on the network shares these
//! files usually arrive on. `FileReady` is emitted exactly once per path
//! per session; an abandoned candidate is reconsidered only on a fresh
//! watcher event.

use crate::cancel::CancellationToken;
use crate::events::EngineEvent;
use crate::stability::StabilityDetector;
use forker_protocol::paths::is_staging_path;
use forker_protocol::ForkerConfig;
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    /// A stability loop is running for this path
    InFlight,
    /// FileReady has been emitted; never emitted again this session
    Emitted,
    /// Stability checks gave up; a fresh watcher event revives the path
    Abandoned,
}

#[derive(Clone)]
pub struct Discovery {
    config: Arc<ForkerConfig>,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
    detector: StabilityDetector,
    filters: Arc<Vec<glob::Pattern>>,
    exclude_extensions: Arc<Vec<String>>,
    seen: Arc<Mutex<HashMap<PathBuf, CandidateState>>>,
}

impl Discovery {
    pub fn new(
        config: Arc<ForkerConfig>,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let mut filters = Vec::with_capacity(config.monitoring.file_filters.len());
        for raw in &config.monitoring.file_filters {
            filters.push(glob::Pattern::new(raw)?);
        }
        let exclude_extensions = config
            .monitoring
            .exclude_extensions
            .iter()
            .map(|ext| ext.to_ascii_lowercase())
            .collect();
        let detector = StabilityDetector::from_config(&config.monitoring);
        Ok(Self {
            config,
            events,
            cancel,
            detector,
            filters: Arc::new(filters),
            exclude_extensions: Arc::new(exclude_extensions),
            seen: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start the watcher and the rescan loop. Returns after spawning; work
    /// continues until the cancellation token fires.
    pub fn start(&self) -> anyhow::Result<()> {
        self.start_watcher()?;
        self.start_rescan();
        info!(
            source = %self.config.directories.source.display(),
            "Discovery started"
        );
        Ok(())
    }

    fn start_watcher(&self) -> anyhow::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Any
                    ) {
                        for path in event.paths {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Watcher error; rescan will cover"),
            }
        })?;

        let mode = if self.config.monitoring.include_subdirectories {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.config.directories.source, mode)?;

        // Drain watcher events until shutdown; the watcher dies with the task.
        let this = self.clone();
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let path = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    path = raw_rx.recv() => match path {
                        Some(path) => path,
                        None => break,
                    },
                };
                this.consider(&path, true).await;
            }
            debug!("Watcher task stopped");
        });
        Ok(())
    }

    fn start_rescan(&self) {
        let this = self.clone();
        let interval = Duration::from_secs(this.config.monitoring.rescan_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                this.rescan().await;
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Rescan task stopped");
        });
    }

    /// One full pass over the source directory; catches files that were
    /// present before startup and events the watcher dropped.
    async fn rescan(&self) {
        let source = self.config.directories.source.clone();
        let paths: Vec<PathBuf> = if self.config.monitoring.include_subdirectories {
            walkdir::WalkDir::new(&source)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect()
        } else {
            match std::fs::read_dir(&source) {
                Ok(entries) => entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .map(|entry| entry.path())
                    .collect(),
                Err(err) => {
                    error!(dir = %source.display(), error = %err, "Source directory scan failed");
                    return;
                }
            }
        };

        for path in paths {
            if self.cancel.is_cancelled() {
                return;
            }
            self.consider(&path, false).await;
        }
    }

    /// Funnel for both sources: filter, dedupe, then spawn the candidate's
    /// stability loop.
    async fn consider(&self, path: &Path, via_watcher: bool) {
        if !self.accepts(path) {
            return;
        }

        {
            let mut seen = match self.seen.lock() {
                Ok(seen) => seen,
                Err(_) => return,
            };
            match seen.get(path) {
                None => {}
                // A fresh filesystem event revives an abandoned candidate.
                Some(CandidateState::Abandoned) if via_watcher => {}
                Some(_) => return,
            }
            seen.insert(path.to_path_buf(), CandidateState::InFlight);
        }

        let this = self.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            this.watch_candidate(path).await;
        });
    }

    async fn watch_candidate(&self, path: PathBuf) {
        match self.detector.await_stability(&path, &self.cancel).await {
            Ok(Some(ready)) => {
                if self.cancel.is_cancelled() {
                    return;
                }
                debug!(path = %ready.path.display(), size = ready.size, "File ready");
                if self
                    .events
                    .send(EngineEvent::FileReady {
                        path: ready.path,
                        size: ready.size,
                    })
                    .await
                    .is_ok()
                {
                    self.mark(&path, CandidateState::Emitted);
                }
            }
            Ok(None) => {
                if !self.cancel.is_cancelled() {
                    warn!(path = %path.display(), "Candidate never stabilized; abandoned");
                    self.mark(&path, CandidateState::Abandoned);
                }
            }
            Err(err) => {
                // The file vanished or metadata failed; forget it so a
                // fresh appearance starts over.
                debug!(path = %path.display(), error = %err, "Candidate dropped");
                if let Ok(mut seen) = self.seen.lock() {
                    seen.remove(&path);
                }
            }
        }
    }

    fn mark(&self, path: &Path, state: CandidateState) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(path.to_path_buf(), state);
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        if is_staging_path(path) {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = name.to_ascii_lowercase();
        if self
            .exclude_extensions
            .iter()
            .any(|ext| lower.ends_with(ext.as_str()))
        {
            return false;
        }
        if !self.filters.is_empty() && !self.filters.iter().any(|f| f.matches(&lower)) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_protocol::ForkerConfig;

    fn test_config(dir: &Path) -> Arc<ForkerConfig> {
        let mut config = ForkerConfig::with_default_targets(
            dir.join("source"),
            dir.join("target-a"),
            dir.join("target-b"),
            dir.join("quarantine"),
        );
        config.monitoring.min_file_age_seconds = 0;
        config.monitoring.stability_check_interval_seconds = 1;
        config.monitoring.max_stability_checks = 5;
        config.monitoring.rescan_interval_seconds = 1;
        Arc::new(config)
    }

    fn discovery(
        config: Arc<ForkerConfig>,
    ) -> (Discovery, mpsc::Receiver<EngineEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let discovery = Discovery::new(config, tx, cancel.clone()).unwrap();
        (discovery, rx, cancel)
    }

    #[tokio::test]
    async fn pre_existing_stable_file_is_discovered_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.directories.source).unwrap();
        let file = config.directories.source.join("slide-01.svs");
        std::fs::write(&file, vec![9u8; 512]).unwrap();

        let (discovery, mut rx, cancel) = discovery(config);
        discovery.start().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("discovery should emit within the window")
            .expect("channel open");
        match event {
            EngineEvent::FileReady { path, size } => {
                assert_eq!(path, file);
                assert_eq!(size, 512);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // No duplicate emission from subsequent rescans.
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(second.is_err(), "same path must not be emitted twice");
        cancel.cancel();
    }

    #[tokio::test]
    async fn filtered_and_staging_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.directories.source).unwrap();
        std::fs::write(config.directories.source.join("notes.txt"), b"x").unwrap();
        std::fs::write(
            config.directories.source.join("slide-01.svs.forker-tmp"),
            b"x",
        )
        .unwrap();
        std::fs::write(config.directories.source.join("upload.tmp"), b"x").unwrap();

        let (discovery, mut rx, cancel) = discovery(config);
        discovery.start().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(4), rx.recv()).await;
        assert!(event.is_err(), "no event expected for filtered files");
        cancel.cancel();
    }

    #[tokio::test]
    async fn no_emission_after_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.directories.source).unwrap();
        std::fs::write(config.directories.source.join("slide-01.svs"), b"x").unwrap();

        let (discovery, mut rx, cancel) = discovery(config);
        discovery.start().unwrap();
        cancel.cancel();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        match event {
            Err(_) => {}
            Ok(None) => {}
            Ok(Some(event)) => panic!("no event expected after cancel, got {event:?}"),
        }
    }
}
