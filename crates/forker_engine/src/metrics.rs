//! In-memory engine metrics.
//!
//! Lock-free counters, single global instance, snapshot for readers and a
//! Prometheus exposition string for hosts that scrape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics instance - lock-free atomics for counters
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Job counters
    pub jobs_discovered: AtomicU64,
    pub jobs_verified: AtomicU64,
    pub jobs_quarantined: AtomicU64,
    pub jobs_failed: AtomicU64,

    // Target counters
    pub copies_started: AtomicU64,
    pub copies_committed: AtomicU64,
    pub copies_failed: AtomicU64,
    pub verifications_passed: AtomicU64,
    pub verifications_failed: AtomicU64,
    pub retries_scheduled: AtomicU64,

    // Volume and timing (cumulative, for averaging)
    pub bytes_copied: AtomicU64,
    pub copy_time_us: AtomicU64,
    pub verify_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_discovered: AtomicU64::new(0),
            jobs_verified: AtomicU64::new(0),
            jobs_quarantined: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            copies_started: AtomicU64::new(0),
            copies_committed: AtomicU64::new(0),
            copies_failed: AtomicU64::new(0),
            verifications_passed: AtomicU64::new(0),
            verifications_failed: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
            copy_time_us: AtomicU64::new(0),
            verify_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_discovered(&self) {
        self.jobs_discovered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_verified(&self) {
        self.jobs_verified.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_quarantined(&self) {
        self.jobs_quarantined.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_copies_started(&self) {
        self.copies_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_copies_failed(&self) {
        self.copies_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_verifications_passed(&self) {
        self.verifications_passed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_verifications_failed(&self) {
        self.verifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_retries_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed copy with its volume and timing.
    #[inline]
    pub fn record_copy_committed(&self, bytes: u64, started: Instant) {
        self.copies_committed.fetch_add(1, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
        self.copy_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_verify_time(&self, started: Instant) {
        self.verify_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_discovered: self.jobs_discovered.load(Ordering::Relaxed),
            jobs_verified: self.jobs_verified.load(Ordering::Relaxed),
            jobs_quarantined: self.jobs_quarantined.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            copies_started: self.copies_started.load(Ordering::Relaxed),
            copies_committed: self.copies_committed.load(Ordering::Relaxed),
            copies_failed: self.copies_failed.load(Ordering::Relaxed),
            verifications_passed: self.verifications_passed.load(Ordering::Relaxed),
            verifications_failed: self.verifications_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            copy_time_us: self.copy_time_us.load(Ordering::Relaxed),
            verify_time_us: self.verify_time_us.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP forker_jobs_discovered_total Total jobs created from stable files
# TYPE forker_jobs_discovered_total counter
forker_jobs_discovered_total {}

# HELP forker_jobs_verified_total Total jobs with both targets verified
# TYPE forker_jobs_verified_total counter
forker_jobs_verified_total {}

# HELP forker_jobs_quarantined_total Total jobs quarantined on hash mismatch
# TYPE forker_jobs_quarantined_total counter
forker_jobs_quarantined_total {}

# HELP forker_jobs_failed_total Total jobs that ended in permanent failure
# TYPE forker_jobs_failed_total counter
forker_jobs_failed_total {}

# HELP forker_copies_started_total Total per-target copy attempts started
# TYPE forker_copies_started_total counter
forker_copies_started_total {}

# HELP forker_copies_committed_total Total copies committed under their final name
# TYPE forker_copies_committed_total counter
forker_copies_committed_total {}

# HELP forker_copies_failed_total Total copy attempts that failed
# TYPE forker_copies_failed_total counter
forker_copies_failed_total {}

# HELP forker_verifications_passed_total Total target rehashes that matched
# TYPE forker_verifications_passed_total counter
forker_verifications_passed_total {}

# HELP forker_verifications_failed_total Total target rehashes that failed or mismatched
# TYPE forker_verifications_failed_total counter
forker_verifications_failed_total {}

# HELP forker_retries_scheduled_total Total retries scheduled with backoff
# TYPE forker_retries_scheduled_total counter
forker_retries_scheduled_total {}

# HELP forker_bytes_copied_total Cumulative bytes committed to targets
# TYPE forker_bytes_copied_total counter
forker_bytes_copied_total {}

# HELP forker_copy_time_microseconds_total Cumulative copy time in microseconds
# TYPE forker_copy_time_microseconds_total counter
forker_copy_time_microseconds_total {}

# HELP forker_verify_time_microseconds_total Cumulative verification time in microseconds
# TYPE forker_verify_time_microseconds_total counter
forker_verify_time_microseconds_total {}
"#,
            s.jobs_discovered,
            s.jobs_verified,
            s.jobs_quarantined,
            s.jobs_failed,
            s.copies_started,
            s.copies_committed,
            s.copies_failed,
            s.verifications_passed,
            s.verifications_failed,
            s.retries_scheduled,
            s.bytes_copied,
            s.copy_time_us,
            s.verify_time_us,
        )
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_discovered: u64,
    pub jobs_verified: u64,
    pub jobs_quarantined: u64,
    pub jobs_failed: u64,
    pub copies_started: u64,
    pub copies_committed: u64,
    pub copies_failed: u64,
    pub verifications_passed: u64,
    pub verifications_failed: u64,
    pub retries_scheduled: u64,
    pub bytes_copied: u64,
    pub copy_time_us: u64,
    pub verify_time_us: u64,
}

impl MetricsSnapshot {
    /// Average committed-copy duration in milliseconds.
    pub fn avg_copy_time_ms(&self) -> f64 {
        if self.copies_committed == 0 {
            0.0
        } else {
            (self.copy_time_us as f64 / self.copies_committed as f64) / 1000.0
        }
    }
}
