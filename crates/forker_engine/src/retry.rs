//! Failure classification and retry backoff.
//!
//! Classification keys on error properties, not type names. Backoff is
//! exponential with jitter, capped, and never decreases across the attempt
//! sequence of one target.

use forker_protocol::{CopyConfig, ErrorCategory};
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Classify an I/O error into a retry category.
pub fn classify_io(err: &io::Error) -> ErrorCategory {
    #[cfg(unix)]
    {
        // ENOSPC and ENAMETOOLONG have no stable ErrorKind yet. A full
        // target disk will not drain within the retry budget.
        if matches!(err.raw_os_error(), Some(28) | Some(36)) {
            return ErrorCategory::PermanentIo;
        }
    }
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorCategory::PermanentIo,
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => ErrorCategory::Configuration,
        io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::WriteZero => ErrorCategory::TransientIo,
        _ => ErrorCategory::TransientIo,
    }
}

/// Retry policy: attempt cap plus exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    factor: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, factor: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            factor: factor.max(1.0),
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &CopyConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_delay_ms),
            config.retry_backoff_factor,
            Duration::from_millis(config.retry_delay_cap_ms),
            config.max_retry_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may be scheduled after `attempts` have
    /// already started.
    pub fn can_retry(&self, category: ErrorCategory, attempts: u32) -> bool {
        category.is_retryable() && attempts < self.max_attempts
    }

    /// Delay before the given 1-based attempt number. The result is always
    /// at least `prev_delay`: the schedule never shrinks.
    pub fn next_delay(&self, attempt: u32, prev_delay: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let cap_ms = self.max_delay.as_millis() as u64;
        let raw_ms = (self.base_delay.as_millis() as f64 * self.factor.powi(exponent))
            .min(cap_ms as f64) as u64;

        // Equal jitter: keep at least half the exponential step so the
        // schedule stays monotone before the final clamp.
        let half = (raw_ms / 2).max(1);
        let jittered = (half + jitter_ms(half)).min(cap_ms);

        Duration::from_millis(jittered).max(prev_delay)
    }
}

fn jitter_ms(cap: u64) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % cap.max(1))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1_000), 2.0, Duration::from_secs(60), 3)
    }

    #[test]
    fn classify_missing_file_is_permanent() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(classify_io(&err), ErrorCategory::PermanentIo);
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(classify_io(&err), ErrorCategory::PermanentIo);
    }

    #[cfg(unix)]
    #[test]
    fn classify_disk_full_is_permanent() {
        let err = io::Error::from_raw_os_error(28);
        assert_eq!(classify_io(&err), ErrorCategory::PermanentIo);
    }

    #[test]
    fn classify_generic_io_is_transient() {
        let err = io::Error::other("disk hiccup");
        assert_eq!(classify_io(&err), ErrorCategory::TransientIo);
        let err = io::Error::new(io::ErrorKind::TimedOut, "slow share");
        assert_eq!(classify_io(&err), ErrorCategory::TransientIo);
    }

    #[test]
    fn classify_cancellation_is_transient() {
        let err = io::Error::new(io::ErrorKind::Interrupted, "cancelled");
        assert_eq!(classify_io(&err), ErrorCategory::TransientIo);
    }

    #[test]
    fn classify_invalid_input_is_configuration() {
        let err = io::Error::new(io::ErrorKind::InvalidInput, "bad argument");
        assert_eq!(classify_io(&err), ErrorCategory::Configuration);
    }

    #[test]
    fn delays_never_decrease_across_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(5), 10);
        let mut prev = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.next_delay(attempt, prev);
            assert!(
                delay >= prev,
                "attempt {attempt}: {delay:?} < previous {prev:?}"
            );
            prev = delay;
        }
    }

    #[test]
    fn delays_respect_cap() {
        let policy = policy();
        let mut prev = Duration::ZERO;
        for attempt in 1..=20 {
            prev = policy.next_delay(attempt, prev);
        }
        assert!(prev <= Duration::from_secs(60));
    }

    #[test]
    fn retry_gate_honours_category_and_cap() {
        let policy = policy();
        assert!(policy.can_retry(ErrorCategory::TransientIo, 1));
        assert!(policy.can_retry(ErrorCategory::TransientIo, 2));
        assert!(!policy.can_retry(ErrorCategory::TransientIo, 3));
        assert!(!policy.can_retry(ErrorCategory::PermanentIo, 0));
        assert!(!policy.can_retry(ErrorCategory::Integrity, 0));
        assert!(!policy.can_retry(ErrorCategory::Unknown, 0));
    }
}
