//! Canonical default values shared across the workspace.

pub const TARGET_A_ID: &str = "TargetA";
pub const TARGET_B_ID: &str = "TargetB";

/// Suffix appended to the final name while bytes are being staged.
pub const STAGING_SUFFIX: &str = ".forker-tmp";

pub const DEFAULT_DB_FILE: &str = "forker.sqlite3";
pub const DEFAULT_BUFFER_SIZE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MIN_FILE_AGE_SECS: u64 = 5;
pub const DEFAULT_STABILITY_CHECK_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_MAX_STABILITY_CHECKS: u32 = 10;
pub const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_COPIES_PER_TARGET: usize = 2;
pub const DEFAULT_MAX_CONCURRENT_VERIFICATIONS: usize = 5;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_RETRY_DELAY_CAP_MS: u64 = 60_000;

pub const CANCELLED_MESSAGE: &str = "Cancelled by shutdown";
