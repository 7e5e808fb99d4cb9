//! Canonical types shared across the Forker crates.
//!
//! Everything that crosses a crate boundary lives here: job and target
//! state enums, identifier newtypes, error categories, the configuration
//! tree, and the staging-path rules. Keeping one definition per concept
//! avoids the drift that creeps in when each crate re-declares its own.

pub mod config;
pub mod defaults;
pub mod paths;
pub mod types;

pub use config::{
    ConfigError, CopyConfig, DatabaseConfig, DirectoriesConfig, ForkerConfig, MonitoringConfig,
    StateLogConfig, TargetConfig,
};
pub use paths::{final_path, is_staging_path, staging_path, PathError};
pub use types::{
    DeadLetterStatus, EntityType, ErrorCategory, JobId, JobIdError, JobState, ParseStateError,
    QuarantineStatus, TargetCopyState, TargetId,
};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All persisted timestamps use this representation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
