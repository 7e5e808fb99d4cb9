//! Configuration for the replication service.
//!
//! The whole tree is constructed once at startup (from TOML plus CLI
//! overrides) and passed down explicitly; nothing reads configuration
//! ambiently. Validation failures are configuration errors and prevent
//! the service from starting.

use crate::defaults;
use crate::types::TargetId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for the Forker service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForkerConfig {
    #[serde(default)]
    pub directories: DirectoriesConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Exactly two targets; both must be enabled.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    #[serde(default)]
    pub copy: CopyConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub state_log: StateLogConfig,
}

/// Filesystem layout for one run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirectoriesConfig {
    /// Directory watched for incoming files
    pub source: PathBuf,

    /// Directory receiving quarantine forensic reports
    pub quarantine: PathBuf,

    /// Optional scratch directory for host tooling; unused by the engine
    #[serde(default)]
    pub processing: Option<PathBuf>,
}

/// File discovery and stability options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Glob filters applied to file names; empty means accept everything
    #[serde(default = "default_file_filters")]
    pub file_filters: Vec<String>,

    /// Extensions never picked up (staging files are always excluded)
    #[serde(default = "default_exclude_extensions")]
    pub exclude_extensions: Vec<String>,

    #[serde(default)]
    pub include_subdirectories: bool,

    /// Last-modified age a file must reach before it can be stable
    #[serde(default = "default_min_file_age_seconds")]
    pub min_file_age_seconds: u64,

    /// Interval between consecutive size/lock samples
    #[serde(default = "default_stability_check_interval_seconds")]
    pub stability_check_interval_seconds: u64,

    /// Consecutive non-stable observations before a candidate is abandoned
    #[serde(default = "default_max_stability_checks")]
    pub max_stability_checks: u32,

    /// Period of the full rescan that backstops the live watcher
    #[serde(default = "default_rescan_interval_seconds")]
    pub rescan_interval_seconds: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            file_filters: default_file_filters(),
            exclude_extensions: default_exclude_extensions(),
            include_subdirectories: false,
            min_file_age_seconds: default_min_file_age_seconds(),
            stability_check_interval_seconds: default_stability_check_interval_seconds(),
            max_stability_checks: default_max_stability_checks(),
            rescan_interval_seconds: default_rescan_interval_seconds(),
        }
    }
}

/// One replication target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: TargetId,
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Orders copy-slot acquisition when both targets are waiting
    #[serde(default)]
    pub priority: i32,

    /// Rehash the committed file and compare against the source hash
    #[serde(default = "default_true")]
    pub verify_after_copy: bool,
}

/// Copy and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    #[serde(default = "default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,

    #[serde(default = "default_max_concurrent_copies_per_target")]
    pub max_concurrent_copies_per_target: usize,

    #[serde(default = "default_max_concurrent_verifications")]
    pub max_concurrent_verifications: usize,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base delay before the first retry
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    #[serde(default = "default_retry_delay_cap_ms")]
    pub retry_delay_cap_ms: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            buffer_size_bytes: default_buffer_size_bytes(),
            max_concurrent_copies_per_target: default_max_concurrent_copies_per_target(),
            max_concurrent_verifications: default_max_concurrent_verifications(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_delay_cap_ms: default_retry_delay_cap_ms(),
        }
    }
}

/// Durable store options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the single-file SQLite database
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub wal_enabled: bool,

    /// SQLite busy timeout applied to every connection
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// PRAGMA cache_size value (negative means KiB, SQLite convention)
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,

    #[serde(default = "default_true")]
    pub foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            wal_enabled: true,
            command_timeout_ms: default_command_timeout_ms(),
            cache_size: default_cache_size(),
            foreign_keys: true,
        }
    }
}

/// State-change audit log options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Row-count cap enforced by the retention task
    #[serde(default = "default_state_log_max_records")]
    pub max_records: u64,

    #[serde(default = "default_true")]
    pub auto_cleanup: bool,

    #[serde(default = "default_state_log_retention_days")]
    pub retention_days: u32,

    /// Persist the structured context blob alongside each transition
    #[serde(default = "default_true")]
    pub include_context: bool,

    #[serde(default = "default_state_log_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for StateLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_records: default_state_log_max_records(),
            auto_cleanup: true,
            retention_days: default_state_log_retention_days(),
            include_context: true,
            cleanup_interval_seconds: default_state_log_cleanup_interval_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_file_filters() -> Vec<String> {
    vec![
        "*.svs".to_string(),
        "*.tif".to_string(),
        "*.tiff".to_string(),
        "*.ndpi".to_string(),
        "*.scn".to_string(),
    ]
}

fn default_exclude_extensions() -> Vec<String> {
    vec![".tmp".to_string(), ".partial".to_string()]
}

fn default_min_file_age_seconds() -> u64 {
    defaults::DEFAULT_MIN_FILE_AGE_SECS
}

fn default_stability_check_interval_seconds() -> u64 {
    defaults::DEFAULT_STABILITY_CHECK_INTERVAL_SECS
}

fn default_max_stability_checks() -> u32 {
    defaults::DEFAULT_MAX_STABILITY_CHECKS
}

fn default_rescan_interval_seconds() -> u64 {
    defaults::DEFAULT_RESCAN_INTERVAL_SECS
}

fn default_buffer_size_bytes() -> usize {
    defaults::DEFAULT_BUFFER_SIZE_BYTES
}

fn default_max_concurrent_copies_per_target() -> usize {
    defaults::DEFAULT_MAX_CONCURRENT_COPIES_PER_TARGET
}

fn default_max_concurrent_verifications() -> usize {
    defaults::DEFAULT_MAX_CONCURRENT_VERIFICATIONS
}

fn default_max_retry_attempts() -> u32 {
    defaults::DEFAULT_MAX_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    defaults::DEFAULT_RETRY_DELAY_MS
}

fn default_retry_backoff_factor() -> f64 {
    defaults::DEFAULT_RETRY_BACKOFF_FACTOR
}

fn default_retry_delay_cap_ms() -> u64 {
    defaults::DEFAULT_RETRY_DELAY_CAP_MS
}

fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".forker").join(defaults::DEFAULT_DB_FILE))
        .unwrap_or_else(|| PathBuf::from(defaults::DEFAULT_DB_FILE))
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_cache_size() -> i64 {
    -2_000
}

fn default_state_log_max_records() -> u64 {
    100_000
}

fn default_state_log_retention_days() -> u32 {
    30
}

fn default_state_log_cleanup_interval_seconds() -> u64 {
    3_600
}

impl ForkerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ForkerConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A config with the canonical TargetA/TargetB pair filled in.
    pub fn with_default_targets(
        source: PathBuf,
        target_a: PathBuf,
        target_b: PathBuf,
        quarantine: PathBuf,
    ) -> Self {
        Self {
            directories: DirectoriesConfig {
                source,
                quarantine,
                processing: None,
            },
            targets: vec![
                TargetConfig {
                    id: TargetId::new(defaults::TARGET_A_ID),
                    path: target_a,
                    enabled: true,
                    priority: 0,
                    verify_after_copy: true,
                },
                TargetConfig {
                    id: TargetId::new(defaults::TARGET_B_ID),
                    path: target_b,
                    enabled: true,
                    priority: 0,
                    verify_after_copy: true,
                },
            ],
            ..Self::default()
        }
    }

    /// Validate the tree. Any failure here is a Configuration error and
    /// must prevent service start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directories.source.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("source directory is not set".into()));
        }
        if self.directories.quarantine.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "quarantine directory is not set".into(),
            ));
        }
        if self.targets.len() != 2 {
            return Err(ConfigError::Invalid(format!(
                "exactly two targets are required, found {}",
                self.targets.len()
            )));
        }
        for target in &self.targets {
            if !target.enabled {
                // The job model is fixed at two live targets; a disabled
                // target cannot be expressed as a degraded mode.
                return Err(ConfigError::Invalid(format!(
                    "target '{}' is disabled; both targets must be enabled",
                    target.id
                )));
            }
            if target.path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' has no path",
                    target.id
                )));
            }
        }
        if self.targets[0].id == self.targets[1].id {
            return Err(ConfigError::Invalid(format!(
                "target ids must be distinct, both are '{}'",
                self.targets[0].id
            )));
        }
        if self.targets[0].path == self.targets[1].path {
            return Err(ConfigError::Invalid(format!(
                "target paths must be distinct, both are '{}'",
                self.targets[0].path.display()
            )));
        }
        if self.copy.buffer_size_bytes == 0 {
            return Err(ConfigError::Invalid("buffer_size_bytes must be > 0".into()));
        }
        if self.copy.max_concurrent_copies_per_target == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_copies_per_target must be > 0".into(),
            ));
        }
        if self.copy.max_concurrent_verifications == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_verifications must be > 0".into(),
            ));
        }
        if self.copy.retry_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "retry_backoff_factor must be >= 1.0 so delays never shrink".into(),
            ));
        }
        if self.monitoring.stability_check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "stability_check_interval_seconds must be > 0".into(),
            ));
        }
        if self.monitoring.max_stability_checks == 0 {
            return Err(ConfigError::Invalid(
                "max_stability_checks must be > 0".into(),
            ));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database path is not set".into()));
        }
        Ok(())
    }

    /// Targets ordered by descending priority, stable on id.
    pub fn targets_by_priority(&self) -> Vec<&TargetConfig> {
        let mut ordered: Vec<&TargetConfig> = self.targets.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ForkerConfig {
        ForkerConfig::with_default_targets(
            PathBuf::from("/data/source"),
            PathBuf::from("/data/target-a"),
            PathBuf::from("/data/target-b"),
            PathBuf::from("/data/quarantine"),
        )
    }

    #[test]
    fn default_config_fails_validation() {
        assert!(ForkerConfig::default().validate().is_err());
    }

    #[test]
    fn canonical_config_passes_validation() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn disabled_target_is_rejected() {
        let mut config = valid_config();
        config.targets[1].enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_target_paths_are_rejected() {
        let mut config = valid_config();
        config.targets[1].path = config.targets[0].path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let mut config = valid_config();
        config.copy.retry_backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn priority_orders_targets() {
        let mut config = valid_config();
        config.targets[1].priority = 10;
        let ordered = config.targets_by_priority();
        assert_eq!(ordered[0].id.as_str(), "TargetB");
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forker.toml");
        let config = valid_config();
        config.save(&path).unwrap();
        let loaded = ForkerConfig::load(&path).unwrap();
        assert_eq!(loaded.targets.len(), 2);
        assert_eq!(loaded.directories.source, config.directories.source);
        assert_eq!(
            loaded.copy.buffer_size_bytes,
            crate::defaults::DEFAULT_BUFFER_SIZE_BYTES
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_text = r#"
            [directories]
            source = "/in"
            quarantine = "/q"

            [[targets]]
            id = "TargetA"
            path = "/a"

            [[targets]]
            id = "TargetB"
            path = "/b"
        "#;
        let config: ForkerConfig = toml::from_str(toml_text).unwrap();
        config.validate().unwrap();
        assert!(config.targets[0].verify_after_copy);
        assert_eq!(config.monitoring.max_stability_checks, 10);
        assert_eq!(config.copy.max_retry_attempts, 3);
    }
}
