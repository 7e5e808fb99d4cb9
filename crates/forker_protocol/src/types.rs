//! Canonical identifiers and state enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Canonical job identifier: an opaque UUID assigned at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Mint a fresh id for a newly discovered file.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| JobIdError::Parse(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = JobIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("invalid job id: {0}")]
    Parse(String),
}

/// Error returned when a persisted state string fails to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseStateError(pub String);

/// Identifier for one of a job's two replication targets.
///
/// The canonical pair is `"TargetA"` / `"TargetB"`; the value mirrors the
/// `id` field of the target's configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Job lifecycle
// ============================================================================

/// Job lifecycle state - the top-level state machine.
/// This is the CANONICAL definition - use this everywhere for job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// File seen and deemed stable, job row not yet queued for copy
    #[default]
    Discovered,
    /// Job persisted with two pending targets, waiting for copy slots
    Queued,
    /// At least one target copy has started
    InProgress,
    /// One target verified, the other not yet terminal
    Partial,
    /// Both targets verified against the source hash
    Verified,
    /// All targets terminal with at least one permanent failure
    Failed,
    /// Hash mismatch detected; manual release or purge required
    Quarantined,
}

impl JobState {
    pub const ALL: &'static [JobState] = &[
        JobState::Discovered,
        JobState::Queued,
        JobState::InProgress,
        JobState::Partial,
        JobState::Verified,
        JobState::Failed,
        JobState::Quarantined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Discovered => "DISCOVERED",
            JobState::Queued => "QUEUED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Partial => "PARTIAL",
            JobState::Verified => "VERIFIED",
            JobState::Failed => "FAILED",
            JobState::Quarantined => "QUARANTINED",
        }
    }

    /// True when no further automatic work is attempted for the job.
    ///
    /// `Quarantined` counts as terminal: only a manual release or purge
    /// moves a quarantined job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Verified | JobState::Failed | JobState::Quarantined
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(JobState::Discovered),
            "QUEUED" => Ok(JobState::Queued),
            "IN_PROGRESS" => Ok(JobState::InProgress),
            "PARTIAL" => Ok(JobState::Partial),
            "VERIFIED" => Ok(JobState::Verified),
            "FAILED" => Ok(JobState::Failed),
            "QUARANTINED" => Ok(JobState::Quarantined),
            _ => Err(ParseStateError(format!("Invalid job state: '{s}'"))),
        }
    }
}

impl TryFrom<String> for JobState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Per-target lifecycle
// ============================================================================

/// Copy state of a single target - the per-target sub-state machine.
///
/// Transitions are serial and monotonic within one target; the two targets
/// of a job advance independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetCopyState {
    /// Waiting for a copy slot
    #[default]
    Pending,
    /// Bytes are streaming into the staging file
    Copying,
    /// Staging file committed under the final name, hash recorded
    Copied,
    /// Rehash of the committed file is in flight
    Verifying,
    /// Rehash matched the job's source hash
    Verified,
    /// Last attempt failed with a retryable error; a retry is scheduled
    FailedRetryable,
    /// Attempts exhausted or the error was permanent
    FailedPermanent,
}

impl TargetCopyState {
    pub const ALL: &'static [TargetCopyState] = &[
        TargetCopyState::Pending,
        TargetCopyState::Copying,
        TargetCopyState::Copied,
        TargetCopyState::Verifying,
        TargetCopyState::Verified,
        TargetCopyState::FailedRetryable,
        TargetCopyState::FailedPermanent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCopyState::Pending => "PENDING",
            TargetCopyState::Copying => "COPYING",
            TargetCopyState::Copied => "COPIED",
            TargetCopyState::Verifying => "VERIFYING",
            TargetCopyState::Verified => "VERIFIED",
            TargetCopyState::FailedRetryable => "FAILED_RETRYABLE",
            TargetCopyState::FailedPermanent => "FAILED_PERMANENT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetCopyState::Verified | TargetCopyState::FailedPermanent
        )
    }
}

impl fmt::Display for TargetCopyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TargetCopyState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TargetCopyState::Pending),
            "COPYING" => Ok(TargetCopyState::Copying),
            "COPIED" => Ok(TargetCopyState::Copied),
            "VERIFYING" => Ok(TargetCopyState::Verifying),
            "VERIFIED" => Ok(TargetCopyState::Verified),
            "FAILED_RETRYABLE" => Ok(TargetCopyState::FailedRetryable),
            "FAILED_PERMANENT" => Ok(TargetCopyState::FailedPermanent),
            _ => Err(ParseStateError(format!("Invalid target copy state: '{s}'"))),
        }
    }
}

impl TryFrom<String> for TargetCopyState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Failure classification
// ============================================================================

/// Category assigned to a failure by the retry policy.
///
/// Classification is keyed on platform-agnostic error properties, never on
/// concrete error type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Generic I/O, timeouts, cancellation surfaced through I/O
    TransientIo,
    /// Missing file or directory, access denied, path too long
    PermanentIo,
    /// Invalid arguments or operation; surfaced at startup, never retried
    Configuration,
    /// Invariant violation or hash mismatch; routes to quarantine
    Integrity,
    /// Anything unclassified; held for manual investigation
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientIo => "TRANSIENT_IO",
            ErrorCategory::PermanentIo => "PERMANENT_IO",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Integrity => "INTEGRITY",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// Whether the retry policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::TransientIo)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSIENT_IO" => Ok(ErrorCategory::TransientIo),
            "PERMANENT_IO" => Ok(ErrorCategory::PermanentIo),
            "CONFIGURATION" => Ok(ErrorCategory::Configuration),
            "INTEGRITY" => Ok(ErrorCategory::Integrity),
            "UNKNOWN" => Ok(ErrorCategory::Unknown),
            _ => Err(ParseStateError(format!("Invalid error category: '{s}'"))),
        }
    }
}

impl TryFrom<String> for ErrorCategory {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Quarantine / dead letter
// ============================================================================

/// Lifecycle of a quarantine entry. Transitions are manual only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuarantineStatus {
    #[default]
    Active,
    Released,
    Purged,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineStatus::Active => "ACTIVE",
            QuarantineStatus::Released => "RELEASED",
            QuarantineStatus::Purged => "PURGED",
        }
    }
}

impl fmt::Display for QuarantineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QuarantineStatus {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(QuarantineStatus::Active),
            "RELEASED" => Ok(QuarantineStatus::Released),
            "PURGED" => Ok(QuarantineStatus::Purged),
            _ => Err(ParseStateError(format!("Invalid quarantine status: '{s}'"))),
        }
    }
}

impl TryFrom<String> for QuarantineStatus {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    #[default]
    Active,
    Requeued,
    Purged,
    Resolved,
    UnderInvestigation,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Active => "ACTIVE",
            DeadLetterStatus::Requeued => "REQUEUED",
            DeadLetterStatus::Purged => "PURGED",
            DeadLetterStatus::Resolved => "RESOLVED",
            DeadLetterStatus::UnderInvestigation => "UNDER_INVESTIGATION",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(DeadLetterStatus::Active),
            "REQUEUED" => Ok(DeadLetterStatus::Requeued),
            "PURGED" => Ok(DeadLetterStatus::Purged),
            "RESOLVED" => Ok(DeadLetterStatus::Resolved),
            "UNDER_INVESTIGATION" => Ok(DeadLetterStatus::UnderInvestigation),
            _ => Err(ParseStateError(format!("Invalid dead letter status: '{s}'"))),
        }
    }
}

impl TryFrom<String> for DeadLetterStatus {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Audit log
// ============================================================================

/// Which entity a state-change log row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Job,
    Target,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Job => "JOB",
            EntityType::Target => "TARGET",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JOB" => Ok(EntityType::Job),
            "TARGET" => Ok(EntityType::Target),
            _ => Err(ParseStateError(format!("Invalid entity type: '{s}'"))),
        }
    }
}

impl TryFrom<String> for EntityType {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
