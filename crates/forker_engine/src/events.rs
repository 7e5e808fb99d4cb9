//! Engine events flowing into the job controller.
//!
//! Each component owns its outbound side: discovery emits `FileReady`,
//! per-target tasks emit copy/verify milestones. The controller is the
//! single consumer and the only writer of job-level state.

use forker_protocol::{ErrorCategory, JobId, TargetId};
use forker_store::TargetSnapshot;
use std::path::PathBuf;

#[derive(Debug)]
pub enum EngineEvent {
    /// A source file passed stability checks
    FileReady { path: PathBuf, size: u64 },

    /// The first copy of a job started streaming
    CopyStarted { job_id: JobId },

    /// A target reached `Verified`
    TargetVerified { job_id: JobId, target_id: TargetId },

    /// A target's rehash disagreed with the source hash
    TargetMismatch {
        job_id: JobId,
        target_id: TargetId,
        snapshot: TargetSnapshot,
    },

    /// A target reached `FailedPermanent`
    TargetFailedPermanent {
        job_id: JobId,
        target_id: TargetId,
        operation: &'static str,
        category: ErrorCategory,
        message: String,
        attempts: i64,
    },
}
