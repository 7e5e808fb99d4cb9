//! Replication engine: discovery, stability, dual-target copy,
//! verification, retry policy, job control and crash recovery.
//!
//! Components talk over explicit channels: discovery emits file-ready
//! events to the controller, the controller creates jobs and hands them to
//! the orchestrator, per-target tasks report milestones back to the
//! controller. Every state transition commits through `forker_store`
//! before the next step proceeds.

pub mod cancel;
pub mod controller;
pub mod copier;
pub mod discovery;
pub mod events;
pub mod hasher;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod stability;
pub mod verifier;

pub use cancel::CancellationToken;
pub use controller::JobController;
pub use copier::{copy_to_target, CopyFailure, CopySuccess};
pub use discovery::Discovery;
pub use events::EngineEvent;
pub use metrics::METRICS;
pub use orchestrator::Orchestrator;
pub use recovery::{Recovery, RecoveryReport};
pub use retry::RetryPolicy;
pub use stability::{ReadyFile, StabilityDetector, StabilityVerdict};
pub use verifier::{verify_target, VerifyOutcome};
