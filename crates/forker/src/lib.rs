//! Forker service library: wiring for the replication pipeline plus the
//! read-only monitoring surface consumed by external hosts and UIs.

pub mod monitor;
pub mod service;

pub use monitor::{HealthSnapshot, Monitor};
pub use service::Service;
