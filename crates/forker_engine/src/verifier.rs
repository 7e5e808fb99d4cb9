//! Independent post-copy verification.
//!
//! Rehashes the committed target file with shared read access (external
//! readers stay unblocked) and compares against the job's persisted source
//! hash. The file is never modified.

use crate::cancel::CancellationToken;
use crate::hasher;
use crate::retry::classify_io;
use forker_protocol::ErrorCategory;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of verifying one target.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    /// Rehash equals the expected source hash
    Match { hash: String, duration: Duration },
    /// Rehash differs: integrity failure, quarantine territory
    Mismatch {
        expected: String,
        computed: String,
        duration: Duration,
    },
    /// The rehash itself failed; the retry policy decides what follows
    IoError {
        category: ErrorCategory,
        message: String,
    },
}

/// Rehash `path` and compare with `expected_hash`.
pub async fn verify_target(
    path: &Path,
    expected_hash: &str,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> VerifyOutcome {
    let started = Instant::now();
    match hasher::hash_file(path, chunk_size, cancel).await {
        Ok((bytes, computed)) => {
            let duration = started.elapsed();
            if computed == expected_hash {
                debug!(path = %path.display(), bytes, "Verification matched");
                VerifyOutcome::Match {
                    hash: computed,
                    duration,
                }
            } else {
                VerifyOutcome::Mismatch {
                    expected: expected_hash.to_string(),
                    computed,
                    duration,
                }
            }
        }
        Err(err) => VerifyOutcome::IoError {
            category: classify_io(&err),
            message: format!("rehash {}: {err}", path.display()),
        },
    }
}
