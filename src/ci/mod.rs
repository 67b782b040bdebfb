//! CI status: parsing, classification and polling.

pub mod classifier;
pub mod parse;
pub mod poller;
pub mod types;

use async_trait::async_trait;
use std::path::Path;

use crate::errors::CiError;

pub use classifier::{
    CiFailureHistory, CiFailureHistoryEntry, ClassifiedFailure, ClassifierConfig,
    FailureCategory, FailureClassifier, FailureReason, is_persistent_failure,
};
pub use parse::{normalize_state, parse_ci_output, parse_ci_output_filtered};
pub use poller::{CiOutcome, CiPoller, CiProgress, PollConfig, PollOptions};
pub use types::{CheckJob, CiResult, CiStatus, JobState};

/// Source of check-run status for a pull request.
#[async_trait]
pub trait CiChecker: Send + Sync {
    /// Current check runs for `pr`. An empty list means nothing is registered yet.
    async fn check(&self, dir: &Path, pr: u64) -> Result<Vec<CheckJob>, CiError>;

    /// Re-run the check runs behind `pr` (used for cancelled-only results).
    async fn rerun(&self, dir: &Path, pr: u64) -> Result<(), CiError>;
}
