use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::CiChecker;
use super::classifier::{CiFailureHistory, CiFailureHistoryEntry, ClassifiedFailure, FailureClassifier};
use super::parse::parse_ci_output_filtered;
use super::types::{CiResult, CiStatus};
use crate::clock::{Clock, WaitOutcome};
use crate::errors::CiError;

/// Default pattern for end-to-end job names.
pub const DEFAULT_E2E_PATTERN: &str = "(?i)e2e|end-to-end";

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub e2e_pattern: Regex,
}

impl PollConfig {
    pub fn new(
        initial_delay: Duration,
        interval: Duration,
        timeout: Duration,
        e2e_pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            initial_delay,
            interval,
            timeout,
            e2e_pattern: Regex::new(e2e_pattern)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollOptions {
    /// Leave end-to-end jobs out of the pass/fail decision.
    pub skip_e2e: bool,
}

/// Progress notifications for operator display.
#[derive(Debug, Clone, PartialEq)]
pub enum CiProgress {
    Checking {
        pr: u64,
        elapsed: Duration,
    },
    Waiting {
        pr: u64,
        elapsed: Duration,
        next_check_in: Duration,
    },
    Status {
        pr: u64,
        elapsed: Duration,
        status: CiStatus,
        failed: usize,
        cancelled: usize,
    },
    Retry {
        pr: u64,
        elapsed: Duration,
        error: String,
    },
}

/// Final result of waiting for CI on one pull request.
#[derive(Debug, Clone)]
pub struct CiOutcome {
    pub result: CiResult,
    /// Present when the result was cancelled-only even after the rerun.
    pub classification: Option<ClassifiedFailure>,
    pub reran: bool,
}

pub struct CiPoller {
    checker: Arc<dyn CiChecker>,
    clock: Arc<dyn Clock>,
    config: PollConfig,
    classifier: FailureClassifier,
}

impl CiPoller {
    pub fn new(
        checker: Arc<dyn CiChecker>,
        clock: Arc<dyn Clock>,
        config: PollConfig,
        classifier: FailureClassifier,
    ) -> Self {
        Self {
            checker,
            clock,
            config,
            classifier,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Poll until the result is terminal, the timeout ceiling is hit, or the
    /// token is cancelled.
    pub async fn poll(
        &self,
        dir: &Path,
        pr: u64,
        opts: PollOptions,
        cancel: &CancellationToken,
        progress: &(dyn Fn(CiProgress) + Send + Sync),
    ) -> Result<CiResult, CiError> {
        self.poll_inner(dir, pr, opts, true, cancel, progress).await
    }

    async fn poll_inner(
        &self,
        dir: &Path,
        pr: u64,
        opts: PollOptions,
        check_immediately: bool,
        cancel: &CancellationToken,
        progress: &(dyn Fn(CiProgress) + Send + Sync),
    ) -> Result<CiResult, CiError> {
        let start = self.clock.now();

        if cancel.is_cancelled() {
            return Err(CiError::Cancelled);
        }
        if check_immediately
            && let Some(result) = self.check_once(dir, pr, opts, start, progress).await?
            && result.is_terminal()
        {
            return Ok(result);
        }

        let mut delay = self.config.initial_delay;
        loop {
            if cancel.is_cancelled() {
                return Err(CiError::Cancelled);
            }
            let elapsed = self.clock.elapsed_since(start);
            let remaining = self.config.timeout.saturating_sub(elapsed);
            if remaining.is_zero() {
                tracing::warn!(pr, elapsed_secs = elapsed.as_secs(), "CI polling timed out");
                return Err(CiError::Timeout(self.config.timeout));
            }

            let wait = delay.min(remaining);
            progress(CiProgress::Waiting {
                pr,
                elapsed,
                next_check_in: wait,
            });
            if self.clock.wait(wait, cancel).await == WaitOutcome::Cancelled {
                return Err(CiError::Cancelled);
            }

            if let Some(result) = self.check_once(dir, pr, opts, start, progress).await?
                && result.is_terminal()
            {
                return Ok(result);
            }
            delay = self.config.interval;
        }
    }

    /// One status query. Retryable command errors become `None`.
    async fn check_once(
        &self,
        dir: &Path,
        pr: u64,
        opts: PollOptions,
        start: std::time::Instant,
        progress: &(dyn Fn(CiProgress) + Send + Sync),
    ) -> Result<Option<CiResult>, CiError> {
        progress(CiProgress::Checking {
            pr,
            elapsed: self.clock.elapsed_since(start),
        });
        match self.checker.check(dir, pr).await {
            Ok(jobs) => {
                let filter = opts.skip_e2e.then_some(&self.config.e2e_pattern);
                let result = parse_ci_output_filtered(&jobs, filter);
                tracing::debug!(
                    pr,
                    status = %result.status,
                    jobs = jobs.len(),
                    failed = result.failed_jobs.len(),
                    "CI status"
                );
                progress(CiProgress::Status {
                    pr,
                    elapsed: self.clock.elapsed_since(start),
                    status: result.status,
                    failed: result.failed_jobs.len(),
                    cancelled: result.cancelled_jobs.len(),
                });
                Ok(Some(result))
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(pr, error = %e, "CI check failed, will retry");
                progress(CiProgress::Retry {
                    pr,
                    elapsed: self.clock.elapsed_since(start),
                    error: e.to_string(),
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll to completion, rerunning once if the only problem is cancelled jobs.
    ///
    /// Every failed outcome is appended to `history`.
    pub async fn wait_for_ci(
        &self,
        dir: &Path,
        pr: u64,
        opts: PollOptions,
        history: &mut CiFailureHistory,
        cancel: &CancellationToken,
        progress: &(dyn Fn(CiProgress) + Send + Sync),
    ) -> Result<CiOutcome, CiError> {
        let mut result = self.poll(dir, pr, opts, cancel, progress).await?;
        let mut reran = false;

        if result.is_cancelled_only() {
            tracing::info!(pr, cancelled = ?result.cancelled_jobs, "only cancelled jobs, rerunning once");
            match self.checker.rerun(dir, pr).await {
                Ok(()) => {
                    reran = true;
                    result = self.poll_inner(dir, pr, opts, false, cancel, progress).await?;
                }
                Err(e) => tracing::warn!(pr, error = %e, "rerun failed"),
            }
        }

        if result.passed {
            return Ok(CiOutcome {
                result,
                classification: None,
                reran,
            });
        }

        let classification = result
            .is_cancelled_only()
            .then(|| self.classifier.classify(&result, history));
        if let Some(c) = &classification {
            tracing::info!(pr, category = %c.category, "classified cancelled-only failure");
        }
        history.record(CiFailureHistoryEntry::from_result(
            &result,
            classification.as_ref().map(|c| c.category),
        ));

        Ok(CiOutcome {
            result,
            classification,
            reran,
        })
    }
}
