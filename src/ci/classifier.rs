//! Failure classification.
//!
//! Pure functions over a [`CiResult`] and the failure history of earlier
//! attempts. Nothing here touches the network or the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::types::CiResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Infrastructure,
    CodeRelated,
    Mixed,
    Persistent,
}

impl FailureCategory {
    pub fn recommended_action(&self) -> &'static str {
        match self {
            FailureCategory::Infrastructure => {
                "Infrastructure issue detected; automatically retry the CI run"
            }
            FailureCategory::CodeRelated => "Code failure detected; fix the code and push again",
            FailureCategory::Mixed => {
                "Mixed failures detected; fix the code failures, then re-split if needed"
            }
            FailureCategory::Persistent => {
                "The same jobs keep failing across attempts; stop retrying and escalate"
            }
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureCategory::Infrastructure => "infrastructure",
            FailureCategory::CodeRelated => "code_related",
            FailureCategory::Mixed => "mixed",
            FailureCategory::Persistent => "persistent",
        })
    }
}

/// Why one job landed in its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub job_name: String,
    pub conclusion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub explanation: String,
    pub category: FailureCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub category: FailureCategory,
    pub reasons: Vec<FailureReason>,
    pub recommended_action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiFailureHistoryEntry {
    pub failed_jobs: Vec<String>,
    pub cancelled_jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    pub timestamp: DateTime<Utc>,
}

impl CiFailureHistoryEntry {
    pub fn from_result(result: &CiResult, category: Option<FailureCategory>) -> Self {
        Self {
            failed_jobs: result.failed_jobs.clone(),
            cancelled_jobs: result.cancelled_jobs.clone(),
            category,
            timestamp: Utc::now(),
        }
    }

    /// Order-independent set of every failing or cancelled job name.
    pub fn job_set(&self) -> BTreeSet<&str> {
        self.failed_jobs
            .iter()
            .chain(self.cancelled_jobs.iter())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiFailureHistory {
    pub entries: Vec<CiFailureHistoryEntry>,
}

impl CiFailureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: CiFailureHistoryEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// True iff the last `k` entries all have the same set of failing jobs.
///
/// Fewer than `k` entries (or `k == 0`) is never persistent.
pub fn is_persistent_failure(history: &CiFailureHistory, k: usize) -> bool {
    if k == 0 || history.entries.len() < k {
        return false;
    }
    let window = &history.entries[history.entries.len() - k..];
    let first = window[0].job_set();
    !first.is_empty() && window.iter().all(|e| e.job_set() == first)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Cancelled faster than this: killed before real work, treat as infrastructure.
    pub short_threshold: Duration,
    /// Cancelled slower than this: timeout-scale run, treat as code related.
    pub long_threshold: Duration,
    pub code_keywords: Vec<String>,
    pub persistence_window: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            short_threshold: Duration::from_secs(60),
            long_threshold: Duration::from_secs(300),
            code_keywords: ["test", "build", "lint", "check", "e2e", "integration"]
                .into_iter()
                .map(String::from)
                .collect(),
            persistence_window: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    config: ClassifierConfig,
}

impl FailureClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify_cancelled_job(&self, name: &str, duration: Option<Duration>) -> FailureReason {
        let (category, explanation) = match duration {
            None => (
                FailureCategory::Infrastructure,
                "no timing data; assuming the run was cancelled externally".to_string(),
            ),
            Some(d) if d < self.config.short_threshold => (
                FailureCategory::Infrastructure,
                format!("cancelled after {}s, before doing real work", d.as_secs()),
            ),
            Some(d) if d > self.config.long_threshold => (
                FailureCategory::CodeRelated,
                format!("cancelled after {}s, likely a timeout in the code under test", d.as_secs()),
            ),
            Some(d) => {
                let lowered = name.to_lowercase();
                match self
                    .config
                    .code_keywords
                    .iter()
                    .find(|k| lowered.contains(k.as_str()))
                {
                    Some(keyword) => (
                        FailureCategory::CodeRelated,
                        format!("cancelled after {}s in a '{}' job", d.as_secs(), keyword),
                    ),
                    None => (
                        FailureCategory::Infrastructure,
                        format!("cancelled after {}s in a non-code job", d.as_secs()),
                    ),
                }
            }
        };
        FailureReason {
            job_name: name.to_string(),
            conclusion: "cancelled".to_string(),
            duration_secs: duration.map(|d| d.as_secs()),
            explanation,
            category,
        }
    }

    /// Classify `result` given the history of previous attempts.
    ///
    /// `history` holds earlier attempts only; `result` counts as the newest
    /// attempt for persistence detection.
    pub fn classify(&self, result: &CiResult, history: &CiFailureHistory) -> ClassifiedFailure {
        let mut reasons: Vec<FailureReason> = result
            .failed_jobs
            .iter()
            .map(|name| FailureReason {
                job_name: name.clone(),
                conclusion: "failure".to_string(),
                duration_secs: result.job(name).and_then(|j| j.duration()).map(|d| d.as_secs()),
                explanation: "job reported a failure".to_string(),
                category: FailureCategory::CodeRelated,
            })
            .collect();
        reasons.extend(result.cancelled_jobs.iter().map(|name| {
            let duration = result.job(name).and_then(|j| j.duration());
            self.classify_cancelled_job(name, duration)
        }));

        let mut window = history.clone();
        window.record(CiFailureHistoryEntry::from_result(result, None));

        let has_infra = reasons
            .iter()
            .any(|r| r.category == FailureCategory::Infrastructure);
        let has_code = reasons
            .iter()
            .any(|r| r.category == FailureCategory::CodeRelated);

        let category = if is_persistent_failure(&window, self.config.persistence_window) {
            FailureCategory::Persistent
        } else if has_infra && has_code {
            FailureCategory::Mixed
        } else if has_infra {
            FailureCategory::Infrastructure
        } else {
            FailureCategory::CodeRelated
        };

        ClassifiedFailure {
            category,
            recommended_action: category.recommended_action().to_string(),
            reasons,
        }
    }
}
