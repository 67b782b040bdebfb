//! Interpretation of raw check listings.

use regex::Regex;

use super::types::{CheckJob, CiResult, CiStatus, JobState};

/// Map a reported job state onto the four buckets the poller cares about.
pub fn normalize_state(state: &str) -> JobState {
    match state.trim().to_lowercase().as_str() {
        "success" | "pass" | "passed" | "skipped" | "skipping" | "neutral" => JobState::Success,
        "failure" | "fail" | "failed" | "error" | "timed_out" | "action_required"
        | "startup_failure" => JobState::Failure,
        "cancelled" | "canceled" | "cancel" => JobState::Cancelled,
        _ => JobState::Pending,
    }
}

/// Interpret a job listing without any end-to-end filtering.
pub fn parse_ci_output(jobs: &[CheckJob]) -> CiResult {
    parse_ci_output_filtered(jobs, None)
}

/// Interpret a job listing, leaving jobs whose name matches `e2e_filter` out of
/// the pass/fail decision. The raw output always lists every job.
///
/// Overall status is failure if any considered job failed or was cancelled,
/// pending if any is still running, success otherwise. An empty listing is
/// pending, since checks may not have been registered yet.
pub fn parse_ci_output_filtered(jobs: &[CheckJob], e2e_filter: Option<&Regex>) -> CiResult {
    let mut failed_jobs = Vec::new();
    let mut cancelled_jobs = Vec::new();
    let mut ignored_jobs = Vec::new();
    let mut pending = 0usize;
    let mut considered = 0usize;

    for job in jobs {
        if e2e_filter.is_some_and(|re| re.is_match(&job.name)) {
            ignored_jobs.push(job.name.clone());
            continue;
        }
        considered += 1;
        match normalize_state(&job.state) {
            JobState::Success => {}
            JobState::Failure => failed_jobs.push(job.name.clone()),
            JobState::Cancelled => cancelled_jobs.push(job.name.clone()),
            JobState::Pending => pending += 1,
        }
    }

    let status = if !failed_jobs.is_empty() || !cancelled_jobs.is_empty() {
        CiStatus::Failure
    } else if pending > 0 || jobs.is_empty() {
        CiStatus::Pending
    } else {
        CiStatus::Success
    };

    if considered == 0 && !jobs.is_empty() {
        tracing::debug!(ignored = ignored_jobs.len(), "every job filtered as end-to-end");
    }

    CiResult {
        passed: status == CiStatus::Success,
        status,
        failed_jobs,
        cancelled_jobs,
        ignored_jobs,
        output: render_jobs(jobs),
        jobs: jobs.to_vec(),
    }
}

fn render_jobs(jobs: &[CheckJob]) -> String {
    jobs.iter()
        .map(|j| match j.duration() {
            Some(d) => format!("{}\t{}\t{}s", j.name, j.state, d.as_secs()),
            None => format!("{}\t{}", j.name, j.state),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
