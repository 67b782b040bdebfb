//! Plain-text views of persisted workflows for `status` and `list`.

use console::style;

use crate::phase::{Phase, PhaseStatus};
use crate::workflow::{WorkflowState, WorkflowStatus, WorkflowSummary};

fn status_cell(status: PhaseStatus) -> String {
    let text = status.to_string();
    match status {
        PhaseStatus::Completed => style(text).green().to_string(),
        PhaseStatus::InProgress => style(text).yellow().to_string(),
        PhaseStatus::Failed => style(text).red().to_string(),
        PhaseStatus::Skipped | PhaseStatus::Pending => style(text).dim().to_string(),
    }
}

/// Detailed view of one workflow.
pub fn render_status(state: &WorkflowState) -> String {
    let mut out = format!(
        "{} ({})\n  {}\n\n  phase:   {}\n  status:  {}\n",
        style(&state.name).bold(),
        state.workflow_type,
        state.description,
        style(state.current_phase).yellow(),
        state.status()
    );
    if let Some(branch) = &state.branch {
        out.push_str(&format!("  branch:  {}\n", branch));
    }
    if let Some(path) = &state.worktree_path {
        out.push_str(&format!("  worktree: {}\n", path.display()));
    }
    if let Some(pr) = state.pr_number {
        out.push_str(&format!("  PR:      #{}\n", pr));
    }
    out.push_str(&format!(
        "  updated: {}\n\n",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    for phase in Phase::ORDERED {
        let ps = state.phase(phase);
        let mut line = format!("  {:<15} {}", phase.as_str(), status_cell(ps.status));
        if ps.attempts > 0 {
            line.push_str(&format!("  attempts: {}", ps.attempts));
        }
        if let Some(m) = &ps.metrics {
            line.push_str(&format!("  {} lines / {} files", m.total_lines, m.files_changed));
        }
        out.push_str(&line);
        out.push('\n');
    }

    if let Some(error) = &state.error {
        out.push_str(&format!(
            "\n  {} {} (in {}, {})\n",
            style("error:").red().bold(),
            error.message,
            error.phase,
            if error.recoverable {
                "recoverable with `shepherd resume`"
            } else {
                "not recoverable"
            }
        ));
    }
    out
}

/// One line per workflow.
pub fn render_list(summaries: &[WorkflowSummary]) -> String {
    if summaries.is_empty() {
        return "No workflows found.\n".to_string();
    }
    let mut out = String::new();
    for s in summaries {
        let status = match s.status {
            WorkflowStatus::Completed => style(s.status.to_string()).green(),
            WorkflowStatus::Failed => style(s.status.to_string()).red(),
            WorkflowStatus::InProgress => style(s.status.to_string()).yellow(),
        };
        out.push_str(&format!(
            "{:<24} {:<8} {:<15} {}  {}\n",
            s.name,
            s.workflow_type.as_str(),
            s.current_phase.as_str(),
            status,
            style(s.updated_at.format("%Y-%m-%d %H:%M")).dim()
        ));
    }
    out
}
