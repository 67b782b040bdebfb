use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::agent::AgentProgress;
use crate::ci::{CiProgress, CiStatus};
use crate::orchestrator::WorkflowObserver;
use crate::phase::Phase;
use crate::stream::{tool_emoji, truncate_str};
use crate::ui::icons::{ARROW, CHECK, CROSS, HOURGLASS, RETRY, THINKING, WARN};

/// Terminal rendering of a running workflow.
///
/// A single spinner carries the current phase and attempt. Tool use and
/// phase transitions are printed above it; thinking and narrative text only
/// in verbose mode.
pub struct TerminalObserver {
    multi: MultiProgress,
    spinner: ProgressBar,
    verbose: bool,
}

/// `Xs` below a minute, `Xm Ys` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

impl TerminalObserver {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("shepherd");
        Self {
            multi,
            spinner,
            verbose,
        }
    }

    /// Print above the spinner, falling back to stderr if the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Stop the spinner and leave a final line.
    pub fn finish(&self, success: bool, message: &str) {
        let icon = if success { CHECK } else { CROSS };
        self.spinner
            .finish_with_message(format!("{}{}", icon, message));
    }
}

impl WorkflowObserver for TerminalObserver {
    fn phase_started(&self, workflow: &str, phase: Phase, attempt: u32) {
        let attempt_note = if attempt > 1 {
            format!(" (attempt {})", attempt)
        } else {
            String::new()
        };
        self.spinner.set_message(format!(
            "{}: {}{}",
            style(workflow).cyan(),
            style(phase).yellow(),
            style(attempt_note).dim()
        ));
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    fn phase_finished(&self, workflow: &str, phase: Phase, next: Phase) {
        self.print_line(format!(
            "{}{} {} {}{}",
            CHECK,
            style(workflow).cyan(),
            style(phase).green(),
            ARROW,
            style(next).yellow()
        ));
    }

    fn agent_progress(&self, event: &AgentProgress) {
        match event {
            AgentProgress::ToolUse { name, description } => {
                self.print_line(format!(
                    "    {} {}",
                    tool_emoji(name),
                    style(description).yellow()
                ));
            }
            AgentProgress::ToolResult { is_error: true } if self.verbose => {
                self.print_line(format!("    {}{}", WARN, style("tool reported an error").red()));
            }
            AgentProgress::Thinking(snippet) if self.verbose => {
                self.print_line(format!("    {}{}", THINKING, style(snippet).dim()));
            }
            AgentProgress::Text(text) if self.verbose => {
                self.print_line(format!("    {}", style(truncate_str(text, 100)).dim()));
            }
            _ => {}
        }
    }

    fn ci_progress(&self, event: &CiProgress) {
        match event {
            CiProgress::Checking { pr, elapsed } => {
                self.spinner.set_message(format!(
                    "CI #{}: checking {}",
                    pr,
                    style(format!("({})", format_elapsed(*elapsed))).dim()
                ));
            }
            CiProgress::Waiting {
                pr,
                elapsed,
                next_check_in,
            } => {
                self.spinner.set_message(format!(
                    "{}CI #{}: waiting, next check in {} {}",
                    HOURGLASS,
                    pr,
                    format_elapsed(*next_check_in),
                    style(format!("({})", format_elapsed(*elapsed))).dim()
                ));
            }
            CiProgress::Status {
                pr,
                status,
                failed,
                cancelled,
                ..
            } => {
                let status_text = match status {
                    CiStatus::Success => style(status.to_string()).green(),
                    CiStatus::Failure => style(status.to_string()).red(),
                    CiStatus::Pending => style(status.to_string()).yellow(),
                };
                if *status == CiStatus::Pending {
                    self.spinner
                        .set_message(format!("CI #{}: {}", pr, status_text));
                } else {
                    self.print_line(format!(
                        "    CI #{}: {} ({} failed, {} cancelled)",
                        pr, status_text, failed, cancelled
                    ));
                }
            }
            CiProgress::Retry { pr, error, .. } => {
                self.print_line(format!(
                    "    {}CI #{}: {}",
                    RETRY,
                    pr,
                    style(error).yellow()
                ));
            }
        }
    }

    fn notice(&self, message: &str) {
        self.print_line(format!("  {}{}", WARN, message));
    }
}
