//! Bodies of the comments posted back to pull requests.

use std::fmt::Write;

use itertools::Itertools;

use crate::tekton::{RunState, TaskOutcome};

/// Description attached to statuses of runs waiting for authorization.
pub const SKIPPED_DESCRIPTION: &str = "Pending approval, waiting for an /ok-to-test";

pub fn access_denied_comment(sender: &str) -> String {
    format!(
        "User **{sender}** is not allowed to trigger CI on this repository.\n\n\
         An authorized user can unlock it by commenting `/ok-to-test` on this pull request."
    )
}

pub fn template_warning_comment(unknown_keys: &[String]) -> String {
    let keys = unknown_keys.iter().map(|k| format!("`{{{{ {k} }}}}`")).join(", ");
    format!(
        "Some variables in your pipeline definitions could not be resolved and were left \
         as-is: {keys}.\n\nCheck the `.tekton/` manifests and the repository settings params."
    )
}

pub fn template_error_comment(pipeline: &str, error: &str) -> String {
    format!(
        ":x: The pipeline definition `{pipeline}` could not be processed:\n\n```\n{error}\n```"
    )
}

pub fn submission_failed_comment(detail: &str) -> String {
    format!(":x: Could not start a pipeline after several attempts:\n\n```\n{detail}\n```")
}

fn state_marker(state: RunState) -> &'static str {
    match state {
        RunState::Succeeded => ":heavy_check_mark:",
        RunState::Failed => ":x:",
        RunState::Cancelled => ":no_entry_sign:",
        RunState::Skipped => ":white_circle:",
        RunState::Queued | RunState::Running => ":hourglass:",
    }
}

/// Task-by-task summary posted when a run finishes on a pull request.
pub fn summary_comment(
    run_name: &str,
    state: RunState,
    tasks: &[TaskOutcome],
    log_url: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} Pipeline **{run_name}** has finished: **{state}**.",
        state_marker(state)
    );
    if !tasks.is_empty() {
        let _ = writeln!(out, "\n| Task | Status |\n|---|---|");
        for task in tasks {
            let _ = writeln!(
                out,
                "| {} | {} {} |",
                task.name,
                state_marker(task.state),
                task.state
            );
        }
    }
    if !log_url.is_empty() {
        let _ = writeln!(out, "\n[View logs]({log_url})");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_tasks() {
        let tasks = vec![
            TaskOutcome {
                name: "build".to_string(),
                state: RunState::Succeeded,
            },
            TaskOutcome {
                name: "test".to_string(),
                state: RunState::Failed,
            },
        ];
        let comment = summary_comment("checks", RunState::Failed, &tasks, "https://console/x");
        assert!(comment.contains("**checks**"));
        assert!(comment.contains("| build |"));
        assert!(comment.contains("| test |"));
        assert!(comment.contains("[View logs](https://console/x)"));
    }

    #[test]
    fn warning_comment_names_keys() {
        let comment = template_warning_comment(&["mystery".to_string()]);
        assert!(comment.contains("{{ mystery }}"));
    }
}
