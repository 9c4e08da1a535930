//! Reflects run state transitions back to the forge as checks, commit
//! statuses and summary comments. Posting is at-least-once with retry; the
//! `(sha, run_name, state)` idempotency set keeps a single process from
//! reposting a transition it already delivered.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::pac::comment;
use crate::pac::event::Event;
use crate::provider::{Provider, ProviderError};
use crate::tekton::{RunState, TaskOutcome};
use crate::utils::retry::{Backoff, retry_with_backoff};

pub struct StatusReporter {
    posted: Mutex<HashSet<(String, String, RunState)>>,
    backoff: Backoff,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        Self {
            posted: Mutex::new(HashSet::new()),
            backoff: Backoff::default(),
        }
    }

    fn mark_posted(&self, event_sha: &str, run_name: &str, state: RunState) -> bool {
        self.posted
            .lock()
            .insert((event_sha.to_string(), run_name.to_string(), state))
    }

    fn describe(state: RunState) -> &'static str {
        match state {
            RunState::Queued => "Waiting for a free slot",
            RunState::Running => "Validating your commit",
            RunState::Succeeded => "All checks passed",
            RunState::Failed => "Some checks failed",
            RunState::Cancelled => "The run was cancelled",
            RunState::Skipped => comment::SKIPPED_DESCRIPTION,
        }
    }

    /// Post one state transition. Duplicate `(sha, run, state)` posts are
    /// suppressed; transient provider errors are retried, authentication
    /// failures are not.
    pub async fn report(
        &self,
        provider: &dyn Provider,
        event: &Event,
        run_name: &str,
        state: RunState,
        log_url: &str,
    ) -> Result<(), ProviderError> {
        if !self.mark_posted(&event.sha, run_name, state) {
            return Ok(());
        }
        let result = retry_with_backoff(
            "post status",
            &self.backoff,
            |error: &ProviderError| !error.is_retriable(),
            || provider.post_status(event, run_name, state, log_url, Self::describe(state)),
        )
        .await;
        if result.is_err() {
            // Allow a later retry of this transition.
            self.posted.lock().remove(&(
                event.sha.clone(),
                run_name.to_string(),
                state,
            ));
        }
        result
    }

    /// Post a terminal status plus, on pull requests, the task-by-task
    /// summary comment.
    pub async fn report_completion(
        &self,
        provider: &dyn Provider,
        event: &Event,
        run_name: &str,
        original_name: &str,
        state: RunState,
        tasks: &[TaskOutcome],
        log_url: &str,
    ) -> Result<(), ProviderError> {
        self.report(provider, event, run_name, state, log_url).await?;
        if event.pull_request_number.is_some() {
            let body = comment::summary_comment(original_name, state, tasks, log_url);
            retry_with_backoff(
                "post summary comment",
                &self.backoff,
                |error: &ProviderError| !error.is_retriable(),
                || provider.post_comment(event, &body),
            )
            .await?;
        }
        Ok(())
    }

    /// Report an event that was denied by the ACL: a neutral/pending status
    /// with the ok-to-test hint, and a comment on the pull request.
    pub async fn report_skipped(
        &self,
        provider: &dyn Provider,
        event: &Event,
    ) -> Result<(), ProviderError> {
        self.report(provider, event, "", RunState::Skipped, "").await?;
        if event.pull_request_number.is_some() {
            provider
                .post_comment(event, &comment::access_denied_comment(&event.sender))
                .await?;
        }
        Ok(())
    }
}
