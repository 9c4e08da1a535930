//! The Tekton/Kubernetes seam. The core creates, cancels and observes
//! `PipelineRun` objects through [`TektonClient`] and emits core/v1 Events
//! through [`Recorder`]; the cluster wiring behind the traits is an external
//! collaborator.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod http;
pub mod watcher;

pub const LABEL_PREFIX: &str = "pipelinesascode.tekton.dev";

pub const LABEL_REPOSITORY: &str = "pipelinesascode.tekton.dev/repository";
pub const LABEL_SHA: &str = "pipelinesascode.tekton.dev/sha";
pub const LABEL_EVENT_TYPE: &str = "pipelinesascode.tekton.dev/event-type";
pub const LABEL_BRANCH: &str = "pipelinesascode.tekton.dev/branch";
pub const LABEL_ORIGINAL_NAME: &str = "pipelinesascode.tekton.dev/original-prname";

pub const ANNOTATION_REPO_URL: &str = "pipelinesascode.tekton.dev/repo-url";
pub const ANNOTATION_ORGANIZATION: &str = "pipelinesascode.tekton.dev/organization";
pub const ANNOTATION_REPOSITORY: &str = "pipelinesascode.tekton.dev/repository";
pub const ANNOTATION_SHA: &str = "pipelinesascode.tekton.dev/sha";
pub const ANNOTATION_BRANCH: &str = "pipelinesascode.tekton.dev/branch";
pub const ANNOTATION_EVENT_TYPE: &str = "pipelinesascode.tekton.dev/event-type";
pub const ANNOTATION_PULL_REQUEST: &str = "pipelinesascode.tekton.dev/pull-request";
pub const ANNOTATION_QUEUE_POSITION: &str = "pipelinesascode.tekton.dev/queue-position";
pub const ANNOTATION_MAX_KEEP_RUNS: &str = "pipelinesascode.tekton.dev/max-keep-runs";

/// Labels Tekton itself puts on the TaskRuns of a PipelineRun.
pub const LABEL_TEKTON_PIPELINE_RUN: &str = "tekton.dev/pipelineRun";
pub const LABEL_TEKTON_PIPELINE_TASK: &str = "tekton.dev/pipelineTask";

/// Lifecycle of a PipelineRun as reflected to the forge.
/// Transitions are monotonic except `Queued -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled | RunState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Skipped => "skipped",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully materialized PipelineRun ready for submission.
#[derive(Debug, Clone)]
pub struct RunObject {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// The complete object as it will be sent to the cluster.
    pub manifest: serde_json::Value,
}

impl RunObject {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A PipelineRun observed on the cluster.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub object: RunObject,
    pub state: RunState,
    pub pending: bool,
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub name: String,
    pub state: RunState,
}

/// A state transition observed by the watcher and consumed by the status
/// reporter and the concurrency manager.
#[derive(Debug, Clone)]
pub struct RunStatusEvent {
    pub namespace: String,
    pub name: String,
    pub repository_url: String,
    pub organization: String,
    pub repository: String,
    pub sha: String,
    pub head_branch: String,
    pub event_type: String,
    pub pull_request_number: Option<u64>,
    pub state: RunState,
    pub log_url: String,
    pub tasks: Vec<TaskOutcome>,
    /// Name of the pipeline as written in `.tekton/`, before suffixing.
    pub original_name: String,
    pub max_keep_runs: Option<usize>,
}

#[async_trait]
pub trait TektonClient: Send + Sync {
    /// Create a PipelineRun. When `pending` is set the run is created with
    /// `spec.status: PipelineRunPending` and will not execute until started.
    async fn create_pipeline_run(&self, run: &RunObject, pending: bool) -> anyhow::Result<()>;

    /// Clear the pending status so a queued run starts executing.
    async fn start_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()>;

    /// Patch the run's spec status to `CancelledRunFinally`.
    async fn cancel_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()>;

    async fn delete_pipeline_run(&self, namespace: &str, name: &str) -> anyhow::Result<()>;

    async fn list_pipeline_runs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<RunSnapshot>>;

    /// List TaskRun objects, for per-task outcomes of a finished run.
    /// A PipelineRun's own status only carries bare child references.
    async fn list_task_runs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> anyhow::Result<Vec<serde_json::Value>>;
}

/// Emits Kubernetes core/v1 Events on failures and skips.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn event(&self, namespace: &str, reason: &str, message: &str);
}

/// Recorder used when no cluster connection is available: events only reach
/// the logs.
pub struct LogRecorder;

#[async_trait]
impl Recorder for LogRecorder {
    async fn event(&self, namespace: &str, reason: &str, message: &str) {
        tracing::info!(namespace, reason, "{message}");
    }
}

/// Derive the [`RunState`] of a PipelineRun object from its `spec.status`
/// and its `Succeeded` condition.
pub fn run_state_of(manifest: &serde_json::Value) -> RunState {
    if manifest["spec"]["status"].as_str() == Some("PipelineRunPending") {
        return RunState::Queued;
    }
    let conditions = manifest["status"]["conditions"].as_array();
    let succeeded = conditions.and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c["type"].as_str() == Some("Succeeded"))
    });
    let Some(condition) = succeeded else {
        return RunState::Running;
    };
    let reason = condition["reason"].as_str().unwrap_or_default();
    match condition["status"].as_str() {
        Some("True") => RunState::Succeeded,
        Some("False") => {
            if reason.contains("Cancelled") || reason.contains("Canceled") {
                RunState::Cancelled
            } else {
                RunState::Failed
            }
        }
        _ => RunState::Running,
    }
}

/// Per-task outcomes for the completion summary comment, derived from the
/// TaskRun objects of a run. The PipelineRun status itself only references
/// its children by name and carries no conditions for them.
pub fn task_outcomes(task_runs: &[serde_json::Value]) -> Vec<TaskOutcome> {
    let mut outcomes: Vec<TaskOutcome> = task_runs
        .iter()
        .filter_map(|task_run| {
            let name = task_run["metadata"]["labels"][LABEL_TEKTON_PIPELINE_TASK]
                .as_str()
                .or_else(|| task_run["metadata"]["name"].as_str())?;
            Some(TaskOutcome {
                name: name.to_string(),
                state: run_state_of(task_run),
            })
        })
        .collect();
    outcomes.sort_by(|a, b| a.name.cmp(&b.name));
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_run_is_queued() {
        let manifest = json!({"spec": {"status": "PipelineRunPending"}});
        assert_eq!(run_state_of(&manifest), RunState::Queued);
    }

    #[test]
    fn no_conditions_is_running() {
        let manifest = json!({"spec": {}, "status": {}});
        assert_eq!(run_state_of(&manifest), RunState::Running);
    }

    #[test]
    fn succeeded_condition() {
        let manifest = json!({
            "status": {"conditions": [{"type": "Succeeded", "status": "True", "reason": "Completed"}]}
        });
        assert_eq!(run_state_of(&manifest), RunState::Succeeded);
    }

    #[test]
    fn cancelled_reason_maps_to_cancelled() {
        let manifest = json!({
            "status": {"conditions": [{"type": "Succeeded", "status": "False", "reason": "CancelledRunFinally"}]}
        });
        assert_eq!(run_state_of(&manifest), RunState::Cancelled);
    }

    #[test]
    fn failed_condition() {
        let manifest = json!({
            "status": {"conditions": [{"type": "Succeeded", "status": "False", "reason": "Failed"}]}
        });
        assert_eq!(run_state_of(&manifest), RunState::Failed);
    }

    fn task_run(task: &str, status: &str, reason: &str) -> serde_json::Value {
        json!({
            "metadata": {
                "name": format!("checks-abcde-{task}"),
                "labels": {
                    (LABEL_TEKTON_PIPELINE_RUN): "checks-abcde",
                    (LABEL_TEKTON_PIPELINE_TASK): task,
                }
            },
            "status": {"conditions": [{"type": "Succeeded", "status": status, "reason": reason}]}
        })
    }

    #[test]
    fn task_outcomes_come_from_task_run_conditions() {
        let task_runs = vec![
            task_run("unit", "True", "Succeeded"),
            task_run("build", "False", "Failed"),
        ];
        let outcomes = task_outcomes(&task_runs);
        assert_eq!(
            outcomes,
            vec![
                TaskOutcome {
                    name: "build".to_string(),
                    state: RunState::Failed,
                },
                TaskOutcome {
                    name: "unit".to_string(),
                    state: RunState::Succeeded,
                },
            ]
        );
    }

    #[test]
    fn task_outcomes_fall_back_to_the_task_run_name() {
        let task_runs = vec![json!({
            "metadata": {"name": "checks-abcde-lint"},
            "status": {"conditions": [{"type": "Succeeded", "status": "True"}]}
        })];
        let outcomes = task_outcomes(&task_runs);
        assert_eq!(outcomes[0].name, "checks-abcde-lint");
        assert_eq!(outcomes[0].state, RunState::Succeeded);
    }
}
