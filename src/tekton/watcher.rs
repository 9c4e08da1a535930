//! Observes PipelineRun state by polling the cluster and feeding transitions
//! into the run-status channel. An informer-based watcher can replace this
//! behind the same channel contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::binding::BindingStore;
use crate::tekton::{
    ANNOTATION_BRANCH, ANNOTATION_EVENT_TYPE, ANNOTATION_MAX_KEEP_RUNS, ANNOTATION_ORGANIZATION,
    ANNOTATION_PULL_REQUEST, ANNOTATION_REPO_URL, ANNOTATION_REPOSITORY, ANNOTATION_SHA,
    LABEL_ORIGINAL_NAME, LABEL_REPOSITORY, LABEL_TEKTON_PIPELINE_RUN, RunSnapshot, RunState,
    RunStatusEvent, TaskOutcome, TektonClient, task_outcomes,
};

#[cfg(not(test))]
const POLL_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(test)]
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct RunWatcher {
    tekton: Arc<dyn TektonClient>,
    bindings: Arc<BindingStore>,
    console_url: String,
    tx: mpsc::Sender<RunStatusEvent>,
    last_seen: HashMap<(String, String), RunState>,
}

impl RunWatcher {
    pub fn new(
        tekton: Arc<dyn TektonClient>,
        bindings: Arc<BindingStore>,
        console_url: String,
        tx: mpsc::Sender<RunStatusEvent>,
    ) -> Self {
        Self {
            tekton,
            bindings,
            console_url,
            tx,
            last_seen: HashMap::new(),
        }
    }

    /// Poll until the status channel is closed.
    pub async fn run(mut self) {
        loop {
            if let Err(error) = self.tick().await {
                tracing::warn!("Run watcher tick failed: {error:?}");
            }
            if self.tx.is_closed() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let mut observed = std::collections::HashSet::new();
        for namespace in self.bindings.namespaces() {
            let runs = self
                .tekton
                .list_pipeline_runs(&namespace, LABEL_REPOSITORY)
                .await?;
            for run in runs {
                let key = (run.object.namespace.clone(), run.object.name.clone());
                observed.insert(key.clone());
                let previous = self.last_seen.get(&key).copied();
                if previous == Some(run.state) {
                    continue;
                }
                self.last_seen.insert(key, run.state);
                // Only completion summaries need task-level detail.
                let tasks = if run.state.is_terminal() {
                    self.task_outcomes_of(&run).await
                } else {
                    vec![]
                };
                let event = self.status_event(&run, tasks);
                if self.tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        // Forget runs that were deleted from the cluster.
        self.last_seen.retain(|key, _| observed.contains(key));
        Ok(())
    }

    /// The TaskRuns of a PipelineRun carry its per-task conditions; the
    /// run's own status only references them by name.
    async fn task_outcomes_of(&self, run: &RunSnapshot) -> Vec<TaskOutcome> {
        let selector = format!("{LABEL_TEKTON_PIPELINE_RUN}={}", run.object.name);
        match self
            .tekton
            .list_task_runs(&run.object.namespace, &selector)
            .await
        {
            Ok(task_runs) => task_outcomes(&task_runs),
            Err(error) => {
                tracing::warn!(
                    run = run.object.name,
                    "Could not list the run's task runs: {error:#}"
                );
                vec![]
            }
        }
    }

    fn status_event(&self, run: &RunSnapshot, tasks: Vec<TaskOutcome>) -> RunStatusEvent {
        let annotation = |key: &str| run.object.annotation(key).unwrap_or_default().to_string();
        RunStatusEvent {
            namespace: run.object.namespace.clone(),
            name: run.object.name.clone(),
            repository_url: annotation(ANNOTATION_REPO_URL),
            organization: annotation(ANNOTATION_ORGANIZATION),
            repository: annotation(ANNOTATION_REPOSITORY),
            sha: annotation(ANNOTATION_SHA),
            head_branch: annotation(ANNOTATION_BRANCH),
            event_type: annotation(ANNOTATION_EVENT_TYPE),
            pull_request_number: run
                .object
                .annotation(ANNOTATION_PULL_REQUEST)
                .and_then(|n| n.parse().ok()),
            state: run.state,
            log_url: format!(
                "{}/{}/{}",
                self.console_url.trim_end_matches('/'),
                run.object.namespace,
                run.object.name
            ),
            tasks,
            original_name: run
                .object
                .labels
                .get(LABEL_ORIGINAL_NAME)
                .cloned()
                .unwrap_or_else(|| run.object.name.clone()),
            max_keep_runs: run
                .object
                .annotation(ANNOTATION_MAX_KEEP_RUNS)
                .and_then(|n| n.parse().ok()),
        }
    }
}
