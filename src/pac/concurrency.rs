//! Per-repository FIFO admission of PipelineRuns, bounded by the binding's
//! `concurrency_limit`. Runs over the limit are created in the cluster as
//! pending and promoted when capacity frees up; a new push cancels
//! superseded runs on the same branch.
//!
//! Single writer per repository key: the global index is behind a read-lock,
//! each repository queue behind its own mutex. Queue mutexes are never held
//! across cluster calls; slots are reserved under the lock and released if
//! the call fails.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::binding::RepositoryBinding;
use crate::pac::error::PacError;
use crate::pac::event::{Event, EventKind, normalize_url};
use crate::tekton::{
    ANNOTATION_QUEUE_POSITION, LABEL_ORIGINAL_NAME, LABEL_REPOSITORY, RunObject, RunState,
    RunStatusEvent, TektonClient,
};
use crate::utils::retry::{Backoff, retry_with_backoff};

/// Identity of one executing PipelineRun.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub namespace: String,
    pub name: String,
    pub event_sha: String,
    pub head_branch: String,
    pub repository_url: String,
    pub state: RunState,
}

#[derive(Debug)]
pub struct Admitted {
    pub record: RunRecord,
    /// false when the run was created pending, over the limit.
    pub started: bool,
}

#[derive(Default)]
struct RepoQueue {
    limit: Option<usize>,
    running: HashMap<String, RunRecord>,
    pending: VecDeque<RunRecord>,
}

impl RepoQueue {
    fn has_capacity(&self) -> bool {
        self.limit.is_none_or(|limit| self.running.len() < limit)
    }
}

pub struct ConcurrencyManager {
    tekton: Arc<dyn TektonClient>,
    backoff: Backoff,
    index: RwLock<HashMap<String, Arc<Mutex<RepoQueue>>>>,
}

impl ConcurrencyManager {
    pub fn new(tekton: Arc<dyn TektonClient>) -> Self {
        Self {
            tekton,
            backoff: Backoff::default(),
            index: RwLock::new(HashMap::new()),
        }
    }

    fn queue_for(&self, repository_url: &str, limit: Option<usize>) -> Arc<Mutex<RepoQueue>> {
        if let Some(queue) = self.index.read().get(repository_url) {
            queue.lock().limit = limit;
            return queue.clone();
        }
        let mut index = self.index.write();
        let queue = index
            .entry(repository_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RepoQueue::default())))
            .clone();
        queue.lock().limit = limit;
        queue
    }

    /// Admit freshly materialized runs for an event: cancel superseded runs
    /// when configured, then start or enqueue each run in submission order.
    pub async fn admit(
        &self,
        binding: &RepositoryBinding,
        event: &Event,
        runs: Vec<RunObject>,
    ) -> Result<Vec<Admitted>, PacError> {
        let repository_url = normalize_url(&event.base_url);
        let queue = self.queue_for(&repository_url, binding.spec.concurrency_limit);

        let cancel_in_progress = binding
            .cancel_in_progress()
            .unwrap_or(event.kind != EventKind::Push);
        if cancel_in_progress {
            self.cancel_superseded(&queue, event).await;
        }

        let mut admitted = Vec::new();
        for mut run in runs {
            let record = RunRecord {
                namespace: run.namespace.clone(),
                name: run.name.clone(),
                event_sha: event.sha.clone(),
                head_branch: event.head_branch.clone(),
                repository_url: repository_url.clone(),
                state: RunState::Running,
            };

            // Reserve a slot (or a queue position) before the cluster call.
            let start = {
                let mut queue = queue.lock();
                let start = queue.has_capacity() && queue.pending.is_empty();
                if start {
                    let mut record = record.clone();
                    record.state = RunState::Running;
                    queue.running.insert(record.name.clone(), record);
                } else {
                    let position = queue.pending.len();
                    run.annotations
                        .insert(ANNOTATION_QUEUE_POSITION.to_string(), position.to_string());
                    run.manifest["metadata"]["annotations"][ANNOTATION_QUEUE_POSITION] =
                        serde_json::json!(position.to_string());
                    let mut record = record.clone();
                    record.state = RunState::Queued;
                    queue.pending.push_back(record);
                }
                start
            };

            let created = retry_with_backoff(
                "create PipelineRun",
                &self.backoff,
                |_| false,
                || self.tekton.create_pipeline_run(&run, !start),
            )
            .await;

            if let Err(error) = created {
                let mut queue = queue.lock();
                if start {
                    queue.running.remove(&run.name);
                } else {
                    queue.pending.retain(|r| r.name != run.name);
                }
                return Err(PacError::SubmissionError(format!(
                    "{}: {error:#}",
                    run.name
                )));
            }

            let mut record = record;
            record.state = if start {
                RunState::Running
            } else {
                RunState::Queued
            };
            admitted.push(Admitted {
                record,
                started: start,
            });
        }
        Ok(admitted)
    }

    /// Cancel every queued or running record for the event's
    /// `(repository, head_branch)`. Cancellation failures are logged, never
    /// fatal; the superseded run finishes and still gets reported.
    async fn cancel_superseded(&self, queue: &Arc<Mutex<RepoQueue>>, event: &Event) {
        let victims: Vec<RunRecord> = {
            let mut queue = queue.lock();
            let mut victims: Vec<RunRecord> = queue
                .running
                .values()
                .filter(|r| r.head_branch == event.head_branch && r.event_sha != event.sha)
                .cloned()
                .collect();
            let queued: Vec<RunRecord> = queue
                .pending
                .iter()
                .filter(|r| r.head_branch == event.head_branch && r.event_sha != event.sha)
                .cloned()
                .collect();
            queue
                .pending
                .retain(|r| !(r.head_branch == event.head_branch && r.event_sha != event.sha));
            for victim in &victims {
                queue.running.remove(&victim.name);
            }
            victims.extend(queued);
            victims
        };

        for victim in victims {
            tracing::info!(
                run = victim.name,
                branch = victim.head_branch,
                "Cancelling superseded run"
            );
            if let Err(error) = self
                .tekton
                .cancel_pipeline_run(&victim.namespace, &victim.name)
                .await
            {
                tracing::warn!(run = victim.name, "Could not cancel superseded run: {error:#}");
            }
        }
    }

    /// Handle a terminal transition: free the slot, promote queued runs in
    /// FIFO order, prune old runs when `max-keep-runs` is set.
    pub async fn on_terminal(&self, status: &RunStatusEvent) -> Vec<RunRecord> {
        let repository_url = normalize_url(&status.repository_url);
        let Some(queue) = self.index.read().get(&repository_url).cloned() else {
            return vec![];
        };

        let promoted: Vec<RunRecord> = {
            let mut queue = queue.lock();
            queue.running.remove(&status.name);
            queue.pending.retain(|r| r.name != status.name);
            let mut promoted = Vec::new();
            while queue.has_capacity() {
                let Some(mut next) = queue.pending.pop_front() else {
                    break;
                };
                next.state = RunState::Running;
                queue.running.insert(next.name.clone(), next.clone());
                promoted.push(next);
            }
            promoted
        };

        let mut started = Vec::new();
        for record in promoted {
            let result = retry_with_backoff(
                "start PipelineRun",
                &self.backoff,
                |_| false,
                || self.tekton.start_pipeline_run(&record.namespace, &record.name),
            )
            .await;
            match result {
                Ok(()) => started.push(record),
                Err(error) => {
                    tracing::warn!(run = record.name, "Could not promote queued run: {error:#}");
                    queue.lock().running.remove(&record.name);
                }
            }
        }
        started
    }

    /// Delete terminal runs of the same original pipeline beyond the
    /// `max-keep-runs` annotation.
    pub async fn prune_old_runs(&self, status: &RunStatusEvent) {
        let Some(max_keep) = status.max_keep_runs else {
            return;
        };
        let selector = format!("{LABEL_ORIGINAL_NAME}={}", status.original_name);
        let runs = match self
            .tekton
            .list_pipeline_runs(&status.namespace, &selector)
            .await
        {
            Ok(runs) => runs,
            Err(error) => {
                tracing::warn!("Could not list runs for pruning: {error:#}");
                return;
            }
        };
        let mut terminal: Vec<_> = runs
            .into_iter()
            .filter(|r| r.state.is_terminal() && !r.pending)
            .collect();
        terminal.sort_by(|a, b| b.completion_time.cmp(&a.completion_time));
        for run in terminal.into_iter().skip(max_keep.max(1)) {
            tracing::info!(run = run.object.name, "Pruning old run");
            if let Err(error) = self
                .tekton
                .delete_pipeline_run(&run.object.namespace, &run.object.name)
                .await
            {
                tracing::warn!(run = run.object.name, "Could not prune run: {error:#}");
            }
        }
    }

    /// Rebuild the queue index from the cluster at startup. Pending runs are
    /// re-ordered by the queue position recorded at creation.
    pub async fn rebuild(&self, namespaces: &[String]) -> anyhow::Result<()> {
        let mut pending_by_repo: HashMap<String, Vec<(usize, RunRecord)>> = HashMap::new();
        for namespace in namespaces {
            let runs = self
                .tekton
                .list_pipeline_runs(namespace, LABEL_REPOSITORY)
                .await?;
            for run in runs {
                if run.state.is_terminal() {
                    continue;
                }
                let Some(repository_url) = run
                    .object
                    .annotation(crate::tekton::ANNOTATION_REPO_URL)
                    .map(normalize_url)
                else {
                    continue;
                };
                let record = RunRecord {
                    namespace: run.object.namespace.clone(),
                    name: run.object.name.clone(),
                    event_sha: run
                        .object
                        .annotation(crate::tekton::ANNOTATION_SHA)
                        .unwrap_or_default()
                        .to_string(),
                    head_branch: run
                        .object
                        .annotation(crate::tekton::ANNOTATION_BRANCH)
                        .unwrap_or_default()
                        .to_string(),
                    repository_url: repository_url.clone(),
                    state: run.state,
                };
                if run.pending {
                    let position = run
                        .object
                        .annotation(ANNOTATION_QUEUE_POSITION)
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(usize::MAX);
                    pending_by_repo
                        .entry(repository_url)
                        .or_default()
                        .push((position, record));
                } else {
                    let queue = self.queue_for(&repository_url, None);
                    queue.lock().running.insert(record.name.clone(), record);
                }
            }
        }
        for (repository_url, mut pending) in pending_by_repo {
            pending.sort_by_key(|(position, _)| *position);
            let queue = self.queue_for(&repository_url, None);
            let mut queue = queue.lock();
            for (_, record) in pending {
                queue.pending.push_back(record);
            }
        }
        Ok(())
    }

    /// Count of non-terminal records for a repository, for tests and
    /// diagnostics.
    pub fn in_flight(&self, repository_url: &str) -> usize {
        let url = normalize_url(repository_url);
        self.index
            .read()
            .get(&url)
            .map(|q| {
                let q = q.lock();
                q.running.len()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ObjectMeta, RepositorySpec};
    use crate::tests::event_builder::TestEvent;
    use crate::tests::mocks::MockTekton;
    use std::collections::BTreeMap;

    fn binding(limit: Option<usize>) -> RepositoryBinding {
        RepositoryBinding {
            metadata: ObjectMeta {
                name: "demo".to_string(),
                namespace: "ci".to_string(),
                ..Default::default()
            },
            spec: RepositorySpec {
                url: "https://github.com/owner/repo".to_string(),
                concurrency_limit: limit,
                ..Default::default()
            },
        }
    }

    fn run_object(name: &str) -> RunObject {
        RunObject {
            name: name.to_string(),
            namespace: "ci".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            manifest: serde_json::json!({
                "apiVersion": "tekton.dev/v1",
                "kind": "PipelineRun",
                "metadata": {"name": name, "annotations": {}},
                "spec": {}
            }),
        }
    }

    fn status_event(name: &str, state: RunState) -> RunStatusEvent {
        RunStatusEvent {
            namespace: "ci".to_string(),
            name: name.to_string(),
            repository_url: "https://github.com/owner/repo".to_string(),
            sha: "abc123".to_string(),
            head_branch: "feature".to_string(),
            event_type: "pull_request".to_string(),
            organization: "owner".to_string(),
            repository: "repo".to_string(),
            pull_request_number: Some(1),
            state,
            log_url: String::new(),
            tasks: vec![],
            original_name: "checks".to_string(),
            max_keep_runs: None,
        }
    }

    #[tokio::test]
    async fn admits_up_to_the_limit() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());
        let event = TestEvent::default().build();

        let admitted = manager
            .admit(
                &binding(Some(2)),
                &event,
                vec![run_object("a"), run_object("b"), run_object("c")],
            )
            .await
            .unwrap();

        assert_eq!(admitted.len(), 3);
        assert!(admitted[0].started);
        assert!(admitted[1].started);
        assert!(!admitted[2].started);
        assert_eq!(manager.in_flight("https://github.com/owner/repo"), 2);
        assert_eq!(tekton.pending_creates(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn queued_runs_record_their_position() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());
        let event = TestEvent::default().build();

        manager
            .admit(
                &binding(Some(1)),
                &event,
                vec![run_object("a"), run_object("b"), run_object("c")],
            )
            .await
            .unwrap();

        let created = tekton.created();
        let b = created.iter().find(|r| r.name == "b").unwrap();
        let c = created.iter().find(|r| r.name == "c").unwrap();
        assert_eq!(b.annotations[ANNOTATION_QUEUE_POSITION], "0");
        assert_eq!(c.annotations[ANNOTATION_QUEUE_POSITION], "1");
    }

    #[tokio::test]
    async fn terminal_transition_promotes_fifo() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());
        let event = TestEvent::default().build();

        manager
            .admit(
                &binding(Some(1)),
                &event,
                vec![run_object("a"), run_object("b"), run_object("c")],
            )
            .await
            .unwrap();

        let promoted = manager
            .on_terminal(&status_event("a", RunState::Succeeded))
            .await;
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].name, "b");
        assert_eq!(tekton.started(), vec!["b".to_string()]);

        let promoted = manager
            .on_terminal(&status_event("b", RunState::Succeeded))
            .await;
        assert_eq!(promoted[0].name, "c");
    }

    #[tokio::test]
    async fn new_push_cancels_in_progress_runs_on_same_branch() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());

        let first = TestEvent::default().sha("old111").build();
        manager
            .admit(&binding(None), &first, vec![run_object("run-a")])
            .await
            .unwrap();

        let second = TestEvent::default().sha("new222").build();
        manager
            .admit(&binding(None), &second, vec![run_object("run-b")])
            .await
            .unwrap();

        assert_eq!(tekton.cancelled(), vec!["run-a".to_string()]);
        assert_eq!(manager.in_flight("https://github.com/owner/repo"), 1);
    }

    #[tokio::test]
    async fn different_branches_are_not_cancelled() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());

        let first = TestEvent::default().head_branch("feature-a").build();
        manager
            .admit(&binding(None), &first, vec![run_object("run-a")])
            .await
            .unwrap();

        let second = TestEvent::default().head_branch("feature-b").sha("zzz999").build();
        manager
            .admit(&binding(None), &second, vec![run_object("run-b")])
            .await
            .unwrap();

        assert!(tekton.cancelled().is_empty());
        assert_eq!(manager.in_flight("https://github.com/owner/repo"), 2);
    }

    #[tokio::test]
    async fn push_events_do_not_cancel_by_default() {
        let tekton = Arc::new(MockTekton::default());
        let manager = ConcurrencyManager::new(tekton.clone());

        let first = TestEvent::default()
            .kind(EventKind::Push)
            .sha("old111")
            .build();
        manager
            .admit(&binding(None), &first, vec![run_object("run-a")])
            .await
            .unwrap();

        let second = TestEvent::default()
            .kind(EventKind::Push)
            .sha("new222")
            .build();
        manager
            .admit(&binding(None), &second, vec![run_object("run-b")])
            .await
            .unwrap();

        assert!(tekton.cancelled().is_empty());
    }

    #[tokio::test]
    async fn submission_failure_releases_the_slot() {
        let tekton = Arc::new(MockTekton::default());
        tekton.fail_creates();
        let manager = ConcurrencyManager::new(tekton.clone());
        let event = TestEvent::default().build();

        let result = manager
            .admit(&binding(Some(1)), &event, vec![run_object("a")])
            .await;
        assert!(matches!(result, Err(PacError::SubmissionError(_))));
        assert_eq!(manager.in_flight("https://github.com/owner/repo"), 0);
    }

    #[tokio::test]
    async fn cancellation_failure_is_not_fatal() {
        let tekton = Arc::new(MockTekton::default());
        tekton.fail_cancels();
        let manager = ConcurrencyManager::new(tekton.clone());

        let first = TestEvent::default().sha("old111").build();
        manager
            .admit(&binding(None), &first, vec![run_object("run-a")])
            .await
            .unwrap();
        let second = TestEvent::default().sha("new222").build();
        let admitted = manager
            .admit(&binding(None), &second, vec![run_object("run-b")])
            .await
            .unwrap();
        assert_eq!(admitted.len(), 1);
    }
}
