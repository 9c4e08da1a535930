//! End-to-end tests of the event-to-execution pipeline, with the forge and
//! the cluster mocked out.

use std::sync::Arc;

use crate::binding::{
    BindingStore, ObjectMeta, RepositoryBinding, RepositorySpec, StaticSecretStore,
};
use crate::pac::comment::SKIPPED_DESCRIPTION;
use crate::pac::context::{GlobalSettings, PacContext};
use crate::pac::event::{CommentContext, EventKind, TriggerTarget};
use crate::pac::handlers::{handle_run_status, handle_webhook_event};
use crate::tekton::{
    LABEL_EVENT_TYPE, LABEL_SHA, RunObject, RunSnapshot, RunState, RunStatusEvent, TaskOutcome,
};
use crate::tests::event_builder::TestEvent;
use crate::tests::mocks::{MockProvider, MockProviderFactory, MockRecorder, MockTekton};

const PR_MANIFEST: &str = r#"
apiVersion: tekton.dev/v1
kind: PipelineRun
metadata:
  name: checks
  annotations:
    pipelinesascode.tekton.dev/on-event: "[pull_request]"
    pipelinesascode.tekton.dev/on-target-branch: "[main]"
spec:
  params:
    - name: revision
      value: "{{ revision }}"
"#;

struct PacTester {
    ctx: Arc<PacContext>,
    provider: Arc<MockProvider>,
    tekton: Arc<MockTekton>,
    recorder: Arc<MockRecorder>,
}

impl PacTester {
    fn new(provider: MockProvider) -> Self {
        Self::with_binding(provider, |_| {})
    }

    fn with_binding(provider: MockProvider, customize: impl FnOnce(&mut RepositoryBinding)) -> Self {
        let mut binding = RepositoryBinding {
            metadata: ObjectMeta {
                name: "demo".to_string(),
                namespace: "ci".to_string(),
                ..Default::default()
            },
            spec: RepositorySpec {
                url: "https://github.com/owner/repo".to_string(),
                ..Default::default()
            },
        };
        customize(&mut binding);
        let bindings = Arc::new(BindingStore::new());
        bindings.replace_all(vec![binding]);

        let provider = Arc::new(provider);
        let tekton = Arc::new(MockTekton::default());
        let recorder = Arc::new(MockRecorder::default());
        let ctx = Arc::new(PacContext::new(
            bindings,
            Arc::new(StaticSecretStore::default()),
            Arc::new(MockProviderFactory {
                provider: provider.clone(),
            }),
            tekton.clone(),
            recorder.clone(),
            GlobalSettings {
                console_url: "https://console".to_string(),
            },
        ));
        Self {
            ctx,
            provider,
            tekton,
            recorder,
        }
    }
}

#[tokio::test]
async fn pull_request_creates_a_labeled_pipeline_run() {
    let tester = PacTester::new(
        MockProvider::default().with_tekton_file(".tekton/checks.yaml", PR_MANIFEST),
    );
    let event = TestEvent::default().build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    let created = tester.tekton.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].labels[LABEL_SHA], "abc123");
    assert_eq!(created[0].labels[LABEL_EVENT_TYPE], "pull_request");
    assert_eq!(
        created[0].manifest["spec"]["params"][0]["value"],
        serde_json::json!("abc123")
    );

    let statuses = tester.provider.posted_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1, RunState::Running);

    let events = tester.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "PipelineRunsCreated");
}

#[tokio::test]
async fn ok_to_test_from_owner_runs_ci_for_a_stranger() {
    let tester = PacTester::new(
        MockProvider::default()
            .with_tekton_file(".tekton/checks.yaml", PR_MANIFEST)
            .with_comment("owner", "/ok-to-test"),
    );
    let event = TestEvent::default()
        .kind(EventKind::IssueComment)
        .trigger(TriggerTarget::OkToTestComment)
        .sender("nonowner")
        .sha("")
        .fork()
        .comment(CommentContext {
            author: "owner".to_string(),
            body: "/ok-to-test".to_string(),
        })
        .build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    let created = tester.tekton.created();
    assert_eq!(created.len(), 1);
    // The SHA was filled in from the pull request.
    assert_eq!(created[0].labels[LABEL_SHA], "abc123");
    assert_eq!(created[0].labels[LABEL_EVENT_TYPE], "issue_comment");
}

#[tokio::test]
async fn denied_sender_gets_a_skipped_status() {
    let tester = PacTester::new(
        MockProvider::default()
            .with_tekton_file(".tekton/checks.yaml", PR_MANIFEST)
            .with_comment("notowner", "/ok-to-test"),
    );
    let event = TestEvent::default().sender("nonowner").fork().build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    assert!(tester.tekton.created().is_empty());
    let statuses = tester.provider.posted_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1, RunState::Skipped);
    assert_eq!(statuses[0].2, SKIPPED_DESCRIPTION);
    assert_eq!(tester.recorder.events()[0].1, "AccessDenied");
}

#[tokio::test]
async fn no_matching_pipeline_records_an_event() {
    let manifest = PR_MANIFEST.replace("[main]", "[production]");
    let tester =
        PacTester::new(MockProvider::default().with_tekton_file(".tekton/checks.yaml", &manifest));
    let event = TestEvent::default().build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    assert!(tester.tekton.created().is_empty());
    let events = tester.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "NoMatch");
}

#[tokio::test]
async fn unknown_template_keys_produce_a_warning_comment() {
    let manifest = PR_MANIFEST.replace("{{ revision }}", "{{ revision }}-{{ mystery }}");
    let tester =
        PacTester::new(MockProvider::default().with_tekton_file(".tekton/checks.yaml", &manifest));
    let event = TestEvent::default().build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    assert_eq!(tester.tekton.created().len(), 1);
    let comments = tester.provider.posted_comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("{{ mystery }}"));
}

#[tokio::test]
async fn second_push_cancels_the_first_run() {
    let push_manifest = PR_MANIFEST
        .replace("[pull_request]", "[push]")
        .replace("[main]", "[feature]");
    let provider = MockProvider::default().with_tekton_file(".tekton/checks.yaml", &push_manifest);
    let tester = PacTester::with_binding(provider, |binding| {
        binding.spec.settings = Some(crate::binding::Settings {
            cancel_in_progress: Some(true),
            ..Default::default()
        });
    });

    let first = TestEvent::default()
        .kind(EventKind::Push)
        .sender("owner")
        .base_branch("feature")
        .sha("old111")
        .build();
    handle_webhook_event(tester.ctx.clone(), first).await.unwrap();

    let second = TestEvent::default()
        .kind(EventKind::Push)
        .sender("owner")
        .base_branch("feature")
        .sha("new222")
        .build();
    handle_webhook_event(tester.ctx.clone(), second).await.unwrap();

    let created = tester.tekton.created();
    assert_eq!(created.len(), 2);
    let cancelled = tester.tekton.cancelled();
    assert_eq!(cancelled, vec![created[0].name.clone()]);
}

#[tokio::test]
async fn concurrency_limit_queues_the_overflow() {
    let two_runs = format!(
        "{PR_MANIFEST}\n---\n{}",
        PR_MANIFEST.replace("name: checks", "name: lint")
    );
    let provider = MockProvider::default().with_tekton_file(".tekton/checks.yaml", &two_runs);
    let tester = PacTester::with_binding(provider, |binding| {
        binding.spec.concurrency_limit = Some(1);
    });
    let event = TestEvent::default().build();

    handle_webhook_event(tester.ctx.clone(), event).await.unwrap();

    let created = tester.tekton.created();
    assert_eq!(created.len(), 2);
    assert_eq!(tester.tekton.pending_creates().len(), 1);
    let statuses = tester.provider.posted_statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().any(|s| s.1 == RunState::Queued));
    assert!(statuses.iter().any(|s| s.1 == RunState::Running));
}

fn status_event(name: &str, state: RunState) -> RunStatusEvent {
    RunStatusEvent {
        namespace: "ci".to_string(),
        name: name.to_string(),
        repository_url: "https://github.com/owner/repo".to_string(),
        organization: "owner".to_string(),
        repository: "repo".to_string(),
        sha: "abc123".to_string(),
        head_branch: "feature".to_string(),
        event_type: "pull_request".to_string(),
        pull_request_number: Some(1),
        state,
        log_url: "https://console/ci/checks-abcde".to_string(),
        tasks: vec![TaskOutcome {
            name: "build".to_string(),
            state: RunState::Succeeded,
        }],
        original_name: "checks".to_string(),
        max_keep_runs: None,
    }
}

fn finished_snapshot(name: &str, completed_at: &str) -> RunSnapshot {
    RunSnapshot {
        object: RunObject {
            name: name.to_string(),
            namespace: "ci".to_string(),
            labels: Default::default(),
            annotations: Default::default(),
            manifest: serde_json::json!({
                "metadata": {"name": name, "namespace": "ci"},
                "status": {"conditions": [{"type": "Succeeded", "status": "True"}]}
            }),
        },
        state: RunState::Succeeded,
        pending: false,
        completion_time: Some(
            chrono::DateTime::parse_from_rfc3339(completed_at)
                .unwrap()
                .with_timezone(&chrono::Utc),
        ),
    }
}

#[tokio::test]
async fn max_keep_runs_prunes_the_oldest_runs() {
    let tester = PacTester::new(MockProvider::default());
    tester.tekton.set_runs(vec![
        finished_snapshot("checks-old1", "2026-08-01T10:00:00Z"),
        finished_snapshot("checks-old2", "2026-08-01T11:00:00Z"),
        finished_snapshot("checks-new", "2026-08-01T12:00:00Z"),
    ]);

    let mut status = status_event("checks-new", RunState::Succeeded);
    status.max_keep_runs = Some(1);
    handle_run_status(tester.ctx.clone(), status).await.unwrap();

    assert_eq!(
        tester.tekton.deleted(),
        vec!["checks-old2".to_string(), "checks-old1".to_string()]
    );
}

#[tokio::test]
async fn terminal_status_posts_a_summary_comment() {
    let tester = PacTester::new(MockProvider::default());

    handle_run_status(tester.ctx.clone(), status_event("checks-abcde", RunState::Succeeded))
        .await
        .unwrap();

    let statuses = tester.provider.posted_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1, RunState::Succeeded);
    let comments = tester.provider.posted_comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].contains("**checks**"));
    assert!(comments[0].contains("| build |"));
}

#[tokio::test]
async fn duplicate_terminal_statuses_are_posted_once() {
    let tester = PacTester::new(MockProvider::default());

    let status = status_event("checks-abcde", RunState::Failed);
    handle_run_status(tester.ctx.clone(), status.clone()).await.unwrap();
    handle_run_status(tester.ctx.clone(), status).await.unwrap();

    assert_eq!(tester.provider.posted_statuses().len(), 1);
}

#[tokio::test]
async fn running_status_is_reported() {
    let tester = PacTester::new(MockProvider::default());

    handle_run_status(tester.ctx.clone(), status_event("checks-abcde", RunState::Running))
        .await
        .unwrap();

    let statuses = tester.provider.posted_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].1, RunState::Running);
    assert!(tester.provider.posted_comments().is_empty());
}
