//! The event-to-execution pipeline: resolve the binding, enforce the ACL,
//! match and template manifests, admit runs, and reflect run status
//! transitions back to the forge.

use std::sync::Arc;

use crate::binding::RepositoryBinding;
use crate::pac::context::PacContext;
use crate::pac::error::PacError;
use crate::pac::event::{Event, EventKind, TriggerTarget, normalize_url};
use crate::pac::{acl, comment, matcher, template};
use crate::provider::Provider;
use crate::tekton::{RunState, RunStatusEvent};

/// Handle one accepted webhook event. Every accepted event ends in a
/// cluster Event record; failures and skips additionally surface as a
/// status or comment where a pull request is available.
pub async fn handle_webhook_event(ctx: Arc<PacContext>, event: Event) -> anyhow::Result<()> {
    let Some(binding) = ctx.bindings.resolve(&event.base_url) else {
        // The server answers 202 for unbound repositories; getting here
        // means the cache changed in between.
        tracing::warn!(url = event.base_url, "Repository binding disappeared, dropping event");
        return Ok(());
    };
    let namespace = binding.metadata.namespace.clone();

    let mut event = event;
    match process_event(&ctx, &mut event, &binding).await {
        Ok((reason, message)) => {
            ctx.recorder.event(&namespace, reason, &message).await;
            Ok(())
        }
        Err(error) => {
            ctx.recorder
                .event(
                    &namespace,
                    "ProcessingFailed",
                    &format!("{}@{}: {error}", event.repo_slug(), event.sha),
                )
                .await;
            Err(error.into())
        }
    }
}

async fn process_event(
    ctx: &PacContext,
    event: &mut Event,
    binding: &RepositoryBinding,
) -> Result<(&'static str, String), PacError> {
    let provider = ctx.providers.create(event.provider, binding).await?;

    enrich_from_pull_request(event, provider.as_ref()).await?;

    if !acl::is_allowed(provider.as_ref(), event, binding.policy()).await? {
        if let Err(error) = ctx.reporter.report_skipped(provider.as_ref(), event).await {
            tracing::warn!("Could not report the denied event: {error}");
        }
        return Ok((
            "AccessDenied",
            format!(
                "{} is not allowed to trigger CI on {}",
                event.sender,
                event.repo_slug()
            ),
        ));
    }

    let manifests = provider.get_pipeline_manifests(event).await?;
    let matches = matcher::match_event(event, provider.as_ref(), &manifests).await?;
    if matches.is_empty() {
        return Ok((
            "NoMatch",
            format!(
                "no pipeline in .tekton/ matched {} on {}",
                event.kind, event.base_branch
            ),
        ));
    }

    let mut runs = Vec::new();
    let mut unknown_keys = Vec::new();
    let mut template_failures = 0usize;
    for matched in &matches {
        match template::materialize(matched, event, binding, ctx.secrets.as_ref()).await {
            Ok(materialized) => {
                unknown_keys.extend(materialized.unknown_keys);
                runs.push(materialized.run);
            }
            Err(PacError::TemplateError(error)) => {
                template_failures += 1;
                tracing::warn!(pipeline = matched.name, "Template error: {error}");
                if let Err(post_error) = provider
                    .post_comment(event, &comment::template_error_comment(&matched.name, &error))
                    .await
                {
                    tracing::warn!("Could not post the template error comment: {post_error}");
                }
            }
            Err(other) => return Err(other),
        }
    }

    unknown_keys.sort();
    unknown_keys.dedup();
    if !unknown_keys.is_empty() {
        if let Err(error) = provider
            .post_comment(event, &comment::template_warning_comment(&unknown_keys))
            .await
        {
            tracing::warn!("Could not post the unknown-keys warning: {error}");
        }
    }

    if runs.is_empty() {
        return Ok((
            "TemplateError",
            format!("{template_failures} pipeline definition(s) could not be processed"),
        ));
    }

    match ctx.concurrency.admit(binding, event, runs).await {
        Ok(admitted) => {
            for admission in &admitted {
                let record = &admission.record;
                let log_url = ctx.run_log_url(&record.namespace, &record.name);
                let state = if admission.started {
                    RunState::Running
                } else {
                    RunState::Queued
                };
                if let Err(error) = ctx
                    .reporter
                    .report(provider.as_ref(), event, &record.name, state, &log_url)
                    .await
                {
                    tracing::warn!(run = record.name, "Could not post the initial status: {error}");
                }
            }
            Ok((
                "PipelineRunsCreated",
                format!(
                    "{} PipelineRun(s) created for {} at {}",
                    admitted.len(),
                    event.repo_slug(),
                    event.sha
                ),
            ))
        }
        Err(PacError::SubmissionError(detail)) => {
            if let Err(error) = provider
                .post_comment(event, &comment::submission_failed_comment(&detail))
                .await
            {
                tracing::warn!("Could not post the submission failure comment: {error}");
            }
            Ok(("SubmissionFailed", detail))
        }
        Err(other) => Err(other),
    }
}

/// Comment-triggered events carry no SHA; fill the blanks from the pull
/// request itself.
async fn enrich_from_pull_request(
    event: &mut Event,
    provider: &dyn Provider,
) -> Result<(), PacError> {
    if !event.sha.is_empty() {
        return Ok(());
    }
    let Some(number) = event.pull_request_number else {
        return Err(PacError::MalformedPayload(
            "comment event without a pull request".to_string(),
        ));
    };
    let pr = provider.get_pull_request(event, number).await?;
    event.sha = pr.head_sha;
    if event.head_branch.is_empty() {
        event.head_branch = pr.head_branch;
    }
    if event.base_branch.is_empty() {
        event.base_branch = pr.base_branch;
    }
    if event.head_url.is_empty() {
        event.head_url = normalize_url(&pr.head_url);
    }
    if event.pull_request_author.is_none() && !pr.author.is_empty() {
        event.pull_request_author = Some(pr.author.to_lowercase());
    }
    if event.default_branch.is_empty() {
        event.default_branch = pr.default_branch;
    }
    Ok(())
}

/// Handle one observed PipelineRun state transition.
pub async fn handle_run_status(
    ctx: Arc<PacContext>,
    status: RunStatusEvent,
) -> anyhow::Result<()> {
    if status.repository_url.is_empty() {
        return Ok(());
    }
    let Some(binding) = ctx.bindings.resolve(&status.repository_url) else {
        tracing::warn!(
            url = status.repository_url,
            run = status.name,
            "No binding for an observed run, not reporting"
        );
        return Ok(());
    };
    let kind = crate::provider::infer_kind(&binding, &status.repository_url);
    let provider = ctx.providers.create(kind, &binding).await?;
    let event = event_from_status(&status, kind);

    match status.state {
        // The admission path posts the initial queued status.
        RunState::Queued => {}
        RunState::Running => {
            if let Err(error) = ctx
                .reporter
                .report(
                    provider.as_ref(),
                    &event,
                    &status.name,
                    RunState::Running,
                    &status.log_url,
                )
                .await
            {
                tracing::warn!(run = status.name, "Could not post the running status: {error}");
            }
        }
        RunState::Succeeded | RunState::Failed | RunState::Cancelled | RunState::Skipped => {
            let promoted = ctx.concurrency.on_terminal(&status).await;
            for record in promoted {
                let mut promoted_event = event.clone();
                promoted_event.sha = record.event_sha.clone();
                promoted_event.head_branch = record.head_branch.clone();
                promoted_event.pull_request_number = None;
                let log_url = ctx.run_log_url(&record.namespace, &record.name);
                if let Err(error) = ctx
                    .reporter
                    .report(
                        provider.as_ref(),
                        &promoted_event,
                        &record.name,
                        RunState::Running,
                        &log_url,
                    )
                    .await
                {
                    tracing::warn!(run = record.name, "Could not post the promoted status: {error}");
                }
            }
            if let Err(error) = ctx
                .reporter
                .report_completion(
                    provider.as_ref(),
                    &event,
                    &status.name,
                    &status.original_name,
                    status.state,
                    &status.tasks,
                    &status.log_url,
                )
                .await
            {
                tracing::warn!(run = status.name, "Could not report the completion: {error}");
            }
            ctx.concurrency.prune_old_runs(&status).await;
        }
    }
    Ok(())
}

fn event_from_status(
    status: &RunStatusEvent,
    kind: crate::pac::event::ProviderKind,
) -> Event {
    let event_kind = EventKind::parse(&status.event_type).unwrap_or(EventKind::Push);
    Event {
        provider: kind,
        kind: event_kind,
        organization: status.organization.clone(),
        repository: status.repository.clone(),
        sender: String::new(),
        sha: status.sha.clone(),
        base_branch: String::new(),
        head_branch: status.head_branch.clone(),
        base_url: status.repository_url.clone(),
        head_url: String::new(),
        pull_request_number: status.pull_request_number,
        pull_request_author: None,
        trigger_target: match event_kind {
            EventKind::Push => TriggerTarget::Push,
            _ => TriggerTarget::PullRequest,
        },
        default_branch: String::new(),
        comment: None,
        requested_test: None,
        headers: Default::default(),
        raw_payload: serde_json::Value::Null,
        installation_token: None,
    }
}
