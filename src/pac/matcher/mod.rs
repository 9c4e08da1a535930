//! Selects which `.tekton/` manifests apply to an event, through the
//! `on-event`/`on-target-branch` annotations, `on-path-change` globs, or an
//! `on-cel-expression` filter.

use std::collections::BTreeMap;
use std::sync::Arc;

use globset::Glob;
use serde::Deserialize;

use crate::pac::error::PacError;
use crate::pac::event::{Event, EventKind, strip_ref_prefix};
use crate::provider::{ChangedFiles, Manifest, Provider};

pub mod cel;

pub const ANNOTATION_PREFIX: &str = "pipelinesascode.tekton.dev/";

/// A manifest selected for execution, together with the annotations that
/// drive templating and pruning.
#[derive(Debug, Clone)]
pub struct PipelineMatch {
    pub name: String,
    /// The single-document YAML source of the selected manifest.
    pub manifest: String,
    pub annotations: BTreeMap<String, String>,
    pub max_keep_runs: Option<usize>,
}

impl PipelineMatch {
    pub fn annotation(&self, short_key: &str) -> Option<&str> {
        self.annotations
            .get(&format!("{ANNOTATION_PREFIX}{short_key}"))
            .map(String::as_str)
    }
}

/// The event type manifests are matched against. Comment-triggered events
/// re-run pull request pipelines.
pub fn match_event_type(event: &Event) -> &'static str {
    match event.kind {
        EventKind::Push => "push",
        _ => "pull_request",
    }
}

/// Match all manifest documents against the event. The changed-file list is
/// fetched from the provider at most once, and only when an expression or an
/// `on-path-change` annotation requires it.
pub async fn match_event(
    event: &Event,
    provider: &dyn Provider,
    manifests: &[Manifest],
) -> Result<Vec<PipelineMatch>, PacError> {
    let mut changed_files: Option<Arc<ChangedFiles>> = None;
    let mut matches = Vec::new();

    for manifest in manifests {
        for document in split_documents(&manifest.content) {
            let Some(candidate) = parse_candidate(&document) else {
                continue;
            };
            let matched = match matches_candidate(event, provider, &candidate, &mut changed_files)
                .await
            {
                Ok(matched) => matched,
                Err(error) => {
                    tracing::warn!(
                        manifest = manifest.path,
                        pipeline = candidate.name,
                        "Skipping manifest with invalid filter: {error}"
                    );
                    continue;
                }
            };
            if !matched {
                continue;
            }
            matches.push(PipelineMatch {
                name: candidate.name,
                manifest: document,
                max_keep_runs: candidate
                    .annotations
                    .get(&format!("{ANNOTATION_PREFIX}max-keep-runs"))
                    .and_then(|v| v.parse().ok()),
                annotations: candidate.annotations,
            });
        }
    }

    // `/test <name>` re-runs a single pipeline.
    if let Some(requested) = &event.requested_test {
        matches.retain(|m| &m.name == requested);
    }

    Ok(matches)
}

struct Candidate {
    name: String,
    annotations: BTreeMap<String, String>,
}

/// Split a possibly multi-document YAML file.
fn split_documents(content: &str) -> Vec<String> {
    content
        .split("\n---")
        .map(|doc| doc.trim_start_matches("---").trim())
        .filter(|doc| !doc.is_empty())
        .map(String::from)
        .collect()
}

fn parse_candidate(document: &str) -> Option<Candidate> {
    #[derive(Deserialize)]
    struct Doc {
        #[serde(default)]
        kind: String,
        #[serde(default)]
        metadata: Meta,
    }
    #[derive(Deserialize, Default)]
    struct Meta {
        #[serde(default)]
        name: Option<String>,
        #[serde(rename = "generateName", default)]
        generate_name: Option<String>,
        #[serde(default)]
        annotations: BTreeMap<String, String>,
    }

    let doc: Doc = serde_yaml::from_str(document).ok()?;
    if doc.kind != "PipelineRun" {
        return None;
    }
    let name = doc
        .metadata
        .name
        .or_else(|| {
            doc.metadata
                .generate_name
                .map(|n| n.trim_end_matches('-').to_string())
        })
        .unwrap_or_default();
    Some(Candidate {
        name,
        annotations: doc.metadata.annotations,
    })
}

async fn matches_candidate(
    event: &Event,
    provider: &dyn Provider,
    candidate: &Candidate,
    changed_files: &mut Option<Arc<ChangedFiles>>,
) -> Result<bool, String> {
    let annotation =
        |key: &str| candidate.annotations.get(&format!("{ANNOTATION_PREFIX}{key}"));
    let event_type = match_event_type(event);

    if let Some(expression) = annotation("on-cel-expression") {
        let program = cel::compile(expression)?;
        if cel::needs_changed_files(&program) {
            ensure_changed_files(event, provider, changed_files).await?;
        }
        return cel::evaluate(&program, event, event_type, changed_files.clone());
    }

    let (Some(on_event), Some(on_branch)) = (annotation("on-event"), annotation("on-target-branch"))
    else {
        // A library document (a Pipeline, a Task, or an unannotated run).
        return Ok(false);
    };

    let event_matched = annotation_values(on_event)
        .iter()
        .any(|value| value.as_str() == event_type);
    if !event_matched {
        return Ok(false);
    }

    let branch_matched = annotation_values(on_branch)
        .iter()
        .any(|pattern| branch_matches(pattern, &event.base_branch));
    if !branch_matched {
        return Ok(false);
    }

    if let Some(on_path) = annotation("on-path-change") {
        ensure_changed_files(event, provider, changed_files).await?;
        let files = changed_files.as_ref().map(|f| f.all.as_slice()).unwrap_or(&[]);
        let path_matched = annotation_values(on_path)
            .iter()
            .any(|glob| cel::path_changed(glob, files));
        if !path_matched {
            return Ok(false);
        }
    }

    Ok(true)
}

async fn ensure_changed_files(
    event: &Event,
    provider: &dyn Provider,
    changed_files: &mut Option<Arc<ChangedFiles>>,
) -> Result<(), String> {
    if changed_files.is_none() {
        let files = provider
            .changed_files(event)
            .await
            .map_err(|error| error.to_string())?;
        *changed_files = Some(Arc::new(files));
    }
    Ok(())
}

/// Annotation values are either one entry or a YAML list: `"[a, b]"`.
fn annotation_values(value: &str) -> Vec<String> {
    match serde_yaml::from_str::<Vec<String>>(value) {
        Ok(list) => list,
        Err(_) => vec![value.to_string()],
    }
}

/// Git-style glob match of a target branch, `*` and `**` only.
fn branch_matches(pattern: &str, branch: &str) -> bool {
    let pattern = strip_ref_prefix(pattern);
    if pattern == branch {
        return true;
    }
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(branch),
        Err(_) => false,
    }
}
