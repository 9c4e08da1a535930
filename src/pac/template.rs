//! `{{ key }}` substitution over manifest bytes, followed by
//! materialization into a submittable PipelineRun object.
//!
//! Substitution happens in a single pass over the raw bytes BEFORE YAML
//! parsing, so values can sit in structural positions. It is a pure function
//! of `(manifest, event, params)`; the random name suffix is applied only
//! afterwards.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use rand::Rng;
use regex::{Captures, Regex};
use secrecy::ExposeSecret;

use crate::binding::{RepositoryBinding, SecretStore};
use crate::pac::error::PacError;
use crate::pac::event::Event;
use crate::pac::matcher::PipelineMatch;
use crate::tekton::{
    ANNOTATION_BRANCH, ANNOTATION_EVENT_TYPE, ANNOTATION_MAX_KEEP_RUNS, ANNOTATION_ORGANIZATION,
    ANNOTATION_PULL_REQUEST, ANNOTATION_REPO_URL, ANNOTATION_REPOSITORY, ANNOTATION_SHA,
    LABEL_BRANCH, LABEL_EVENT_TYPE, LABEL_ORIGINAL_NAME, LABEL_REPOSITORY, LABEL_SHA, RunObject,
};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}").unwrap());

/// Replace `{{ key }}` placeholders. Unknown keys are left untouched and
/// returned so the caller can warn about them.
pub fn expand(manifest: &str, values: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let mut unknown = Vec::new();
    let expanded = PLACEHOLDER_RE
        .replace_all(manifest, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                unknown.push(caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned();
    unknown.sort();
    unknown.dedup();
    (expanded, unknown)
}

/// The dynamic values every manifest can reference.
pub fn standard_values(event: &Event) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("repo_url".to_string(), event.base_url.clone()),
        ("repo_owner".to_string(), event.organization.clone()),
        ("repo_name".to_string(), event.repository.clone()),
        ("revision".to_string(), event.sha.clone()),
        ("source_branch".to_string(), event.head_branch.clone()),
        ("target_branch".to_string(), event.base_branch.clone()),
        ("sender".to_string(), event.sender.clone()),
        ("event_type".to_string(), event.kind.as_str().to_string()),
        (
            "pull_request_number".to_string(),
            event
                .pull_request_number
                .map(|n| n.to_string())
                .unwrap_or_default(),
        ),
    ])
}

pub struct Materialized {
    pub run: RunObject,
    /// Placeholders with no known value, reported back on the PR.
    pub unknown_keys: Vec<String>,
}

/// Expand one matched manifest and shape it into a cluster object: generated
/// name suffix, PaC labels and annotations.
pub async fn materialize(
    matched: &PipelineMatch,
    event: &Event,
    binding: &RepositoryBinding,
    secrets: &dyn SecretStore,
) -> Result<Materialized, PacError> {
    let mut values = standard_values(event);
    for param in &binding.spec.params {
        let value = if let Some(value) = &param.value {
            value.clone()
        } else if let Some(secret_ref) = &param.secret_ref {
            secrets
                .token(&binding.metadata.namespace, secret_ref)
                .await
                .map_err(PacError::Internal)?
                .expose_secret()
                .clone()
        } else {
            continue;
        };
        // Binding params must not shadow the standard keys.
        values.entry(param.name.clone()).or_insert(value);
    }

    let (expanded, unknown_keys) = expand(&matched.manifest, &values);
    let mut manifest: serde_json::Value = serde_yaml::from_str(&expanded)
        .map_err(|error| PacError::TemplateError(error.to_string()))?;

    let base_name = if matched.name.is_empty() {
        "pipelinerun"
    } else {
        &matched.name
    };
    let name = format!("{base_name}-{}", random_suffix());

    let mut labels = BTreeMap::from([
        (
            LABEL_REPOSITORY.to_string(),
            sanitize_label(&event.repository),
        ),
        (LABEL_SHA.to_string(), sanitize_label(&event.sha)),
        (
            LABEL_EVENT_TYPE.to_string(),
            sanitize_label(event.kind.as_str()),
        ),
        (LABEL_BRANCH.to_string(), sanitize_label(&event.head_branch)),
        (LABEL_ORIGINAL_NAME.to_string(), sanitize_label(base_name)),
    ]);
    let mut annotations = BTreeMap::from([
        (ANNOTATION_REPO_URL.to_string(), event.base_url.clone()),
        (
            ANNOTATION_ORGANIZATION.to_string(),
            event.organization.clone(),
        ),
        (ANNOTATION_REPOSITORY.to_string(), event.repository.clone()),
        (ANNOTATION_SHA.to_string(), event.sha.clone()),
        (ANNOTATION_BRANCH.to_string(), event.head_branch.clone()),
        (
            ANNOTATION_EVENT_TYPE.to_string(),
            event.kind.as_str().to_string(),
        ),
    ]);
    if let Some(number) = event.pull_request_number {
        annotations.insert(ANNOTATION_PULL_REQUEST.to_string(), number.to_string());
    }
    if let Some(max_keep_runs) = matched.max_keep_runs {
        annotations.insert(
            ANNOTATION_MAX_KEEP_RUNS.to_string(),
            max_keep_runs.to_string(),
        );
    }

    let metadata = manifest["metadata"]
        .as_object_mut()
        .ok_or_else(|| PacError::TemplateError("manifest has no metadata".to_string()))?;
    metadata.insert("name".to_string(), serde_json::json!(name));
    metadata.remove("generateName");
    metadata.insert(
        "namespace".to_string(),
        serde_json::json!(binding.metadata.namespace),
    );
    let existing_labels = metadata
        .entry("labels")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(map) = existing_labels.as_object_mut() {
        for (key, value) in &labels {
            map.insert(key.clone(), serde_json::json!(value));
        }
        labels = map
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
            .collect();
    }
    let existing_annotations = metadata
        .entry("annotations")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(map) = existing_annotations.as_object_mut() {
        for (key, value) in &annotations {
            map.insert(key.clone(), serde_json::json!(value));
        }
        annotations = map
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
            .collect();
    }

    Ok(Materialized {
        run: RunObject {
            name,
            namespace: binding.metadata.namespace.clone(),
            labels,
            annotations,
            manifest,
        },
        unknown_keys,
    })
}

fn random_suffix() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Kubernetes label values: alphanumerics, `-`, `_` and `.`, at most 63
/// characters.
fn sanitize_label(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    while out.ends_with(['-', '_', '.']) {
        out.pop();
    }
    out
}
