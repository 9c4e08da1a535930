//! The capability set uniform across Git forges. One concrete adapter per
//! provider; dispatch happens on the detected [`ProviderKind`], never on the
//! payload shape.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::binding::{RepositoryBinding, SecretStore};
use crate::pac::error::PacError;
use crate::pac::event::{Event, ProviderKind};
use crate::tekton::RunState;

pub mod bitbucket;
pub mod gitea;
pub mod github;
pub mod gitlab;

/// Check/status name under which runs are reported.
pub const APPLICATION_NAME: &str = "Pipelines as Code CI";

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected our credentials. Fatal, never retried.
    #[error("authentication rejected by provider")]
    AuthFailed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected provider response ({status}): {text}")]
    Unexpected { status: StatusCode, text: String },
}

impl ProviderError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProviderError::AuthFailed)
    }

    pub(crate) fn from_status(status: StatusCode, text: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ProviderError::AuthFailed
        } else {
            ProviderError::Unexpected { status, text }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        ProviderError::Transport(error.to_string())
    }
}

impl From<octocrab::Error> for ProviderError {
    fn from(error: octocrab::Error) -> Self {
        ProviderError::Transport(error.to_string())
    }
}

impl From<ProviderError> for PacError {
    fn from(error: ProviderError) -> Self {
        PacError::ProviderUnavailable(error.to_string())
    }
}

/// A candidate pipeline document discovered under `.tekton/` (or through a
/// remote `task`/`pipeline` reference).
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ProviderComment {
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangedFiles {
    pub all: Vec<String>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
}

/// Pull request details fetched to enrich comment-triggered events, whose
/// payloads carry no SHA.
#[derive(Debug, Clone)]
pub struct PullRequestInfo {
    pub number: u64,
    pub author: String,
    pub head_sha: String,
    pub head_branch: String,
    pub base_branch: String,
    pub head_url: String,
    pub base_url: String,
    pub default_branch: String,
}

/// A `task`/`pipeline` annotation reference in `owner/repo/path@ref` form.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRef {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub reference: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch a file from the event's repository at the given ref.
    async fn get_file(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError>;

    /// All file paths under `.tekton/`, recursively, at the given ref.
    async fn list_tekton_files(
        &self,
        event: &Event,
        reference: &str,
    ) -> Result<Vec<String>, ProviderError>;

    /// Fetch a file from another repository on the same forge, for
    /// `owner/repo/path@ref` remote references.
    async fn get_remote_file(
        &self,
        event: &Event,
        remote: &RemoteRef,
    ) -> Result<Option<Vec<u8>>, ProviderError>;

    /// All comments on the event's pull request; pagination is exhausted.
    async fn list_comments(&self, event: &Event) -> Result<Vec<ProviderComment>, ProviderError>;

    async fn get_pull_request(
        &self,
        event: &Event,
        number: u64,
    ) -> Result<PullRequestInfo, ProviderError>;

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles, ProviderError>;

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool, ProviderError>;

    async fn is_collaborator(
        &self,
        login: &str,
        org: &str,
        repo: &str,
    ) -> Result<bool, ProviderError>;

    /// Post a check-run/commit status for the run. At-least-once; duplicate
    /// posts must be tolerated by the forge.
    async fn post_status(
        &self,
        event: &Event,
        run_name: &str,
        state: RunState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ProviderError>;

    async fn post_comment(&self, event: &Event, body: &str) -> Result<(), ProviderError>;

    /// Optional provider-side UI cue that a run was superseded.
    async fn cancel_hint(&self, _event: &Event) -> Result<(), ProviderError> {
        Ok(())
    }

    /// All `.tekton/` manifests at the event's SHA, with one level of remote
    /// `task`/`pipeline` references resolved.
    async fn get_pipeline_manifests(&self, event: &Event) -> Result<Vec<Manifest>, ProviderError> {
        let paths = self.list_tekton_files(event, &event.sha).await?;
        let mut manifests = Vec::new();
        for path in paths {
            if !(path.ends_with(".yaml") || path.ends_with(".yml")) {
                continue;
            }
            if let Some(bytes) = self.get_file(event, &path, &event.sha).await? {
                manifests.push(Manifest {
                    path,
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
        }

        let mut seen = HashSet::new();
        let mut remote = Vec::new();
        for manifest in &manifests {
            for reference in remote_refs_of(&manifest.content) {
                if !seen.insert(reference.clone()) {
                    continue;
                }
                let fetched = if reference.starts_with("http://")
                    || reference.starts_with("https://")
                {
                    fetch_url(&reference).await?
                } else if let Some(remote_ref) = parse_remote_ref(&reference) {
                    self.get_remote_file(event, &remote_ref)
                        .await?
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    tracing::warn!("Ignoring unparsable remote reference {reference}");
                    None
                };
                match fetched {
                    Some(content) => remote.push(Manifest {
                        path: reference,
                        content,
                    }),
                    None => {
                        tracing::warn!("Remote reference {reference} was not found");
                    }
                }
            }
        }
        manifests.extend(remote);
        Ok(manifests)
    }
}

/// Collect `task`/`pipeline` annotation references from one manifest.
pub(crate) fn remote_refs_of(content: &str) -> Vec<String> {
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(content) else {
        return vec![];
    };
    let mut refs = Vec::new();
    let annotations = &doc["metadata"]["annotations"];
    for key in ["task", "pipeline"] {
        let annotation = format!("pipelinesascode.tekton.dev/{key}");
        let Some(value) = annotations.get(annotation.as_str()).and_then(|v| v.as_str()) else {
            continue;
        };
        // The annotation is either one reference or a YAML list of them.
        match serde_yaml::from_str::<Vec<String>>(value) {
            Ok(list) => refs.extend(list),
            Err(_) => refs.push(value.to_string()),
        }
    }
    refs
}

/// Parse `owner/repo/path@ref` shorthand; the ref defaults to the
/// repository's default branch marker `HEAD` when omitted.
pub(crate) fn parse_remote_ref(value: &str) -> Option<RemoteRef> {
    let (path_part, reference) = match value.split_once('@') {
        Some((p, r)) if !r.is_empty() => (p, r.to_string()),
        Some((p, _)) => (p, "HEAD".to_string()),
        None => (value, "HEAD".to_string()),
    };
    let mut segments = path_part.splitn(3, '/');
    let owner = segments.next()?.to_string();
    let repo = segments.next()?.to_string();
    let path = segments.next()?.to_string();
    if owner.is_empty() || repo.is_empty() || path.is_empty() {
        return None;
    }
    Some(RemoteRef {
        owner,
        repo,
        path,
        reference,
    })
}

async fn fetch_url(url: &str) -> Result<Option<String>, ProviderError> {
    let response = reqwest::get(url).await?;
    match response.status() {
        status if status.is_success() => Ok(Some(response.text().await?)),
        reqwest::StatusCode::NOT_FOUND => Ok(None),
        status => Err(ProviderError::Unexpected {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            text: response.text().await.unwrap_or_default(),
        }),
    }
}

/// Provider family of a binding: the explicit `git_provider.type` when set,
/// otherwise inferred from the repository URL host.
pub fn infer_kind(binding: &RepositoryBinding, url: &str) -> ProviderKind {
    if let Some(kind) = binding
        .spec
        .git_provider
        .as_ref()
        .and_then(|p| p.kind.as_deref())
    {
        match kind {
            "github" => return ProviderKind::Github,
            "gitlab" => return ProviderKind::Gitlab,
            "gitea" => return ProviderKind::Gitea,
            "bitbucket" | "bitbucket-cloud" => return ProviderKind::Bitbucket,
            other => {
                tracing::warn!("Unknown git_provider type {other}, inferring from the URL");
            }
        }
    }
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    if host.contains("github") {
        ProviderKind::Github
    } else if host.contains("gitlab") {
        ProviderKind::Gitlab
    } else if host.contains("bitbucket") {
        ProviderKind::Bitbucket
    } else {
        ProviderKind::Gitea
    }
}

/// Build the provider adapter for an event from its repository binding.
pub async fn provider_for(
    kind: ProviderKind,
    binding: &RepositoryBinding,
    secrets: &dyn SecretStore,
) -> Result<Arc<dyn Provider>, PacError> {
    let git_provider = binding.spec.git_provider.as_ref();
    let token: Option<SecretString> = match git_provider.and_then(|p| p.secret.as_ref()) {
        Some(secret_ref) => Some(
            secrets
                .token(&binding.metadata.namespace, secret_ref)
                .await
                .map_err(PacError::Internal)?,
        ),
        None => None,
    };
    let api_url = git_provider.and_then(|p| p.url.clone());

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Github => Arc::new(
            github::GithubProvider::new(token, api_url).map_err(PacError::Internal)?,
        ),
        ProviderKind::Gitlab => Arc::new(gitlab::GitlabProvider::new(token, api_url)),
        ProviderKind::Gitea => Arc::new(gitea::GiteaProvider::new(token, api_url)),
        ProviderKind::Bitbucket => Arc::new(bitbucket::BitbucketProvider::new(token, api_url)),
    };
    Ok(provider)
}

/// Creates adapters for events. Behind a trait so tests can inject an
/// in-memory provider.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(
        &self,
        kind: ProviderKind,
        binding: &RepositoryBinding,
    ) -> Result<Arc<dyn Provider>, PacError>;
}

pub struct DefaultProviderFactory {
    secrets: Arc<dyn SecretStore>,
}

impl DefaultProviderFactory {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl ProviderFactory for DefaultProviderFactory {
    async fn create(
        &self,
        kind: ProviderKind,
        binding: &RepositoryBinding,
    ) -> Result<Arc<dyn Provider>, PacError> {
        provider_for(kind, binding, self.secrets.as_ref()).await
    }
}

/// Name of the check/status a run is reported under. Authorization-level
/// statuses carry no run name.
pub(crate) fn status_context(run_name: &str) -> String {
    if run_name.is_empty() {
        APPLICATION_NAME.to_string()
    } else {
        format!("{APPLICATION_NAME} / {run_name}")
    }
}

/// Shared helper for reqwest-based adapters: bail out on auth failures,
/// classify everything else.
pub(crate) async fn expect_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        text,
    ))
}

pub(crate) fn bearer_client(token: Option<&SecretString>) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Some(token) = token {
        if let Ok(mut value) = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            token.expose_secret()
        )) {
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
    }
    reqwest::Client::builder()
        .user_agent("pipelines-as-code")
        .default_headers(headers)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_shorthand() {
        let parsed = parse_remote_ref("owner/repo/tasks/lint.yaml@main").unwrap();
        assert_eq!(parsed.owner, "owner");
        assert_eq!(parsed.repo, "repo");
        assert_eq!(parsed.path, "tasks/lint.yaml");
        assert_eq!(parsed.reference, "main");
    }

    #[test]
    fn remote_shorthand_defaults_ref() {
        let parsed = parse_remote_ref("owner/repo/task.yaml").unwrap();
        assert_eq!(parsed.reference, "HEAD");
    }

    #[test]
    fn rejects_short_remote_refs() {
        assert_eq!(parse_remote_ref("owner/repo"), None);
    }

    #[test]
    fn extracts_remote_refs_from_annotations() {
        let manifest = r#"
apiVersion: tekton.dev/v1
kind: PipelineRun
metadata:
  name: test
  annotations:
    pipelinesascode.tekton.dev/task: "[owner/repo/task.yaml@main, https://example.com/task.yaml]"
    pipelinesascode.tekton.dev/pipeline: "owner/repo/pipeline.yaml@v1"
"#;
        let refs = remote_refs_of(manifest);
        assert_eq!(
            refs,
            vec![
                "owner/repo/task.yaml@main",
                "https://example.com/task.yaml",
                "owner/repo/pipeline.yaml@v1"
            ]
        );
    }
}
