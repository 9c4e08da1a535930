//! GitLab adapter over the v4 REST API. Projects are addressed by their
//! URL-encoded `group/subgroup/name` path.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::pac::error::PacError;
use crate::pac::event::{
    CommentCommand, CommentContext, Event, EventKind, ProviderKind, TriggerTarget,
};
use crate::provider::{
    ChangedFiles, Provider, ProviderComment, ProviderError, PullRequestInfo, status_context,
    RemoteRef, expect_success,
};
use crate::tekton::RunState;

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Deserialize)]
struct Project {
    path_with_namespace: String,
    #[serde(default)]
    web_url: String,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct GitlabUser {
    username: String,
}

#[derive(Deserialize)]
struct LastCommit {
    id: String,
}

#[derive(Deserialize)]
struct MergeRequestAttributes {
    iid: u64,
    #[serde(default)]
    action: Option<String>,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    last_commit: Option<LastCommit>,
    #[serde(default)]
    source: Option<Project>,
    #[serde(default)]
    target: Option<Project>,
}

#[derive(Deserialize)]
struct MergeRequestPayload {
    user: GitlabUser,
    project: Project,
    object_attributes: MergeRequestAttributes,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    reference: String,
    after: String,
    #[serde(default)]
    user_username: Option<String>,
    project: Project,
}

#[derive(Deserialize)]
struct NoteAttributes {
    #[serde(default)]
    note: String,
}

#[derive(Deserialize)]
struct NotePayload {
    user: GitlabUser,
    project: Project,
    object_attributes: NoteAttributes,
    #[serde(default)]
    merge_request: Option<MergeRequestAttributes>,
}

fn split_namespace(path_with_namespace: &str) -> (String, String) {
    match path_with_namespace.rsplit_once('/') {
        Some((org, repo)) => (org.to_string(), repo.to_string()),
        None => (String::new(), path_with_namespace.to_string()),
    }
}

fn malformed(error: serde_json::Error) -> PacError {
    PacError::MalformedPayload(error.to_string())
}

pub(crate) fn parse_webhook(
    event_type: &str,
    body: &[u8],
    headers: BTreeMap<String, String>,
) -> Result<Option<Event>, PacError> {
    let raw_payload: serde_json::Value = serde_json::from_slice(body).map_err(malformed)?;
    let event = match event_type {
        "Merge Request Hook" => {
            let payload: MergeRequestPayload = serde_json::from_slice(body).map_err(malformed)?;
            let attrs = payload.object_attributes;
            if !matches!(
                attrs.action.as_deref(),
                Some("open") | Some("update") | Some("reopen")
            ) {
                return Ok(None);
            }
            let (organization, repository) = split_namespace(&payload.project.path_with_namespace);
            Event {
                provider: ProviderKind::Gitlab,
                kind: EventKind::PullRequest,
                organization,
                repository,
                sender: payload.user.username,
                sha: attrs.last_commit.map(|c| c.id).unwrap_or_default(),
                base_branch: attrs.target_branch,
                head_branch: attrs.source_branch,
                base_url: attrs
                    .target
                    .map(|p| p.web_url)
                    .unwrap_or_else(|| payload.project.web_url.clone()),
                head_url: attrs.source.map(|p| p.web_url).unwrap_or_default(),
                pull_request_number: Some(attrs.iid),
                pull_request_author: None,
                trigger_target: TriggerTarget::PullRequest,
                default_branch: payload.project.default_branch.clone().unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        "Push Hook" => {
            let payload: PushPayload = serde_json::from_slice(body).map_err(malformed)?;
            if payload.after == ZERO_SHA {
                return Ok(None);
            }
            let (organization, repository) = split_namespace(&payload.project.path_with_namespace);
            Event {
                provider: ProviderKind::Gitlab,
                kind: EventKind::Push,
                organization,
                repository,
                sender: payload.user_username.unwrap_or_default(),
                sha: payload.after,
                base_branch: payload.reference.clone(),
                head_branch: payload.reference,
                base_url: payload.project.web_url.clone(),
                head_url: payload.project.web_url.clone(),
                pull_request_number: None,
                pull_request_author: None,
                trigger_target: TriggerTarget::Push,
                default_branch: payload.project.default_branch.clone().unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        "Note Hook" => {
            let payload: NotePayload = serde_json::from_slice(body).map_err(malformed)?;
            let Some(mr) = payload.merge_request else {
                return Ok(None);
            };
            let Some(command) = CommentCommand::parse(&payload.object_attributes.note) else {
                return Ok(None);
            };
            let (organization, repository) = split_namespace(&payload.project.path_with_namespace);
            Event {
                provider: ProviderKind::Gitlab,
                kind: EventKind::IssueComment,
                organization,
                repository,
                sender: payload.user.username.clone(),
                sha: mr.last_commit.map(|c| c.id).unwrap_or_default(),
                base_branch: mr.target_branch,
                head_branch: mr.source_branch,
                base_url: mr
                    .target
                    .map(|p| p.web_url)
                    .unwrap_or_else(|| payload.project.web_url.clone()),
                head_url: mr.source.map(|p| p.web_url).unwrap_or_default(),
                pull_request_number: Some(mr.iid),
                pull_request_author: None,
                trigger_target: command.trigger_target(),
                default_branch: payload.project.default_branch.clone().unwrap_or_default(),
                comment: Some(CommentContext {
                    author: payload.user.username,
                    body: payload.object_attributes.note,
                }),
                requested_test: match command {
                    CommentCommand::Test(name) => Some(name),
                    _ => None,
                },
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

pub struct GitlabProvider {
    client: reqwest::Client,
    api_url: Option<String>,
}

impl GitlabProvider {
    pub fn new(token: Option<SecretString>, api_url: Option<String>) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            if let Ok(mut value) = reqwest::header::HeaderValue::from_str(token.expose_secret()) {
                value.set_sensitive(true);
                headers.insert("PRIVATE-TOKEN", value);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent("pipelines-as-code")
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self { client, api_url }
    }

    fn api_base(&self, event: &Event) -> String {
        if let Some(url) = &self.api_url {
            return url.trim_end_matches('/').to_string();
        }
        match url::Url::parse(&event.base_url) {
            Ok(parsed) => format!(
                "{}://{}/api/v4",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            ),
            Err(_) => "https://gitlab.com/api/v4".to_string(),
        }
    }

    fn project_id(owner: &str, repo: &str) -> String {
        format!("{owner}/{repo}").replace('/', "%2F")
    }

    fn encode_path(path: &str) -> String {
        path.replace('/', "%2F").replace('.', "%2E")
    }
}

#[derive(Deserialize)]
struct DiffEntry {
    new_path: String,
    old_path: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    deleted_file: bool,
    #[serde(default)]
    renamed_file: bool,
}

fn collect_changed(entries: Vec<DiffEntry>) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    for entry in entries {
        files.all.push(entry.new_path.clone());
        if entry.new_file {
            files.added.push(entry.new_path);
        } else if entry.deleted_file {
            files.deleted.push(entry.new_path);
        } else if entry.renamed_file {
            files.renamed.push(entry.old_path);
            files.renamed.push(entry.new_path);
        } else {
            files.modified.push(entry.new_path);
        }
    }
    files
}

#[async_trait]
impl Provider for GitlabProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
    }

    async fn get_file(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let response = self
            .client
            .get(format!(
                "{base}/projects/{id}/repository/files/{}/raw",
                Self::encode_path(path)
            ))
            .query(&[("ref", reference)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = expect_success(response).await?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }

    async fn list_tekton_files(
        &self,
        event: &Event,
        reference: &str,
    ) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct TreeEntry {
            path: String,
            #[serde(rename = "type")]
            kind: String,
        }

        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let mut files = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(format!("{base}/projects/{id}/repository/tree"))
                .query(&[
                    ("path", ".tekton"),
                    ("ref", reference),
                    ("recursive", "true"),
                    ("per_page", "100"),
                    ("page", &page.to_string()),
                ])
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                break;
            }
            let entries: Vec<TreeEntry> = expect_success(response).await?.json().await?;
            if entries.is_empty() {
                break;
            }
            files.extend(
                entries
                    .into_iter()
                    .filter(|e| e.kind == "blob")
                    .map(|e| e.path),
            );
            page += 1;
        }
        files.sort();
        Ok(files)
    }

    async fn get_remote_file(
        &self,
        event: &Event,
        remote: &RemoteRef,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let base = self.api_base(event);
        let id = Self::project_id(&remote.owner, &remote.repo);
        let response = self
            .client
            .get(format!(
                "{base}/projects/{id}/repository/files/{}/raw",
                Self::encode_path(&remote.path)
            ))
            .query(&[("ref", remote.reference.as_str())])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = expect_success(response).await?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<ProviderComment>, ProviderError> {
        #[derive(Deserialize)]
        struct Note {
            #[serde(default)]
            body: String,
            author: GitlabUser,
        }

        let Some(iid) = event.pull_request_number else {
            return Ok(vec![]);
        };
        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(format!("{base}/projects/{id}/merge_requests/{iid}/notes"))
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await?;
            let batch: Vec<Note> = expect_success(response).await?.json().await?;
            if batch.is_empty() {
                break;
            }
            comments.extend(batch.into_iter().map(|n| ProviderComment {
                author: n.author.username,
                body: n.body,
            }));
            page += 1;
        }
        Ok(comments)
    }

    async fn get_pull_request(
        &self,
        event: &Event,
        number: u64,
    ) -> Result<PullRequestInfo, ProviderError> {
        #[derive(Deserialize)]
        struct MrRecord {
            iid: u64,
            #[serde(default)]
            author: Option<GitlabUser>,
            sha: String,
            source_branch: String,
            target_branch: String,
            #[serde(default)]
            source_project_id: Option<u64>,
            #[serde(default)]
            target_project_id: Option<u64>,
        }

        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let response = self
            .client
            .get(format!("{base}/projects/{id}/merge_requests/{number}"))
            .send()
            .await?;
        let mr: MrRecord = expect_success(response).await?.json().await?;
        // The source project URL is not embedded; a merge request from the
        // same project is recognizable by the matching project ids.
        let same_project = mr.source_project_id.is_some() && mr.source_project_id == mr.target_project_id;
        Ok(PullRequestInfo {
            number: mr.iid,
            author: mr.author.map(|u| u.username).unwrap_or_default(),
            head_sha: mr.sha,
            head_branch: mr.source_branch,
            base_branch: mr.target_branch,
            head_url: if same_project {
                event.base_url.clone()
            } else {
                String::new()
            },
            base_url: event.base_url.clone(),
            default_branch: event.default_branch.clone(),
        })
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles, ProviderError> {
        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let url = match event.pull_request_number {
            Some(iid) => format!("{base}/projects/{id}/merge_requests/{iid}/diffs"),
            None => format!(
                "{base}/projects/{id}/repository/commits/{}/diff",
                event.sha
            ),
        };
        let mut entries = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(&url)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await?;
            let batch: Vec<DiffEntry> = expect_success(response).await?.json().await?;
            if batch.is_empty() {
                break;
            }
            entries.extend(batch);
            page += 1;
        }
        Ok(collect_changed(entries))
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool, ProviderError> {
        #[derive(Deserialize)]
        struct Member {
            username: String,
        }

        let Some(base) = self.api_url.as_deref() else {
            return Ok(false);
        };
        let group = org.replace('/', "%2F");
        let response = self
            .client
            .get(format!(
                "{}/groups/{group}/members/all",
                base.trim_end_matches('/')
            ))
            .query(&[("query", login)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let members: Vec<Member> = expect_success(response).await?.json().await?;
        Ok(members.iter().any(|m| m.username.eq_ignore_ascii_case(login)))
    }

    async fn is_collaborator(
        &self,
        login: &str,
        org: &str,
        repo: &str,
    ) -> Result<bool, ProviderError> {
        #[derive(Deserialize)]
        struct Member {
            username: String,
        }

        let Some(base) = self.api_url.as_deref() else {
            return Ok(false);
        };
        let id = Self::project_id(org, repo);
        let response = self
            .client
            .get(format!(
                "{}/projects/{id}/members/all",
                base.trim_end_matches('/')
            ))
            .query(&[("query", login)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let members: Vec<Member> = expect_success(response).await?.json().await?;
        Ok(members.iter().any(|m| m.username.eq_ignore_ascii_case(login)))
    }

    async fn post_status(
        &self,
        event: &Event,
        run_name: &str,
        state: RunState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ProviderError> {
        let state_str = match state {
            RunState::Queued | RunState::Skipped => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "success",
            RunState::Failed => "failed",
            RunState::Cancelled => "canceled",
        };
        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let response = self
            .client
            .post(format!("{base}/projects/{id}/statuses/{}", event.sha))
            .json(&serde_json::json!({
                "state": state_str,
                "target_url": target_url,
                "description": description,
                "context": status_context(run_name),
            }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<(), ProviderError> {
        let Some(iid) = event.pull_request_number else {
            return Ok(());
        };
        let base = self.api_base(event);
        let id = Self::project_id(&event.organization, &event.repository);
        let response = self
            .client
            .post(format!("{base}/projects/{id}/merge_requests/{iid}/notes"))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}
