//! GitHub adapter: webhook payload parsing plus the API surface, driven
//! through octocrab's generic JSON verbs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use http::StatusCode;
use octocrab::Octocrab;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::pac::error::PacError;
use crate::pac::event::{CommentCommand, CommentContext, Event, EventKind, ProviderKind, TriggerTarget};
use crate::provider::{
    ChangedFiles, Provider, ProviderComment, ProviderError, PullRequestInfo, status_context,
    RemoteRef,
};
use crate::tekton::RunState;

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Deserialize)]
struct User {
    login: String,
}

#[derive(Deserialize)]
struct Repo {
    name: String,
    #[serde(default)]
    owner: Option<User>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
    #[serde(default)]
    repo: Option<Repo>,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequestBody,
    repository: Repo,
    sender: User,
}

#[derive(Deserialize)]
struct PullRequestBody {
    number: u64,
    #[serde(default)]
    user: Option<User>,
    head: BranchRef,
    base: BranchRef,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    reference: String,
    after: String,
    repository: Repo,
    #[serde(default)]
    sender: Option<User>,
}

#[derive(Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: Issue,
    comment: CommentBody,
    repository: Repo,
    sender: User,
}

#[derive(Deserialize)]
struct Issue {
    number: u64,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CommentBody {
    #[serde(default)]
    body: Option<String>,
    user: User,
}

#[derive(Deserialize)]
struct CheckRunPayload {
    action: String,
    check_run: CheckRun,
    repository: Repo,
    sender: User,
}

#[derive(Deserialize)]
struct CheckRun {
    head_sha: String,
    #[serde(default)]
    pull_requests: Vec<CheckRunPullRequest>,
}

#[derive(Deserialize)]
struct CheckRunPullRequest {
    number: u64,
    head: BranchRef,
    base: BranchRef,
}

fn malformed(error: serde_json::Error) -> PacError {
    PacError::MalformedPayload(error.to_string())
}

/// Classify and parse a GitHub webhook. Returns `None` for payloads this
/// controller does not react to.
pub(crate) fn parse_webhook(
    event_type: &str,
    body: &[u8],
    headers: BTreeMap<String, String>,
) -> Result<Option<Event>, PacError> {
    let raw_payload: serde_json::Value = serde_json::from_slice(body).map_err(malformed)?;
    let event = match event_type {
        "pull_request" => {
            let payload: PullRequestPayload = serde_json::from_slice(body).map_err(malformed)?;
            // Gitea sends "synchronized" where GitHub sends "synchronize".
            if !matches!(
                payload.action.as_str(),
                "opened" | "synchronize" | "synchronized" | "reopened"
            ) {
                return Ok(None);
            }
            let pr = payload.pull_request;
            Event {
                provider: ProviderKind::Github,
                kind: EventKind::PullRequest,
                organization: owner_login(&payload.repository),
                repository: payload.repository.name.clone(),
                sender: payload.sender.login,
                sha: pr.head.sha,
                base_branch: pr.base.branch,
                head_branch: pr.head.branch,
                base_url: payload.repository.html_url.clone(),
                head_url: pr.head.repo.map(|r| r.html_url).unwrap_or_default(),
                pull_request_number: Some(pr.number),
                pull_request_author: pr.user.map(|u| u.login),
                trigger_target: TriggerTarget::PullRequest,
                default_branch: payload.repository.default_branch.clone().unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        "push" => {
            let payload: PushPayload = serde_json::from_slice(body).map_err(malformed)?;
            if payload.after == ZERO_SHA {
                // Branch deletion.
                return Ok(None);
            }
            Event {
                provider: ProviderKind::Github,
                kind: EventKind::Push,
                organization: owner_login(&payload.repository),
                repository: payload.repository.name.clone(),
                sender: payload.sender.map(|u| u.login).unwrap_or_default(),
                sha: payload.after,
                base_branch: payload.reference.clone(),
                head_branch: payload.reference,
                base_url: payload.repository.html_url.clone(),
                head_url: payload.repository.html_url.clone(),
                pull_request_number: None,
                pull_request_author: None,
                trigger_target: TriggerTarget::Push,
                default_branch: payload.repository.default_branch.clone().unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        "issue_comment" => {
            let payload: IssueCommentPayload = serde_json::from_slice(body).map_err(malformed)?;
            if payload.action != "created" || payload.issue.pull_request.is_none() {
                return Ok(None);
            }
            let body_text = payload.comment.body.unwrap_or_default();
            let Some(command) = CommentCommand::parse(&body_text) else {
                return Ok(None);
            };
            Event {
                provider: ProviderKind::Github,
                kind: EventKind::IssueComment,
                organization: owner_login(&payload.repository),
                repository: payload.repository.name.clone(),
                sender: payload.sender.login,
                sha: String::new(),
                base_branch: String::new(),
                head_branch: String::new(),
                base_url: payload.repository.html_url.clone(),
                head_url: String::new(),
                pull_request_number: Some(payload.issue.number),
                pull_request_author: payload.issue.user.map(|u| u.login),
                trigger_target: command.trigger_target(),
                default_branch: payload.repository.default_branch.clone().unwrap_or_default(),
                comment: Some(CommentContext {
                    author: payload.comment.user.login,
                    body: body_text,
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
        "check_run" => {
            let payload: CheckRunPayload = serde_json::from_slice(body).map_err(malformed)?;
            if payload.action != "rerequested" {
                return Ok(None);
            }
            let pr = payload.check_run.pull_requests.into_iter().next();
            Event {
                provider: ProviderKind::Github,
                kind: EventKind::CheckRunRerequested,
                organization: owner_login(&payload.repository),
                repository: payload.repository.name.clone(),
                sender: payload.sender.login,
                sha: payload.check_run.head_sha,
                base_branch: pr
                    .as_ref()
                    .map(|p| p.base.branch.clone())
                    .unwrap_or_default(),
                head_branch: pr
                    .as_ref()
                    .map(|p| p.head.branch.clone())
                    .unwrap_or_default(),
                base_url: payload.repository.html_url.clone(),
                head_url: String::new(),
                pull_request_number: pr.map(|p| p.number),
                pull_request_author: None,
                trigger_target: TriggerTarget::RetestComment,
                default_branch: payload.repository.default_branch.clone().unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn owner_login(repo: &Repo) -> String {
    repo.owner
        .as_ref()
        .map(|o| o.login.clone())
        .unwrap_or_default()
}

pub struct GithubProvider {
    client: Octocrab,
}

impl GithubProvider {
    pub fn new(token: Option<SecretString>, api_url: Option<String>) -> anyhow::Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token.expose_secret().clone());
        }
        if let Some(url) = api_url {
            builder = builder.base_uri(url)?;
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    fn map_err(error: octocrab::Error) -> ProviderError {
        match &error {
            octocrab::Error::GitHub { source, .. }
                if source.status_code == StatusCode::UNAUTHORIZED
                    || source.status_code == StatusCode::FORBIDDEN =>
            {
                ProviderError::AuthFailed
            }
            _ => ProviderError::Transport(error.to_string()),
        }
    }

    fn is_not_found(error: &octocrab::Error) -> bool {
        matches!(
            error,
            octocrab::Error::GitHub { source, .. } if source.status_code == StatusCode::NOT_FOUND
        )
    }

    async fn get_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        #[derive(Deserialize)]
        struct Content {
            #[serde(default)]
            content: Option<String>,
        }

        let route = format!("/repos/{owner}/{repo}/contents/{path}?ref={reference}");
        let content = match self.client.get::<Content, _, _>(route, None::<&()>).await {
            Ok(content) => content,
            Err(error) if Self::is_not_found(&error) => return Ok(None),
            Err(error) => return Err(Self::map_err(error)),
        };
        let Some(encoded) = content.content else {
            return Ok(None);
        };
        let cleaned: String = encoded.split_whitespace().collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|error| ProviderError::Transport(format!("invalid file encoding: {error}")))?;
        Ok(Some(decoded))
    }

    async fn list_dir(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Vec<(String, String)>, ProviderError> {
        #[derive(Deserialize)]
        struct Entry {
            path: String,
            #[serde(rename = "type")]
            kind: String,
        }

        let route = format!(
            "/repos/{}/{}/contents/{path}?ref={reference}",
            event.organization, event.repository
        );
        match self.client.get::<Vec<Entry>, _, _>(route, None::<&()>).await {
            Ok(entries) => Ok(entries.into_iter().map(|e| (e.path, e.kind)).collect()),
            Err(error) if Self::is_not_found(&error) => Ok(vec![]),
            Err(error) => Err(Self::map_err(error)),
        }
    }

    /// Status probe on endpoints that answer 204/404 without a body.
    async fn probe(&self, route: &str) -> Result<bool, ProviderError> {
        let response = self
            .client
            ._get(route)
            .await
            .map_err(Self::map_err)?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::AuthFailed),
            status => Err(ProviderError::Unexpected {
                status,
                text: String::new(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct FileEntry {
    filename: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    previous_filename: Option<String>,
}

fn collect_changed(entries: Vec<FileEntry>) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    for entry in entries {
        files.all.push(entry.filename.clone());
        match entry.status.as_str() {
            "added" => files.added.push(entry.filename),
            "removed" => files.deleted.push(entry.filename),
            "renamed" => {
                if let Some(previous) = entry.previous_filename {
                    files.renamed.push(previous);
                }
                files.renamed.push(entry.filename);
            }
            _ => files.modified.push(entry.filename),
        }
    }
    files
}

#[async_trait]
impl Provider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    async fn get_file(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        self.get_content(&event.organization, &event.repository, path, reference)
            .await
    }

    async fn list_tekton_files(
        &self,
        event: &Event,
        reference: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut pending = vec![".tekton".to_string()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            for (path, kind) in self.list_dir(event, &dir, reference).await? {
                match kind.as_str() {
                    "dir" => pending.push(path),
                    "file" => files.push(path),
                    _ => {}
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn get_remote_file(
        &self,
        _event: &Event,
        remote: &RemoteRef,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        self.get_content(&remote.owner, &remote.repo, &remote.path, &remote.reference)
            .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<ProviderComment>, ProviderError> {
        #[derive(Deserialize)]
        struct CommentRecord {
            #[serde(default)]
            body: Option<String>,
            user: User,
        }

        let Some(number) = event.pull_request_number else {
            return Ok(vec![]);
        };
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let route = format!(
                "/repos/{}/{}/issues/{number}/comments?per_page=100&page={page}",
                event.organization, event.repository
            );
            let batch = self
                .client
                .get::<Vec<CommentRecord>, _, _>(route, None::<&()>)
                .await
                .map_err(Self::map_err)?;
            let len = batch.len();
            comments.extend(batch.into_iter().map(|c| ProviderComment {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
            }));
            if len < 100 {
                break;
            }
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
        struct PrRecord {
            number: u64,
            #[serde(default)]
            user: Option<User>,
            head: BranchRef,
            base: BranchRef,
        }

        let route = format!(
            "/repos/{}/{}/pulls/{number}",
            event.organization, event.repository
        );
        let pr = self
            .client
            .get::<PrRecord, _, _>(route, None::<&()>)
            .await
            .map_err(Self::map_err)?;
        let base_repo = pr.base.repo;
        Ok(PullRequestInfo {
            number: pr.number,
            author: pr.user.map(|u| u.login).unwrap_or_default(),
            head_sha: pr.head.sha,
            head_branch: pr.head.branch,
            base_branch: pr.base.branch,
            head_url: pr.head.repo.map(|r| r.html_url).unwrap_or_default(),
            base_url: base_repo
                .as_ref()
                .map(|r| r.html_url.clone())
                .unwrap_or_else(|| event.base_url.clone()),
            default_branch: base_repo
                .and_then(|r| r.default_branch)
                .unwrap_or_default(),
        })
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles, ProviderError> {
        if let Some(number) = event.pull_request_number {
            let mut entries = Vec::new();
            let mut page = 1;
            loop {
                let route = format!(
                    "/repos/{}/{}/pulls/{number}/files?per_page=100&page={page}",
                    event.organization, event.repository
                );
                let batch = self
                    .client
                    .get::<Vec<FileEntry>, _, _>(route, None::<&()>)
                    .await
                    .map_err(Self::map_err)?;
                let len = batch.len();
                entries.extend(batch);
                if len < 100 {
                    break;
                }
                page += 1;
            }
            return Ok(collect_changed(entries));
        }

        #[derive(Deserialize)]
        struct Commit {
            #[serde(default)]
            files: Vec<FileEntry>,
        }

        let route = format!(
            "/repos/{}/{}/commits/{}",
            event.organization, event.repository, event.sha
        );
        let commit = self
            .client
            .get::<Commit, _, _>(route, None::<&()>)
            .await
            .map_err(Self::map_err)?;
        Ok(collect_changed(commit.files))
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool, ProviderError> {
        self.probe(&format!("/orgs/{org}/public_members/{login}"))
            .await
    }

    async fn is_collaborator(
        &self,
        login: &str,
        org: &str,
        repo: &str,
    ) -> Result<bool, ProviderError> {
        self.probe(&format!("/repos/{org}/{repo}/collaborators/{login}"))
            .await
    }

    async fn post_status(
        &self,
        event: &Event,
        run_name: &str,
        state: RunState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ProviderError> {
        let (status, conclusion) = match state {
            RunState::Queued => ("queued", None),
            RunState::Running => ("in_progress", None),
            RunState::Succeeded => ("completed", Some("success")),
            RunState::Failed => ("completed", Some("failure")),
            RunState::Cancelled => ("completed", Some("cancelled")),
            RunState::Skipped => ("completed", Some("neutral")),
        };
        let mut body = serde_json::json!({
            "name": status_context(run_name),
            "head_sha": event.sha,
            "status": status,
            "output": {
                "title": description,
                "summary": description,
            },
        });
        if let Some(conclusion) = conclusion {
            body["conclusion"] = serde_json::json!(conclusion);
        }
        if !target_url.is_empty() {
            body["details_url"] = serde_json::json!(target_url);
        }
        let route = format!(
            "/repos/{}/{}/check-runs",
            event.organization, event.repository
        );
        self.client
            .post::<_, serde_json::Value>(route, Some(&body))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<(), ProviderError> {
        let Some(number) = event.pull_request_number else {
            return Ok(());
        };
        self.client
            .issues(&event.organization, &event.repository)
            .create_comment(number, body)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }
}
