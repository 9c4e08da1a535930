//! Gitea adapter. Gitea webhook payloads track GitHub's, so payload parsing
//! is shared with the GitHub adapter; the API surface differs enough to be
//! driven directly over reqwest.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::pac::error::PacError;
use crate::pac::event::{Event, ProviderKind};
use crate::provider::{
    ChangedFiles, Provider, ProviderComment, ProviderError, PullRequestInfo, status_context,
    RemoteRef, expect_success, github,
};
use crate::tekton::RunState;

pub(crate) fn parse_webhook(
    event_type: &str,
    body: &[u8],
    headers: BTreeMap<String, String>,
) -> Result<Option<Event>, PacError> {
    Ok(github::parse_webhook(event_type, body, headers)?.map(|mut event| {
        event.provider = ProviderKind::Gitea;
        event
    }))
}

pub struct GiteaProvider {
    client: reqwest::Client,
    api_url: Option<String>,
}

impl GiteaProvider {
    pub fn new(token: Option<SecretString>, api_url: Option<String>) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            if let Ok(mut value) = reqwest::header::HeaderValue::from_str(&format!(
                "token {}",
                token.expose_secret()
            )) {
                value.set_sensitive(true);
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent("pipelines-as-code")
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self { client, api_url }
    }

    /// API base: the configured URL, or derived from the event's repository
    /// host for bindings that did not set one.
    fn api_base(&self, event: &Event) -> String {
        if let Some(url) = &self.api_url {
            return url.trim_end_matches('/').to_string();
        }
        match url::Url::parse(&event.base_url) {
            Ok(parsed) => format!(
                "{}://{}/api/v1",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            ),
            Err(_) => String::new(),
        }
    }

    async fn get_content(
        &self,
        base: &str,
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

        let response = self
            .client
            .get(format!("{base}/repos/{owner}/{repo}/contents/{path}"))
            .query(&[("ref", reference)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let content: Content = expect_success(response).await?.json().await?;
        let Some(encoded) = content.content else {
            return Ok(None);
        };
        use base64::Engine;
        let cleaned: String = encoded.split_whitespace().collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|error| ProviderError::Transport(format!("invalid file encoding: {error}")))?;
        Ok(Some(decoded))
    }

    async fn probe(&self, url: String) -> Result<bool, ProviderError> {
        let response = self.client.get(url).send().await?;
        match response.status() {
            reqwest::StatusCode::NO_CONTENT | reqwest::StatusCode::OK => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(ProviderError::AuthFailed)
            }
            status => Err(ProviderError::Unexpected {
                status: http::StatusCode::from_u16(status.as_u16())
                    .unwrap_or(http::StatusCode::BAD_GATEWAY),
                text: String::new(),
            }),
        }
    }
}

#[derive(Deserialize)]
struct GiteaUser {
    login: String,
}

#[derive(Deserialize)]
struct ChangedFileEntry {
    filename: String,
    #[serde(default)]
    status: String,
}

fn collect_changed(entries: Vec<ChangedFileEntry>) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    for entry in entries {
        files.all.push(entry.filename.clone());
        match entry.status.as_str() {
            "added" => files.added.push(entry.filename),
            "deleted" | "removed" => files.deleted.push(entry.filename),
            "renamed" => files.renamed.push(entry.filename),
            _ => files.modified.push(entry.filename),
        }
    }
    files
}

#[async_trait]
impl Provider for GiteaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitea
    }

    async fn get_file(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let base = self.api_base(event);
        self.get_content(&base, &event.organization, &event.repository, path, reference)
            .await
    }

    async fn list_tekton_files(
        &self,
        event: &Event,
        reference: &str,
    ) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct Entry {
            path: String,
            #[serde(rename = "type")]
            kind: String,
        }

        let base = self.api_base(event);
        let mut pending = vec![".tekton".to_string()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            let response = self
                .client
                .get(format!(
                    "{base}/repos/{}/{}/contents/{dir}",
                    event.organization, event.repository
                ))
                .query(&[("ref", reference)])
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                continue;
            }
            let entries: Vec<Entry> = expect_success(response).await?.json().await?;
            for entry in entries {
                match entry.kind.as_str() {
                    "dir" => pending.push(entry.path),
                    "file" => files.push(entry.path),
                    _ => {}
                }
            }
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
        self.get_content(&base, &remote.owner, &remote.repo, &remote.path, &remote.reference)
            .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<ProviderComment>, ProviderError> {
        #[derive(Deserialize)]
        struct CommentRecord {
            #[serde(default)]
            body: Option<String>,
            user: GiteaUser,
        }

        let Some(number) = event.pull_request_number else {
            return Ok(vec![]);
        };
        let base = self.api_base(event);
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .client
                .get(format!(
                    "{base}/repos/{}/{}/issues/{number}/comments",
                    event.organization, event.repository
                ))
                .query(&[("page", page.to_string()), ("limit", "50".to_string())])
                .send()
                .await?;
            let batch: Vec<CommentRecord> = expect_success(response).await?.json().await?;
            if batch.is_empty() {
                break;
            }
            comments.extend(batch.into_iter().map(|c| ProviderComment {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
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
        struct PrBranch {
            #[serde(rename = "ref")]
            branch: String,
            sha: String,
            #[serde(default)]
            repo: Option<PrRepo>,
        }
        #[derive(Deserialize)]
        struct PrRepo {
            #[serde(default)]
            html_url: String,
            #[serde(default)]
            default_branch: Option<String>,
        }
        #[derive(Deserialize)]
        struct PrRecord {
            number: u64,
            #[serde(default)]
            user: Option<GiteaUser>,
            head: PrBranch,
            base: PrBranch,
        }

        let base = self.api_base(event);
        let response = self
            .client
            .get(format!(
                "{base}/repos/{}/{}/pulls/{number}",
                event.organization, event.repository
            ))
            .send()
            .await?;
        let pr: PrRecord = expect_success(response).await?.json().await?;
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
        let base = self.api_base(event);
        if let Some(number) = event.pull_request_number {
            let response = self
                .client
                .get(format!(
                    "{base}/repos/{}/{}/pulls/{number}/files",
                    event.organization, event.repository
                ))
                .send()
                .await?;
            let entries: Vec<ChangedFileEntry> = expect_success(response).await?.json().await?;
            return Ok(collect_changed(entries));
        }

        #[derive(Deserialize)]
        struct Commit {
            #[serde(default)]
            files: Vec<ChangedFileEntry>,
        }

        let response = self
            .client
            .get(format!(
                "{base}/repos/{}/{}/git/commits/{}",
                event.organization, event.repository, event.sha
            ))
            .send()
            .await?;
        let commit: Commit = expect_success(response).await?.json().await?;
        Ok(collect_changed(commit.files))
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool, ProviderError> {
        // The adapter has no event in scope here; membership probes only
        // make sense with a configured API URL.
        let Some(base) = self.api_url.as_deref() else {
            return Ok(false);
        };
        self.probe(format!(
            "{}/orgs/{org}/members/{login}",
            base.trim_end_matches('/')
        ))
        .await
    }

    async fn is_collaborator(
        &self,
        login: &str,
        org: &str,
        repo: &str,
    ) -> Result<bool, ProviderError> {
        let Some(base) = self.api_url.as_deref() else {
            return Ok(false);
        };
        self.probe(format!(
            "{}/repos/{org}/{repo}/collaborators/{login}",
            base.trim_end_matches('/')
        ))
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
        let state_str = match state {
            RunState::Queued | RunState::Skipped => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "success",
            RunState::Failed => "failure",
            RunState::Cancelled => "canceled",
        };
        let base = self.api_base(event);
        let response = self
            .client
            .post(format!(
                "{base}/repos/{}/{}/statuses/{}",
                event.organization, event.repository, event.sha
            ))
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
        let Some(number) = event.pull_request_number else {
            return Ok(());
        };
        let base = self.api_base(event);
        let response = self
            .client
            .post(format!(
                "{base}/repos/{}/{}/issues/{number}/comments",
                event.organization, event.repository
            ))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}
