//! Bitbucket Cloud adapter over the 2.0 API. Collection endpoints paginate
//! with `next` links, which are followed until exhausted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::pac::error::PacError;
use crate::pac::event::{
    CommentCommand, CommentContext, Event, EventKind, ProviderKind, TriggerTarget,
};
use crate::provider::{
    ChangedFiles, Provider, ProviderComment, ProviderError, PullRequestInfo, status_context,
    RemoteRef, bearer_client, expect_success,
};
use crate::tekton::RunState;

const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";

#[derive(Deserialize)]
struct Actor {
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl Actor {
    fn login(&self) -> String {
        self.nickname
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    html: Option<Link>,
}

#[derive(Deserialize)]
struct Link {
    href: String,
}

#[derive(Deserialize)]
struct BbRepository {
    full_name: String,
    #[serde(default)]
    links: Option<Links>,
    #[serde(default)]
    mainbranch: Option<BranchName>,
}

#[derive(Deserialize)]
struct BranchName {
    #[serde(default)]
    name: String,
}

impl BbRepository {
    fn html_url(&self) -> String {
        self.links
            .as_ref()
            .and_then(|l| l.html.as_ref())
            .map(|l| l.href.clone())
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct PrEndpoint {
    branch: BranchName,
    #[serde(default)]
    commit: Option<Commit>,
    #[serde(default)]
    repository: Option<BbRepository>,
}

#[derive(Deserialize)]
struct Commit {
    hash: String,
}

#[derive(Deserialize)]
struct BbPullRequest {
    id: u64,
    #[serde(default)]
    author: Option<Actor>,
    source: PrEndpoint,
    destination: PrEndpoint,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    pullrequest: BbPullRequest,
    repository: BbRepository,
    actor: Actor,
}

#[derive(Deserialize)]
struct PushPayload {
    push: PushInfo,
    repository: BbRepository,
    actor: Actor,
}

#[derive(Deserialize)]
struct PushInfo {
    #[serde(default)]
    changes: Vec<PushChange>,
}

#[derive(Deserialize)]
struct PushChange {
    #[serde(default)]
    new: Option<ChangeTarget>,
}

#[derive(Deserialize)]
struct ChangeTarget {
    #[serde(default)]
    name: String,
    #[serde(default)]
    target: Option<Commit>,
}

#[derive(Deserialize)]
struct CommentPayload {
    comment: BbComment,
    pullrequest: BbPullRequest,
    repository: BbRepository,
    actor: Actor,
}

#[derive(Deserialize)]
struct BbComment {
    content: CommentContent,
}

#[derive(Deserialize)]
struct CommentContent {
    #[serde(default)]
    raw: String,
}

fn split_full_name(full_name: &str) -> (String, String) {
    match full_name.split_once('/') {
        Some((workspace, repo)) => (workspace.to_string(), repo.to_string()),
        None => (String::new(), full_name.to_string()),
    }
}

fn malformed(error: serde_json::Error) -> PacError {
    PacError::MalformedPayload(error.to_string())
}

fn pull_request_event(
    payload: PullRequestPayload,
    raw_payload: serde_json::Value,
    headers: BTreeMap<String, String>,
    kind: EventKind,
    trigger_target: TriggerTarget,
    comment: Option<CommentContext>,
    requested_test: Option<String>,
) -> Event {
    let (organization, repository) = split_full_name(&payload.repository.full_name);
    let pr = payload.pullrequest;
    Event {
        provider: ProviderKind::Bitbucket,
        kind,
        organization,
        repository,
        sender: payload.actor.login(),
        sha: pr
            .source
            .commit
            .map(|c| c.hash)
            .unwrap_or_default(),
        base_branch: pr.destination.branch.name,
        head_branch: pr.source.branch.name,
        base_url: pr
            .destination
            .repository
            .map(|r| r.html_url())
            .unwrap_or_else(|| payload.repository.html_url()),
        head_url: pr
            .source
            .repository
            .map(|r| r.html_url())
            .unwrap_or_default(),
        pull_request_number: Some(pr.id),
        pull_request_author: pr.author.map(|a| a.login()),
        trigger_target,
        default_branch: payload
            .repository
            .mainbranch
            .map(|b| b.name)
            .unwrap_or_default(),
        comment,
        requested_test,
        headers,
        raw_payload,
        installation_token: None,
    }
}

pub(crate) fn parse_webhook(
    event_key: &str,
    body: &[u8],
    headers: BTreeMap<String, String>,
) -> Result<Option<Event>, PacError> {
    let raw_payload: serde_json::Value = serde_json::from_slice(body).map_err(malformed)?;
    let event = match event_key {
        "pullrequest:created" | "pullrequest:updated" => {
            let payload: PullRequestPayload = serde_json::from_slice(body).map_err(malformed)?;
            pull_request_event(
                payload,
                raw_payload,
                headers,
                EventKind::PullRequest,
                TriggerTarget::PullRequest,
                None,
                None,
            )
        }
        "repo:push" => {
            let payload: PushPayload = serde_json::from_slice(body).map_err(malformed)?;
            let Some(change) = payload.push.changes.into_iter().next().and_then(|c| c.new)
            else {
                // Branch deletions have no "new" side.
                return Ok(None);
            };
            let (organization, repository) = split_full_name(&payload.repository.full_name);
            Event {
                provider: ProviderKind::Bitbucket,
                kind: EventKind::Push,
                organization,
                repository,
                sender: payload.actor.login(),
                sha: change.target.map(|t| t.hash).unwrap_or_default(),
                base_branch: change.name.clone(),
                head_branch: change.name,
                base_url: payload.repository.html_url(),
                head_url: payload.repository.html_url(),
                pull_request_number: None,
                pull_request_author: None,
                trigger_target: TriggerTarget::Push,
                default_branch: payload
                    .repository
                    .mainbranch
                    .map(|b| b.name)
                    .unwrap_or_default(),
                comment: None,
                requested_test: None,
                headers,
                raw_payload,
                installation_token: None,
            }
        }
        "pullrequest:comment_created" => {
            let payload: CommentPayload = serde_json::from_slice(body).map_err(malformed)?;
            let body_text = payload.comment.content.raw.clone();
            let Some(command) = CommentCommand::parse(&body_text) else {
                return Ok(None);
            };
            let comment = CommentContext {
                author: payload.actor.login(),
                body: body_text,
            };
            let requested_test = match &command {
                CommentCommand::Test(name) => Some(name.clone()),
                _ => None,
            };
            let inner = PullRequestPayload {
                pullrequest: payload.pullrequest,
                repository: payload.repository,
                actor: payload.actor,
            };
            pull_request_event(
                inner,
                raw_payload,
                headers,
                EventKind::IssueComment,
                command.trigger_target(),
                Some(comment),
                requested_test,
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

pub struct BitbucketProvider {
    client: reqwest::Client,
    api_url: String,
}

/// Bitbucket collection page with a `next` link.
#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

impl BitbucketProvider {
    pub fn new(token: Option<SecretString>, api_url: Option<String>) -> Self {
        Self {
            client: bearer_client(token.as_ref()),
            api_url: api_url
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    async fn collect_pages<T: DeserializeOwned>(
        &self,
        first_url: String,
    ) -> Result<Vec<T>, ProviderError> {
        let mut values = Vec::new();
        let mut url = Some(first_url);
        while let Some(current) = url.take() {
            let response = self.client.get(&current).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                break;
            }
            let page: Page<T> = expect_success(response).await?.json().await?;
            values.extend(page.values);
            url = page.next;
        }
        Ok(values)
    }

    async fn get_src(
        &self,
        owner: &str,
        repo: &str,
        reference: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/repositories/{owner}/{repo}/src/{reference}/{path}",
                self.api_url
            ))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = expect_success(response).await?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }
}

#[derive(Deserialize)]
struct DiffStatEntry {
    #[serde(default)]
    status: String,
    #[serde(default)]
    old: Option<DiffPath>,
    #[serde(default)]
    new: Option<DiffPath>,
}

#[derive(Deserialize)]
struct DiffPath {
    path: String,
}

fn collect_changed(entries: Vec<DiffStatEntry>) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    for entry in entries {
        let path = entry
            .new
            .as_ref()
            .or(entry.old.as_ref())
            .map(|p| p.path.clone())
            .unwrap_or_default();
        if path.is_empty() {
            continue;
        }
        files.all.push(path.clone());
        match entry.status.as_str() {
            "added" => files.added.push(path),
            "removed" => files.deleted.push(path),
            "renamed" => {
                if let Some(old) = entry.old {
                    files.renamed.push(old.path);
                }
                files.renamed.push(path);
            }
            _ => files.modified.push(path),
        }
    }
    files
}

#[async_trait]
impl Provider for BitbucketProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bitbucket
    }

    async fn get_file(
        &self,
        event: &Event,
        path: &str,
        reference: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        self.get_src(&event.organization, &event.repository, reference, path)
            .await
    }

    async fn list_tekton_files(
        &self,
        event: &Event,
        reference: &str,
    ) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct SrcEntry {
            #[serde(default)]
            path: String,
            #[serde(rename = "type", default)]
            kind: String,
        }

        let mut pending = vec![".tekton".to_string()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            let entries: Vec<SrcEntry> = self
                .collect_pages(format!(
                    "{}/repositories/{}/{}/src/{reference}/{dir}",
                    self.api_url, event.organization, event.repository
                ))
                .await?;
            for entry in entries {
                match entry.kind.as_str() {
                    "commit_directory" => pending.push(entry.path),
                    "commit_file" => files.push(entry.path),
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
        self.get_src(&remote.owner, &remote.repo, &remote.reference, &remote.path)
            .await
    }

    async fn list_comments(&self, event: &Event) -> Result<Vec<ProviderComment>, ProviderError> {
        #[derive(Deserialize)]
        struct CommentRecord {
            #[serde(default)]
            content: Option<CommentContent>,
            #[serde(default)]
            user: Option<Actor>,
        }

        let Some(id) = event.pull_request_number else {
            return Ok(vec![]);
        };
        let records: Vec<CommentRecord> = self
            .collect_pages(format!(
                "{}/repositories/{}/{}/pullrequests/{id}/comments",
                self.api_url, event.organization, event.repository
            ))
            .await?;
        Ok(records
            .into_iter()
            .map(|record| ProviderComment {
                author: record.user.map(|u| u.login()).unwrap_or_default(),
                body: record.content.map(|c| c.raw).unwrap_or_default(),
            })
            .collect())
    }

    async fn get_pull_request(
        &self,
        event: &Event,
        number: u64,
    ) -> Result<PullRequestInfo, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/repositories/{}/{}/pullrequests/{number}",
                self.api_url, event.organization, event.repository
            ))
            .send()
            .await?;
        let pr: BbPullRequest = expect_success(response).await?.json().await?;
        Ok(PullRequestInfo {
            number: pr.id,
            author: pr.author.map(|a| a.login()).unwrap_or_default(),
            head_sha: pr.source.commit.map(|c| c.hash).unwrap_or_default(),
            head_branch: pr.source.branch.name,
            base_branch: pr.destination.branch.name,
            head_url: pr
                .source
                .repository
                .map(|r| r.html_url())
                .unwrap_or_default(),
            base_url: pr
                .destination
                .repository
                .map(|r| r.html_url())
                .unwrap_or_else(|| event.base_url.clone()),
            default_branch: event.default_branch.clone(),
        })
    }

    async fn changed_files(&self, event: &Event) -> Result<ChangedFiles, ProviderError> {
        let url = match event.pull_request_number {
            Some(id) => format!(
                "{}/repositories/{}/{}/pullrequests/{id}/diffstat",
                self.api_url, event.organization, event.repository
            ),
            None => format!(
                "{}/repositories/{}/{}/diffstat/{}",
                self.api_url, event.organization, event.repository, event.sha
            ),
        };
        let entries: Vec<DiffStatEntry> = self.collect_pages(url).await?;
        Ok(collect_changed(entries))
    }

    async fn is_member_of_org(&self, login: &str, org: &str) -> Result<bool, ProviderError> {
        #[derive(Deserialize)]
        struct Member {
            #[serde(default)]
            user: Option<Actor>,
        }

        let members: Vec<Member> = self
            .collect_pages(format!("{}/workspaces/{org}/members", self.api_url))
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| m.user.as_ref())
            .any(|u| u.login().eq_ignore_ascii_case(login)))
    }

    async fn is_collaborator(
        &self,
        _login: &str,
        _org: &str,
        _repo: &str,
    ) -> Result<bool, ProviderError> {
        // Bitbucket Cloud has no collaborator probe that works without
        // admin rights; workspace membership and OWNERS cover access.
        Ok(false)
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
            RunState::Queued | RunState::Running => "INPROGRESS",
            RunState::Succeeded => "SUCCESSFUL",
            RunState::Failed => "FAILED",
            RunState::Cancelled | RunState::Skipped => "STOPPED",
        };
        let url = if target_url.is_empty() {
            event.base_url.clone()
        } else {
            target_url.to_string()
        };
        let response = self
            .client
            .post(format!(
                "{}/repositories/{}/{}/commit/{}/statuses/build",
                self.api_url, event.organization, event.repository, event.sha
            ))
            .json(&serde_json::json!({
                "key": run_name,
                "name": status_context(run_name),
                "state": state_str,
                "url": url,
                "description": description,
            }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn post_comment(&self, event: &Event, body: &str) -> Result<(), ProviderError> {
        let Some(id) = event.pull_request_number else {
            return Ok(());
        };
        let response = self
            .client
            .post(format!(
                "{}/repositories/{}/{}/pullrequests/{id}/comments",
                self.api_url, event.organization, event.repository
            ))
            .json(&serde_json::json!({ "content": { "raw": body } }))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}
