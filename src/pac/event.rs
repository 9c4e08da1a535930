//! The normalized representation of one inbound forge notification.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use secrecy::SecretString;
use url::Url;

use crate::pac::error::PacError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Github,
    Gitlab,
    Gitea,
    Bitbucket,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Github => "github",
            ProviderKind::Gitlab => "gitlab",
            ProviderKind::Gitea => "gitea",
            ProviderKind::Bitbucket => "bitbucket",
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Push,
    PullRequest,
    IssueComment,
    CheckRunRerequested,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::IssueComment => "issue_comment",
            EventKind::CheckRunRerequested => "check_run_rerequested",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push" => Some(EventKind::Push),
            "pull_request" => Some(EventKind::PullRequest),
            "issue_comment" => Some(EventKind::IssueComment),
            "check_run_rerequested" => Some(EventKind::CheckRunRerequested),
            _ => None,
        }
    }

    /// Only PR-scoped events may be unlocked through comments.
    pub fn is_pull_request_scoped(&self) -> bool {
        !matches!(self, EventKind::Push)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTarget {
    Push,
    PullRequest,
    OkToTestComment,
    RetestComment,
}

impl TriggerTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerTarget::Push => "push",
            TriggerTarget::PullRequest => "pull_request",
            TriggerTarget::OkToTestComment => "ok-to-test-comment",
            TriggerTarget::RetestComment => "retest-comment",
        }
    }
}

impl Display for TriggerTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The comment that carried a `/ok-to-test`, `/retest` or `/test` command.
/// Consumed by the ACL engine only; it never replaces the event sender.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentContext {
    pub author: String,
    pub body: String,
}

static OK_TO_TEST_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(?m)^/ok-to-test\s*$").unwrap());
static RETEST_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(?m)^/retest\s*$").unwrap());
static TEST_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(?m)^/test[ \t]+(\S+)\s*$").unwrap());

/// A CI command found in a comment body. Comments without a command do not
/// trigger anything.
#[derive(Debug, Clone, PartialEq)]
pub enum CommentCommand {
    OkToTest,
    Retest,
    Test(String),
}

impl CommentCommand {
    pub fn parse(body: &str) -> Option<Self> {
        if OK_TO_TEST_RE.is_match(body) {
            return Some(CommentCommand::OkToTest);
        }
        if RETEST_RE.is_match(body) {
            return Some(CommentCommand::Retest);
        }
        TEST_RE
            .captures(body)
            .map(|caps| CommentCommand::Test(caps[1].to_string()))
    }

    pub fn trigger_target(&self) -> TriggerTarget {
        match self {
            CommentCommand::OkToTest => TriggerTarget::OkToTestComment,
            CommentCommand::Retest | CommentCommand::Test(_) => TriggerTarget::RetestComment,
        }
    }
}

/// Immutable record of one inbound provider notification.
///
/// `(sha, repository)` identifies the code state under test.
#[derive(Debug, Clone)]
pub struct Event {
    pub provider: ProviderKind,
    pub kind: EventKind,
    pub organization: String,
    pub repository: String,
    pub sender: String,
    pub sha: String,
    pub base_branch: String,
    pub head_branch: String,
    /// Canonical clone URL of the base repository.
    pub base_url: String,
    /// Canonical clone URL of the head repository; empty when unknown.
    pub head_url: String,
    pub pull_request_number: Option<u64>,
    pub pull_request_author: Option<String>,
    pub trigger_target: TriggerTarget,
    pub default_branch: String,
    pub comment: Option<CommentContext>,
    /// When the trigger was `/test <name>`, the requested pipeline name.
    pub requested_test: Option<String>,
    /// Request headers captured at ingestion, lower-cased keys.
    pub headers: BTreeMap<String, String>,
    pub raw_payload: serde_json::Value,
    pub installation_token: Option<SecretString>,
}

impl Event {
    /// Enforce canonical forms: lower-case logins, normalized URLs, branch
    /// names without the `refs/heads/` prefix. Rejects events without a
    /// `sha` or `repository`.
    pub fn normalize(mut self) -> Result<Self, PacError> {
        // Comment events carry no SHA in their payload; it is filled in from
        // the pull request before matching.
        if self.sha.is_empty() && self.kind != EventKind::IssueComment {
            return Err(PacError::MalformedPayload("event has no sha".to_string()));
        }
        if self.repository.is_empty() || self.organization.is_empty() {
            return Err(PacError::MalformedPayload(
                "event has no repository".to_string(),
            ));
        }
        self.organization = self.organization.to_lowercase();
        self.repository = self.repository.to_lowercase();
        self.sender = self.sender.to_lowercase();
        self.pull_request_author = self.pull_request_author.map(|a| a.to_lowercase());
        if let Some(comment) = self.comment.as_mut() {
            comment.author = comment.author.to_lowercase();
        }
        self.base_branch = strip_ref_prefix(&self.base_branch).to_string();
        self.head_branch = strip_ref_prefix(&self.head_branch).to_string();
        self.base_url = normalize_url(&self.base_url);
        self.head_url = normalize_url(&self.head_url);
        Ok(self)
    }

    /// `owner/repo` slug for logging and labels.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.organization, self.repository)
    }
}

pub fn strip_ref_prefix(branch: &str) -> &str {
    branch
        .strip_prefix("refs/heads/")
        .or_else(|| branch.strip_prefix("refs/tags/"))
        .unwrap_or(branch)
}

/// Strip trailing slashes, a `.git` suffix and any userinfo from a
/// repository URL. Values that do not parse as URLs are passed through
/// trimmed, so that the resolver can still attempt an exact match.
pub fn normalize_url(value: &str) -> String {
    let trimmed = value.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    match Url::parse(trimmed) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            let mut out = url.to_string();
            while out.ends_with('/') {
                out.pop();
            }
            out
        }
        Err(_) => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::event_builder::TestEvent;

    #[test]
    fn normalize_lowercases_logins_and_strips_refs() {
        let event = TestEvent::default()
            .sender("MrBig")
            .base_branch("refs/heads/main")
            .head_branch("refs/heads/feature")
            .build();
        let event = event.normalize().unwrap();
        assert_eq!(event.sender, "mrbig");
        assert_eq!(event.base_branch, "main");
        assert_eq!(event.head_branch, "feature");
    }

    #[test]
    fn normalize_urls() {
        assert_eq!(
            normalize_url("https://user:pw@github.com/owner/repo/"),
            "https://github.com/owner/repo"
        );
        assert_eq!(
            normalize_url("https://gitlab.com/group/repo"),
            "https://gitlab.com/group/repo"
        );
    }

    #[test]
    fn missing_sha_is_malformed() {
        let event = TestEvent::default().sha("").build();
        assert!(matches!(
            event.normalize(),
            Err(PacError::MalformedPayload(_))
        ));
    }

    #[test]
    fn missing_repository_is_malformed() {
        let event = TestEvent::default().repository("").build();
        assert!(matches!(
            event.normalize(),
            Err(PacError::MalformedPayload(_))
        ));
    }

    #[test]
    fn normalization_is_identity_on_canonical_events() {
        let event = TestEvent::default().build();
        let before = format!("{event:?}");
        let after = format!("{:?}", event.normalize().unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn comment_commands() {
        assert_eq!(
            CommentCommand::parse("/ok-to-test"),
            Some(CommentCommand::OkToTest)
        );
        assert_eq!(
            CommentCommand::parse("lgtm\n/ok-to-test  "),
            Some(CommentCommand::OkToTest)
        );
        assert_eq!(CommentCommand::parse("/retest"), Some(CommentCommand::Retest));
        assert_eq!(
            CommentCommand::parse("/test lint"),
            Some(CommentCommand::Test("lint".to_string()))
        );
        assert_eq!(CommentCommand::parse("looks /ok-to-test to me"), None);
        assert_eq!(CommentCommand::parse("/ok-to-test please"), None);
        assert_eq!(CommentCommand::parse("nothing here"), None);
    }
}
