//! Builder for canonical test events. The default is a pull request from a
//! branch of the target repository (`owner/repo`), PR #1, sender
//! `nonowner`.

use std::collections::BTreeMap;

use crate::pac::event::{CommentContext, Event, EventKind, ProviderKind, TriggerTarget};

pub struct TestEvent {
    event: Event,
}

impl Default for TestEvent {
    fn default() -> Self {
        Self {
            event: Event {
                provider: ProviderKind::Github,
                kind: EventKind::PullRequest,
                organization: "owner".to_string(),
                repository: "repo".to_string(),
                sender: "nonowner".to_string(),
                sha: "abc123".to_string(),
                base_branch: "main".to_string(),
                head_branch: "feature".to_string(),
                base_url: "https://github.com/owner/repo".to_string(),
                head_url: "https://github.com/owner/repo".to_string(),
                pull_request_number: Some(1),
                pull_request_author: None,
                trigger_target: TriggerTarget::PullRequest,
                default_branch: "main".to_string(),
                comment: None,
                requested_test: None,
                headers: BTreeMap::new(),
                raw_payload: serde_json::json!({}),
                installation_token: None,
            },
        }
    }
}

impl TestEvent {
    pub fn kind(mut self, kind: EventKind) -> Self {
        self.event.kind = kind;
        if kind == EventKind::Push {
            self.event.trigger_target = TriggerTarget::Push;
            self.event.pull_request_number = None;
        }
        self
    }

    pub fn trigger(mut self, trigger: TriggerTarget) -> Self {
        self.event.trigger_target = trigger;
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.event.sender = sender.to_string();
        self
    }

    pub fn sha(mut self, sha: &str) -> Self {
        self.event.sha = sha.to_string();
        self
    }

    pub fn repository(mut self, repository: &str) -> Self {
        self.event.repository = repository.to_string();
        self
    }

    pub fn base_branch(mut self, branch: &str) -> Self {
        self.event.base_branch = branch.to_string();
        self
    }

    pub fn head_branch(mut self, branch: &str) -> Self {
        self.event.head_branch = branch.to_string();
        self
    }

    pub fn pull_request(mut self, number: u64) -> Self {
        self.event.pull_request_number = Some(number);
        self
    }

    pub fn no_pull_request(mut self) -> Self {
        self.event.pull_request_number = None;
        self
    }

    pub fn pr_author(mut self, author: &str) -> Self {
        self.event.pull_request_author = Some(author.to_string());
        self
    }

    pub fn comment(mut self, comment: CommentContext) -> Self {
        self.event.comment = Some(comment);
        self
    }

    pub fn requested_test(mut self, name: &str) -> Self {
        self.event.requested_test = Some(name.to_string());
        self
    }

    /// Make the head repository a fork, so the same-repo rule does not
    /// apply.
    pub fn fork(mut self) -> Self {
        self.event.head_url = "https://github.com/forker/repo".to_string();
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
