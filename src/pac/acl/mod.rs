//! Decides whether an event is authorized to trigger CI.
//!
//! The ladder, first match wins: owner-as-sender, public org member,
//! repository collaborator, OWNERS approver/reviewer, an `/ok-to-test`
//! comment whose author passes the same ladder, and finally same-repository
//! pull requests. Push events are never unlocked through comments.

use crate::binding::Policy;
use crate::pac::error::PacError;
use crate::pac::event::{CommentCommand, Event, EventKind};
use crate::provider::Provider;

pub mod owners;

use owners::Owners;

pub async fn is_allowed(
    provider: &dyn Provider,
    event: &Event,
    policy: Option<&Policy>,
) -> Result<bool, PacError> {
    let mut ladder = Ladder {
        provider,
        event,
        policy,
        owners: None,
    };

    if ladder.passes(&event.sender).await? {
        return Ok(true);
    }

    if event.kind.is_pull_request_scoped() && event.pull_request_number.is_some() {
        if let Some(comment) = &event.comment {
            match CommentCommand::parse(&comment.body) {
                Some(CommentCommand::OkToTest) => {
                    if ladder.passes(&comment.author).await? {
                        return Ok(true);
                    }
                }
                Some(CommentCommand::Retest | CommentCommand::Test(_)) => {
                    // Retests are open to the PR author, everyone else goes
                    // through the ladder.
                    if event.pull_request_author.as_deref() == Some(comment.author.as_str()) {
                        return Ok(true);
                    }
                    if ladder.passes(&comment.author).await? {
                        return Ok(true);
                    }
                }
                None => {}
            }
        }

        for comment in provider.list_comments(event).await? {
            if !matches!(
                CommentCommand::parse(&comment.body),
                Some(CommentCommand::OkToTest)
            ) {
                continue;
            }
            if ladder.passes(&comment.author.to_lowercase()).await? {
                return Ok(true);
            }
        }
    }

    // A pull request from a branch of the target repository itself: whoever
    // pushed the branch already holds write access.
    if event.kind == EventKind::PullRequest
        && !event.base_url.is_empty()
        && event.base_url == event.head_url
    {
        return Ok(true);
    }

    Ok(false)
}

struct Ladder<'a> {
    provider: &'a dyn Provider,
    event: &'a Event,
    policy: Option<&'a Policy>,
    /// OWNERS content is fetched at most once per event.
    owners: Option<Option<Owners>>,
}

impl Ladder<'_> {
    async fn passes(&mut self, login: &str) -> Result<bool, PacError> {
        if login.is_empty() {
            return Ok(false);
        }
        if login == self.event.organization {
            return Ok(true);
        }
        if let Some(policy) = self.policy {
            if policy.pull_request.iter().any(|l| l.eq_ignore_ascii_case(login))
                || policy.ok_to_test.iter().any(|l| l.eq_ignore_ascii_case(login))
            {
                return Ok(true);
            }
        }
        if self
            .provider
            .is_member_of_org(login, &self.event.organization)
            .await?
        {
            return Ok(true);
        }
        if self
            .provider
            .is_collaborator(login, &self.event.organization, &self.event.repository)
            .await?
        {
            return Ok(true);
        }
        if let Some(owners) = self.owners().await? {
            if owners.contains(login) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn owners(&mut self) -> Result<&Option<Owners>, PacError> {
        if self.owners.is_none() {
            let reference = if self.event.default_branch.is_empty() {
                "HEAD"
            } else {
                self.event.default_branch.as_str()
            };
            let owners_content = self
                .provider
                .get_file(self.event, "OWNERS", reference)
                .await?;
            let loaded = match owners_content {
                Some(owners_bytes) => {
                    let aliases_bytes = self
                        .provider
                        .get_file(self.event, "OWNERS_ALIASES", reference)
                        .await?;
                    let owners_text = String::from_utf8_lossy(&owners_bytes).into_owned();
                    let aliases_text =
                        aliases_bytes.map(|b| String::from_utf8_lossy(&b).into_owned());
                    match Owners::parse(&owners_text, aliases_text.as_deref()) {
                        Ok(owners) => Some(owners),
                        Err(error) => {
                            tracing::warn!(
                                repo = self.event.repo_slug(),
                                "Unparsable OWNERS file: {error}"
                            );
                            None
                        }
                    }
                }
                None => None,
            };
            self.owners = Some(loaded);
        }
        Ok(self.owners.as_ref().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pac::event::{CommentContext, TriggerTarget};
    use crate::tests::event_builder::TestEvent;
    use crate::tests::mocks::MockProvider;

    #[tokio::test]
    async fn owner_as_sender_is_allowed() {
        let provider = MockProvider::default();
        let event = TestEvent::default().sender("owner").build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn org_member_is_allowed() {
        let provider = MockProvider::default().with_org_member("dev");
        let event = TestEvent::default().sender("dev").build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn collaborator_is_allowed() {
        let provider = MockProvider::default().with_collaborator("dev");
        let event = TestEvent::default().sender("dev").build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_sender_is_denied() {
        let provider = MockProvider::default();
        let event = TestEvent::default().sender("stranger").fork().build();
        assert!(!is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn owners_approver_is_allowed() {
        let provider = MockProvider::default()
            .with_file("OWNERS", "approvers:\n  - approved\n");
        let event = TestEvent::default().sender("approved").fork().build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn owners_alias_is_expanded() {
        let provider = MockProvider::default()
            .with_file("OWNERS", "approvers:\n  - infra\n")
            .with_file("OWNERS_ALIASES", "aliases:\n  infra:\n    - hector\n");
        let event = TestEvent::default().sender("hector").fork().build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn ok_to_test_from_owner_unlocks_sender() {
        let provider = MockProvider::default().with_comment("owner", "/ok-to-test");
        let event = TestEvent::default()
            .sender("nonowner")
            .pull_request(1)
            .fork()
            .build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn ok_to_test_from_non_owner_does_not_unlock() {
        let provider = MockProvider::default().with_comment("notowner", "/ok-to-test");
        let event = TestEvent::default()
            .sender("nonowner")
            .pull_request(1)
            .fork()
            .build();
        assert!(!is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn push_event_is_never_unlocked_by_comments() {
        let provider = MockProvider::default().with_comment("owner", "/ok-to-test");
        let event = TestEvent::default()
            .kind(EventKind::Push)
            .trigger(TriggerTarget::Push)
            .sender("nonowner")
            .build();
        assert!(!is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn same_repo_pull_request_is_allowed() {
        let provider = MockProvider::default();
        let event = TestEvent::default().sender("nonowner").build();
        assert_eq!(event.base_url, event.head_url);
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn retest_from_pr_author_is_allowed() {
        let provider = MockProvider::default();
        let event = TestEvent::default()
            .kind(EventKind::IssueComment)
            .trigger(TriggerTarget::RetestComment)
            .sender("author")
            .pull_request(2)
            .pr_author("author")
            .comment(CommentContext {
                author: "author".to_string(),
                body: "/retest".to_string(),
            })
            .fork()
            .build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn retest_from_stranger_is_denied() {
        let provider = MockProvider::default();
        let event = TestEvent::default()
            .kind(EventKind::IssueComment)
            .trigger(TriggerTarget::RetestComment)
            .sender("stranger")
            .pull_request(2)
            .pr_author("author")
            .comment(CommentContext {
                author: "stranger".to_string(),
                body: "/retest".to_string(),
            })
            .fork()
            .build();
        assert!(!is_allowed(&provider, &event, None).await.unwrap());
    }

    #[tokio::test]
    async fn policy_relaxation_allows_listed_login() {
        let provider = MockProvider::default();
        let policy = Policy {
            ok_to_test: vec![],
            pull_request: vec!["trusted".to_string()],
        };
        let event = TestEvent::default().sender("trusted").fork().build();
        assert!(is_allowed(&provider, &event, Some(&policy)).await.unwrap());
    }

    #[tokio::test]
    async fn allowance_is_monotonic_under_new_comments() {
        let provider = MockProvider::default().with_org_member("dev");
        let event = TestEvent::default().sender("dev").fork().build();
        assert!(is_allowed(&provider, &event, None).await.unwrap());

        let provider = provider.with_comment("someone", "/ok-to-test");
        assert!(is_allowed(&provider, &event, None).await.unwrap());
    }
}
