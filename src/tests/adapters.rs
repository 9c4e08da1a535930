//! HTTP-level tests of the reqwest-backed adapters against a mock forge.

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::pac::event::ProviderKind;
use crate::provider::gitea::GiteaProvider;
use crate::provider::github::GithubProvider;
use crate::provider::gitlab::GitlabProvider;
use crate::provider::{Provider, ProviderError};
use crate::tekton::RunState;
use crate::tests::event_builder::TestEvent;

fn gitea(server: &MockServer) -> GiteaProvider {
    GiteaProvider::new(None, Some(format!("{}/api/v1", server.uri())))
}

fn gitlab(server: &MockServer) -> GitlabProvider {
    GitlabProvider::new(None, Some(format!("{}/api/v4", server.uri())))
}

#[tokio::test]
async fn gitea_exhausts_comment_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/repos/owner/repo/issues/1/comments"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"body": "/ok-to-test", "user": {"login": "maintainer"}}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/repos/owner/repo/issues/1/comments"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    let comments = gitea(&server).list_comments(&event).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author, "maintainer");
    assert_eq!(comments[0].body, "/ok-to-test");
}

#[tokio::test]
async fn gitea_membership_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/orgs/owner/members/dev"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/orgs/owner/members/stranger"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = gitea(&server);
    assert!(provider.is_member_of_org("dev", "owner").await.unwrap());
    assert!(!provider.is_member_of_org("stranger", "owner").await.unwrap());
}

#[tokio::test]
async fn gitea_posts_commit_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/repos/owner/repo/statuses/abc123"))
        .and(body_partial_json(json!({"state": "success"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    gitea(&server)
        .post_status(&event, "checks-abcde", RunState::Succeeded, "", "All checks passed")
        .await
        .unwrap();
}

#[tokio::test]
async fn gitea_auth_failure_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/repos/owner/repo/statuses/abc123"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    let error = gitea(&server)
        .post_status(&event, "checks", RunState::Succeeded, "", "")
        .await
        .unwrap_err();
    assert!(matches!(error, ProviderError::AuthFailed));
    assert!(!error.is_retriable());
}

#[tokio::test]
async fn gitlab_fetches_raw_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/owner%2Frepo/repository/files/OWNERS/raw"))
        .and(query_param("ref", "main"))
        .respond_with(ResponseTemplate::new(200).set_body_string("approvers:\n  - alice\n"))
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    let content = gitlab(&server)
        .get_file(&event, "OWNERS", "main")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content, b"approvers:\n  - alice\n");
}

#[tokio::test]
async fn gitlab_missing_file_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    let content = gitlab(&server)
        .get_file(&event, "OWNERS", "main")
        .await
        .unwrap();
    assert!(content.is_none());
}

#[tokio::test]
async fn gitlab_posts_statuses_with_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v4/projects/owner%2Frepo/statuses/abc123"))
        .and(body_partial_json(json!({
            "state": "canceled",
            "context": "Pipelines as Code CI / checks-abcde"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let event = TestEvent::default().build();
    gitlab(&server)
        .post_status(&event, "checks-abcde", RunState::Cancelled, "", "The run was cancelled")
        .await
        .unwrap();
}

#[tokio::test]
async fn github_membership_probe_through_octocrab() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orgs/owner/public_members/dev"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orgs/owner/public_members/stranger"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = GithubProvider::new(None, Some(server.uri())).unwrap();
    assert_eq!(provider.kind(), ProviderKind::Github);
    assert!(provider.is_member_of_org("dev", "owner").await.unwrap());
    assert!(!provider.is_member_of_org("stranger", "owner").await.unwrap());
}
