//! The axum application that receives webhooks from every provider family
//! on one endpoint and exposes liveness/readiness probes.

use std::any::Any;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::catch_panic::CatchPanicLayer;

use crate::binding::BindingStore;
use crate::pac::event::Event;

pub mod webhook;

pub use webhook::{PacWebhook, WebhookSecrets};

/// Shared server state for all axum handlers.
pub struct ServerState {
    event_queue: mpsc::Sender<Event>,
    pub(crate) secrets: WebhookSecrets,
    bindings: Arc<BindingStore>,
}

impl ServerState {
    pub fn new(
        event_queue: mpsc::Sender<Event>,
        secrets: WebhookSecrets,
        bindings: Arc<BindingStore>,
    ) -> Self {
        Self {
            event_queue,
            secrets,
            bindings,
        }
    }
}

pub type ServerStateRef = Arc<ServerState>;

pub fn create_app(state: ServerState) -> Router {
    Router::new()
        .route("/", post(webhook_handler))
        .route("/live", get(live_handler))
        .route("/ready", get(ready_handler))
        .layer(ConcurrencyLimitLayer::new(100))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(Arc::new(state))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Router panicked: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

async fn live_handler() -> impl IntoResponse {
    (StatusCode::OK, "")
}

/// Ready once the binding cache has been seeded; a fresh instance must not
/// answer `NoBinding` for everything during a rollout.
async fn ready_handler(State(state): State<ServerStateRef>) -> impl IntoResponse {
    if state.bindings.is_ready() {
        (StatusCode::OK, "")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "")
    }
}

/// Receives a verified webhook and hands it to the processing loop. Events
/// for repositories without a binding are acknowledged with 202 and dropped.
async fn webhook_handler(
    State(state): State<ServerStateRef>,
    PacWebhook(event): PacWebhook,
) -> impl IntoResponse {
    if state.bindings.resolve(&event.base_url).is_none() {
        tracing::info!(
            url = event.base_url,
            "No repository binding matches, dropping the event"
        );
        return (
            StatusCode::ACCEPTED,
            "no repository binding matches this repository",
        );
    }
    match state.event_queue.send(event).await {
        Ok(_) => (StatusCode::OK, ""),
        Err(error) => {
            tracing::error!("Could not enqueue the webhook event: {error:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, "")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ObjectMeta, RepositoryBinding, RepositorySpec};
    use axum::body::Body;
    use axum::http::Request;
    use hmac::Mac;
    use secrecy::SecretString;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "ABCDEF";

    fn bindings() -> Arc<BindingStore> {
        let store = BindingStore::new();
        store.replace_all(vec![RepositoryBinding {
            metadata: ObjectMeta {
                name: "demo".to_string(),
                namespace: "ci".to_string(),
                ..Default::default()
            },
            spec: RepositorySpec {
                url: "https://github.com/owner/repo".to_string(),
                ..Default::default()
            },
        }]);
        Arc::new(store)
    }

    fn app(bindings: Arc<BindingStore>) -> (Router, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(16);
        let state = ServerState::new(
            tx,
            WebhookSecrets::uniform(Some(SecretString::new(TEST_SECRET.to_string()))),
            bindings,
        );
        (create_app(state), rx)
    }

    fn push_payload(repo_url: &str) -> String {
        serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": {
                "name": "repo",
                "owner": {"login": "owner"},
                "html_url": repo_url,
                "default_branch": "main"
            },
            "sender": {"login": "owner"}
        })
        .to_string()
    }

    fn github_request(body: &str, signed_with: &str) -> Request<Body> {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(signed_with.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("x-github-event", "push")
            .header("x-hub-signature-256", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_webhook_is_accepted_and_enqueued() {
        let (app, mut rx) = app(bindings());
        let body = push_payload("https://github.com/owner/repo");
        let response = app.oneshot(github_request(&body, TEST_SECRET)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.sha, "abc123");
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_with_401() {
        let (app, mut rx) = app(bindings());
        let body = push_payload("https://github.com/owner/repo");
        let response = app.oneshot(github_request(&body, "WRONG")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unbound_repository_is_answered_with_202() {
        let (app, mut rx) = app(bindings());
        let body = push_payload("https://github.com/unknown/repo");
        let response = app.oneshot(github_request(&body, TEST_SECRET)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_event_types_are_ignored_with_200() {
        let (app, mut rx) = app(bindings());
        let body = "{}";
        let mut request = github_request(body, TEST_SECRET);
        request
            .headers_mut()
            .insert("x-github-event", "star".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_with_400() {
        let (app, _rx) = app(bindings());
        let response = app
            .oneshot(github_request("not json", TEST_SECRET))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_endpoints() {
        let (app, _rx) = app(bindings());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/live")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_is_503_before_the_cache_is_seeded() {
        let (app, _rx) = app(Arc::new(BindingStore::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
