//! Provider detection and signature verification for inbound webhooks.
//! Verification runs on the raw body BEFORE any parsing; invalid signatures
//! are answered with 401 and an empty body.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::pac::error::PacError;
use crate::pac::event::{Event, ProviderKind};
use crate::provider::{bitbucket, gitea, github, gitlab};
use crate::server::ServerStateRef;

const WEBHOOK_BODY_LIMIT: usize = 8 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Shared webhook secrets, one per provider family. A family with no
/// configured secret skips verification (ingestion is then expected to be
/// restricted upstream).
#[derive(Default)]
pub struct WebhookSecrets {
    pub github: Option<SecretString>,
    pub gitlab: Option<SecretString>,
    pub gitea: Option<SecretString>,
    pub bitbucket: Option<SecretString>,
}

impl WebhookSecrets {
    /// One shared secret for every provider family.
    pub fn uniform(secret: Option<SecretString>) -> Self {
        Self {
            github: secret.clone(),
            gitlab: secret.clone(),
            gitea: secret.clone(),
            bitbucket: secret,
        }
    }

    fn for_kind(&self, kind: ProviderKind) -> Option<&SecretString> {
        match kind {
            ProviderKind::Github => self.github.as_ref(),
            ProviderKind::Gitlab => self.gitlab.as_ref(),
            ProviderKind::Gitea => self.gitea.as_ref(),
            ProviderKind::Bitbucket => self.bitbucket.as_ref(),
        }
    }

    pub(crate) fn verify(
        &self,
        kind: ProviderKind,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), PacError> {
        let Some(secret) = self.for_kind(kind) else {
            tracing::debug!("No webhook secret configured for {kind}, skipping verification");
            return Ok(());
        };
        let valid = match kind {
            ProviderKind::Github => {
                verify_hmac(headers, "x-hub-signature-256", Some("sha256="), secret, body)
            }
            ProviderKind::Gitea => verify_hmac(headers, "x-gitea-signature", None, secret, body),
            ProviderKind::Bitbucket => {
                verify_hmac(headers, "x-hub-signature", Some("sha256="), secret, body)
            }
            ProviderKind::Gitlab => headers
                .get("x-gitlab-token")
                .map(|token| constant_time_eq(token.as_bytes(), secret.expose_secret().as_bytes()))
                .unwrap_or(false),
        };
        if valid {
            Ok(())
        } else {
            Err(PacError::SignatureInvalid)
        }
    }
}

fn verify_hmac(
    headers: &HeaderMap,
    header: &str,
    prefix: Option<&str>,
    secret: &SecretString,
    body: &[u8],
) -> bool {
    let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let hex_digest = match prefix {
        Some(prefix) => match value.strip_prefix(prefix) {
            Some(rest) => rest,
            None => return false,
        },
        None => value,
    };
    let Ok(signature) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Classify the request by its headers. Gitea is checked before GitHub
/// because Gitea sends both header families.
pub(crate) fn detect(headers: &HeaderMap) -> Option<(ProviderKind, String)> {
    for (header, kind) in [
        ("x-gitea-event", ProviderKind::Gitea),
        ("x-github-event", ProviderKind::Github),
        ("x-gitlab-event", ProviderKind::Gitlab),
        ("x-event-key", ProviderKind::Bitbucket),
    ] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            return Some((kind, value.to_string()));
        }
    }
    None
}

/// axum extractor producing a verified, parsed, normalized [`Event`].
pub struct PacWebhook(pub Event);

impl FromRequest<ServerStateRef> for PacWebhook {
    type Rejection = Response;

    async fn from_request(
        request: Request,
        state: &ServerStateRef,
    ) -> Result<Self, Self::Rejection> {
        let (parts, body) = request.into_parts();
        let body: Bytes = match axum::body::to_bytes(body, WEBHOOK_BODY_LIMIT).await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!("Could not read the webhook body: {error}");
                return Err((StatusCode::BAD_REQUEST, "").into_response());
            }
        };

        let Some((kind, event_type)) = detect(&parts.headers) else {
            tracing::debug!("Ignoring a request from an unknown provider");
            return Err((StatusCode::OK, "").into_response());
        };

        // Before parsing, always.
        if let Err(error) = state.secrets.verify(kind, &parts.headers, &body) {
            tracing::warn!("Webhook authentication failed for {kind}");
            return Err((error.status(), "").into_response());
        }

        let headers = header_map(&parts.headers);
        let parsed = match kind {
            ProviderKind::Github => github::parse_webhook(&event_type, &body, headers),
            ProviderKind::Gitlab => gitlab::parse_webhook(&event_type, &body, headers),
            ProviderKind::Gitea => gitea::parse_webhook(&event_type, &body, headers),
            ProviderKind::Bitbucket => bitbucket::parse_webhook(&event_type, &body, headers),
        };
        match parsed {
            Ok(Some(event)) => match event.normalize() {
                Ok(event) => Ok(PacWebhook(event)),
                Err(error) => {
                    tracing::warn!("Rejecting an abnormal event: {error}");
                    Err((error.status(), "").into_response())
                }
            },
            Ok(None) => {
                tracing::debug!(event_type, "Ignoring an uninteresting {kind} event");
                Err((StatusCode::OK, "").into_response())
            }
            Err(error) => {
                tracing::warn!("Cannot parse a {kind} webhook: {error}");
                Err((error.status(), "").into_response())
            }
        }
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> WebhookSecrets {
        WebhookSecrets::uniform(Some(SecretString::new("ABCDEF".to_string())))
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn github_signature_accepts_valid() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("ABCDEF", body).parse().unwrap());
        assert!(
            secrets()
                .verify(ProviderKind::Github, &headers, body)
                .is_ok()
        );
    }

    #[test]
    fn github_signature_rejects_wrong_secret() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("WRONG", body).parse().unwrap());
        assert!(matches!(
            secrets().verify(ProviderKind::Github, &headers, body),
            Err(PacError::SignatureInvalid)
        ));
    }

    #[test]
    fn github_signature_rejects_missing_header() {
        assert!(matches!(
            secrets().verify(ProviderKind::Github, &HeaderMap::new(), b"{}"),
            Err(PacError::SignatureInvalid)
        ));
    }

    #[test]
    fn gitlab_token_comparison() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-token", "ABCDEF".parse().unwrap());
        assert!(
            secrets()
                .verify(ProviderKind::Gitlab, &headers, b"{}")
                .is_ok()
        );
        headers.insert("x-gitlab-token", "GUESS".parse().unwrap());
        assert!(
            secrets()
                .verify(ProviderKind::Gitlab, &headers, b"{}")
                .is_err()
        );
    }

    #[test]
    fn gitea_signature_has_no_prefix() {
        let body = b"{}";
        let signature = sign("ABCDEF", body);
        let bare = signature.strip_prefix("sha256=").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-gitea-signature", bare.parse().unwrap());
        assert!(secrets().verify(ProviderKind::Gitea, &headers, body).is_ok());
    }

    #[test]
    fn unconfigured_secret_skips_verification() {
        let secrets = WebhookSecrets::default();
        assert!(
            secrets
                .verify(ProviderKind::Github, &HeaderMap::new(), b"{}")
                .is_ok()
        );
    }

    #[test]
    fn detection_prefers_gitea_over_github() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "push".parse().unwrap());
        headers.insert("x-gitea-event", "push".parse().unwrap());
        let (kind, _) = detect(&headers).unwrap();
        assert_eq!(kind, ProviderKind::Gitea);
    }

    #[test]
    fn detection_by_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-gitlab-event", "Push Hook".parse().unwrap());
        assert_eq!(detect(&headers).unwrap().0, ProviderKind::Gitlab);

        let mut headers = HeaderMap::new();
        headers.insert("x-event-key", "repo:push".parse().unwrap());
        assert_eq!(detect(&headers).unwrap().0, ProviderKind::Bitbucket);

        assert!(detect(&HeaderMap::new()).is_none());
    }
}
