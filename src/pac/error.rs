use axum::http::StatusCode;
use thiserror::Error;

/// The error taxonomy surfaced at component boundaries.
///
/// Transport errors from providers and from the cluster are converted into
/// these variants before they cross a component boundary; internal details
/// never leak into HTTP responses.
#[derive(Debug, Error)]
pub enum PacError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid webhook signature")]
    SignatureInvalid,
    #[error("no repository binding matches {0}")]
    NoBinding(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("sender {0} is not allowed to run CI")]
    AccessDenied(String),
    #[error("template error: {0}")]
    TemplateError(String),
    #[error("pipeline run submission failed: {0}")]
    SubmissionError(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PacError {
    /// HTTP status reported when the error surfaces at the webhook boundary.
    ///
    /// `AccessDenied` and `TemplateError` consume the webhook (the user is
    /// informed through a status or comment instead).
    pub fn status(&self) -> StatusCode {
        match self {
            PacError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            PacError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            PacError::NoBinding(_) => StatusCode::ACCEPTED,
            PacError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            PacError::AccessDenied(_) | PacError::TemplateError(_) => StatusCode::OK,
            PacError::SubmissionError(_) => StatusCode::OK,
            PacError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            PacError::MalformedPayload("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(PacError::SignatureInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            PacError::NoBinding("https://example.com/a/b".into()).status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            PacError::ProviderUnavailable("timeout".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            PacError::AccessDenied("mallory".into()).status(),
            StatusCode::OK
        );
    }
}
