use anyhow::Error;
use tracing::span::Span;

/// Attach a handler error to the span it happened under.
pub trait LogError {
    fn log_error(&self, error: Error);
}

impl LogError for Span {
    fn log_error(&self, error: Error) {
        self.in_scope(|| {
            tracing::error!("Handler failed: {error:?}");
        });
    }
}
