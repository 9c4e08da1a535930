use std::fmt::Debug;
use std::time::Duration;

/// Backoff schedule for retryable provider and cluster operations.
/// Delays double from `base` up to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            #[cfg(not(test))]
            base: Duration::from_secs(1),
            #[cfg(test)]
            base: Duration::from_millis(10),
            #[cfg(not(test))]
            cap: Duration::from_secs(30),
            #[cfg(test)]
            cap: Duration::from_millis(50),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.cap)
    }
}

/// Perform an asynchronous retryable operation.
///
/// `is_fatal` lets the caller mark errors that must not be retried, such as
/// authentication failures. The last error is returned once the attempts are
/// exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: &str,
    backoff: &Backoff,
    is_fatal: impl Fn(&E) -> bool,
    func: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Debug,
{
    let mut attempt = 0;
    loop {
        match func().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if is_fatal(&error) || attempt >= backoff.max_attempts {
                    return Err(error);
                }
                let delay = backoff.delay(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    "Operation failed, retrying in {delay:?}: {error:?}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
