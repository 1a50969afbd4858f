//! ============================================================================
//! Retry Policy - Exponential Backoff for Upstream Calls
//! ============================================================================
//! Provides robust calls to the completion / embedding services and the
//! model store with:
//! - Exponential backoff with jitter between attempts
//! - A per-attempt timeout
//! - Error classification (retryable vs permanent vs rate limited)
//! ============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::types::{ConverseError, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Base delay between retries (multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Upper bound on a single attempt
    pub attempt_timeout_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            attempt_timeout_ms: 20_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Which collaborator a retried call talks to; decides the error a timeout maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Completion,
    Embedding,
    Persistence,
}

impl Upstream {
    pub fn error(self, message: String) -> ConverseError {
        match self {
            Upstream::Completion => ConverseError::CompletionUnavailable(message),
            Upstream::Embedding => ConverseError::EmbeddingUnavailable(message),
            Upstream::Persistence => ConverseError::PersistenceUnavailable(message),
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Error is permanent, don't retry
    Permanent,
    /// Rate limited, back off more aggressively
    RateLimited,
}

/// Classify an error to determine if retry is appropriate
pub fn classify_error(error: &ConverseError) -> ErrorKind {
    if !error.is_retryable() {
        return ErrorKind::Permanent;
    }

    let lower = error.to_string().to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
        return ErrorKind::RateLimited;
    }

    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        // 0-50% on top
        let jitter_factor = 1.0 + rand::thread_rng().gen::<f64>() * 0.5;
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt is bounded by `attempt_timeout_ms`; a timeout counts as a
/// retryable failure of `upstream`.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    upstream: Upstream,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = upstream.error(format!("{} never attempted", operation));

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = calculate_delay(attempt - 1, config);
            debug!("{}: retry attempt {} after {:?} delay", operation, attempt, delay);
            sleep(delay).await;
        }

        let outcome = match timeout(config.attempt_timeout(), op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(upstream.error(format!(
                "{} timed out after {}ms",
                operation, config.attempt_timeout_ms
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) => {
                let kind = classify_error(&e);
                warn!("{}: attempt {} failed ({:?}): {}", operation, attempt + 1, kind, e);

                match kind {
                    ErrorKind::Permanent => return Err(e),
                    ErrorKind::RateLimited => {
                        let rate_limit_delay = Duration::from_millis(config.max_delay_ms);
                        if attempt + 1 < attempts {
                            debug!("{}: rate limited, waiting {:?}", operation, rate_limit_delay);
                            sleep(rate_limit_delay).await;
                        }
                    }
                    ErrorKind::Retryable => {}
                }

                last_error = e;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_ms: 50,
            jitter: false,
        }
    }

    #[test]
    fn test_calculate_delay_no_jitter() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: false,
            ..RetryConfig::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(200));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(800));
        // Capped at max_delay_ms
        assert_eq!(calculate_delay(4, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(40, &config), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter_bounds() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: true,
            ..RetryConfig::default()
        };

        for _ in 0..20 {
            let delay = calculate_delay(1, &config);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify_error(&ConverseError::InvalidInput("empty id".into())),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify_error(&ConverseError::CompletionUnavailable("HTTP 429 Too Many Requests".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify_error(&ConverseError::EmbeddingUnavailable("connection reset".into())),
            ErrorKind::Retryable
        );
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_config(3), Upstream::Completion, "generate", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ConverseError::CompletionUnavailable("flaky".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_config(2), Upstream::Embedding, "embed", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ConverseError::EmbeddingUnavailable(format!("down #{}", attempt))) }
        })
        .await;

        assert_eq!(
            result.unwrap_err(),
            ConverseError::EmbeddingUnavailable("down #1".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast_config(5), Upstream::Embedding, "embed", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConverseError::InvalidInput("bad text".into())) }
        })
        .await;

        assert!(matches!(result, Err(ConverseError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_maps_to_upstream_error() {
        let result: Result<()> = retry_with_backoff(&fast_config(1), Upstream::Completion, "generate", |_| async {
            sleep(Duration::from_millis(500)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ConverseError::CompletionUnavailable(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
