//! Request execution with classified retries and capped, jittered backoff.

use rand::Rng as _;
use relay_core::llm::ChatError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;
const JITTER_MS: u64 = 200;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_enabled: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_enabled: bool) -> Self {
        Self {
            max_retries,
            retry_enabled,
        }
    }

    /// Streaming requests must not be replayed once the server may have
    /// started emitting (or billing) a response.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retry_enabled: false,
        }
    }

    fn total_attempts(&self) -> u32 {
        if self.retry_enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

/// Run one logical request through the retry policy. `attempt` is invoked
/// once per transport attempt and must return an already-classified outcome.
///
/// The cancellation token is observed before the first attempt, while an
/// attempt is in flight, and during every backoff wait; attempts are strictly
/// sequential.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, ChatError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    if cancel.is_cancelled() {
        return Err(ChatError::Canceled(Some("canceled before request".into())));
    }
    let total = policy.total_attempts().max(1);
    let mut n = 0u32;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ChatError::Canceled(Some("canceled in flight".into())));
            }
            r = attempt() => r,
        };
        let err = match outcome {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if n + 1 >= total || !is_retryable(&err) {
            return Err(err);
        }
        let delay = backoff_delay(n, retry_after_hint(&err));
        warn!(
            target: "providers::openai",
            "attempt {}/{} failed: {err}; retrying in {:?}",
            n + 1,
            total,
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ChatError::Canceled(Some("canceled during backoff".into())));
            }
            _ = sleep(delay) => {}
        }
        n += 1;
    }
}

fn is_retryable(err: &ChatError) -> bool {
    match err {
        ChatError::RateLimit { .. } | ChatError::Network(_) => true,
        ChatError::Server(status) => *status >= 500,
        _ => false,
    }
}

fn retry_after_hint(err: &ChatError) -> Option<f64> {
    match err {
        ChatError::RateLimit { retry_after, .. } => *retry_after,
        _ => None,
    }
}

/// Delay before retry `attempt` (0-based). A server-provided Retry-After
/// wins over the computed curve; both are capped at 30s so a hostile header
/// can never stall the caller longer than that per attempt.
pub(crate) fn backoff_delay(attempt: u32, retry_after: Option<f64>) -> Duration {
    let ms = match retry_after {
        Some(secs) => (secs * 1_000.0) as u64,
        None => {
            let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(20));
            base.saturating_add(rand::rng().random_range(0..JITTER_MS))
        }
    };
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// A Retry-After value that is missing, non-numeric, negative, or non-finite
/// is treated as absent, never as zero.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
