//! Bounded retry with a fixed delay.
//! Each attempt races a timeout; timeouts count as ordinary failures.
//! The last failure is classified only once retries are exhausted.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::translate::TranslateError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(45),
        }
    }
}

/// Run `attempt` until it succeeds or the retry budget is spent.
///
/// An empty result, or one identical to `origin`, means nothing needed
/// translating and yields `origin` verbatim.
pub async fn run<F, Fut>(
    origin: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<String, TranslateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    let mut retries: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let outcome = match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "translation request timeout after {}ms",
                policy.timeout.as_millis()
            )),
        };

        let error = match outcome {
            Ok(translated) if translated.is_empty() || translated == origin => {
                debug!("no translation necessary, returning origin");
                return Ok(origin.to_string());
            }
            Ok(translated) => return Ok(translated),
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        if retries >= policy.max_retries {
            let message = format!("{error:#}");
            warn!(attempts = retries + 1, error = %message, "translation failed, retries exhausted");
            return Err(TranslateError::classify(&message));
        }

        retries += 1;
        debug!(retry = retries, max = policy.max_retries, error = %error, "translation attempt failed, retrying");
        tokio::select! {
            _ = tokio::time::sleep(policy.retry_delay) => {}
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        }
    }
}
