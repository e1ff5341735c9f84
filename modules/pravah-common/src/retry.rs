use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::PravahError;

/// Exponential backoff for transient failures: `base * factor^attempt + jitter`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 3,
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            factor: 1,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.factor.saturating_pow(attempt)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    }
}

/// Run `op`, retrying only while it fails with a transient error.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PravahError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PravahError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.delay_for(attempt);
                warn!(
                    what,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying after backoff"
                );
                tokio::time::sleep(backoff + policy.jitter()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
