//! Retry with fixed or exponential backoff

use dlc_core::{DlcError, DlcResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed delay).
    pub multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed delay between a bounded number of attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculate delay for a given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
        } else {
            delay
        }
    }
}

/// Retry `op` while it fails with a retryable error.
pub async fn retry<F, Fut, T>(config: &RetryConfig, what: &str, mut op: F) -> DlcResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DlcResult<T>>,
{
    let mut attempt = 0;
    let mut last_error = None;

    while attempt < config.max_attempts {
        attempt += 1;

        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }

                debug!(
                    what = what,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "Attempt failed"
                );
                last_error = Some(e);

                if attempt < config.max_attempts {
                    sleep(config.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    Err(DlcError::RetryExhausted {
        attempts: attempt,
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{} never attempted", what)),
    })
}

/// Retry `op` until it returns `Ok(true)`.
///
/// `Ok(false)` counts as a failed attempt; errors abort immediately unless
/// retryable.
pub async fn retry_until<F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> DlcResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DlcResult<bool>>,
{
    retry(config, what, || {
        let fut = op();
        async move {
            if fut.await? {
                Ok(())
            } else {
                Err(DlcError::NotReady(what.to_string()))
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_fixed_delay() {
        let config = RetryConfig::fixed(10, Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(7), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry(&quick(5), "flaky", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(DlcError::Network("refused".to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: DlcResult<()> = retry(&quick(5), "fatal", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DlcError::Config("bad".to_string()))
        })
        .await;
        assert!(matches!(result, Err(DlcError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_until_exhausts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_until(&quick(3), "never", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        })
        .await;
        assert!(matches!(
            result,
            Err(DlcError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
