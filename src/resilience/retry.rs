use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::resilience::ExternalError;

/// Custom retry decision: `(error, attempt_number) -> retry?`
pub type RetryPredicate = Arc<dyn Fn(&ExternalError, u32) -> bool + Send + Sync>;

pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay added at random, `0.0` disables jitter
    pub jitter_factor: f64,
    /// Bound on each individual attempt
    pub timeout: Option<Duration>,
    pub retryable_status_codes: Vec<u16>,
    pub should_retry: Option<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            timeout: Some(Duration::from_secs(30)),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            should_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("timeout", &self.timeout)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

impl RetryOptions {
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ExternalError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn is_retryable(&self, error: &ExternalError, attempt: u32) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(error, attempt);
        }
        if error.is_transient_network() {
            return true;
        }
        error
            .status()
            .map(|status| self.retryable_status_codes.contains(&status))
            .unwrap_or(false)
    }

    /// Sleep before retry number `retry` (0-based), jitter included
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = backoff_delay(
            self.initial_delay,
            self.backoff_multiplier,
            self.max_delay,
            retry,
        );
        if self.jitter_factor <= 0.0 {
            return base;
        }
        base.mul_f64(1.0 + self.jitter_factor * rand::random::<f64>())
    }
}

/// `min(initial * multiplier^retry, max)`
pub fn backoff_delay(initial: Duration, multiplier: f64, max: Duration, retry: u32) -> Duration {
    let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
    let seconds = initial.as_secs_f64() * multiplier.powi(exponent);
    if !seconds.is_finite() || seconds >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Result of [`with_retry`]. Check [`RetryOutcome::is_success`] before using the value.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ExternalError>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The value, or the terminal error wrapped with attempt count and elapsed time
    pub fn into_result(self) -> Result<T, ExternalError> {
        match self.result {
            Ok(value) => Ok(value),
            Err(source) => Err(ExternalError::Exhausted {
                attempts: self.attempts,
                elapsed: self.elapsed,
                source: Box::new(source),
            }),
        }
    }
}

/// Run `operation` until it succeeds, fails terminally, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(mut operation: F, options: &RetryOptions) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let started = Instant::now();
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(ExternalError::Timeout(limit)),
            },
            None => operation().await,
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    log::debug!("Operation succeeded on attempt {}", attempt);
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            Err(error) => error,
        };

        if attempt >= max_attempts || !options.is_retryable(&error, attempt) {
            if attempt > 1 {
                log::warn!("Giving up after {} attempt(s): {}", attempt, error);
            }
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                elapsed: started.elapsed(),
            };
        }

        let delay = options.delay_for(attempt - 1);
        log::warn!(
            "Attempt {}/{} failed ({}), retrying in {:?}",
            attempt,
            max_attempts,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
            timeout: None,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_after_one_attempt() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ExternalError::Status {
                        status: 400,
                        message: "bad prompt".to_string(),
                    })
                }
            },
            &fast_options(),
        )
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExternalError::Network("connection reset".to_string()))
                    } else {
                        Ok("image-url")
                    }
                }
            },
            &fast_options(),
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        // 100ms + 200ms of backoff with jitter disabled
        assert!(outcome.elapsed >= Duration::from_millis(300));
        assert_eq!(outcome.into_result().unwrap(), "image-url");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_exhausts_attempts() {
        let outcome: RetryOutcome<()> = with_retry(
            || async {
                Err(ExternalError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            },
            &fast_options(),
        )
        .await;

        assert_eq!(outcome.attempts, 3);
        match outcome.into_result() {
            Err(ExternalError::Exhausted {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.status(), Some(503));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_retryable() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions {
            max_attempts: 2,
            timeout: Some(Duration::from_secs(1)),
            ..fast_options()
        };

        let outcome: RetryOutcome<()> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            },
            &options,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.result,
            Err(ExternalError::Timeout(Duration::from_secs(1)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_default() {
        let options = fast_options().with_predicate(|error, _| error.status() == Some(400));
        let outcome: RetryOutcome<()> = with_retry(
            || async {
                Err(ExternalError::Status {
                    status: 400,
                    message: "flaky validator".to_string(),
                })
            },
            &options,
        )
        .await;
        assert_eq!(outcome.attempts, 3);

        let outcome: RetryOutcome<()> = with_retry(
            || async { Err(ExternalError::Network("down".to_string())) },
            &options,
        )
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(backoff_delay(initial, 2.0, max, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(initial, 2.0, max, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(initial, 2.0, max, 3), max);
        assert_eq!(backoff_delay(initial, 2.0, max, u32::MAX), max);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let options = RetryOptions {
            jitter_factor: 0.5,
            ..fast_options()
        };
        for _ in 0..50 {
            let delay = options.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}
