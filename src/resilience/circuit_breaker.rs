use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::resilience::ExternalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful probes needed to close it again
    pub success_threshold: u32,
    /// Time since the last failure before a probe is let through
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Guards one external dependency. Share one instance per service, never across services.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            since_last_failure: inner.last_failure.map(|at| at.elapsed()),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.last_failure = None;
    }

    /// Run `operation` unless the circuit is open. An open circuit fails fast
    /// without invoking the operation.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ExternalError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        self.acquire()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    fn acquire(&self) -> Result<(), ExternalError> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let cooled_down = inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true);
        if !cooled_down {
            return Err(ExternalError::CircuitOpen(self.name.clone()));
        }

        log::info!("Circuit '{}' half-open, probing dependency", self.name);
        inner.state = CircuitState::HalfOpen;
        inner.successes = 0;
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    log::info!("Circuit '{}' closed after successful probes", self.name);
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            // A call admitted before another caller tripped the circuit
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    log::warn!(
                        "Circuit '{}' opened after {} consecutive failures",
                        self.name,
                        inner.failures
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                log::warn!("Circuit '{}' probe failed, reopening", self.name);
                inner.state = CircuitState::Open;
                inner.successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

/// One breaker per logical external service, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config)))
            .clone()
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let breakers = self.breakers.lock();
        let mut stats: Vec<_> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "image-provider",
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(10),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ExternalError> {
        breaker
            .execute(|| async { Err(ExternalError::Network("refused".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), ExternalError> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = breaker();
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(
            result,
            Err(ExternalError::CircuitOpen("image-provider".to_string()))
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_then_close() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // The reopened circuit waits a full reset timeout again
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(ExternalError::CircuitOpen(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.reset();
        assert_eq!(breaker.stats().failures, 0);
    }

    #[test]
    fn test_registry_returns_one_breaker_per_service() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("images");
        let b = registry.get("images");
        let c = registry.get("chat");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        let names: Vec<_> = registry.stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["chat".to_string(), "images".to_string()]);
    }
}
