// ============================================================================
// Circuit Breaker for broker writes
// ============================================================================
//
// Keeps a slow or absent broker from stalling every registration request.
//
// States:
// - CLOSED: writes go through
// - OPEN: `failure_threshold` consecutive failures seen, writes fail fast
// - HALF_OPEN: `reset_timeout` elapsed since the last failure, writes are let
//   through again; `close_after_successes` successes close the circuit, one
//   failure reopens it
//
// ============================================================================

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Upper bound on a single protected call
    pub timeout: Duration,
    pub reset_timeout: Duration,
    pub close_after_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(3),
            reset_timeout: Duration::from_secs(30),
            close_after_successes: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open (last failure {0:?} ago)")]
    Open(Duration),

    #[error("call exceeded {timeout:?}")]
    Timeout { timeout: Duration },

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Tally {
    consecutive_failures: u32,
    half_open_successes: u32,
    opened: bool,
    last_failure: Option<Instant>,
}

/// Thread-safe circuit breaker shared by clones of a producer
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    tally: Mutex<Tally>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Run `operation` unless the circuit is open
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let tally = self.tally.lock().await;
            if tally.opened {
                if let Some(last_failure) = tally.last_failure {
                    let elapsed = last_failure.elapsed();
                    if elapsed < self.config.reset_timeout {
                        tracing::warn!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Circuit breaker OPEN - rejecting broker write"
                        );
                        return Err(CircuitBreakerError::Open(elapsed));
                    }
                    tracing::info!("Circuit breaker half-open - probing broker");
                }
            }
        }

        match tokio::time::timeout(self.config.timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
            Err(_) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Timeout {
                    timeout: self.config.timeout,
                })
            }
        }
    }

    async fn record_success(&self) {
        let mut tally = self.tally.lock().await;
        if tally.opened {
            tally.half_open_successes += 1;
            if tally.half_open_successes >= self.config.close_after_successes {
                *tally = Tally::default();
                tracing::info!("Circuit breaker CLOSED - broker recovered");
            }
        } else {
            tally.consecutive_failures = 0;
        }
    }

    async fn record_failure(&self) {
        let mut tally = self.tally.lock().await;
        tally.consecutive_failures += 1;
        tally.half_open_successes = 0;
        tally.last_failure = Some(Instant::now());

        if tally.consecutive_failures >= self.config.failure_threshold && !tally.opened {
            tally.opened = true;
            tracing::error!(
                failures = tally.consecutive_failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker OPENED"
            );
        }
    }

    pub async fn state(&self) -> CircuitState {
        let tally = self.tally.lock().await;
        match (tally.opened, tally.last_failure) {
            (false, _) => CircuitState::Closed,
            (true, Some(last)) if last.elapsed() >= self.config.reset_timeout => {
                CircuitState::HalfOpen
            }
            (true, _) => CircuitState::Open,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_millis(100),
            reset_timeout: Duration::from_millis(50),
            close_after_successes: 2,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(async { Err::<(), _>("down") }).await;
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            reset_timeout: Duration::from_secs(30),
            ..fast_config(2)
        });
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let mut executed = false;
        let result = cb
            .call(async {
                executed = true;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
        assert!(!executed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(fast_config(1));
        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_recovers_after_successes() {
        let cb = CircuitBreaker::new(fast_config(1));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        for _ in 0..2 {
            assert!(cb.call(async { Ok::<_, &str>(1) }).await.is_ok());
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(fast_config(1));
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
