use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Fails fast when an upstream is persistently failing: closed → open after
/// `failure_threshold` consecutive failures, open → half-open once
/// `recovery_timeout` elapses, half-open → closed on a successful trial
/// call (→ open again on a failed one).
#[derive(Debug)]
pub struct CircuitBreaker {
    api: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(api: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            api: api.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate before every outbound call. O(1); while open it returns
    /// `CircuitOpen` without touching the network. At most one caller is
    /// admitted as the half-open trial.
    pub async fn check(&self) -> Result<(), IngestError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    tracing::warn!(
                        api = self.api.as_str(),
                        "Circuit half-open; admitting a trial request"
                    );
                    Ok(())
                } else {
                    Err(IngestError::CircuitOpen {
                        api: self.api.clone(),
                    })
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(api = self.api.as_str(), "Circuit closed after trial success");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(api = self.api.as_str(), "Trial request failed; circuit re-opened");
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.state == CircuitState::Closed
                    && inner.consecutive_failures >= self.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        api = self.api.as_str(),
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test-api", threshold, Duration::from_millis(recovery_ms))
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 60_000);
        for _ in 0..2 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let err = breaker.check().await.expect_err("must fail fast");
        assert!(matches!(err, IngestError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = breaker(3, 60_000);
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_closes_on_success() {
        let breaker = breaker(1, 100);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;
        breaker.check().await.expect("trial admitted");
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_reopens_on_failure() {
        let breaker = breaker(1, 100);
        breaker.record_failure().await;

        tokio::time::advance(Duration::from_millis(150)).await;
        breaker.check().await.expect("trial admitted");
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Still open: the recovery window restarts from the re-open.
        let err = breaker.check().await.expect_err("fail fast again");
        assert!(matches!(err, IngestError::CircuitOpen { .. }));
    }
}
