use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    error::{ErrorCategory, ProviderError},
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState},
};

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Generation of the half-open trial call currently running.
    trial_in_flight: Option<u64>,
    trials: u64,
    opened_at: Option<Instant>,
    window_total: u32,
    window_failures: u32,
}

/// Permission to make one call. A half-open trial call is released when this drops, so a call
/// abandoned midway does not hold the circuit half-open.
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl Admission<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial {
            let mut inner = self.breaker.lock();
            if inner.trial_in_flight == Some(generation) {
                inner.trial_in_flight = None;
            }
        }
    }
}

/// In-process circuit breaker shared by every worker of one channel.
///
/// While half-open only one trial call is in flight; concurrent callers are turned away.
pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service_name = service_name.into();
        info!(service = %service_name, "Circuit breaker initialized");

        Self {
            service_name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                trial_in_flight: None,
                trials: 0,
                opened_at: None,
                window_total: 0,
                window_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // state is plain counters, a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.config.reset_timeout_secs)
    }

    /// Time left before an open circuit admits a trial call.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(self.reset_timeout().saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }

    /// Admits a call, moving an expired open circuit to half-open.
    pub fn try_acquire(&self) -> Result<Admission<'_>, ProviderError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let expired = inner
                .opened_at
                .map(|t| t.elapsed() >= self.reset_timeout())
                .unwrap_or(true);

            if !expired {
                debug!(service = %self.service_name, "Circuit breaker is open, rejecting call");
                return Err(ProviderError::CircuitOpen(self.service_name.clone()));
            }

            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.trial_in_flight = None;
            info!(service = %self.service_name, "Circuit breaker attempting reset");
        }

        if inner.state != CircuitState::HalfOpen {
            return Ok(Admission {
                breaker: self,
                trial: None,
            });
        }

        if inner.trial_in_flight.is_some() {
            debug!(service = %self.service_name, "Recovery call in flight, rejecting call");
            return Err(ProviderError::CircuitOpen(self.service_name.clone()));
        }

        inner.trials += 1;
        inner.trial_in_flight = Some(inner.trials);
        Ok(Admission {
            breaker: self,
            trial: inner.trial_in_flight,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        Self::update_window(&mut inner, false, self.config.window_size);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    service = %self.service_name,
                    successes = inner.half_open_successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if inner.half_open_successes >= self.config.success_threshold {
                    Self::close(&mut inner);
                    info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        Self::update_window(&mut inner, true, self.config.window_size);

        match inner.state {
            CircuitState::HalfOpen => {
                Self::open(&mut inner);
                warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                debug!(
                    service = %self.service_name,
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner);
                    warn!(
                        service = %self.service_name,
                        failures = self.config.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                } else if self.failure_rate_exceeded(&inner) {
                    let rate = inner.window_failures * 100 / inner.window_total.max(1);
                    Self::open(&mut inner);
                    warn!(service = %self.service_name, rate, "Circuit breaker opened due to failure rate");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Runs `operation` through the breaker. Only infrastructure faults count as failures;
    /// a provider that answers with a rejection is healthy.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let _admission = self.try_acquire()?;

        match operation().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                if Self::trips(&e) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(e)
            }
        }
    }

    fn trips(error: &ProviderError) -> bool {
        matches!(
            error.category(),
            ErrorCategory::Timeout
                | ErrorCategory::Transport
                | ErrorCategory::ServerError
                | ErrorCategory::RateLimited
        )
    }

    fn failure_rate_exceeded(&self, inner: &BreakerState) -> bool {
        match self.config.failure_rate_threshold {
            Some(threshold) if inner.window_total >= self.config.minimum_samples => {
                inner.window_failures * 100 >= threshold * inner.window_total
            }
            _ => false,
        }
    }

    fn update_window(inner: &mut BreakerState, failure: bool, window_size: u32) {
        if inner.window_total >= window_size.max(1) {
            inner.window_total = 0;
            inner.window_failures = 0;
        }
        inner.window_total += 1;
        if failure {
            inner.window_failures += 1;
        }
    }

    fn open(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.trial_in_flight = None;
    }

    fn close(inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.trial_in_flight = None;
        inner.window_total = 0;
        inner.window_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, reset_timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "email",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 1,
                reset_timeout_secs,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker(3, 60);

        for _ in 0..3 {
            let result: Result<(), _> = breaker
                .call(|| async { Err(ProviderError::Timeout(10)) })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.retry_after().is_some());

        let mut called = false;
        let result = breaker
            .call(|| {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert_eq!(result, Err(ProviderError::CircuitOpen("email".into())));
        assert!(!called, "open circuit must not reach the provider");
    }

    #[tokio::test]
    async fn test_rejections_do_not_trip() {
        let breaker = breaker(2, 60);

        for _ in 0..5 {
            let _: Result<(), _> = breaker
                .call(|| async {
                    Err(ProviderError::Rejected {
                        status: 400,
                        message: "invalid email address".into(),
                    })
                })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_on_success() {
        let breaker = breaker(1, 0);

        let _: Result<(), _> = breaker
            .call(|| async { Err(ProviderError::Transport("reset".into())) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // zero reset timeout: the next call is a half-open trial call
        let result = breaker.call(|| async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 0);
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_one_call_at_a_time() {
        let breaker = CircuitBreaker::new(
            "chat",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                reset_timeout_secs: 0,
                ..Default::default()
            },
        );
        breaker.record_failure();

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(
            breaker.try_acquire().err(),
            Some(ProviderError::CircuitOpen("chat".into()))
        );

        // an abandoned trial call frees the slot
        drop(trial);
        let result = breaker.call(|| async { Ok::<_, ProviderError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let next = breaker.try_acquire().unwrap();
        assert!(next.is_trial());
    }

    #[test]
    fn test_failure_rate_threshold() {
        let breaker = CircuitBreaker::new(
            "sms",
            CircuitBreakerConfig {
                failure_threshold: 100,
                failure_rate_threshold: Some(50),
                minimum_samples: 4,
                window_size: 10,
                ..Default::default()
            },
        );

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed, "below minimum samples");

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
