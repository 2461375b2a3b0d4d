//! Per-operation circuit breakers.
//!
//! Closed: calls pass through; consecutive failures inside the monitor window
//! are counted. Reaching the threshold opens the breaker.
//! Open: calls are rejected without invoking the operation until the reset
//! timeout elapses.
//! HalfOpen: exactly one trial call is admitted. Success closes the breaker,
//! failure re-opens it for another reset timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Failures further apart than this do not accumulate.
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitor_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. Dropping it without reporting an outcome
/// (e.g. the caller's future was cancelled) releases a half-open probe slot.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, promoting Open to HalfOpen once the reset timeout passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    info!("Circuit breaker '{}' half-open, admitting a trial call", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                }
            }
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Admission {
                breaker: self,
                probe: false,
                settled: false,
            }),
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.probe_in_flight => None,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Some(Admission {
                    breaker: self,
                    probe: true,
                    settled: false,
                })
            }
        }
    }

    fn on_success(&self, admission: &mut Admission<'_>) {
        admission.settled = true;
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker '{}' closed after successful call", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn on_failure(&self, admission: &mut Admission<'_>) {
        admission.settled = true;
        let now = Instant::now();
        let mut inner = self.lock();

        if admission.probe {
            warn!("Circuit breaker '{}' trial call failed, re-opening", self.name);
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.last_failure_at = Some(now);
            inner.probe_in_flight = false;
            return;
        }

        let within_window = inner
            .last_failure_at
            .is_some_and(|last| now.duration_since(last) <= self.config.monitor_window);
        inner.consecutive_failures = if within_window {
            inner.consecutive_failures + 1
        } else {
            1
        };
        inner.last_failure_at = Some(now);

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            warn!(
                "Circuit breaker '{}' opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// Runs `operation` through the breaker. When the breaker rejects the call
    /// the operation is never constructed.
    pub async fn call<T, E, Op, Fut>(&self, operation: Op) -> Result<T, CircuitError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut admission) = self.admit() else {
            return Err(CircuitError::Open {
                name: self.name.clone(),
            });
        };

        match operation().await {
            Ok(value) => {
                self.on_success(&mut admission);
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&mut admission);
                Err(CircuitError::Inner(error))
            }
        }
    }
}

/// Named breakers shared across the process, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "resume-processing",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(30),
                monitor_window: Duration::from_secs(60),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_short_circuits() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            assert!(matches!(fail(&b, &calls).await, Err(CircuitError::Inner(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let rejected = succeed(&b, &calls).await;
        assert!(matches!(rejected, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "operation must not run while open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        assert!(succeed(&b, &calls).await.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(fail(&b, &calls).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&b, &calls).await, Err(CircuitError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_admitted() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&b, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let probe = b.admit().expect("first probe admitted");
        assert!(b.admit().is_none(), "second concurrent probe rejected");
        drop(probe);
        assert!(b.admit().is_some(), "abandoned probe frees the slot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        let calls = AtomicU32::new(0);
        let _ = fail(&b, &calls).await;
        let _ = fail(&b, &calls).await;
        succeed(&b, &calls).await.unwrap();
        let _ = fail(&b, &calls).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_named_breakers() {
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
        let a = breakers.get("resume-processing");
        let b = breakers.get("resume-processing");
        assert!(Arc::ptr_eq(&a, &b));
        breakers.get("blob-download");
        let names: Vec<_> = breakers.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["blob-download", "resume-processing"]);
    }
}
