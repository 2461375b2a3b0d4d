//! Exponential backoff with jitter, as an explicit higher-order function.
//!
//! Only errors that report themselves as retryable consume the attempt budget.
//! Everything else is returned after the first failure.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use tracing::warn;

use crate::errors::ParsingError;

/// Lets the retry loop ask an error whether another attempt is worthwhile.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ParsingError {
    fn is_retryable(&self) -> bool {
        ParsingError::is_retryable(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f32,
    pub max_delay: Duration,
    /// Adds a random share of up to one extra delay to every backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// base × multiplier^(n-1) per retry, capped at `max_delay`, with one
    /// delay fewer than there are attempts.
    pub fn backoff(&self) -> ExponentialBuilder {
        let retries = self.max_attempts.max(1) - 1;
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.multiplier)
            .with_max_delay(self.max_delay)
            .with_max_times(retries as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Successful result plus the number of attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final error plus the number of attempts consumed before giving up.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent.
///
/// `operation` receives the 1-based attempt number. `on_retry` is awaited with
/// the failed attempt number whenever another attempt will follow.
pub async fn retry_with_backoff<T, E, Op, OpFut, Hook, HookFut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: Op,
    on_retry: Hook,
) -> Result<Retried<T>, Exhausted<E>>
where
    E: Retryable + std::fmt::Display,
    Op: FnMut(u32) -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Hook: Fn(&E, u32) -> HookFut,
    HookFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let attempts = &AtomicU32::new(0);
    let on_retry = &on_retry;

    let attempt_once = || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let call = operation(attempt);
        async move {
            let result = call.await;
            if let Err(error) = &result {
                if error.is_retryable() && attempt < max_attempts {
                    on_retry(error, attempt).await;
                }
            }
            result
        }
    };

    let result = attempt_once
        .retry(policy.backoff())
        .when(|error: &E| error.is_retryable())
        .notify(|error: &E, delay: Duration| {
            warn!(
                "{} attempt {}/{} failed: {}; retrying after {}ms",
                operation_name,
                attempts.load(Ordering::SeqCst),
                max_attempts,
                error,
                delay.as_millis()
            );
        })
        .await;

    let attempts = attempts.load(Ordering::SeqCst);
    result
        .map(|value| Retried { value, attempts })
        .map_err(|error| Exhausted { error, attempts })
}

#[cfg(test)]
mod tests {
    use backon::BackoffBuilder;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn transient() -> ParsingError {
        ParsingError::AiParsing {
            message: "timeout".into(),
            retryable: true,
        }
    }

    #[test]
    fn test_delay_schedule_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            max_delay: Duration::from_secs(3),
            ..no_jitter()
        };
        let delays: Vec<Duration> = policy.backoff().build().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff().build().count(), 0);
    }

    #[test]
    fn test_jitter_only_lengthens_delays() {
        for _ in 0..100 {
            let delays: Vec<Duration> = RetryPolicy::default().backoff().build().collect();
            assert_eq!(delays.len(), 2);
            assert!(delays[0] >= Duration::from_secs(1), "{:?}", delays[0]);
            assert!(delays[0] <= Duration::from_secs(2), "{:?}", delays[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let hooks = &AtomicU32::new(0);
        let result = retry_with_backoff(
            &no_jitter(),
            "test",
            move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            },
            move |_: &ParsingError, _| {
                hooks.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let hooks = &AtomicU32::new(0);
        let err = retry_with_backoff(
            &no_jitter(),
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            },
            move |_: &ParsingError, _| {
                hooks.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The final failure is not followed by a retry.
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_first_time() {
        let calls = &AtomicU32::new(0);
        let err = retry_with_backoff(
            &no_jitter(),
            "test",
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ParsingError::FileValidation("invalid type".into()))
            },
            |_: &ParsingError, _| async {},
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err.error, ParsingError::FileValidation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let _ = retry_with_backoff(
            &no_jitter(),
            "test",
            |_| async { Err::<(), _>(transient()) },
            |_: &ParsingError, _| async {},
        )
        .await;
        // 1s + 2s of backoff for three attempts
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
