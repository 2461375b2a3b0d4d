// Retry and circuit-breaker policies wrapped around fallible async calls.
// Both are plain higher-order functions; callers compose them explicitly.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakers, CircuitError};
pub use retry::{retry_with_backoff, Retried, RetryPolicy};
