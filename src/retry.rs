// src/retry.rs
//! Bounded exponential backoff for transient port failures.

use std::future::Future;
use std::time::Duration;

use metrics::counter;

use crate::error::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no sleeping. Used by tests and fakes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base * 2^(attempt-1)`, or the upstream hint, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        hint.unwrap_or_else(|| self.base_delay.saturating_mul(1u32 << exp))
            .min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails permanently, or the budget runs out.
/// Only `RateLimited` and `Transport` are retried.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T, PortError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PortError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts.max(1) => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient failure, backing off");
                counter!("port_retries_total", "op" => op.to_string()).increment(1);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1, None), Duration::from_millis(500));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3, None), Duration::from_millis(2000));
        assert_eq!(p.delay_for(20, None), Duration::from_secs(30));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(7))), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let hits = AtomicU32::new(0);
        let calls = &hits;
        let out = with_backoff(&RetryPolicy::immediate(3), "test", move || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(PortError::Transport("reset".into())),
                1 => Err(PortError::RateLimited { retry_after: None }),
                _ => Ok(42),
            }
        })
        .await;
        assert_eq!(out, Ok(42));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_is_not_retried() {
        let hits = AtomicU32::new(0);
        let calls = &hits;
        let out: Result<(), _> = with_backoff(&RetryPolicy::immediate(5), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PortError::Auth("bad key".into()))
        })
        .await;
        assert!(matches!(out, Err(PortError::Auth(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_is_bounded() {
        let hits = AtomicU32::new(0);
        let calls = &hits;
        let out: Result<(), _> = with_backoff(&RetryPolicy::immediate(2), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PortError::Transport("down".into()))
        })
        .await;
        assert!(matches!(out, Err(PortError::Transport(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
