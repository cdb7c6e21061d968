//! Backoff and retry policy abstractions (module C1).
//!
//! `BackoffPolicy` produces the delay before a given attempt; `RetryPolicy`
//! decides whether a given (attempt, error) pair justifies another attempt.
//! Both are pure functions of their inputs plus whatever internal state an
//! implementation carries (e.g. a jitter RNG) — neither may block on I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Produces the delay to wait before a given attempt. Attempts start at 1.
pub trait BackoffPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Implemented by backoff policies that carry attempt-count state the
/// consume-loop driver resets after a success.
pub trait Resettable {
    fn reset(&self);
}

/// Decides whether attempt `attempt` (which just failed with `err`) should
/// be retried. Receives the cancellation token so an implementation may
/// honor an external deadline, but must never block on I/O itself.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn should_retry(&self, ctx: &CancellationToken, attempt: u32, err: &anyhow::Error) -> bool;
}

/// Default exponential backoff: 100ms initial, x2 multiplier, 30s cap,
/// +/-10% jitter per call. All parameters are overridable per call-site.
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.10,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            multiplier,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = self.multiplier.powi((attempt - 1) as i32);
        let base_ms = (self.initial.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter_span = base_ms * self.jitter;
        let delta = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };

        let jittered = (base_ms + delta).max(0.0);
        Duration::from_millis(jittered.min(self.max.as_millis() as f64) as u64)
    }
}

/// A fixed delay on every attempt, resettable (used by scenario S2: a
/// resettable backoff whose `reset()` call the consume-loop driver is
/// expected to invoke after a success).
pub struct FixedBackoff {
    delay: Duration,
    reset_count: AtomicU64,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            reset_count: AtomicU64::new(0),
        }
    }

    /// Number of times `reset()` has been called; exposed for tests.
    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::SeqCst)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

impl Resettable for FixedBackoff {
    fn reset(&self) {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Retries up to `max_attempts` times (so the handler runs at most
/// `max_attempts + 1` times total) unless the context is already cancelled.
pub struct MaxAttemptsRetryPolicy {
    max_attempts: u32,
}

impl MaxAttemptsRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

#[async_trait]
impl RetryPolicy for MaxAttemptsRetryPolicy {
    async fn should_retry(&self, ctx: &CancellationToken, attempt: u32, _err: &anyhow::Error) -> bool {
        !ctx.is_cancelled() && attempt <= self.max_attempts
    }
}

/// Never retries; attempt 1 is the only attempt made.
pub struct NoRetryPolicy;

#[async_trait]
impl RetryPolicy for NoRetryPolicy {
    async fn should_retry(&self, _ctx: &CancellationToken, _attempt: u32, _err: &anyhow::Error) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_attempt_one_within_jitter_band() {
        let backoff = ExponentialBackoff::default();
        let delay = backoff.next_delay(1);
        assert!(delay >= Duration::from_millis(90) && delay <= Duration::from_millis(110));
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let backoff = ExponentialBackoff::default();
        let delay = backoff.next_delay(20);
        assert!(delay <= Duration::from_millis(33_000));
    }

    #[test]
    fn fixed_backoff_is_resettable() {
        let backoff = FixedBackoff::new(Duration::from_millis(10));
        assert_eq!(backoff.reset_count(), 0);
        backoff.reset();
        backoff.reset();
        assert_eq!(backoff.reset_count(), 2);
        assert_eq!(backoff.next_delay(5), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn max_attempts_retry_policy_denies_after_limit() {
        let policy = MaxAttemptsRetryPolicy::new(2);
        let ctx = CancellationToken::new();
        let err = anyhow::anyhow!("boom");
        assert!(policy.should_retry(&ctx, 1, &err).await);
        assert!(policy.should_retry(&ctx, 2, &err).await);
        assert!(!policy.should_retry(&ctx, 3, &err).await);
    }

    #[tokio::test]
    async fn max_attempts_retry_policy_denies_on_cancellation() {
        let policy = MaxAttemptsRetryPolicy::new(5);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = anyhow::anyhow!("boom");
        assert!(!policy.should_retry(&ctx, 1, &err).await);
    }

    #[tokio::test]
    async fn no_retry_policy_never_retries() {
        let policy = NoRetryPolicy;
        let ctx = CancellationToken::new();
        let err = anyhow::anyhow!("boom");
        assert!(!policy.should_retry(&ctx, 1, &err).await);
    }
}
