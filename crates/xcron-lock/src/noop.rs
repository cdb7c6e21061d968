//! The no-op lock: `try_lock` always succeeds, `unlock`/`renew` always
//! succeed. Intended for single-replica deployments where mutual exclusion
//! across processes is unnecessary.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xcron_core::XCronError;

use crate::lock::{new_token, validate_ttl, BoxedLockHandle, LockHandle, LockProvider};

#[derive(Debug, Default, Clone)]
pub struct NoopLock;

impl NoopLock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LockProvider for NoopLock {
    async fn try_lock(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<BoxedLockHandle>, XCronError> {
        validate_ttl(ttl)?;
        Ok(Some(Box::new(NoopLockHandle {
            key: key.to_string(),
            token: new_token("noop"),
        })))
    }

    fn is_noop(&self) -> bool {
        true
    }
}

struct NoopLockHandle {
    key: String,
    token: String,
}

#[async_trait]
impl LockHandle for NoopLockHandle {
    async fn unlock(&self, _ctx: &CancellationToken) -> Result<(), XCronError> {
        Ok(())
    }

    async fn renew(&self, _ctx: &CancellationToken, ttl: Duration) -> Result<(), XCronError> {
        validate_ttl(ttl)
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn token(&self) -> &str {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_lock_always_acquires() {
        let lock = NoopLock::new();
        let ctx = CancellationToken::new();
        let a = lock.try_lock(&ctx, "job-a", Duration::from_secs(5)).await.unwrap();
        let b = lock.try_lock(&ctx, "job-a", Duration::from_secs(5)).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(lock.is_noop());
    }

    #[tokio::test]
    async fn noop_lock_rejects_zero_ttl() {
        let lock = NoopLock::new();
        let ctx = CancellationToken::new();
        let result = lock.try_lock(&ctx, "job-a", Duration::ZERO).await;
        assert_eq!(result.unwrap_err(), XCronError::InvalidTTL);
    }

    #[tokio::test]
    async fn noop_handle_unlock_and_renew_always_succeed() {
        let lock = NoopLock::new();
        let ctx = CancellationToken::new();
        let handle = lock
            .try_lock(&ctx, "job-a", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.key(), "job-a");
        assert!(handle.renew(&ctx, Duration::from_secs(5)).await.is_ok());
        assert!(handle.unlock(&ctx).await.is_ok());
    }
}
