//! Adapter over an externally injected lock factory (module C3). Useful
//! when a host application already has its own distributed-lock client
//! (etcd, ZooKeeper, a bespoke service) and wants to plug it into the
//! scheduler without xcron knowing its wire protocol.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xcron_core::XCronError;

use crate::lock::{validate_ttl, BoxedLockHandle, LockHandle, LockProvider};

/// A handle produced by an external factory. `extend` is whatever the
/// factory calls lease renewal internally; it ignores the TTL the caller
/// passes in, since the factory uses its own configured TTL.
#[async_trait]
pub trait ExternalLockHandle: Send + Sync {
    async fn extend(&self) -> Result<(), XCronError>;
    async fn release(&self) -> Result<(), XCronError>;
    fn key(&self) -> &str;
    fn token(&self) -> &str;
}

/// An injected factory that produces `ExternalLockHandle`s. `try_acquire`
/// must be non-blocking: `Ok(None)` means "held by another party".
#[async_trait]
pub trait ExternalLockFactory: Send + Sync {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn ExternalLockHandle>>, XCronError>;
}

pub struct ExternalLockAdapter<F: ExternalLockFactory> {
    factory: F,
}

impl<F: ExternalLockFactory> ExternalLockAdapter<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F: ExternalLockFactory + 'static> LockProvider for ExternalLockAdapter<F> {
    async fn try_lock(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<BoxedLockHandle>, XCronError> {
        validate_ttl(ttl)?;
        let Some(inner) = self.factory.try_acquire(key, ttl).await? else {
            return Ok(None);
        };
        Ok(Some(Box::new(ExternalLockHandleAdapter { inner })))
    }
}

struct ExternalLockHandleAdapter {
    inner: Box<dyn ExternalLockHandle>,
}

#[async_trait]
impl LockHandle for ExternalLockHandleAdapter {
    async fn unlock(&self, _ctx: &CancellationToken) -> Result<(), XCronError> {
        self.inner.release().await
    }

    async fn renew(&self, _ctx: &CancellationToken, _ttl: Duration) -> Result<(), XCronError> {
        // The external factory's handles are always extended using the
        // factory's own configured TTL; the renewal TTL parameter is
        // intentionally unused here (spec.md §4.3).
        self.inner.extend().await
    }

    fn key(&self) -> &str {
        self.inner.key()
    }

    fn token(&self) -> &str {
        self.inner.token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeHandle {
        key: String,
        token: String,
        extend_calls: Arc<AtomicU32>,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ExternalLockHandle for FakeHandle {
        async fn extend(&self) -> Result<(), XCronError> {
            self.extend_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release(&self) -> Result<(), XCronError> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn key(&self) -> &str {
            &self.key
        }
        fn token(&self) -> &str {
            &self.token
        }
    }

    struct FakeFactory {
        extend_calls: Arc<AtomicU32>,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ExternalLockFactory for FakeFactory {
        async fn try_acquire(
            &self,
            key: &str,
            _ttl: Duration,
        ) -> Result<Option<Box<dyn ExternalLockHandle>>, XCronError> {
            Ok(Some(Box::new(FakeHandle {
                key: key.to_string(),
                token: "factory-token".to_string(),
                extend_calls: self.extend_calls.clone(),
                released: self.released.clone(),
            })))
        }
    }

    #[tokio::test]
    async fn renew_maps_to_extend_and_ignores_ttl_param() {
        let extend_calls = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let adapter = ExternalLockAdapter::new(FakeFactory {
            extend_calls: extend_calls.clone(),
            released: released.clone(),
        });
        let ctx = CancellationToken::new();

        let handle = adapter
            .try_lock(&ctx, "job", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        handle.renew(&ctx, Duration::from_secs(999)).await.unwrap();
        assert_eq!(extend_calls.load(Ordering::SeqCst), 1);

        handle.unlock(&ctx).await.unwrap();
        assert!(released.load(Ordering::SeqCst));
    }
}
