//! Lock abstraction (module C2).
//!
//! ```text
//! try_lock(ctx, key, ttl) -> (handle | None, err)
//! handle.unlock(ctx)      -> err
//! handle.renew(ctx, ttl)  -> err
//! handle.key()            -> &str
//! ```
//!
//! `try_lock` MUST be non-blocking: `Ok(None)` means "held by another party —
//! not an error"; `Err` means the lock service itself is faulty. Every
//! successful acquisition mints a fresh, unique token so two concurrent
//! acquirers from the same process never share a lease — the classic bug
//! where one goroutine's `unlock` revokes a sibling's lock.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xcron_core::XCronError;

/// Proof of a successful `try_lock`. Operating on an expired or stolen lock
/// (one whose token no longer matches what the provider holds) returns
/// `XCronError::LockNotHeld` rather than silently succeeding or panicking.
#[async_trait]
pub trait LockHandle: Send + Sync {
    async fn unlock(&self, ctx: &CancellationToken) -> Result<(), XCronError>;
    async fn renew(&self, ctx: &CancellationToken, ttl: Duration) -> Result<(), XCronError>;
    fn key(&self) -> &str;
    /// The per-acquisition unique token stored as the lock's value (for
    /// diagnostics and tests; never used to "prove" ownership in caller
    /// code since only the handle itself can act as that proof).
    fn token(&self) -> &str;
}

pub type BoxedLockHandle = Box<dyn LockHandle>;

/// A mutual-exclusion lock provider. `try_lock` must never block on
/// contention; it returns immediately with `Ok(None)` when the key is held
/// by someone else.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn try_lock(
        &self,
        ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<BoxedLockHandle>, XCronError>;

    /// Marker used by the scheduler to decide whether `name != ""` must be
    /// enforced (spec's `Closed`-sentinel marker interface for the no-op
    /// lock). Only the no-op implementation overrides this to `true`.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Rejects non-positive TTLs up front; every provider's `try_lock` should
/// call this before doing any I/O.
pub fn validate_ttl(ttl: Duration) -> Result<(), XCronError> {
    if ttl.is_zero() {
        return Err(XCronError::InvalidTTL);
    }
    Ok(())
}

/// Optional capability: a lock provider that can report its own health.
/// Modeled as a separate trait (rather than a method on `LockProvider` with
/// a default no-op) so the health checker's "is this capability present"
/// question is answered by explicit configuration instead of runtime
/// downcasting — see DESIGN.md's note on this Open Question.
#[async_trait]
pub trait LockHealthCheck: Send + Sync {
    async fn health(&self, ctx: &CancellationToken) -> Result<(), String>;
}

/// Builds the per-acquisition token `<identity>:<uuid>` every provider uses
/// as its stored lock value.
pub fn new_token(identity: &str) -> String {
    format!("{identity}:{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ttl_rejects_zero() {
        assert_eq!(validate_ttl(Duration::ZERO), Err(XCronError::InvalidTTL));
        assert!(validate_ttl(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn tokens_are_unique() {
        let a = new_token("host-1");
        let b = new_token("host-1");
        assert_ne!(a, b);
        assert!(a.starts_with("host-1:"));
    }
}
