//! Redis lock (module C3): `SET key token NX PX ttl` for acquisition, and
//! Lua compare-and-delete / compare-and-expire scripts for unlock/renew so
//! a handle can only ever affect the lease it itself acquired.
//!
//! Grounded on `acteon-state-redis`'s `RedisDistributedLock`, adapted to
//! this crate's non-blocking `LockProvider`/`LockHandle` contract (no
//! polling loop: `try_lock` returns `Ok(None)` immediately on contention
//! instead of retrying until a deadline).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, Script};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use xcron_core::XCronError;

use crate::lock::{new_token, validate_ttl, BoxedLockHandle, LockHandle, LockHealthCheck, LockProvider};

pub const DEFAULT_PREFIX: &str = "xcron:lock:";

/// Deletes the key only if its value still equals the caller's token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Extends the key's TTL only if its value still equals the caller's token.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLock {
    pool: Pool,
    prefix: String,
    identity: String,
    unlock_script: Script,
    renew_script: Script,
}

impl RedisLock {
    pub fn new(pool: Pool, identity: impl Into<String>) -> Self {
        Self::with_prefix(pool, identity, DEFAULT_PREFIX)
    }

    pub fn with_prefix(pool: Pool, identity: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            identity: identity.into(),
            unlock_script: Script::new(UNLOCK_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
        }
    }

    fn redis_key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    async fn conn(&self) -> Result<Connection, XCronError> {
        self.pool
            .get()
            .await
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))
    }
}

#[async_trait]
impl LockProvider for RedisLock {
    async fn try_lock(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<BoxedLockHandle>, XCronError> {
        validate_ttl(ttl)?;
        let redis_key = self.redis_key(key);
        let token = new_token(&self.identity);
        let ttl_ms: i64 = ttl.as_millis().try_into().unwrap_or(i64::MAX);

        let mut conn = self.conn().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(&redis_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map(|reply: Option<String>| reply.is_some())
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(RedisLockHandle {
            pool: self.pool.clone(),
            redis_key,
            token,
            unlock_script: self.unlock_script.clone(),
            renew_script: self.renew_script.clone(),
        })))
    }
}

struct RedisLockHandle {
    pool: Pool,
    redis_key: String,
    token: String,
    unlock_script: Script,
    renew_script: Script,
}

impl RedisLockHandle {
    async fn conn(&self) -> Result<Connection, XCronError> {
        self.pool
            .get()
            .await
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))
    }
}

#[async_trait]
impl LockHandle for RedisLockHandle {
    async fn unlock(&self, _ctx: &CancellationToken) -> Result<(), XCronError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .unlock_script
            .key(&self.redis_key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(XCronError::LockNotHeld)
        }
    }

    async fn renew(&self, _ctx: &CancellationToken, ttl: Duration) -> Result<(), XCronError> {
        validate_ttl(ttl)?;
        let ttl_ms: i64 = ttl.as_millis().try_into().unwrap_or(i64::MAX);
        let mut conn = self.conn().await?;
        let renewed: i64 = self
            .renew_script
            .key(&self.redis_key)
            .arg(&self.token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))?;

        if renewed == 1 {
            Ok(())
        } else {
            Err(XCronError::LockNotHeld)
        }
    }

    fn key(&self) -> &str {
        &self.redis_key
    }

    fn token(&self) -> &str {
        &self.token
    }
}

/// Reports Redis health via `PING`.
#[async_trait]
impl LockHealthCheck for RedisLock {
    async fn health(&self, _ctx: &CancellationToken) -> Result<(), String> {
        let mut conn = self.conn().await.map_err(|e| e.to_string())?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        if pong == "PONG" {
            Ok(())
        } else {
            warn!(reply = %pong, "unexpected PING reply from redis");
            Err(format!("unexpected PING reply: {pong}"))
        }
    }
}

#[cfg(all(test, feature = "redis-lock-integration"))]
mod integration_tests {
    //! Requires a live Redis reachable at `REDIS_URL` (default
    //! `redis://127.0.0.1:6379`). Not run by default `cargo test`.
    use super::*;
    use deadpool_redis::{Config, Runtime};

    fn pool() -> Pool {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        Config::from_url(url).create_pool(Some(Runtime::Tokio1)).unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn mutual_exclusion_on_same_key() {
        let lock = RedisLock::new(pool(), "test-identity");
        let ctx = CancellationToken::new();
        let key = format!("test-{}", uuid::Uuid::new_v4());

        let a = lock.try_lock(&ctx, &key, Duration::from_secs(5)).await.unwrap();
        let b = lock.try_lock(&ctx, &key, Duration::from_secs(5)).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());

        a.unwrap().unlock(&ctx).await.unwrap();
        let c = lock.try_lock(&ctx, &key, Duration::from_secs(5)).await.unwrap();
        assert!(c.is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn cross_handle_isolation() {
        let lock = RedisLock::new(pool(), "test-identity");
        let ctx = CancellationToken::new();
        let key = format!("test-{}", uuid::Uuid::new_v4());

        let a = lock
            .try_lock(&ctx, &key, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let b = lock.try_lock(&ctx, &key, Duration::from_secs(5)).await.unwrap();
        assert!(b.is_some());

        let result = a.unlock(&ctx).await;
        assert_eq!(result.unwrap_err(), XCronError::LockNotHeld);
    }
}
