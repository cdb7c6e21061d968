//! Pluggable non-blocking mutual-exclusion locks used by the scheduler's
//! job wrapper (modules C2/C3): a no-op for single-replica deployments, a
//! Redis implementation, a Kubernetes Lease implementation, and an adapter
//! over an externally injected lock factory.

pub mod external;
pub mod lock;
pub mod noop;

#[cfg(feature = "redis-lock")]
pub mod redis;

#[cfg(feature = "k8s-lock")]
pub mod k8s;

pub use lock::{new_token, validate_ttl, BoxedLockHandle, LockHandle, LockHealthCheck, LockProvider};
pub use noop::NoopLock;

#[cfg(feature = "redis-lock")]
pub use self::redis::RedisLock;

#[cfg(feature = "k8s-lock")]
pub use self::k8s::KubernetesLeaseLock;
