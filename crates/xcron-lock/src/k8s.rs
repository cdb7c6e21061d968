//! Kubernetes Lease lock (module C3), built on the
//! `coordination.k8s.io/v1` `Lease` resource via `kube`/`k8s-openapi`.
//!
//! No repo in the retrieved pack implements this primitive directly; `kube`
//! + `k8s-openapi` are the standard ecosystem crates for talking to this
//! API (see DESIGN.md).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use xcron_core::XCronError;

use crate::lock::{new_token, validate_ttl, BoxedLockHandle, LockHandle, LockHealthCheck, LockProvider};

pub const DEFAULT_PREFIX: &str = "xcron-";
const MAX_LEASE_NAME_LEN: usize = 63;

/// How much clock skew between the acquirer and the previous holder to
/// tolerate before considering a lease expired. A raw value of `None`
/// means "use the 2s default"; a negative value disables the tolerance
/// entirely; a raw value of exactly zero also falls back to the default
/// (spec.md §4.3: "zero falls back to default").
pub fn resolve_clock_skew(raw_ms: Option<i64>) -> Duration {
    match raw_ms {
        None => Duration::from_secs(2),
        Some(v) if v < 0 => Duration::ZERO,
        Some(0) => Duration::from_secs(2),
        Some(v) => Duration::from_millis(v as u64),
    }
}

/// Lowercases, replaces any `[^a-z0-9-]` run with `-`, collapses repeats,
/// trims leading/trailing `-`, and — if cleaning altered the string or the
/// cleaned result would not fit in `63 - prefix_len` bytes — appends
/// `-<8 hex chars of SHA-256(original)>` so two keys that clean to the same
/// string (e.g. `my.job` and `my/job`) don't collide.
pub fn sanitize_lease_name(original: &str, prefix_len: usize) -> String {
    let lower = original.to_lowercase();
    let mut cleaned = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for c in lower.chars() {
        let out = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if out == '-' && last_was_dash {
            continue;
        }
        last_was_dash = out == '-';
        cleaned.push(out);
    }
    let trimmed = cleaned.trim_matches('-').to_string();

    let max_len = MAX_LEASE_NAME_LEN.saturating_sub(prefix_len);
    let altered = trimmed != original;
    let needs_hash = altered || trimmed.len() > max_len;

    if !needs_hash {
        return trimmed;
    }

    let mut hasher = Sha256::new();
    hasher.update(original.as_bytes());
    let digest = hasher.finalize();
    let hash8 = hex8(&digest);
    let suffix = format!("-{hash8}");

    let budget = max_len.saturating_sub(suffix.len());
    let base: String = trimmed.chars().take(budget).collect();
    let base = base.trim_end_matches('-');
    format!("{base}{suffix}")
}

fn hex8(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

pub struct KubernetesLeaseLock {
    client: kube::Client,
    namespace: String,
    prefix: String,
    identity: String,
    clock_skew: Duration,
}

impl KubernetesLeaseLock {
    pub fn new(client: kube::Client, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::with_options(client, namespace, identity, DEFAULT_PREFIX, None)
    }

    pub fn with_options(
        client: kube::Client,
        namespace: impl Into<String>,
        identity: impl Into<String>,
        prefix: impl Into<String>,
        clock_skew_ms: Option<i64>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            prefix: prefix.into(),
            identity: identity.into(),
            clock_skew: resolve_clock_skew(clock_skew_ms),
        }
    }

    fn lease_name(&self, key: &str) -> String {
        let sanitized = sanitize_lease_name(key, self.prefix.len());
        format!("{}{sanitized}", self.prefix)
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn build_lease(&self, name: &str, token: &str, ttl: Duration, now: chrono::DateTime<Utc>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(token.to_string()),
                lease_duration_seconds: Some(ttl.as_secs().max(1) as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl LockProvider for KubernetesLeaseLock {
    async fn try_lock(
        &self,
        _ctx: &CancellationToken,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<BoxedLockHandle>, XCronError> {
        validate_ttl(ttl)?;
        let name = self.lease_name(key);
        let token = new_token(&self.identity);
        let now = Utc::now();
        let api = self.api();

        match api.get(&name).await {
            Err(e) if is_not_found(&e) => {
                let lease = self.build_lease(&name, &token, ttl, now);
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(Some(self.handle(name, token))),
                    Err(e) if is_conflict(&e) => Ok(None),
                    Err(e) => Err(XCronError::LockAcquireFailed(e.to_string())),
                }
            }
            Err(e) => Err(XCronError::LockAcquireFailed(e.to_string())),
            Ok(existing) => {
                let spec = existing.spec.clone().unwrap_or_default();
                let holder_empty = spec
                    .holder_identity
                    .as_deref()
                    .map(str::is_empty)
                    .unwrap_or(true);

                let expired = holder_empty || {
                    let renew_time = spec.renew_time.as_ref().map(|t| t.0).unwrap_or(now);
                    let duration_secs = spec.lease_duration_seconds.unwrap_or(0) as i64;
                    let deadline = renew_time
                        + chrono::Duration::seconds(duration_secs)
                        + chrono::Duration::from_std(self.clock_skew).unwrap_or_default();
                    deadline < now
                };

                if !expired {
                    return Ok(None);
                }

                let mut updated = existing;
                updated.spec = Some(LeaseSpec {
                    holder_identity: Some(token.clone()),
                    lease_duration_seconds: Some(ttl.as_secs().max(1) as i32),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(spec.lease_transitions.unwrap_or(0) + 1),
                    ..Default::default()
                });

                match api.replace(&name, &PostParams::default(), &updated).await {
                    Ok(_) => Ok(Some(self.handle(name, token))),
                    Err(e) if is_conflict(&e) => Ok(None),
                    Err(e) => Err(XCronError::LockAcquireFailed(e.to_string())),
                }
            }
        }
    }
}

impl KubernetesLeaseLock {
    fn handle(&self, name: String, token: String) -> BoxedLockHandle {
        Box::new(KubernetesLeaseHandle {
            api: self.api(),
            name,
            token,
        })
    }
}

struct KubernetesLeaseHandle {
    api: Api<Lease>,
    name: String,
    token: String,
}

impl KubernetesLeaseHandle {
    async fn current_holder_matches(&self) -> Result<Option<Lease>, XCronError> {
        let existing = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| XCronError::LockAcquireFailed(e.to_string()))?;
        let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder == Some(self.token.as_str()) {
            Ok(Some(existing))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl LockHandle for KubernetesLeaseHandle {
    async fn unlock(&self, _ctx: &CancellationToken) -> Result<(), XCronError> {
        let Some(mut existing) = self.current_holder_matches().await? else {
            return Err(XCronError::LockNotHeld);
        };
        existing.spec = Some(LeaseSpec::default());
        match self.api.replace(&self.name, &PostParams::default(), &existing).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(XCronError::LockNotHeld),
            Err(e) => Err(XCronError::LockAcquireFailed(e.to_string())),
        }
    }

    async fn renew(&self, _ctx: &CancellationToken, ttl: Duration) -> Result<(), XCronError> {
        validate_ttl(ttl)?;
        let Some(mut existing) = self.current_holder_matches().await? else {
            return Err(XCronError::LockNotHeld);
        };
        let now = Utc::now();
        if let Some(spec) = existing.spec.as_mut() {
            spec.renew_time = Some(MicroTime(now));
            spec.lease_duration_seconds = Some(ttl.as_secs().max(1) as i32);
        }
        match self.api.replace(&self.name, &PostParams::default(), &existing).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(XCronError::LockNotHeld),
            Err(e) => Err(XCronError::LockAcquireFailed(e.to_string())),
        }
    }

    fn key(&self) -> &str {
        &self.name
    }

    fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
impl LockHealthCheck for KubernetesLeaseLock {
    async fn health(&self, _ctx: &CancellationToken) -> Result<(), String> {
        self.api()
            .list(&Default::default())
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(error = %e, "kubernetes lease lock health check failed");
                e.to_string()
            })
    }
}

/// Reads `POD_NAMESPACE` (default `default`) and `POD_NAME` (default
/// `<hostname>:<pid>`) the way the lock's identity/namespace defaults are
/// documented in spec.md §6.
pub fn identity_from_env() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("{host}:{}", std::process::id())
    })
}

pub fn namespace_from_env() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_chars() {
        let sanitized = sanitize_lease_name("My.Job", 6);
        assert!(sanitized.starts_with("my-job-"));
        assert_eq!(sanitized.len(), "my-job-".len() + 8);
    }

    #[test]
    fn sanitize_collision_produces_distinct_names() {
        let a = sanitize_lease_name("my.job", 6);
        let b = sanitize_lease_name("my/job", 6);
        assert_ne!(a, b);
        assert!(a.len() + 6 <= 63);
        assert!(b.len() + 6 <= 63);
    }

    #[test]
    fn sanitize_clean_name_unchanged_without_hash() {
        assert_eq!(sanitize_lease_name("clean-name", 6), "clean-name");
    }

    #[test]
    fn sanitize_truncates_overlong_names() {
        let long = "a".repeat(100);
        let sanitized = sanitize_lease_name(&long, 6);
        assert!(sanitized.len() + 6 <= 63);
        assert!(sanitized.contains('-'));
    }

    #[test]
    fn clock_skew_defaults_and_overrides() {
        assert_eq!(resolve_clock_skew(None), Duration::from_secs(2));
        assert_eq!(resolve_clock_skew(Some(0)), Duration::from_secs(2));
        assert_eq!(resolve_clock_skew(Some(-1)), Duration::ZERO);
        assert_eq!(resolve_clock_skew(Some(500)), Duration::from_millis(500));
    }
}
