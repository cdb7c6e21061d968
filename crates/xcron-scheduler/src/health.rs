//! Health checker (module C7): aggregates scheduler + lock-provider health
//! into a tri-state status, serialisable for an HTTP health endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use xcron_lock::LockHealthCheck;

use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: Status,
    pub has_jobs: bool,
    pub registered_jobs: usize,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub detail: std::collections::HashMap<String, String>,
}

const DEFAULT_MIN_EXECUTIONS: u64 = 10;
const DEFAULT_DEGRADED_THRESHOLD: f64 = 0.5;

struct Thresholds {
    min_executions: AtomicU64,
    degraded_threshold: RwLock<f64>,
}

/// Evaluates scheduler + (optional) lock-provider health on demand. Cheap
/// enough to call per HTTP health-check request.
pub struct HealthChecker {
    scheduler: Arc<Scheduler>,
    locker: Option<Arc<dyn LockHealthCheck>>,
    thresholds: Thresholds,
}

impl HealthChecker {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            locker: None,
            thresholds: Thresholds {
                min_executions: AtomicU64::new(DEFAULT_MIN_EXECUTIONS),
                degraded_threshold: RwLock::new(DEFAULT_DEGRADED_THRESHOLD),
            },
        }
    }

    /// Opts into lock-provider health checks (spec's "check locker" option).
    pub fn with_locker(mut self, locker: Arc<dyn LockHealthCheck>) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Silently rejects negative values; defaults stand.
    pub fn set_min_executions(&self, min_executions: i64) {
        if min_executions < 0 {
            return;
        }
        self.thresholds.min_executions.store(min_executions as u64, Ordering::SeqCst);
    }

    /// Silently rejects values outside `[0.0, 1.0]`; defaults stand.
    pub fn set_degraded_threshold(&self, threshold: f64) {
        if !(0.0..=1.0).contains(&threshold) {
            return;
        }
        *self.thresholds.degraded_threshold.write() = threshold;
    }

    pub async fn check(&self, ctx: &CancellationToken) -> HealthCheck {
        let snapshot = self.scheduler.aggregate_stats();
        let jobs = self.scheduler.entries();
        let has_jobs = !jobs.is_empty();

        let mut status = Status::Healthy;
        let mut messages: Vec<String> = Vec::new();
        let mut detail = std::collections::HashMap::new();

        let min_executions = self.thresholds.min_executions.load(Ordering::SeqCst);
        let degraded_threshold = *self.thresholds.degraded_threshold.read();
        if snapshot.total >= min_executions && snapshot.failure_rate() > degraded_threshold {
            status = Status::Degraded;
            messages.push(format!(
                "failure rate {:.2} exceeds threshold {:.2}",
                snapshot.failure_rate(),
                degraded_threshold
            ));
        }

        if !has_jobs {
            messages.push("no jobs registered".to_string());
        }

        if let Some(locker) = &self.locker {
            match locker.health(ctx).await {
                Ok(()) => {
                    detail.insert("locker".to_string(), "ok".to_string());
                }
                Err(err) => {
                    status = Status::Unhealthy;
                    detail.insert("locker".to_string(), err.clone());
                    messages.push(format!("locker unhealthy: {err}"));
                }
            }
        }

        HealthCheck {
            status,
            has_jobs,
            registered_jobs: jobs.len(),
            total: snapshot.total,
            success: snapshot.success,
            failure: snapshot.failure,
            success_rate: snapshot.success_rate(),
            last_execution_at: snapshot.last_execution_at,
            last_error: snapshot.last_error,
            message: messages.join("; "),
            checked_at: Utc::now(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Precision;
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use xcron_lock::NoopLock;

    fn scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(SchedulerConfig {
            precision: Precision::Second,
            default_lock: Arc::new(NoopLock::new()),
            default_lock_ttl: Duration::from_secs(3),
            default_lock_timeout: Duration::from_secs(1),
            default_execution_timeout: Duration::ZERO,
        }))
    }

    #[tokio::test]
    async fn starts_healthy_with_no_jobs() {
        let checker = HealthChecker::new(scheduler());
        let ctx = CancellationToken::new();
        let result = checker.check(&ctx).await;
        assert_eq!(result.status, Status::Healthy);
        assert!(!result.has_jobs);
        assert!(result.message.contains("no jobs registered"));
    }

    #[tokio::test]
    async fn degrades_when_failure_rate_exceeds_threshold() {
        let sched = scheduler();
        let job = crate::job::job_from_fn(|_ctx| async { Err(anyhow::anyhow!("boom")) });
        sched
            .add_job("failing", "@every 1h", job)
            .retry_policy(Arc::new(xcron_core::NoRetryPolicy))
            .immediate()
            .register()
            .unwrap();

        for _ in 0..50 {
            if sched.aggregate_stats().total >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let checker = HealthChecker::new(sched);
        checker.set_min_executions(1);
        let ctx = CancellationToken::new();
        let result = checker.check(&ctx).await;
        assert_eq!(result.status, Status::Degraded);
    }

    struct FailingLocker;

    #[async_trait]
    impl LockHealthCheck for FailingLocker {
        async fn health(&self, _ctx: &CancellationToken) -> Result<(), String> {
            Err("connection failed".to_string())
        }
    }

    #[tokio::test]
    async fn unhealthy_locker_overrides_status() {
        let checker = HealthChecker::new(scheduler()).with_locker(Arc::new(FailingLocker));
        let ctx = CancellationToken::new();
        let result = checker.check(&ctx).await;
        assert_eq!(result.status, Status::Unhealthy);
        assert!(result.message.contains("locker unhealthy"));
        assert!(result.message.contains("connection failed"));
    }

    #[test]
    fn threshold_setters_reject_invalid_values() {
        let checker = HealthChecker::new(scheduler());
        checker.set_degraded_threshold(-1.0);
        assert_eq!(*checker.thresholds.degraded_threshold.read(), DEFAULT_DEGRADED_THRESHOLD);
        checker.set_degraded_threshold(1.5);
        assert_eq!(*checker.thresholds.degraded_threshold.read(), DEFAULT_DEGRADED_THRESHOLD);
        checker.set_min_executions(-5);
        assert_eq!(checker.thresholds.min_executions.load(Ordering::SeqCst), DEFAULT_MIN_EXECUTIONS);
    }
}
