//! Execution statistics (module C4): two-level counters (scheduler-aggregate
//! and per-job). Monotonic fields are lock-free atomics; the "last
//! error/duration/time" triple is a small reader-writer-locked struct since
//! it's only ever touched synchronously with no `.await` held across the
//! guard. Min/max latency use compare-and-swap loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Default)]
struct LastExecution {
    error: Option<String>,
    duration: Duration,
    at: Option<DateTime<Utc>>,
}

/// Execution counters for one job or for the scheduler as a whole.
#[derive(Debug)]
pub struct ExecStats {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    skipped: AtomicU64,
    retried_executions: AtomicU64,
    success_after_retry: AtomicU64,
    min_duration_nanos: AtomicU64,
    max_duration_nanos: AtomicU64,
    total_duration_nanos: AtomicU64,
    last: RwLock<LastExecution>,
}

impl Default for ExecStats {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            retried_executions: AtomicU64::new(0),
            success_after_retry: AtomicU64::new(0),
            min_duration_nanos: AtomicU64::new(u64::MAX),
            max_duration_nanos: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
            last: RwLock::new(LastExecution::default()),
        }
    }
}

impl ExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// `attempts` is the number of attempts the execution took (1 means no
    /// retry occurred).
    pub fn record_success(&self, duration: Duration, attempts: u32) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.retried_executions.fetch_add(1, Ordering::Relaxed);
            self.success_after_retry.fetch_add(1, Ordering::Relaxed);
        }
        self.record_duration(duration);
        self.record_last(duration, None);
    }

    pub fn record_failure(&self, duration: Duration, attempts: u32, err: &anyhow::Error) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failure.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.retried_executions.fetch_add(1, Ordering::Relaxed);
        }
        self.record_duration(duration);
        self.record_last(duration, Some(err.to_string()));
    }

    fn record_duration(&self, duration: Duration) {
        let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.total_duration_nanos.fetch_add(nanos, Ordering::Relaxed);

        let mut current_min = self.min_duration_nanos.load(Ordering::Relaxed);
        while nanos < current_min {
            match self.min_duration_nanos.compare_exchange_weak(
                current_min,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current_min = observed,
            }
        }

        let mut current_max = self.max_duration_nanos.load(Ordering::Relaxed);
        while nanos > current_max {
            match self.max_duration_nanos.compare_exchange_weak(
                current_max,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current_max = observed,
            }
        }
    }

    fn record_last(&self, duration: Duration, error: Option<String>) {
        let mut last = self.last.write();
        last.duration = duration;
        last.error = error;
        last.at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let retried = self.retried_executions.load(Ordering::Relaxed);
        let success_after_retry = self.success_after_retry.load(Ordering::Relaxed);
        let total_nanos = self.total_duration_nanos.load(Ordering::Relaxed);
        let min_nanos = self.min_duration_nanos.load(Ordering::Relaxed);
        let max_nanos = self.max_duration_nanos.load(Ordering::Relaxed);

        let completed = success + failure;
        let avg_duration = if completed > 0 {
            Duration::from_nanos(total_nanos / completed)
        } else {
            Duration::ZERO
        };
        let min_duration = if min_nanos == u64::MAX {
            Duration::ZERO
        } else {
            Duration::from_nanos(min_nanos)
        };

        let last = self.last.read();
        StatsSnapshot {
            total,
            success,
            failure,
            skipped,
            retried,
            success_after_retry,
            min_duration,
            max_duration: Duration::from_nanos(max_nanos),
            avg_duration,
            last_error: last.error.clone(),
            last_duration: last.duration,
            last_execution_at: last.at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
    pub retried: u64,
    pub success_after_retry: u64,
    #[serde(with = "duration_secs_f64")]
    pub min_duration: Duration,
    #[serde(with = "duration_secs_f64")]
    pub max_duration: Duration,
    #[serde(with = "duration_secs_f64")]
    pub avg_duration: Duration,
    pub last_error: Option<String>,
    #[serde(with = "duration_secs_f64")]
    pub last_duration: Duration,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.success as f64 / self.total as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}

mod duration_secs_f64 {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_have_zero_min_after_no_observations() {
        let stats = ExecStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.min_duration, Duration::ZERO);
        assert_eq!(snap.success_rate(), 1.0);
    }

    #[test]
    fn records_success_and_failure_counts() {
        let stats = ExecStats::new();
        stats.record_success(Duration::from_millis(10), 1);
        stats.record_failure(Duration::from_millis(20), 3, &anyhow::anyhow!("boom"));
        stats.record_skip();

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert_eq!(snap.min_duration, Duration::from_millis(10));
        assert_eq!(snap.max_duration, Duration::from_millis(20));
    }

    #[test]
    fn success_after_retry_only_counts_multi_attempt_successes() {
        let stats = ExecStats::new();
        stats.record_success(Duration::from_millis(5), 1);
        stats.record_success(Duration::from_millis(5), 2);
        let snap = stats.snapshot();
        assert_eq!(snap.success_after_retry, 1);
    }
}
