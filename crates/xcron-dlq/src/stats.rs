//! DLQ statistics (module C9): aggregate counters plus a per-origin-topic
//! dead-letter tally. Same lock-free-where-monotonic discipline as the
//! scheduler's `ExecStats` (module C4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct DlqStats {
    total: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    success_after_retry: AtomicU64,
    last_dlq_at: Mutex<Option<DateTime<Utc>>>,
    per_origin_topic: Mutex<HashMap<String, u64>>,
}

impl DlqStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_handled(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("xcron_dlq_messages_handled_total").increment(1);
    }

    pub fn record_retried(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("xcron_dlq_messages_retried_total").increment(1);
    }

    pub fn record_success_after_retry(&self) {
        self.success_after_retry.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("xcron_dlq_retry_success_total").increment(1);
    }

    pub fn record_dead_lettered(&self, origin_topic: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        *self.last_dlq_at.lock() = Some(Utc::now());
        *self.per_origin_topic.lock().entry(origin_topic.to_string()).or_insert(0) += 1;
        metrics::counter!("xcron_dlq_dead_lettered_total", "origin_topic" => origin_topic.to_string()).increment(1);
    }

    pub fn snapshot(&self) -> DlqStatsSnapshot {
        DlqStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            success_after_retry: self.success_after_retry.load(Ordering::Relaxed),
            last_dlq_at: *self.last_dlq_at.lock(),
            per_origin_topic: self.per_origin_topic.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStatsSnapshot {
    pub total: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub success_after_retry: u64,
    pub last_dlq_at: Option<DateTime<Utc>>,
    pub per_origin_topic: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_totals_and_per_origin_tally() {
        let stats = DlqStats::new();
        stats.record_handled();
        stats.record_retried();
        stats.record_success_after_retry();
        stats.record_dead_lettered("orders");
        stats.record_dead_lettered("orders");
        stats.record_dead_lettered("invoices");

        let snap = stats.snapshot();
        assert_eq!(snap.total, 5);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.dead_lettered, 3);
        assert_eq!(snap.success_after_retry, 1);
        assert_eq!(snap.per_origin_topic.get("orders"), Some(&2));
        assert_eq!(snap.per_origin_topic.get("invoices"), Some(&1));
        assert!(snap.last_dlq_at.is_some());
    }
}
