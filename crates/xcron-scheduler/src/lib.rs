//! The cron scheduler: schedule parsing, the per-job execution wrapper
//! (locking, retry, hooks, tracing), the job registry, execution stats,
//! and the health checker.

pub mod health;
pub mod job;
pub mod schedule;
pub mod scheduler;
pub mod stats;

pub use health::{HealthCheck, HealthChecker, Status};
pub use job::{
    job_from_fn, normalize_lock_ttl, AfterHook, BeforeHook, ExecContext, Job, JobOptions, JobSpan,
    JobTracer, JobWrapper, MIN_LOCK_TTL,
};
pub use schedule::{Precision, ScheduleError, ScheduleSpec};
pub use scheduler::{JobBuilder, Scheduler, SchedulerConfig};
pub use stats::{ExecStats, StatsSnapshot};
