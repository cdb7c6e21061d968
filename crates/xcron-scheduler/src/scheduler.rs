//! The scheduler itself (module C6): owns the registered jobs, drives each
//! job's ticks off its parsed schedule, and coordinates graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xcron_core::XCronError;
use xcron_lock::{LockProvider, NoopLock};

use crate::job::{normalize_lock_ttl, Job, JobOptions, JobWrapper};
use crate::schedule::{Precision, ScheduleSpec};
use crate::stats::{ExecStats, StatsSnapshot};

/// One entry in the scheduler's registry: the parsed schedule plus the
/// job wrapper that actually executes ticks.
struct Entry {
    schedule: ScheduleSpec,
    wrapper: Arc<JobWrapper>,
    tick_cancel: CancellationToken,
    tick_handle: Option<JoinHandle<()>>,
    immediate_handles: Vec<JoinHandle<()>>,
}

/// Builder-style configuration applied at `Scheduler::new`.
pub struct SchedulerConfig {
    pub precision: Precision,
    pub default_lock: Arc<dyn LockProvider>,
    pub default_lock_ttl: Duration,
    pub default_lock_timeout: Duration,
    pub default_execution_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Minute,
            default_lock: Arc::new(NoopLock::new()),
            default_lock_ttl: Duration::from_secs(30),
            default_lock_timeout: Duration::from_secs(10),
            default_execution_timeout: Duration::ZERO,
        }
    }
}

/// Builder for registering a job, mirroring the Go API's functional-option
/// pattern as a method-chaining builder.
pub struct JobBuilder<'a> {
    scheduler: &'a Scheduler,
    name: String,
    schedule_expr: String,
    job: Arc<dyn Job>,
    lock_ttl: Option<Duration>,
    lock_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    retry_policy: Option<Arc<dyn xcron_core::RetryPolicy>>,
    backoff_policy: Option<Arc<dyn xcron_core::BackoffPolicy>>,
    tracer: Option<Arc<dyn crate::job::JobTracer>>,
    before_hooks: Vec<crate::job::BeforeHook>,
    after_hooks: Vec<crate::job::AfterHook>,
    immediate: bool,
    lock_override: Option<Arc<dyn LockProvider>>,
}

impl<'a> JobBuilder<'a> {
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn xcron_core::RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn backoff_policy(mut self, policy: Arc<dyn xcron_core::BackoffPolicy>) -> Self {
        self.backoff_policy = Some(policy);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn crate::job::JobTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn before_hook(mut self, hook: crate::job::BeforeHook) -> Self {
        self.before_hooks.push(hook);
        self
    }

    pub fn after_hook(mut self, hook: crate::job::AfterHook) -> Self {
        self.after_hooks.push(hook);
        self
    }

    /// Runs the job once immediately in addition to its regular schedule.
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_override = Some(provider);
        self
    }

    pub fn register(self) -> Result<(), XCronError> {
        self.scheduler.add_job_from_builder(self)
    }
}

/// The scheduler: a name-keyed registry of jobs, each driven by its own
/// background tick task rooted at the scheduler's shared cancellation
/// token.
pub struct Scheduler {
    config: SchedulerConfig,
    entries: Mutex<HashMap<String, Entry>>,
    aggregate_stats: Arc<ExecStats>,
    root: CancellationToken,
    started: AtomicBool,
    anonymous_seq: std::sync::atomic::AtomicU64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            aggregate_stats: Arc::new(ExecStats::new()),
            root: CancellationToken::new(),
            started: AtomicBool::new(false),
            anonymous_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Starts building a registration for `job` on `schedule_expr`. Call
    /// `.register()` to commit it.
    pub fn add_job<'a>(&'a self, name: &str, schedule_expr: &str, job: Arc<dyn Job>) -> JobBuilder<'a> {
        JobBuilder {
            scheduler: self,
            name: name.to_string(),
            schedule_expr: schedule_expr.to_string(),
            job,
            lock_ttl: None,
            lock_timeout: None,
            execution_timeout: None,
            retry_policy: None,
            backoff_policy: None,
            tracer: None,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            immediate: false,
            lock_override: None,
        }
    }

    /// Convenience wrapper around `add_job` for a plain async closure,
    /// auto-naming it `anon-job-<n>` when `name` is empty.
    pub fn add_func<'a, F, Fut>(&'a self, name: &str, schedule_expr: &str, f: F) -> JobBuilder<'a>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = if name.is_empty() {
            format!("anon-job-{}", self.anonymous_seq.fetch_add(1, Ordering::SeqCst))
        } else {
            name.to_string()
        };
        self.add_job(&name, schedule_expr, crate::job::job_from_fn(f))
    }

    fn add_job_from_builder(&self, builder: JobBuilder<'_>) -> Result<(), XCronError> {
        let JobBuilder {
            scheduler: _,
            name,
            schedule_expr,
            job,
            lock_ttl,
            lock_timeout,
            execution_timeout,
            retry_policy,
            backoff_policy,
            tracer,
            before_hooks,
            after_hooks,
            immediate,
            lock_override,
        } = builder;

        if name.is_empty() {
            return Err(XCronError::MissingName);
        }

        let schedule = ScheduleSpec::parse(&schedule_expr, self.config.precision)
            .map_err(|e| XCronError::LockAcquireFailed(format!("invalid schedule: {e}")))?;

        let opts = JobOptions {
            name: name.clone(),
            schedule_expr,
            lock_ttl: normalize_lock_ttl(lock_ttl.unwrap_or(self.config.default_lock_ttl)),
            lock_timeout: lock_timeout.unwrap_or(self.config.default_lock_timeout),
            execution_timeout: execution_timeout.unwrap_or(self.config.default_execution_timeout),
            retry_policy,
            backoff_policy,
            tracer,
            before_hooks,
            after_hooks,
            immediate,
            lock_override,
        };

        let wrapper = Arc::new(JobWrapper::new(
            opts,
            job,
            self.config.default_lock.clone(),
            self.aggregate_stats.clone(),
        ));

        let mut entries = self.entries.lock();
        if entries.contains_key(&name) {
            return Err(XCronError::DuplicateJobName(name));
        }

        let tick_cancel = self.root.child_token();
        let tick_handle = if self.started.load(Ordering::SeqCst) {
            Some(self.spawn_tick_loop(name.clone(), schedule.clone(), wrapper.clone(), tick_cancel.clone()))
        } else {
            None
        };

        let mut immediate_handles = Vec::new();
        if immediate {
            let immediate_wrapper = wrapper.with_base(self.root.child_token());
            immediate_handles.push(tokio::spawn(async move {
                Arc::new(immediate_wrapper).run().await;
            }));
        }

        entries.insert(
            name,
            Entry {
                schedule,
                wrapper,
                tick_cancel,
                tick_handle,
                immediate_handles,
            },
        );
        Ok(())
    }

    fn spawn_tick_loop(
        &self,
        name: String,
        schedule: ScheduleSpec,
        wrapper: Arc<JobWrapper>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match schedule.next_after(now) {
                    Some(t) => t,
                    None => {
                        warn!(job = %name, "schedule produced no further occurrences, stopping");
                        return;
                    }
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }

                // Once a tick fires we let it run to completion: the job
                // wrapper already bounds itself via execution timeout and
                // lock renewal, and dropping this future mid-flight would
                // leak the lock and lose the attempt's stats.
                wrapper.clone().run().await;

                if cancel.is_cancelled() {
                    return;
                }
            }
        })
    }

    /// Starts tick loops for every job registered so far. Jobs added after
    /// `start()` begin ticking immediately upon registration.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut entries = self.entries.lock();
        for (name, entry) in entries.iter_mut() {
            if entry.tick_handle.is_some() {
                continue;
            }
            let handle = self.spawn_tick_loop(
                name.clone(),
                entry.schedule.clone(),
                entry.wrapper.clone(),
                entry.tick_cancel.clone(),
            );
            entry.tick_handle = Some(handle);
        }
        info!(jobs = entries.len(), "scheduler started");
    }

    /// Cancels every job's tick loop and waits (up to `timeout`) for
    /// in-flight executions to finish. Returns `false` if the timeout
    /// elapsed with executions still active.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.lock();
            let mut handles = Vec::new();
            for entry in entries.values_mut() {
                if let Some(handle) = entry.tick_handle.take() {
                    handles.push(handle);
                }
                handles.append(&mut entry.immediate_handles);
            }
            handles
        };

        let wait_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        tokio::time::timeout(timeout, wait_all).await.is_ok()
    }

    /// Removes a registered job, cancelling its tick loop. Returns `false`
    /// if no job with that name was registered.
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(name) {
            entry.tick_cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Names of every currently registered job.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Per-job execution stats, or `None` if no job with that name exists.
    pub fn job_stats(&self, name: &str) -> Option<StatsSnapshot> {
        self.entries.lock().get(name).map(|e| e.wrapper.stats.snapshot())
    }

    /// Scheduler-wide aggregate execution stats across all jobs.
    pub fn aggregate_stats(&self) -> StatsSnapshot {
        self.aggregate_stats.snapshot()
    }

    /// Total in-flight executions across every registered job (testable
    /// property: must be 0 immediately after `stop()` returns `true`).
    pub fn active_executions(&self) -> i64 {
        self.entries.lock().values().map(|e| e.wrapper.active_executions()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            precision: Precision::Second,
            default_lock: Arc::new(NoopLock::new()),
            default_lock_ttl: Duration::from_secs(3),
            default_lock_timeout: Duration::from_secs(1),
            default_execution_timeout: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn registering_duplicate_name_is_rejected() {
        let scheduler = Scheduler::new(test_config());
        let job = crate::job::job_from_fn(|_ctx| async { Ok(()) });
        scheduler.add_job("a", "@every 1h", job.clone()).register().unwrap();
        let err = scheduler.add_job("a", "@every 1h", job).register().unwrap_err();
        assert_eq!(err, XCronError::DuplicateJobName("a".to_string()));
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let scheduler = Scheduler::new(test_config());
        let job = crate::job::job_from_fn(|_ctx| async { Ok(()) });
        let err = scheduler.add_job("", "@every 1h", job).register().unwrap_err();
        assert_eq!(err, XCronError::MissingName);
    }

    #[tokio::test]
    async fn immediate_job_runs_without_waiting_for_schedule() {
        let scheduler = Scheduler::new(test_config());
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        let job = crate::job::job_from_fn(move |_ctx| {
            let ran = ran_clone.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        scheduler
            .add_job("immediate-job", "@every 1h", job)
            .immediate()
            .register()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_executions() {
        let scheduler = Scheduler::new(test_config());
        let job = crate::job::job_from_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        });
        scheduler.add_job("slow-job", "@every 1ms", job).immediate().register().unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped_cleanly = scheduler.stop(Duration::from_secs(1)).await;
        assert!(stopped_cleanly);
        assert_eq!(scheduler.active_executions(), 0);
    }

    #[tokio::test]
    async fn remove_cancels_the_jobs_tick_loop() {
        let scheduler = Scheduler::new(test_config());
        let job = crate::job::job_from_fn(|_ctx| async { Ok(()) });
        scheduler.add_job("removable", "@every 1h", job).register().unwrap();
        assert!(scheduler.entries().contains(&"removable".to_string()));
        assert!(scheduler.remove("removable"));
        assert!(!scheduler.entries().contains(&"removable".to_string()));
        assert!(!scheduler.remove("removable"));
    }
}
