//! Job wrapper (module C5): runs one attempt of a scheduled job — acquire
//! lock, start renewal, apply timeout, run hooks, execute (with retry),
//! release lock, record stats. One `run()` invocation per scheduled tick.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use xcron_core::{panic_message, sleep_or_cancelled, BackoffPolicy, RetryPolicy};
use xcron_lock::{BoxedLockHandle, LockProvider};

use crate::stats::ExecStats;

/// A scheduled job: a cancellation-aware callable returning an error.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: CancellationToken) -> anyhow::Result<()>;
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

struct FnJob<F> {
    f: F,
}

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: Fn(CancellationToken) -> BoxFuture<anyhow::Result<()>> + Send + Sync,
{
    async fn run(&self, ctx: CancellationToken) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }
}

/// Wraps a plain async closure as a `Job`, the Rust equivalent of
/// `add_func`'s implicit `job_from_fn`.
pub fn job_from_fn<F, Fut>(f: F) -> Arc<dyn Job>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnJob {
        f: move |ctx| Box::pin(f(ctx)) as BoxFuture<anyhow::Result<()>>,
    })
}

/// Per-run mutable context passed to hooks. Metadata set by a before-hook is
/// visible to later before-hooks, the job body is not given direct access to
/// it (it only sees the `CancellationToken`), and after-hooks see the final
/// state plus the execution's outcome.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub job_name: String,
    pub metadata: HashMap<String, String>,
}

pub type BeforeHook = Arc<dyn Fn(&mut ExecContext) + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&ExecContext, Option<&anyhow::Error>) + Send + Sync>;

/// The optional tracer capability (§4.4 step 4). A concrete OpenTelemetry
/// implementation lives in `xcron-tracing`; this crate only depends on the
/// trait so the scheduler never needs an OTLP dependency itself.
pub trait JobTracer: Send + Sync {
    fn start_span(&self, name: &str) -> Box<dyn JobSpan>;
}

pub trait JobSpan: Send {
    fn record_error(&mut self, err: &anyhow::Error);
}

/// Immutable, post-registration configuration for one job. Cloned
/// shallowly for immediate-execution workers (`Arc` fields are cheap to
/// clone); nothing here is ever mutated after `add_job` returns.
#[derive(Clone)]
pub struct JobOptions {
    pub name: String,
    pub schedule_expr: String,
    pub lock_ttl: Duration,
    pub lock_timeout: Duration,
    pub execution_timeout: Duration,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub backoff_policy: Option<Arc<dyn BackoffPolicy>>,
    pub tracer: Option<Arc<dyn JobTracer>>,
    pub before_hooks: Vec<BeforeHook>,
    pub after_hooks: Vec<AfterHook>,
    pub immediate: bool,
    pub lock_override: Option<Arc<dyn LockProvider>>,
}

/// Minimum lock TTL (spec.md §3: "lock_ttl ≥ 3s; shorter values are rounded
/// up so the renewal interval lock_ttl/3 ≥ 1s").
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(3);
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);
const RENEW_RPC_TIMEOUT_FLOOR: Duration = Duration::from_secs(5);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rounds `ttl` up to `MIN_LOCK_TTL` if it's shorter.
pub fn normalize_lock_ttl(ttl: Duration) -> Duration {
    ttl.max(MIN_LOCK_TTL)
}

fn renewal_interval(lock_ttl: Duration) -> Duration {
    (lock_ttl / 3).max(MIN_RENEWAL_INTERVAL)
}

fn renew_rpc_timeout(lock_timeout: Duration, interval: Duration) -> Duration {
    lock_timeout.min(interval).max(RENEW_RPC_TIMEOUT_FLOOR)
}

/// Runs one scheduled job's executions. Created once at registration and
/// shared (via `Arc`) by every tick; an immediate-execution worker gets a
/// shallow clone with a different base cancellation token.
pub struct JobWrapper {
    pub opts: JobOptions,
    pub job: Arc<dyn Job>,
    pub default_lock: Arc<dyn LockProvider>,
    pub stats: Arc<ExecStats>,
    pub aggregate_stats: Arc<ExecStats>,
    base: CancellationToken,
    active_executions: Arc<AtomicI64>,
}

impl JobWrapper {
    pub fn new(
        opts: JobOptions,
        job: Arc<dyn Job>,
        default_lock: Arc<dyn LockProvider>,
        aggregate_stats: Arc<ExecStats>,
    ) -> Self {
        Self {
            opts,
            job,
            default_lock,
            stats: Arc::new(ExecStats::new()),
            aggregate_stats,
            base: CancellationToken::new(),
            active_executions: Arc::new(AtomicI64::new(0)),
        }
    }

    /// A shallow copy sharing `job`/lock/stats but rooted at `base` instead
    /// of a fresh background token — used for immediate-execution workers so
    /// scheduler `stop()` can cancel all of them via one parent token
    /// without mutating the registered wrapper later ticks use.
    pub fn with_base(&self, base: CancellationToken) -> Self {
        Self {
            opts: self.opts.clone(),
            job: self.job.clone(),
            default_lock: self.default_lock.clone(),
            stats: self.stats.clone(),
            aggregate_stats: self.aggregate_stats.clone(),
            base,
            active_executions: self.active_executions.clone(),
        }
    }

    fn effective_lock(&self) -> Arc<dyn LockProvider> {
        self.opts
            .lock_override
            .clone()
            .unwrap_or_else(|| self.default_lock.clone())
    }

    /// Currently in-flight execute-phase count for this job (testable
    /// property: must be 0 after scheduler `stop()`'s done-context fires).
    pub fn active_executions(&self) -> i64 {
        self.active_executions.load(Ordering::SeqCst)
    }

    pub async fn run(self: Arc<Self>) {
        let task_ctx = self.base.child_token();
        let _cancel_on_exit = CancelOnDrop(task_ctx.clone());
        let start = Instant::now();

        let lock = self.effective_lock();
        let lock_fut = {
            let ctx = task_ctx.clone();
            let key = self.opts.name.clone();
            let ttl = self.opts.lock_ttl;
            let lock = lock.clone();
            async move { lock.try_lock(&ctx, &key, ttl).await.map_err(anyhow::Error::from) }
        };

        let lock_outcome = tokio::time::timeout(self.opts.lock_timeout, xcron_core::catch_panic(lock_fut)).await;

        let handle: BoxedLockHandle = match lock_outcome {
            Err(_elapsed) => {
                let err = anyhow::anyhow!("lock acquisition timed out after {:?}", self.opts.lock_timeout);
                self.finish_without_execution(Duration::ZERO, &err);
                return;
            }
            Ok(Err(err)) => {
                self.finish_without_execution(Duration::ZERO, &err);
                return;
            }
            Ok(Ok(None)) => {
                self.stats.record_skip();
                self.aggregate_stats.record_skip();
                metrics::counter!("xcron_scheduler_job_skipped_total", "job" => self.opts.name.clone()).increment(1);
                debug!(job = %self.opts.name, "lock held by another party, skipping tick");
                return;
            }
            Ok(Ok(Some(handle))) => handle,
        };

        let active_now = self.active_executions.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("xcron_scheduler_active_executions", "job" => self.opts.name.clone()).set(active_now as f64);
        let _active_guard = ActiveGuard {
            count: self.active_executions.clone(),
            job_name: self.opts.name.clone(),
        };

        let handle: Arc<dyn xcron_lock::LockHandle> = Arc::from(handle);
        let renew_guard = self.start_renewal(handle.clone(), task_ctx.clone());

        if !self.opts.execution_timeout.is_zero() {
            let watcher_ctx = task_ctx.clone();
            let timeout = self.opts.execution_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => watcher_ctx.cancel(),
                    _ = watcher_ctx.cancelled() => {}
                }
            });
        }

        let mut span = self.opts.tracer.as_ref().and_then(|tracer| {
            let tracer = tracer.clone();
            let name = format!("scheduler.{}", self.opts.name);
            match std::panic::catch_unwind(AssertUnwindSafe(|| tracer.start_span(&name))) {
                Ok(span) => Some(span),
                Err(payload) => {
                    warn!(job = %self.opts.name, panic = %panic_message(&*payload), "tracer panicked starting span");
                    None
                }
            }
        });

        let mut exec_ctx = ExecContext {
            job_name: self.opts.name.clone(),
            metadata: HashMap::new(),
        };
        for hook in &self.opts.before_hooks {
            let mut candidate = exec_ctx.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| hook(&mut candidate))) {
                Ok(()) => exec_ctx = candidate,
                Err(payload) => {
                    warn!(job = %self.opts.name, panic = %panic_message(&*payload), "before-hook panicked");
                }
            }
        }

        let (result, attempts) = if let Some(retry_policy) = self.opts.retry_policy.clone() {
            self.execute_with_retry(task_ctx.clone(), retry_policy, self.opts.backoff_policy.clone())
                .await
        } else {
            (run_one_attempt(self.job.clone(), task_ctx.clone(), &self.opts.name).await, 1)
        };

        for hook in self.opts.after_hooks.iter().rev() {
            let err_ref = result.as_ref().err();
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(&exec_ctx, err_ref))) {
                warn!(job = %self.opts.name, panic = %panic_message(&*payload), "after-hook panicked");
            }
        }

        if let Some(span) = span.as_mut() {
            if let Err(err) = &result {
                span.record_error(err);
            }
        }

        renew_guard.stop().await;

        let release_ctx = CancellationToken::new();
        match tokio::time::timeout(RELEASE_TIMEOUT, handle.unlock(&release_ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_benign_race() => debug!(job = %self.opts.name, "lock already released or expired"),
            Ok(Err(e)) => warn!(job = %self.opts.name, error = %e, "failed to release lock"),
            Err(_elapsed) => warn!(job = %self.opts.name, "unlock timed out"),
        }

        let duration = start.elapsed();
        match &result {
            Ok(()) => {
                self.stats.record_success(duration, attempts);
                self.aggregate_stats.record_success(duration, attempts);
                record_job_duration(&self.opts.name, duration, "success");
                metrics::counter!("xcron_scheduler_job_completed_total", "job" => self.opts.name.clone(), "outcome" => "success")
                    .increment(1);
                debug!(job = %self.opts.name, ?duration, attempts, "job completed");
            }
            Err(err) => {
                self.stats.record_failure(duration, attempts, err);
                self.aggregate_stats.record_failure(duration, attempts, err);
                record_job_duration(&self.opts.name, duration, "failure");
                metrics::counter!("xcron_scheduler_job_completed_total", "job" => self.opts.name.clone(), "outcome" => "failure")
                    .increment(1);
                error!(job = %self.opts.name, ?duration, attempts, error = %err, "job failed");
            }
        }
    }

    fn finish_without_execution(&self, duration: Duration, err: &anyhow::Error) {
        self.stats.record_failure(duration, 1, err);
        self.aggregate_stats.record_failure(duration, 1, err);
        metrics::counter!("xcron_scheduler_job_completed_total", "job" => self.opts.name.clone(), "outcome" => "failure")
            .increment(1);
        error!(job = %self.opts.name, error = %err, "job execution failed before running");
    }

    fn start_renewal(&self, handle: Arc<dyn xcron_lock::LockHandle>, task_ctx: CancellationToken) -> RenewGuard {
        let renewal_cancel = CancellationToken::new();
        let lock_ttl = self.opts.lock_ttl;
        let lock_timeout = self.opts.lock_timeout;
        let job_name = self.opts.name.clone();

        let interval = renewal_interval(lock_ttl);
        let rpc_timeout = renew_rpc_timeout(lock_timeout, interval);

        let loop_cancel = renewal_cancel.clone();
        let loop_task_ctx = task_ctx.clone();
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = loop_cancel.cancelled() => return,
                    _ = loop_task_ctx.cancelled() => return,
                }

                let renew_ctx = CancellationToken::new();
                let handle = handle.clone();
                let fut = async move { handle.renew(&renew_ctx, lock_ttl).await.map_err(anyhow::Error::from) };

                match tokio::time::timeout(rpc_timeout, xcron_core::catch_panic(fut)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => {
                        error!(job = %job_name, error = %err, "lock renewal failed, aborting job");
                        loop_task_ctx.cancel();
                        return;
                    }
                    Err(_elapsed) => {
                        error!(job = %job_name, "lock renewal timed out, aborting job");
                        loop_task_ctx.cancel();
                        return;
                    }
                }
            }
        });

        RenewGuard {
            renewal_cancel,
            join_handle,
        }
    }

    async fn execute_with_retry(
        &self,
        task_ctx: CancellationToken,
        retry_policy: Arc<dyn RetryPolicy>,
        backoff_policy: Option<Arc<dyn BackoffPolicy>>,
    ) -> (anyhow::Result<()>, u32) {
        let mut attempt = 1u32;
        loop {
            let result = run_one_attempt(self.job.clone(), task_ctx.clone(), &self.opts.name).await;
            match result {
                Ok(()) => return (Ok(()), attempt),
                Err(err) => {
                    if !retry_policy.should_retry(&task_ctx, attempt, &err).await {
                        return (Err(err), attempt);
                    }
                    if let Some(backoff) = &backoff_policy {
                        let delay = backoff.next_delay(attempt);
                        if sleep_or_cancelled(&task_ctx, delay).await.is_err() {
                            return (Err(anyhow::anyhow!("context cancelled during retry backoff: {err}")), attempt);
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

async fn run_one_attempt(job: Arc<dyn Job>, ctx: CancellationToken, name: &str) -> anyhow::Result<()> {
    let name_owned = name.to_string();
    let join = tokio::spawn(async move { job.run(ctx).await });
    match join.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            Err(anyhow::anyhow!("job {name_owned:?} panicked: {}", panic_message(&*payload)))
        }
        Err(join_err) => Err(anyhow::anyhow!("job {name_owned:?} task join error: {join_err}")),
    }
}

struct RenewGuard {
    renewal_cancel: CancellationToken,
    join_handle: tokio::task::JoinHandle<()>,
}

impl RenewGuard {
    async fn stop(self) {
        self.renewal_cancel.cancel();
        let _ = self.join_handle.await;
    }
}

struct CancelOnDrop(CancellationToken);
impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct ActiveGuard {
    count: Arc<AtomicI64>,
    job_name: String,
}
impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let remaining = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("xcron_scheduler_active_executions", "job" => self.job_name.clone()).set(remaining as f64);
    }
}

fn record_job_duration(job_name: &str, duration: Duration, outcome: &'static str) {
    metrics::histogram!("xcron_scheduler_job_duration_seconds", "job" => job_name.to_string(), "outcome" => outcome)
        .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use xcron_core::{ExponentialBackoff, MaxAttemptsRetryPolicy};
    use xcron_lock::NoopLock;

    fn default_opts(name: &str) -> JobOptions {
        JobOptions {
            name: name.to_string(),
            schedule_expr: "@every 1s".to_string(),
            lock_ttl: normalize_lock_ttl(Duration::from_secs(3)),
            lock_timeout: Duration::from_secs(1),
            execution_timeout: Duration::ZERO,
            retry_policy: None,
            backoff_policy: None,
            tracer: None,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            immediate: false,
            lock_override: None,
        }
    }

    #[tokio::test]
    async fn successful_job_records_success_stats() {
        let job = job_from_fn(|_ctx| async { Ok(()) });
        let wrapper = Arc::new(JobWrapper::new(
            default_opts("ok-job"),
            job,
            Arc::new(NoopLock::new()),
            Arc::new(ExecStats::new()),
        ));
        wrapper.clone().run().await;
        let snap = wrapper.stats.snapshot();
        assert_eq!(snap.success, 1);
        assert_eq!(snap.failure, 0);
        assert_eq!(wrapper.active_executions(), 0);
    }

    #[tokio::test]
    async fn panicking_job_becomes_an_error() {
        let job = job_from_fn(|_ctx| async { panic!("kaboom") });
        let wrapper = Arc::new(JobWrapper::new(
            default_opts("panic-job"),
            job,
            Arc::new(NoopLock::new()),
            Arc::new(ExecStats::new()),
        ));
        wrapper.clone().run().await;
        let snap = wrapper.stats.snapshot();
        assert_eq!(snap.failure, 1);
        assert!(snap.last_error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn retry_policy_limits_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let job = job_from_fn(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("always fails"))
            }
        });

        let mut opts = default_opts("retry-job");
        opts.retry_policy = Some(Arc::new(MaxAttemptsRetryPolicy::new(2)));
        opts.backoff_policy = Some(Arc::new(ExponentialBackoff::new(
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(5),
            0.0,
        )));

        let wrapper = Arc::new(JobWrapper::new(
            opts,
            job,
            Arc::new(NoopLock::new()),
            Arc::new(ExecStats::new()),
        ));
        wrapper.clone().run().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let snap = wrapper.stats.snapshot();
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.retried, 1);
    }

    #[tokio::test]
    async fn before_hook_panic_does_not_affect_job_or_other_hooks() {
        let second_hook_ran = Arc::new(AtomicU32::new(0));
        let second_hook_ran_clone = second_hook_ran.clone();

        let job = job_from_fn(|_ctx| async { Ok(()) });
        let mut opts = default_opts("hook-job");
        opts.before_hooks = vec![
            Arc::new(|_ctx: &mut ExecContext| panic!("hook boom")),
            Arc::new(move |_ctx: &mut ExecContext| {
                second_hook_ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        let wrapper = Arc::new(JobWrapper::new(
            opts,
            job,
            Arc::new(NoopLock::new()),
            Arc::new(ExecStats::new()),
        ));
        wrapper.clone().run().await;

        assert_eq!(second_hook_ran.load(Ordering::SeqCst), 1);
        assert_eq!(wrapper.stats.snapshot().success, 1);
    }

    #[test]
    fn lock_ttl_is_rounded_up_to_minimum() {
        assert_eq!(normalize_lock_ttl(Duration::from_secs(1)), MIN_LOCK_TTL);
        assert_eq!(normalize_lock_ttl(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn renewal_interval_floors_at_one_second() {
        assert_eq!(renewal_interval(Duration::from_secs(3)), Duration::from_secs(1));
        assert_eq!(renewal_interval(Duration::from_secs(30)), Duration::from_secs(10));
    }

    #[test]
    fn renew_rpc_timeout_floors_at_five_seconds() {
        assert_eq!(
            renew_rpc_timeout(Duration::from_millis(500), Duration::from_secs(1)),
            Duration::from_secs(5)
        );
        assert_eq!(
            renew_rpc_timeout(Duration::from_secs(20), Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }
}
