//! Consume-loop driver (module C11): the reusable loop shared by tracing
//! and DLQ consumers. Repeatedly invokes a consume step and applies backoff
//! on error while honoring cancellation.
//!
//! ```text
//! attempt = 0
//! loop:
//!   if ctx cancelled: return ctx.err
//!   err = consume(ctx)
//!   if err: attempt++; on_error(err); wait backoff.next_delay(attempt) or ctx
//!   else:   attempt = 0; if backoff is Resettable: backoff.reset()
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use xcron_core::{sleep_or_cancelled, BackoffPolicy, Resettable, XCronError};

/// One iteration's worth of work for the consume loop (e.g. "poll one
/// message and process it"). Implemented by the DLQ consumer's `tick`.
#[async_trait]
pub trait ConsumeStep: Send + Sync {
    async fn consume(&self, ctx: &CancellationToken) -> anyhow::Result<()>;
}

struct FnStep<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumeStep for FnStep<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn consume(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        (self.f)(ctx.clone()).await
    }
}

pub fn consume_step_from_fn<F, Fut>(f: F) -> Arc<dyn ConsumeStep>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnStep { f })
}

/// Runs `consume` until `ctx` is cancelled, applying `backoff.next_delay`
/// between failures. `resettable`, if provided, is reset after every
/// success (it is expected to be the same underlying object as `backoff`,
/// exposed as a second trait object since `BackoffPolicy` and `Resettable`
/// are separate capabilities).
///
/// A missing consume step returns `NilHandler` synchronously, matching the
/// spec's "nil consume function" validation.
pub async fn run_consume_loop(
    ctx: CancellationToken,
    consume: Option<Arc<dyn ConsumeStep>>,
    backoff: Arc<dyn BackoffPolicy>,
    resettable: Option<Arc<dyn Resettable>>,
    mut on_error: impl FnMut(&anyhow::Error),
) -> Result<(), XCronError> {
    let consume = consume.ok_or(XCronError::NilHandler)?;
    let mut attempt: u32 = 0;

    loop {
        if ctx.is_cancelled() {
            return Ok(());
        }

        match consume.consume(&ctx).await {
            Ok(()) => {
                attempt = 0;
                if let Some(resettable) = &resettable {
                    resettable.reset();
                }
            }
            Err(err) => {
                attempt += 1;
                on_error(&err);
                let delay = backoff.next_delay(attempt);
                if sleep_or_cancelled(&ctx, delay).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use xcron_core::FixedBackoff;

    #[tokio::test]
    async fn nil_consume_step_returns_nil_handler() {
        let ctx = CancellationToken::new();
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(FixedBackoff::new(Duration::from_millis(1)));
        let result = run_consume_loop(ctx, None, backoff, None, |_| {}).await;
        assert_eq!(result.unwrap_err(), XCronError::NilHandler);
    }

    #[tokio::test]
    async fn resets_backoff_after_success() {
        let ctx = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let ctx_clone = ctx.clone();

        let step = consume_step_from_fn(move |_ctx| {
            let calls = calls_clone.clone();
            let ctx = ctx_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    ctx.cancel();
                }
                if n == 0 || n == 1 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(())
                }
            }
        });

        let backoff = Arc::new(FixedBackoff::new(Duration::from_millis(1)));
        let backoff_dyn: Arc<dyn BackoffPolicy> = backoff.clone();
        let resettable_dyn: Arc<dyn Resettable> = backoff.clone();

        let errors = Arc::new(AtomicU32::new(0));
        let errors_clone = errors.clone();

        run_consume_loop(ctx, Some(step), backoff_dyn, Some(resettable_dyn), |_| {
            errors_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert!(backoff.reset_count() >= 1);
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_loop_immediately() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let step = consume_step_from_fn(move |_ctx| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(FixedBackoff::new(Duration::from_millis(1)));
        run_consume_loop(ctx, Some(step), backoff, None, |_| {}).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
