//! Cancellation and panic-isolation helpers shared by the scheduler and the
//! DLQ consumer.
//!
//! Rust has no direct analogue of a goroutine's `recover()`; we get the same
//! isolation by running the panicking code inside its own `tokio::spawn`ed
//! task and converting a `JoinError::is_panic()` into an ordinary error.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use tokio_util::sync::CancellationToken as TaskContext;

/// Runs `fut` to completion, converting a panic into an `anyhow::Error`
/// instead of unwinding the caller. `fut` must be `'static` + `Send` since it
/// is driven on its own spawned task.
pub async fn catch_panic<F, T>(fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let msg = panic_message(&payload);
            Err(anyhow::anyhow!("{msg}"))
        }
        Err(join_err) => Err(anyhow::anyhow!("task join error: {join_err}")),
    }
}

/// Runs a synchronous closure, converting a panic into an `anyhow::Error`.
/// Used for before/after hooks, which are plain sync callbacks.
pub fn catch_panic_sync<F, T>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    std::panic::catch_unwind(f).map_err(|payload| anyhow::anyhow!("{}", panic_message(&payload)))
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Waits for `delay` to elapse, or returns early (with `Err`) if `ctx` is
/// cancelled first. Used by the retry loop's backoff wait and the renewal
/// loop's tick wait.
pub async fn sleep_or_cancelled(ctx: &CancellationToken, delay: Duration) -> Result<(), ()> {
    if delay.is_zero() {
        if ctx.is_cancelled() {
            return Err(());
        }
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = ctx.cancelled() => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catch_panic_converts_panic_to_error() {
        let result: anyhow::Result<()> = catch_panic(async {
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("boom"));
    }

    #[tokio::test]
    async fn catch_panic_passes_through_ok() {
        let result = catch_panic(async { Ok::<_, anyhow::Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn catch_panic_sync_converts_panic() {
        let result = catch_panic_sync(|| -> i32 { panic!("sync boom") });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sleep_or_cancelled_returns_err_on_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = sleep_or_cancelled(&ctx, Duration::from_secs(10)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sleep_or_cancelled_returns_ok_after_delay() {
        let ctx = CancellationToken::new();
        let result = sleep_or_cancelled(&ctx, Duration::from_millis(1)).await;
        assert!(result.is_ok());
    }
}
