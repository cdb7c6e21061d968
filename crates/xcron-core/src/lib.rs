//! Shared primitives for the `xcron` workspace: the sentinel error
//! taxonomy, the backoff/retry policy abstraction (module C1), and the
//! panic-isolation / cancellation helpers the scheduler and DLQ consumer
//! both build on.

pub mod context;
pub mod error;
pub mod retry;

pub use context::{catch_panic, catch_panic_sync, panic_message, sleep_or_cancelled, TaskContext};
pub use error::XCronError;
pub use retry::{
    BackoffPolicy, ExponentialBackoff, FixedBackoff, MaxAttemptsRetryPolicy, NoRetryPolicy,
    Resettable, RetryPolicy,
};
