use thiserror::Error;

/// Sentinel error taxonomy shared across the scheduler and DLQ consumer.
///
/// Every variant here is meant to be matched by identity (`matches!`,
/// `==` on the discriminant) rather than inspected for message text —
/// callers depend on this for recovery decisions (swallow vs. log vs.
/// propagate), per the error taxonomy in the scheduler design.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XCronError {
    #[error("nil job passed to register")]
    NilJob,

    #[error("nil message handler")]
    NilHandler,

    #[error("nil consumer/producer config")]
    NilConfig,

    #[error("empty topic list")]
    EmptyTopics,

    #[error("lock configured but job has no name")]
    MissingName,

    #[error("duplicate job name: {0}")]
    DuplicateJobName(String),

    #[error("unlock/renew on a lock not held by this handle")]
    LockNotHeld,

    #[error("non-positive ttl")]
    InvalidTTL,

    #[error("lock acquisition failed: {0}")]
    LockAcquireFailed(String),

    #[error("operation on a closed consumer/producer/scheduler")]
    Closed,

    #[error("close could not drain producer within the flush timeout")]
    FlushTimeout,

    #[error("job {0:?} panicked: {1}")]
    JobPanicked(String, String),
}

impl XCronError {
    /// True for the variants documented as "swallow if expected, log if
    /// unexpected" — i.e. errors that are a normal consequence of
    /// concurrent operation rather than a programming mistake.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::LockNotHeld)
    }
}
