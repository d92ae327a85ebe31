//! Error taxonomy for the backend boundary and the handler boundary.
//!
//! Two separate typed error enums, matching the two separate boundaries in
//! the design: `BackendError` is what a `QueueBackend` implementation may
//! raise (typed transient/permanent, so the processor can tell "the job
//! failed" apart from "I could not talk to the store"); `JobError` is what
//! a handler invocation resolves to, with a distinguished `Suspend`
//! sentinel the handler context uses for the wait/token early-return.

use thiserror::Error;

/// An error raised by a `QueueBackend` operation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A connection drop, pool exhaustion, or serialization failure that a
    /// caller may reasonably retry. The processor treats this as `on_error`
    /// and does **not** mark the job failed.
    #[error("transient backend error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Anything else: a constraint violation, a bad tag-mode, a missing
    /// row that should exist. Not retried automatically.
    #[error("backend error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl BackendError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// The outcome type a [`crate::context::JobHandler`] resolves to.
///
/// `Suspend` is the sentinel described in the design notes: `ctx.wait_for`,
/// `ctx.wait_until`, and `ctx.wait_for_token` all return
/// `Result<_, JobError>` and the handler body propagates suspension with
/// the ordinary `?` operator instead of any exception/unwind machinery.
#[derive(Debug, Error)]
pub enum JobError {
    /// The handler suspended at a wait/token site; the backend row has
    /// already transitioned to `waiting`. The processor treats this as a
    /// successful, non-terminal exit — never a retryable failure.
    #[error("job suspended")]
    Suspend,

    /// The handler itself failed. Retried according to `max_attempts`.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl JobError {
    pub fn is_suspend(&self) -> bool {
        matches!(self, JobError::Suspend)
    }
}

/// Error raised by the cron engine.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}
