//! Text encodings for the Postgres enum columns, and `sqlx::Error`
//! classification into `queue_core::BackendError`.
//!
//! The custom Postgres enum types (`job_status`, `failure_reason`, ...)
//! are bound/read as plain strings rather than through `sqlx::Type`
//! derives: Postgres infers the parameter's enum OID from the column it's
//! assigned to or compared against, so a bound `&str`/fetched `String`
//! round-trips without a dedicated Rust-side wire mapping, the same way
//! the teacher's `PgJobStore` binds `error_kind` as a plain `&str`.

use queue_core::{BackendError, CronScheduleStatus, EventType, FailureReason, JobStatus, TagQueryMode, WaitpointStatus};

pub fn job_status_to_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Waiting => "waiting",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

pub fn job_status_from_str(s: &str) -> Result<JobStatus, BackendError> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "waiting" => Ok(JobStatus::Waiting),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(BackendError::permanent(anyhow::anyhow!("unknown job_status '{other}'"))),
    }
}

pub fn failure_reason_to_str(r: FailureReason) -> &'static str {
    match r {
        FailureReason::Timeout => "timeout",
        FailureReason::HandlerError => "handler_error",
        FailureReason::NoHandler => "no_handler",
        FailureReason::Cancelled => "cancelled",
        FailureReason::TokenTimeout => "token_timeout",
    }
}

pub fn failure_reason_from_str(s: &str) -> Result<FailureReason, BackendError> {
    match s {
        "timeout" => Ok(FailureReason::Timeout),
        "handler_error" => Ok(FailureReason::HandlerError),
        "no_handler" => Ok(FailureReason::NoHandler),
        "cancelled" => Ok(FailureReason::Cancelled),
        "token_timeout" => Ok(FailureReason::TokenTimeout),
        other => Err(BackendError::permanent(anyhow::anyhow!("unknown failure_reason '{other}'"))),
    }
}

pub fn event_type_to_str(e: EventType) -> &'static str {
    match e {
        EventType::Added => "added",
        EventType::Processing => "processing",
        EventType::Completed => "completed",
        EventType::Failed => "failed",
        EventType::Cancelled => "cancelled",
        EventType::Retried => "retried",
        EventType::Edited => "edited",
        EventType::Prolonged => "prolonged",
        EventType::Waiting => "waiting",
        EventType::TokenCompleted => "token_completed",
        EventType::Progress => "progress",
        EventType::Reclaimed => "reclaimed",
    }
}

pub fn event_type_from_str(s: &str) -> Result<EventType, BackendError> {
    match s {
        "added" => Ok(EventType::Added),
        "processing" => Ok(EventType::Processing),
        "completed" => Ok(EventType::Completed),
        "failed" => Ok(EventType::Failed),
        "cancelled" => Ok(EventType::Cancelled),
        "retried" => Ok(EventType::Retried),
        "edited" => Ok(EventType::Edited),
        "prolonged" => Ok(EventType::Prolonged),
        "waiting" => Ok(EventType::Waiting),
        "token_completed" => Ok(EventType::TokenCompleted),
        "progress" => Ok(EventType::Progress),
        "reclaimed" => Ok(EventType::Reclaimed),
        other => Err(BackendError::permanent(anyhow::anyhow!("unknown event_type '{other}'"))),
    }
}

pub fn waitpoint_status_to_str(s: WaitpointStatus) -> &'static str {
    match s {
        WaitpointStatus::Pending => "pending",
        WaitpointStatus::Completed => "completed",
        WaitpointStatus::Expired => "expired",
    }
}

pub fn waitpoint_status_from_str(s: &str) -> Result<WaitpointStatus, BackendError> {
    match s {
        "pending" => Ok(WaitpointStatus::Pending),
        "completed" => Ok(WaitpointStatus::Completed),
        "expired" => Ok(WaitpointStatus::Expired),
        other => Err(BackendError::permanent(anyhow::anyhow!("unknown waitpoint_status '{other}'"))),
    }
}

pub fn cron_schedule_status_to_str(s: CronScheduleStatus) -> &'static str {
    match s {
        CronScheduleStatus::Active => "active",
        CronScheduleStatus::Paused => "paused",
    }
}

pub fn cron_schedule_status_from_str(s: &str) -> Result<CronScheduleStatus, BackendError> {
    match s {
        "active" => Ok(CronScheduleStatus::Active),
        "paused" => Ok(CronScheduleStatus::Paused),
        other => Err(BackendError::permanent(anyhow::anyhow!("unknown cron_schedule_status '{other}'"))),
    }
}

/// Render a [`TagFilter`] as a Postgres array-operator fragment plus its
/// bind value. `Exact` is both-direction containment rather than a native
/// set-equality operator, which Postgres's array type doesn't expose
/// directly.
pub fn tag_filter_sql(mode: TagQueryMode) -> &'static str {
    match mode {
        TagQueryMode::Exact => "tags @> $PARAM AND tags <@ $PARAM",
        TagQueryMode::All => "tags @> $PARAM",
        TagQueryMode::Any => "tags && $PARAM",
        TagQueryMode::None => "NOT (tags && $PARAM)",
    }
}

/// Classify a raw `sqlx::Error` as transient (safe to retry: connection
/// drop, pool exhaustion, serialization failure, deadlock) or permanent
/// (everything else — a constraint violation or caller bug).
pub fn classify_sqlx_error(err: sqlx::Error) -> BackendError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            BackendError::transient(err)
        }
        sqlx::Error::Database(db_err) => {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 08xxx connection_exception class.
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => BackendError::transient(err),
                Some(code) if code.starts_with("08") => BackendError::transient(err),
                _ => BackendError::permanent(err),
            }
        }
        _ => BackendError::permanent(err),
    }
}
