//! The `QueueBackend` trait: the sole storage abstraction boundary between
//! the engine and a concrete store. `queue-postgres` and `queue-memory`
//! both implement this completely and are expected to pass the same
//! conformance suite (`queue-testing`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BackendError;
use crate::model::{
    CronSchedule, CronScheduleEdit, CronScheduleOptions, CreateTokenOptions, Job, JobEdit,
    JobEvent, JobOptions, Page, PageQuery, StepData, TagFilter, Waitpoint,
};

/// The fields of a claimed job's wait state, passed to `wait_job`.
#[derive(Debug, Clone, Default)]
pub struct WaitSpec {
    pub wait_until: Option<DateTime<Utc>>,
    pub wait_token_id: Option<Uuid>,
    pub step_data: StepData,
}

/// Storage backend for the job queue engine.
///
/// All mutations that depend on prior row state (claim, retry, cancel,
/// complete-waitpoint, advance-cron) are atomic: one transaction or one
/// compare-and-set, never a read-then-write pair visible to a racing
/// caller.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    // ---- jobs ---------------------------------------------------------

    /// Insert a new job in `pending` status. If `idempotency_key` matches
    /// an existing non-deleted row (any status), returns that row's id
    /// without inserting. Records an `added` event on actual insert.
    async fn add_job(&self, options: JobOptions) -> Result<Job, BackendError>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>, BackendError>;

    async fn get_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError>;

    async fn get_jobs_by_status(
        &self,
        status: crate::model::JobStatus,
        query: PageQuery,
    ) -> Result<Page<Job>, BackendError>;

    async fn get_jobs_by_tags(
        &self,
        filter: TagFilter,
        query: PageQuery,
    ) -> Result<Page<Job>, BackendError>;

    async fn get_all_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError> {
        self.get_jobs(query).await
    }

    /// The central primitive: atomically claim up to `batch_size` ready
    /// jobs for `worker_id`, ordered `priority DESC, run_at ASC, id ASC`,
    /// skipping rows locked by any other in-flight claim. Never returns a
    /// row whose `run_at` is in the future, and never returns the same row
    /// to two concurrent callers.
    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: i64,
        job_type_filter: Option<&[String]>,
    ) -> Result<Vec<Job>, BackendError>;

    async fn complete_job(&self, id: i64, output: Option<Value>) -> Result<(), BackendError>;

    async fn fail_job(
        &self,
        id: i64,
        error_message: &str,
        reason: crate::model::FailureReason,
    ) -> Result<(), BackendError>;

    /// Heartbeat: extend `locked_at` to prevent reclaim.
    async fn prolong_job(&self, id: i64) -> Result<(), BackendError>;

    /// Only from `failed | cancelled`: reset to `pending`, clear
    /// lock/wait/next-attempt fields.
    async fn retry_job(&self, id: i64) -> Result<(), BackendError>;

    /// Only from `pending`: transition to `cancelled`. No-op otherwise.
    async fn cancel_job(&self, id: i64) -> Result<(), BackendError>;

    /// Cancel every still-`pending` job matching `filter` (`None` means no
    /// tag restriction).
    async fn cancel_all_upcoming_jobs(&self, filter: Option<TagFilter>) -> Result<u64, BackendError>;

    /// Restricted to `pending` rows.
    async fn edit_job(&self, id: i64, edit: JobEdit) -> Result<Job, BackendError>;

    async fn edit_all_pending_jobs(
        &self,
        filter: Option<TagFilter>,
        edit: JobEdit,
    ) -> Result<u64, BackendError>;

    /// Rows `processing` with `locked_at` older than `max_minutes` become
    /// `pending` again. Never increments `attempts`.
    async fn reclaim_stuck_jobs(&self, max_minutes: i64) -> Result<u64, BackendError>;

    /// Stamp `pending_reason` on every still-`pending` row of `job_type`
    /// that has no registered handler, so operators can see why a type is
    /// stuck without waiting for each row to be claimed and fail.
    async fn set_pending_reason_for_job_type(
        &self,
        job_type: &str,
        reason: &str,
    ) -> Result<u64, BackendError>;

    /// Delete terminal jobs older than `days`, in batches of `batch_size`,
    /// returning the total deleted.
    async fn cleanup_old_jobs(&self, days: i64, batch_size: i64) -> Result<u64, BackendError>;

    async fn cleanup_old_job_events(&self, days: i64, batch_size: i64) -> Result<u64, BackendError>;

    // ---- handler-facing persistence -----------------------------------

    /// Transition `processing -> waiting`, persisting `step_data`.
    async fn wait_job(&self, id: i64, wait: WaitSpec) -> Result<(), BackendError>;

    /// Best-effort persistence mid-handler; implementations must not
    /// surface failures that would abort the calling handler (the
    /// processor logs and continues on `Err` here rather than failing the
    /// job).
    async fn update_step_data(&self, id: i64, step_data: StepData) -> Result<(), BackendError>;

    /// Best-effort persistence mid-handler, same non-fatal contract as
    /// `update_step_data`: stores `output` on the job row immediately
    /// rather than waiting for the handler to return, so a later
    /// suspension or crash does not lose it.
    async fn set_job_output(&self, id: i64, output: Value) -> Result<(), BackendError>;

    // ---- waitpoints -----------------------------------------------------

    async fn create_waitpoint(
        &self,
        job_id: Option<i64>,
        options: CreateTokenOptions,
    ) -> Result<Waitpoint, BackendError>;

    async fn get_waitpoint(&self, id: Uuid) -> Result<Option<Waitpoint>, BackendError>;

    /// Idempotent: completing an already-completed or expired token is a
    /// no-op. If the associated job is `waiting` on this token, it
    /// transitions back to `pending`.
    async fn complete_waitpoint(&self, id: Uuid, data: Option<Value>) -> Result<(), BackendError>;

    /// Any pending token with `timeout_at <= now` becomes `expired`; its
    /// waiting job (if any) transitions to `pending` with a marker so
    /// `wait_for_token` resolves to a timeout failure on resume.
    async fn expire_timed_out_waitpoints(&self) -> Result<u64, BackendError>;

    /// Any `waiting` job with no `wait_token_id` whose `wait_until <= now`
    /// transitions back to `pending` (clearing `wait_until`), so a plain
    /// `ctx.wait_for`/`ctx.wait_until` timer actually resumes the job
    /// rather than leaving it waiting forever. Never touches `attempts` —
    /// resuming a timed wait is a continuation, not a new attempt.
    async fn resume_timed_waits(&self) -> Result<u64, BackendError>;

    // ---- cron schedules -------------------------------------------------

    async fn add_cron_schedule(
        &self,
        options: CronScheduleOptions,
    ) -> Result<CronSchedule, BackendError>;

    async fn pause_cron_schedule(&self, id: i64) -> Result<(), BackendError>;

    async fn resume_cron_schedule(&self, id: i64) -> Result<(), BackendError>;

    async fn edit_cron_schedule(
        &self,
        id: i64,
        edit: CronScheduleEdit,
    ) -> Result<CronSchedule, BackendError>;

    async fn remove_cron_schedule(&self, id: i64) -> Result<(), BackendError>;

    async fn list_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError>;

    async fn get_cron_schedule(&self, id: i64) -> Result<Option<CronSchedule>, BackendError>;

    async fn get_cron_schedule_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CronSchedule>, BackendError>;

    /// Atomically select active schedules with `next_run_at <= now`,
    /// skipping rows locked by a concurrent caller.
    async fn get_due_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError>;

    /// Advance a schedule after enqueuing a job from its template. If
    /// `allow_overlap = false` and `last_job_id` is still non-terminal,
    /// callers must skip enqueuing and never call this.
    async fn update_cron_schedule_after_enqueue(
        &self,
        id: i64,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError>;

    /// Is `job_id`'s current status non-terminal (i.e. still running
    /// somewhere)? Used by the supervisor's overlap check.
    async fn is_job_non_terminal(&self, job_id: i64) -> Result<bool, BackendError>;

    // ---- events ----------------------------------------------------------

    /// Best-effort: failure to record must never fail the primary
    /// operation it annotates.
    async fn record_job_event(
        &self,
        job_id: i64,
        event_type: crate::model::EventType,
        metadata: Value,
    ) -> Result<(), BackendError>;

    async fn get_job_events(&self, job_id: i64, query: PageQuery) -> Result<Page<JobEvent>, BackendError>;
}
