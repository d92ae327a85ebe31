//! The durable data model: jobs, events, waitpoints, and cron schedules.
//!
//! Every persisted shape here is a tagged enum rather than a raw string
//! column, per the redesign notes: `JobStatus`, `FailureReason`,
//! `EventType`, `WaitpointStatus`, `CronScheduleStatus`, and
//! `TagQueryMode` are closed sets the backend and the engine agree on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Job`].
///
/// `pending -> processing -> (completed | waiting | failed)`;
/// `waiting -> pending` on timer or token completion;
/// `failed -> pending` automatically while `attempts < max_attempts`, or
/// manually via `retry_job`; `pending -> cancelled` only while pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition further except via `retry_job`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Why a job's most recent attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    HandlerError,
    NoHandler,
    Cancelled,
    TokenTimeout,
}

/// A single recorded failure (`Job::error_history` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-job map from step name to a memoized, serialized return value.
///
/// Populated by `ctx.run(name, fn)` after `fn` succeeds. Also used, with
/// reserved `__wait:N` / `__token:N` keys, to memoize wait and token-create
/// sites across handler replays (see `queue_core::context`).
pub type StepData = HashMap<String, serde_json::Value>;

/// A unit of durable, eventually-executed work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub tags: Vec<String>,
    pub idempotency_key: Option<String>,
    pub error_history: Vec<ErrorEntry>,
    pub failure_reason: Option<FailureReason>,
    pub pending_reason: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
    pub wait_token_id: Option<Uuid>,
    pub step_data: StepData,
    pub progress: i32,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_retried_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_cancelled_at: Option<DateTime<Utc>>,
}

/// Options accepted by `QueueBackend::add_job` / `Queue::add_job`.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub tags: Vec<String>,
    pub idempotency_key: Option<String>,
}

impl JobOptions {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn force_kill_on_timeout(mut self, yes: bool) -> Self {
        self.force_kill_on_timeout = yes;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Fields an embedder may change on a still-`pending` job via `edit_job`.
#[derive(Debug, Clone, Default)]
pub struct JobEdit {
    pub payload: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub tags: Option<Vec<String>>,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i64>,
    pub max_attempts: Option<i32>,
}

/// Event types recorded on the append-only `job_events` log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Added,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retried,
    Edited,
    Prolonged,
    Waiting,
    TokenCompleted,
    Progress,
    Reclaimed,
}

/// A single append-only audit record for a job's state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: i64,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Status of a [`Waitpoint`] token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitpointStatus {
    Pending,
    Completed,
    Expired,
}

/// An external-signal mechanism that pauses a job until a correlated
/// completion call (or timeout). A completed or expired token is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: Uuid,
    pub job_id: Option<i64>,
    pub status: WaitpointStatus,
    pub timeout_at: Option<DateTime<Utc>>,
    pub data: Option<serde_json::Value>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Options accepted by `QueueBackend::create_waitpoint`.
#[derive(Debug, Clone, Default)]
pub struct CreateTokenOptions {
    /// A duration string: `Ns | Nm | Nh | Nd`.
    pub timeout: Option<String>,
    pub tags: Vec<String>,
}

/// Status of a [`CronSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronScheduleStatus {
    Active,
    Paused,
}

/// A declarative trigger that enqueues a templated job on a time pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: i64,
    pub schedule_name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub tags: Vec<String>,
    pub allow_overlap: bool,
    pub status: CronScheduleStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<i64>,
}

/// Options accepted by `QueueBackend::add_cron_schedule`.
#[derive(Debug, Clone)]
pub struct CronScheduleOptions {
    pub schedule_name: String,
    pub cron_expression: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub timezone: String,
    pub allow_overlap: bool,
    pub max_attempts: i32,
    pub priority: i32,
    pub timeout_ms: Option<i64>,
    pub force_kill_on_timeout: bool,
    pub tags: Vec<String>,
}

impl CronScheduleOptions {
    pub fn new(
        schedule_name: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            schedule_name: schedule_name.into(),
            cron_expression: cron_expression.into(),
            job_type: job_type.into(),
            payload,
            timezone: "UTC".to_string(),
            allow_overlap: false,
            max_attempts: 3,
            priority: 0,
            timeout_ms: None,
            force_kill_on_timeout: false,
            tags: Vec::new(),
        }
    }
}

/// Fields an embedder may change on a cron schedule via `edit_cron_schedule`.
#[derive(Debug, Clone, Default)]
pub struct CronScheduleEdit {
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub timeout_ms: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub allow_overlap: Option<bool>,
}

/// Set-algebraic predicate for filtering jobs by their tag sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagQueryMode {
    /// Row's tags equal the query set exactly.
    Exact,
    /// Row contains every query tag (superset).
    All,
    /// Intersection with the query set is non-empty.
    Any,
    /// Intersection with the query set is empty.
    None,
}

/// A page of results from a cursor-paginated query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<i64>,
}

/// Offset/limit or keyset-cursor pagination, plus optional status/type
/// narrowing, for `get_jobs` / `get_jobs_by_status`.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub cursor: Option<i64>,
    pub limit: i64,
    pub job_type: Option<String>,
}

impl PageQuery {
    pub fn new(limit: i64) -> Self {
        Self {
            cursor: None,
            limit,
            job_type: None,
        }
    }
}

/// A tag filter for `get_jobs_by_tags` / `cancel_all_upcoming_jobs` /
/// `edit_all_pending_jobs`.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub tags: Vec<String>,
    pub mode: TagQueryMode,
}
