//! # queue-core
//!
//! A durable background job queue engine: producers submit typed jobs,
//! worker processes claim ready jobs under bounded concurrency, execute
//! user-supplied handlers, and persist outcomes with at-least-once
//! execution semantics.
//!
//! ## Architecture
//!
//! ```text
//! producer ──► Queue::add_job ──► Backend::add_job ──► event(added)
//!
//! Processor::start ──► Backend::get_next_batch ──► handler(payload, cancel, ctx)
//!                                                       │
//!                           ctx.run / ctx.wait_for / ctx.wait_for_token
//!                                                       │
//!                                  Backend::complete_job | fail_job | wait_job
//!
//! Supervisor::start ──► Backend::reclaim_stuck_jobs / cleanup_* / expire_*
//!                   └─► Backend::get_due_cron_schedules ──► Backend::add_job
//! ```
//!
//! ## Key Invariants
//!
//! 1. Two concurrent claims against one backend never return the same job.
//! 2. A job never re-executes a memoized step after a retry.
//! 3. Terminal statuses (`completed | failed | cancelled`) never transition
//!    further except via an explicit `retry_job`.
//! 4. Events for a single job are appended in causal order; events across
//!    jobs are not linearizable.
//!
//! ## What This Is Not
//!
//! `queue-core` is **not**:
//! - An exactly-once delivery system (at-least-once execution with
//!   idempotent enqueue)
//! - A strict-FIFO queue (priority overrides FIFO)
//! - A pub/sub system (one handler invocation path per attempt)
//!
//! The storage backend (`QueueBackend`) is the sole abstraction boundary
//! between this engine and a concrete store; see `queue-postgres` and
//! `queue-memory` for the two shipped implementations.

mod backend;
mod context;
mod cron;
mod error;
mod events;
mod facade;
mod model;
mod processor;
mod supervisor;

pub use backend::{QueueBackend, WaitSpec};
pub use context::{CancelSignal, ForceKillable, HandlerCtx, JobHandler, RelativeWait, TokenWait};
pub use cron::{get_next_occurrence, validate as validate_cron_expression, validate_timezone};
pub use error::{BackendError, CronError, JobError};
pub use events::{EventEmitter, QueueEvent};
pub use facade::Queue;
pub use model::{
    CreateTokenOptions, CronSchedule, CronScheduleEdit, CronScheduleOptions, CronScheduleStatus,
    ErrorEntry, EventType, FailureReason, Job, JobEdit, JobEvent, JobOptions, JobStatus, Page,
    PageQuery, StepData, TagFilter, TagQueryMode, Waitpoint, WaitpointStatus,
};
pub use processor::{Processor, ProcessorOptions};
pub use supervisor::{Supervisor, SupervisorOptions};

pub use async_trait::async_trait;
