//! The public embedder-facing surface: aggregates the backend, processor
//! and supervisor factories, and the event emitter.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::backend::QueueBackend;
use crate::error::BackendError;
use crate::events::{EventEmitter, QueueEvent};
use crate::model::{
    CreateTokenOptions, CronSchedule, CronScheduleEdit, CronScheduleOptions, Job, JobEdit,
    JobEvent, JobOptions, JobStatus, Page, PageQuery, TagFilter, Waitpoint,
};
use crate::processor::{Processor, ProcessorOptions};
use crate::supervisor::{Supervisor, SupervisorOptions};

/// Aggregates a storage backend with processor/supervisor factories and
/// the in-process event emitter. This is the single object an embedder
/// constructs and calls into.
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
    emitter: Arc<EventEmitter>,
}

impl Queue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            emitter: Arc::new(EventEmitter::default()),
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    // ---- jobs ---------------------------------------------------------

    pub async fn add_job(&self, options: JobOptions) -> Result<Job, BackendError> {
        let job = self.backend.add_job(options).await?;
        self.emitter.emit(QueueEvent::Added {
            job_id: job.id,
            job_type: job.job_type.clone(),
        });
        Ok(job)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, BackendError> {
        self.backend.get_job(id).await
    }

    pub async fn get_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError> {
        self.backend.get_jobs(query).await
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus, query: PageQuery) -> Result<Page<Job>, BackendError> {
        self.backend.get_jobs_by_status(status, query).await
    }

    pub async fn get_jobs_by_tags(&self, filter: TagFilter, query: PageQuery) -> Result<Page<Job>, BackendError> {
        self.backend.get_jobs_by_tags(filter, query).await
    }

    pub async fn get_all_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError> {
        self.backend.get_all_jobs(query).await
    }

    pub async fn retry_job(&self, id: i64) -> Result<(), BackendError> {
        self.backend.retry_job(id).await
    }

    pub async fn cancel_job(&self, id: i64) -> Result<(), BackendError> {
        self.backend.cancel_job(id).await
    }

    pub async fn cancel_all_upcoming_jobs(&self, filter: Option<TagFilter>) -> Result<u64, BackendError> {
        self.backend.cancel_all_upcoming_jobs(filter).await
    }

    pub async fn edit_job(&self, id: i64, edit: JobEdit) -> Result<Job, BackendError> {
        self.backend.edit_job(id, edit).await
    }

    pub async fn edit_all_pending_jobs(&self, filter: Option<TagFilter>, edit: JobEdit) -> Result<u64, BackendError> {
        self.backend.edit_all_pending_jobs(filter, edit).await
    }

    pub async fn cleanup_old_jobs(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        self.backend.cleanup_old_jobs(days, batch_size).await
    }

    pub async fn cleanup_old_job_events(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        self.backend.cleanup_old_job_events(days, batch_size).await
    }

    pub async fn reclaim_stuck_jobs(&self, max_minutes: i64) -> Result<u64, BackendError> {
        self.backend.reclaim_stuck_jobs(max_minutes).await
    }

    pub async fn record_job_event(&self, job_id: i64, event_type: crate::model::EventType, metadata: Value) -> Result<(), BackendError> {
        self.backend.record_job_event(job_id, event_type, metadata).await
    }

    pub async fn get_job_events(&self, job_id: i64, query: PageQuery) -> Result<Page<JobEvent>, BackendError> {
        self.backend.get_job_events(job_id, query).await
    }

    // ---- processor / supervisor factories ------------------------------

    pub fn create_processor(&self, options: ProcessorOptions) -> Processor {
        Processor::new(self.backend.clone(), self.emitter.clone(), options)
    }

    pub fn create_supervisor(&self, options: SupervisorOptions) -> Supervisor {
        Supervisor::new(self.backend.clone(), self.emitter.clone(), options)
    }

    // ---- waitpoints -----------------------------------------------------

    pub async fn create_token(&self, job_id: Option<i64>, options: CreateTokenOptions) -> Result<Waitpoint, BackendError> {
        self.backend.create_waitpoint(job_id, options).await
    }

    pub async fn complete_token(&self, id: Uuid, data: Option<Value>) -> Result<(), BackendError> {
        self.backend.complete_waitpoint(id, data.clone()).await?;
        self.emitter.emit(QueueEvent::TokenCompleted { token_id: id, job_id: None });
        Ok(())
    }

    pub async fn get_token(&self, id: Uuid) -> Result<Option<Waitpoint>, BackendError> {
        self.backend.get_waitpoint(id).await
    }

    pub async fn expire_timed_out_tokens(&self) -> Result<u64, BackendError> {
        self.backend.expire_timed_out_waitpoints().await
    }

    pub async fn resume_timed_waits(&self) -> Result<u64, BackendError> {
        self.backend.resume_timed_waits().await
    }

    // ---- cron -------------------------------------------------------------

    pub async fn add_cron_job(&self, options: CronScheduleOptions) -> Result<CronSchedule, BackendError> {
        self.backend.add_cron_schedule(options).await
    }

    pub async fn list_cron_jobs(&self) -> Result<Vec<CronSchedule>, BackendError> {
        self.backend.list_cron_schedules().await
    }

    pub async fn pause_cron_job(&self, id: i64) -> Result<(), BackendError> {
        self.backend.pause_cron_schedule(id).await
    }

    pub async fn resume_cron_job(&self, id: i64) -> Result<(), BackendError> {
        self.backend.resume_cron_schedule(id).await
    }

    pub async fn edit_cron_job(&self, id: i64, edit: CronScheduleEdit) -> Result<CronSchedule, BackendError> {
        self.backend.edit_cron_schedule(id, edit).await
    }

    pub async fn remove_cron_job(&self, id: i64) -> Result<(), BackendError> {
        self.backend.remove_cron_schedule(id).await
    }

    pub async fn enqueue_due_cron_jobs(&self) -> anyhow::Result<()> {
        let supervisor = self.create_supervisor(SupervisorOptions::default());
        supervisor.enqueue_due_cron_jobs().await
    }

    // ---- events -------------------------------------------------------------

    pub fn on(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.emitter.subscribe()
    }
}
