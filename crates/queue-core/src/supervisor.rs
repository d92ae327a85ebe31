//! Background maintenance: reclaim stuck jobs, expire waitpoints, clean
//! up old rows, and fire due cron schedules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::backend::QueueBackend;
use crate::cron;
use crate::events::{EventEmitter, QueueEvent};
use crate::model::JobOptions;

/// Configuration for a [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorOptions {
    pub interval: Duration,
    pub stuck_jobs_timeout_minutes: i64,
    pub cleanup_jobs_days_to_keep: i64,
    pub cleanup_events_days_to_keep: i64,
    pub cleanup_batch_size: i64,
    pub reclaim_stuck_jobs: bool,
    pub expire_timed_out_tokens: bool,
    pub on_error: Option<Arc<dyn Fn(&anyhow::Error) + Send + Sync>>,
    pub verbose: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_jobs_timeout_minutes: 10,
            cleanup_jobs_days_to_keep: 30,
            cleanup_events_days_to_keep: 30,
            cleanup_batch_size: 1000,
            reclaim_stuck_jobs: true,
            expire_timed_out_tokens: true,
            on_error: None,
            verbose: false,
        }
    }
}

/// Periodic maintenance loop. Each tick runs its tasks in order, isolating
/// the failure of any one task from the rest.
pub struct Supervisor {
    backend: Arc<dyn QueueBackend>,
    emitter: Arc<EventEmitter>,
    options: SupervisorOptions,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    background: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn QueueBackend>, emitter: Arc<EventEmitter>, options: SupervisorOptions) -> Self {
        Self {
            backend,
            emitter,
            options,
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            background: tokio::sync::Mutex::new(None),
        }
    }

    fn report_error(&self, context: &str, err: anyhow::Error) {
        if let Some(on_error) = &self.options.on_error {
            on_error(&err);
        } else {
            tracing::error!(%context, error = %err, "supervisor task failed");
        }
        self.emitter.emit(QueueEvent::Error {
            context: context.to_string(),
            message: err.to_string(),
            detail: serde_json::Value::Null,
        });
    }

    /// Run one maintenance tick: reclaim, cleanup jobs, cleanup events,
    /// expire waitpoints, then enqueue due cron schedules. Each step's
    /// failure is isolated and does not prevent the next step from
    /// running.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);

        if self.options.reclaim_stuck_jobs {
            match self.backend.reclaim_stuck_jobs(self.options.stuck_jobs_timeout_minutes).await {
                Ok(n) if n > 0 && self.options.verbose => tracing::info!(reclaimed = n, "reclaimed stuck jobs"),
                Ok(_) => {}
                Err(err) => self.report_error("reclaim_stuck_jobs", err.into()),
            }
        }

        match self
            .backend
            .cleanup_old_jobs(self.options.cleanup_jobs_days_to_keep, self.options.cleanup_batch_size)
            .await
        {
            Ok(n) if n > 0 && self.options.verbose => tracing::info!(deleted = n, "cleaned up old jobs"),
            Ok(_) => {}
            Err(err) => self.report_error("cleanup_old_jobs", err.into()),
        }

        match self
            .backend
            .cleanup_old_job_events(self.options.cleanup_events_days_to_keep, self.options.cleanup_batch_size)
            .await
        {
            Ok(n) if n > 0 && self.options.verbose => tracing::info!(deleted = n, "cleaned up old job events"),
            Ok(_) => {}
            Err(err) => self.report_error("cleanup_old_job_events", err.into()),
        }

        if self.options.expire_timed_out_tokens {
            match self.backend.expire_timed_out_waitpoints().await {
                Ok(n) if n > 0 && self.options.verbose => tracing::info!(expired = n, "expired waitpoints"),
                Ok(_) => {}
                Err(err) => self.report_error("expire_timed_out_waitpoints", err.into()),
            }
        }

        match self.backend.resume_timed_waits().await {
            Ok(n) if n > 0 && self.options.verbose => tracing::info!(resumed = n, "resumed timed waits"),
            Ok(_) => {}
            Err(err) => self.report_error("resume_timed_waits", err.into()),
        }

        if let Err(err) = self.enqueue_due_cron_jobs().await {
            self.report_error("enqueue_due_cron_jobs", err);
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Select due, active cron schedules and enqueue a job from each
    /// template, respecting `allow_overlap`, then advance `next_run_at`.
    pub async fn enqueue_due_cron_jobs(&self) -> anyhow::Result<()> {
        let due = self.backend.get_due_cron_schedules().await?;
        for schedule in due {
            if !schedule.allow_overlap {
                if let Some(last_job_id) = schedule.last_job_id {
                    if self.backend.is_job_non_terminal(last_job_id).await? {
                        if self.options.verbose {
                            tracing::debug!(schedule = %schedule.schedule_name, "skipping overlapping cron run");
                        }
                        continue;
                    }
                }
            }

            let job = self
                .backend
                .add_job(JobOptions {
                    job_type: schedule.job_type.clone(),
                    payload: schedule.payload.clone(),
                    priority: Some(schedule.priority),
                    max_attempts: Some(schedule.max_attempts),
                    run_at: None,
                    timeout_ms: schedule.timeout_ms,
                    force_kill_on_timeout: schedule.force_kill_on_timeout,
                    tags: schedule.tags.clone(),
                    idempotency_key: None,
                })
                .await?;

            let now = Utc::now();
            let next_run_at = cron::get_next_occurrence(&schedule.cron_expression, &schedule.timezone, now).ok().flatten();

            self.backend
                .update_cron_schedule_after_enqueue(schedule.id, now, job.id, next_run_at)
                .await?;
        }
        Ok(())
    }

    pub async fn start_in_background(self: Arc<Self>) {
        let stop_requested = self.stop_requested.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                this.start().await;
                tokio::time::sleep(this.options.interval).await;
            }
        });
        *self.background.lock().await = Some(handle);
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub async fn stop_and_drain(&self, timeout: Duration) {
        self.stop();
        let handle = self.background.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
