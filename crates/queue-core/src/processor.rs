//! The batch-claim loop: dispatches handlers with bounded concurrency,
//! per-job timeout enforcement, and optional hard-kill isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::backend::QueueBackend;
use crate::context::{CancelSignal, ForceKillable, HandlerCtx, JobHandler};
use crate::error::{BackendError, JobError};
use crate::events::{EventEmitter, QueueEvent};
use crate::model::{FailureReason, Job};

struct HandlerEntry {
    handler: Arc<dyn JobHandler>,
    force_kill_capable: bool,
}

/// Configuration for a [`Processor`].
#[derive(Clone)]
pub struct ProcessorOptions {
    pub worker_id: String,
    pub batch_size: i64,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_type_filter: Option<Vec<String>>,
    pub verbose: bool,
    pub on_error: Option<Arc<dyn Fn(&anyhow::Error) + Send + Sync>>,
    pub default_timeout_ms: Option<i64>,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size: 10,
            concurrency: 3,
            poll_interval: Duration::from_millis(5000),
            job_type_filter: None,
            verbose: false,
            on_error: None,
            default_timeout_ms: None,
        }
    }
}

/// Claims ready jobs and runs their handlers under a concurrency bound.
pub struct Processor {
    backend: Arc<dyn QueueBackend>,
    emitter: Arc<EventEmitter>,
    handlers: HashMap<String, HandlerEntry>,
    options: ProcessorOptions,
    stop_requested: Arc<AtomicBool>,
    background: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

enum HandlerOutcome {
    Completed(serde_json::Value),
    Suspended,
    Failed { message: String, reason: FailureReason },
}

impl Processor {
    pub fn new(backend: Arc<dyn QueueBackend>, emitter: Arc<EventEmitter>, options: ProcessorOptions) -> Self {
        Self {
            backend,
            emitter,
            handlers: HashMap::new(),
            options,
            stop_requested: Arc::new(AtomicBool::new(false)),
            background: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a handler for `job_type`. Jobs of this type enqueued with
    /// `force_kill_on_timeout = true` will run cooperatively-cancel-only
    /// (the cancel signal is set, but the task is never aborted) unless
    /// registered via [`Processor::register_force_killable`].
    pub fn register<H: JobHandler>(mut self, job_type: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(
            job_type.into(),
            HandlerEntry {
                handler: Arc::new(handler),
                force_kill_capable: false,
            },
        );
        self
    }

    /// Register a handler that has opted into [`ForceKillable`], allowing
    /// jobs of this type with `force_kill_on_timeout = true` to be
    /// forcibly aborted (via `JoinHandle::abort`) when their timeout
    /// fires, rather than only having their cancel signal set.
    pub fn register_force_killable<H: ForceKillable>(mut self, job_type: impl Into<String>, handler: H) -> Self {
        self.handlers.insert(
            job_type.into(),
            HandlerEntry {
                handler: Arc::new(handler),
                force_kill_capable: true,
            },
        );
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    fn report_error(&self, err: &anyhow::Error) {
        if let Some(on_error) = &self.options.on_error {
            on_error(err);
        } else {
            tracing::error!(error = %err, "processor error");
        }
        self.emitter.emit(QueueEvent::Error {
            context: "processor".to_string(),
            message: err.to_string(),
            detail: serde_json::Value::Null,
        });
    }

    /// Claim one batch and run it to completion under the concurrency
    /// bound, returning the number of jobs processed.
    pub async fn start(&self) -> Result<usize, BackendError> {
        let jobs = self
            .backend
            .get_next_batch(
                &self.options.worker_id,
                self.options.batch_size,
                self.options.job_type_filter.as_deref(),
            )
            .await?;

        let n = jobs.len();
        self.run_batch(jobs).await;
        Ok(n)
    }

    async fn run_batch(&self, jobs: Vec<Job>) {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(jobs.len());

        for job in jobs {
            self.emitter.emit(QueueEvent::Claimed {
                job_id: job.id,
                worker_id: self.options.worker_id.clone(),
            });

            let semaphore = semaphore.clone();
            let backend = self.backend.clone();
            let emitter = self.emitter.clone();
            let default_timeout_ms = self.options.default_timeout_ms;
            let entry = self.handlers.get(&job.job_type).map(|e| (e.handler.clone(), e.force_kill_capable));
            let verbose = self.options.verbose;

            let task = async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                run_one(backend, emitter, job, entry, default_timeout_ms, verbose).await
            };
            tasks.push(tokio::spawn(task));
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(join_err) = result {
                self.report_error(&anyhow::anyhow!("job task panicked: {join_err}"));
            }
        }
    }

    /// Repeated one-shot drains with `poll_interval` between them; re-fires
    /// immediately while the previous claim returned a full batch.
    pub async fn start_in_background(self: Arc<Self>) {
        let stop_requested = self.stop_requested.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match this.start().await {
                    Ok(n) if n as i64 >= this.options.batch_size && n > 0 => continue,
                    Ok(_) => {}
                    Err(err) => this.report_error(&anyhow::anyhow!(err)),
                }
                tokio::time::sleep(this.options.poll_interval).await;
            }
        });
        *self.background.lock().await = Some(handle);
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Cooperative shutdown: request stop, then await the background loop
    /// (if running) up to `timeout`.
    pub async fn stop_and_drain(&self, timeout: Duration) {
        self.stop();
        let handle = self.background.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

async fn run_one(
    backend: Arc<dyn QueueBackend>,
    emitter: Arc<EventEmitter>,
    job: Job,
    entry: Option<(Arc<dyn JobHandler>, bool)>,
    default_timeout_ms: Option<i64>,
    verbose: bool,
) {
    let job_id = job.id;

    let Some((handler, force_kill_capable)) = entry else {
        if let Err(err) = backend.set_pending_reason_for_job_type(&job.job_type, "no handler registered").await {
            tracing::warn!(job_type = %job.job_type, error = %err, "failed to stamp pending_reason");
        }
        if let Err(err) = backend.fail_job(job_id, "no handler registered for job type", FailureReason::NoHandler).await {
            tracing::warn!(job_id, error = %err, "failed to mark job as no_handler");
        }
        emitter.emit(QueueEvent::Failed {
            job_id,
            reason: FailureReason::NoHandler,
            message: "no handler registered for job type".to_string(),
        });
        return;
    };

    if verbose {
        tracing::debug!(job_id, job_type = %job.job_type, "dispatching job");
    }

    let cancel = CancelSignal::new();
    let ctx = HandlerCtx::new(job_id, backend.clone(), job.step_data.clone());
    let effective_timeout_ms = job.timeout_ms.or(default_timeout_ms);
    let allow_abort = job.force_kill_on_timeout && force_kill_capable;

    let payload = job.payload.clone();
    let task_cancel = cancel.clone();
    let mut task = tokio::spawn(async move { handler.handle(payload, task_cancel, ctx).await });

    let outcome = match effective_timeout_ms {
        Some(ms) if ms > 0 => {
            tokio::select! {
                result = &mut task => match result {
                    Ok(result) => classify(result),
                    Err(join_err) => HandlerOutcome::Failed {
                        message: format!("handler panicked: {join_err}"),
                        reason: FailureReason::HandlerError,
                    },
                },
                _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {
                    cancel.cancel();
                    if allow_abort {
                        // The closest safe-Rust equivalent to a hard kill:
                        // abort the task at its next await point. Only
                        // permitted for handlers registered as
                        // `ForceKillable`, since aborting requires no
                        // borrowed state to be left dangling.
                        task.abort();
                    }
                    HandlerOutcome::Failed {
                        message: "handler timed out".to_string(),
                        reason: FailureReason::Timeout,
                    }
                }
            }
        }
        _ => match task.await {
            Ok(result) => classify(result),
            Err(join_err) => HandlerOutcome::Failed {
                message: format!("handler panicked: {join_err}"),
                reason: FailureReason::HandlerError,
            },
        },
    };

    match outcome {
        HandlerOutcome::Suspended => {
            emitter.emit(QueueEvent::Waiting { job_id });
        }
        HandlerOutcome::Completed(output) => {
            if let Err(err) = backend.complete_job(job_id, Some(output)).await {
                tracing::warn!(job_id, error = %err, "failed to mark job completed");
            }
            emitter.emit(QueueEvent::Completed { job_id });
        }
        HandlerOutcome::Failed { message, reason } => {
            if let Err(err) = backend.fail_job(job_id, &message, reason).await {
                tracing::warn!(job_id, error = %err, "failed to mark job failed");
            }
            emitter.emit(QueueEvent::Failed { job_id, reason, message });
        }
    }
}

fn classify(result: Result<serde_json::Value, JobError>) -> HandlerOutcome {
    match result {
        Ok(value) => HandlerOutcome::Completed(value),
        Err(JobError::Suspend) => HandlerOutcome::Suspended,
        Err(JobError::Handler(err)) => HandlerOutcome::Failed {
            message: err.to_string(),
            reason: FailureReason::HandlerError,
        },
    }
}
