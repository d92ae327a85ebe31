//! End-to-end tests exercising the suspend/replay contract: step
//! memoization across a timed suspension, a full token-wait round trip,
//! and idempotent enqueue under genuine concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use queue_core::{
    CancelSignal, CreateTokenOptions, EventEmitter, HandlerCtx, JobError, JobHandler, JobOptions,
    JobStatus, Processor, ProcessorOptions, QueueBackend, TokenWait,
};
use queue_memory::MemoryBackend;
use serde_json::Value;

fn backend() -> Arc<dyn QueueBackend> {
    Arc::new(MemoryBackend::new())
}

/// A handler whose first step increments a shared counter and whose
/// second step suspends for a short, fixed duration. Replaying it must
/// never re-run the first step.
struct SuspendingPipeline {
    fetch_calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl JobHandler for SuspendingPipeline {
    async fn handle(&self, _payload: Value, _cancel: CancelSignal, ctx: HandlerCtx) -> Result<Value, JobError> {
        let fetched: i64 = ctx
            .run("fetch", || {
                let calls = self.fetch_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42i64)
                }
            })
            .await?;

        ctx.wait_for(queue_core::RelativeWait::seconds(0)).await?;

        ctx.set_progress(100).await?;
        Ok(serde_json::json!({ "fetched": fetched }))
    }
}

#[tokio::test]
async fn memoized_step_is_not_rerun_across_a_suspend_replay_cycle() {
    let backend = backend();
    let emitter = Arc::new(EventEmitter::default());
    let fetch_calls = Arc::new(AtomicUsize::new(0));

    let job = backend
        .add_job(JobOptions::new("conformance.pipeline", serde_json::json!({})))
        .await
        .unwrap();

    let processor = Processor::new(
        backend.clone(),
        emitter,
        ProcessorOptions {
            poll_interval: std::time::Duration::from_millis(20),
            ..Default::default()
        },
    )
    .register(
        "conformance.pipeline",
        SuspendingPipeline {
            fetch_calls: fetch_calls.clone(),
        },
    );

    // First claim: runs `fetch`, then suspends at `wait_for`.
    processor.start().await.unwrap();
    let suspended = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(suspended.status, JobStatus::Waiting);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);

    // A zero-second wait is already due; resuming it flips the job back
    // to `pending` without touching `attempts`.
    let resumed = backend.resume_timed_waits().await.unwrap();
    assert_eq!(resumed, 1);

    // Second claim replays from the top: `fetch` must be skipped (step
    // data already has it memoized), only the wait site progresses past
    // its now-satisfied marker, and the handler completes.
    processor.start().await.unwrap();
    let completed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1, "fetch must not re-run on replay");
    assert_eq!(completed.output, Some(serde_json::json!({ "fetched": 42 })));
}

struct TokenWaiter;

#[async_trait::async_trait]
impl JobHandler for TokenWaiter {
    async fn handle(&self, _payload: Value, _cancel: CancelSignal, ctx: HandlerCtx) -> Result<Value, JobError> {
        let token = ctx.create_token(CreateTokenOptions::default()).await?;
        let result = ctx.wait_for_token(token).await?;
        match result {
            TokenWait::Completed(data) => Ok(serde_json::json!({ "approved": true, "data": data })),
            TokenWait::TimedOut => Ok(serde_json::json!({ "approved": false })),
        }
    }
}

#[tokio::test]
async fn token_wait_resolves_on_external_completion_and_replay_reads_it_back() {
    let backend = backend();
    let emitter = Arc::new(EventEmitter::default());

    let job = backend
        .add_job(JobOptions::new("conformance.approval", serde_json::json!({})))
        .await
        .unwrap();

    let processor = Processor::new(backend.clone(), emitter, ProcessorOptions::default())
        .register("conformance.approval", TokenWaiter);

    // First claim: mints a token and suspends on it.
    processor.start().await.unwrap();
    let waiting = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, JobStatus::Waiting);

    // The token id is memoized in step_data under the call-order key;
    // find it via the waitpoint list rather than reaching into
    // step_data's internal encoding.
    let token_id = waiting
        .wait_token_id
        .expect("a token-bound wait must record its waitpoint id on the job");

    backend
        .complete_waitpoint(token_id, Some(serde_json::json!({ "approver": "alice" })))
        .await
        .unwrap();

    let resumed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);

    // Second claim replays: `wait_for_token` reads the waitpoint's
    // resolved state instead of suspending again.
    processor.start().await.unwrap();
    let completed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(
        completed.output,
        Some(serde_json::json!({ "approved": true, "data": { "approver": "alice" } }))
    );
}

#[tokio::test]
async fn concurrent_idempotent_enqueues_never_create_two_rows() {
    let backend = backend();
    let key = format!("stress-{}", fastrand::u64(..));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let backend = backend.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            backend
                .add_job(
                    JobOptions::new("conformance.stress", serde_json::json!({}))
                        .idempotency_key(key),
                )
                .await
                .unwrap()
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().id);
    }

    assert_eq!(ids.len(), 1, "every concurrent add_job with the same idempotency key must yield the same id");

    let page = backend
        .get_jobs_by_status(JobStatus::Pending, queue_core::PageQuery::new(100))
        .await
        .unwrap();
    let matching = page.items.iter().filter(|j| j.job_type == "conformance.stress").count();
    assert_eq!(matching, 1, "no duplicate row may have been created under the race");
}
