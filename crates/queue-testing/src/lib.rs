//! Backend-agnostic conformance suite.
//!
//! Every `QueueBackend` implementation is expected to satisfy the same
//! observable contract; this crate names that contract as a set of
//! assertions runnable against any backend, rather than duplicating the
//! same test bodies in `queue-memory` and `queue-postgres`.
//!
//! `queue-memory`'s own test suite (see this crate's `#[cfg(test)]`
//! module) runs it by default; `queue-postgres`'s `tests/conformance.rs`
//! runs the same suite against a live, migrated database when
//! `DATABASE_URL` is set, and skips itself otherwise.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use queue_core::{CreateTokenOptions, FailureReason, JobEdit, JobOptions, JobStatus, QueueBackend, TagFilter, TagQueryMode};

/// Run every conformance property against a freshly constructed backend.
/// `new_backend` must return an empty, isolated backend on each call.
pub async fn run_conformance_suite<F, Fut>(new_backend: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Arc<dyn QueueBackend>>,
{
    claim_never_returns_a_job_twice(new_backend().await).await;
    claims_order_by_priority_then_fifo(new_backend().await).await;
    idempotent_add_job_returns_existing_row(new_backend().await).await;
    failed_job_requeues_until_max_attempts_then_terminates(new_backend().await).await;
    retry_job_resets_attempts(new_backend().await).await;
    cancel_job_only_affects_pending(new_backend().await).await;
    edit_job_is_restricted_to_pending(new_backend().await).await;
    wait_then_complete_waitpoint_requeues_job(new_backend().await).await;
    expired_waitpoint_requeues_job_with_token_timeout(new_backend().await).await;
    reclaim_stuck_jobs_does_not_increment_attempts(new_backend().await).await;
    tag_filter_modes_select_the_right_rows(new_backend().await).await;
    timed_wait_resumes_after_wait_until_elapses(new_backend().await).await;
    cancel_all_upcoming_jobs_respects_filter(new_backend().await).await;
    set_output_persists_before_job_completes(new_backend().await).await;
}

async fn claim_never_returns_a_job_twice(backend: Arc<dyn QueueBackend>) {
    for i in 0..5 {
        backend
            .add_job(JobOptions::new("conformance.claim", serde_json::json!({ "i": i })))
            .await
            .unwrap();
    }
    let a = backend.get_next_batch("worker-a", 3, None).await.unwrap();
    let b = backend.get_next_batch("worker-b", 3, None).await.unwrap();
    let ids_a: HashSet<_> = a.iter().map(|j| j.id).collect();
    let ids_b: HashSet<_> = b.iter().map(|j| j.id).collect();
    assert!(ids_a.is_disjoint(&ids_b), "two claims returned overlapping jobs: {ids_a:?} / {ids_b:?}");
    assert_eq!(a.len() + b.len(), 5);
}

async fn claims_order_by_priority_then_fifo(backend: Arc<dyn QueueBackend>) {
    let j1 = backend
        .add_job(JobOptions::new("conformance.priority", serde_json::json!({})).priority(1))
        .await
        .unwrap();
    let j2 = backend
        .add_job(JobOptions::new("conformance.priority", serde_json::json!({})).priority(5))
        .await
        .unwrap();
    let j3 = backend
        .add_job(JobOptions::new("conformance.priority", serde_json::json!({})).priority(3))
        .await
        .unwrap();

    let claimed = backend.get_next_batch("worker", 10, None).await.unwrap();
    let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![j2.id, j3.id, j1.id], "claims must order priority DESC, run_at ASC, id ASC");
}

async fn idempotent_add_job_returns_existing_row(backend: Arc<dyn QueueBackend>) {
    let first = backend
        .add_job(JobOptions::new("conformance.idempotent", serde_json::json!({"n": 1})).idempotency_key("dup-key"))
        .await
        .unwrap();
    let second = backend
        .add_job(JobOptions::new("conformance.idempotent", serde_json::json!({"n": 2})).idempotency_key("dup-key"))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(
        second.payload,
        serde_json::json!({"n": 1}),
        "a repeated idempotency key must return the original row untouched"
    );
}

async fn failed_job_requeues_until_max_attempts_then_terminates(backend: Arc<dyn QueueBackend>) {
    // attempts(1) < max_attempts(2): the job must go back to `pending`
    // behind a backoff window rather than terminating.
    let retryable = backend
        .add_job(JobOptions::new("conformance.backoff", serde_json::json!({})).max_attempts(2))
        .await
        .unwrap();
    let claimed = backend.get_next_batch("worker", 1, None).await.unwrap();
    assert_eq!(claimed[0].id, retryable.id);
    backend.fail_job(retryable.id, "boom", FailureReason::HandlerError).await.unwrap();

    let after_failure = backend.get_job(retryable.id).await.unwrap().unwrap();
    assert_eq!(after_failure.status, JobStatus::Pending);
    assert_eq!(after_failure.attempts, 1);
    assert!(after_failure.next_attempt_at.is_some(), "a retryable failure must schedule a backoff window");
    assert!(after_failure.next_attempt_at.unwrap() > Utc::now());

    let reclaimed = backend.get_next_batch("worker", 1, None).await.unwrap();
    assert!(reclaimed.is_empty(), "the backoff window has not elapsed, job must not be claimable yet");

    // attempts(1) == max_attempts(1): the job must terminate instead.
    let exhausted = backend
        .add_job(JobOptions::new("conformance.backoff", serde_json::json!({})).max_attempts(1))
        .await
        .unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();
    backend.fail_job(exhausted.id, "fatal", FailureReason::HandlerError).await.unwrap();

    let terminal = backend.get_job(exhausted.id).await.unwrap().unwrap();
    assert_eq!(terminal.status, JobStatus::Failed);
    assert_eq!(terminal.failure_reason, Some(FailureReason::HandlerError));
}

async fn retry_job_resets_attempts(backend: Arc<dyn QueueBackend>) {
    let job = backend
        .add_job(JobOptions::new("conformance.retry", serde_json::json!({})).max_attempts(1))
        .await
        .unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();
    backend.fail_job(job.id, "fatal", FailureReason::HandlerError).await.unwrap();

    let failed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, failed.max_attempts);

    backend.retry_job(job.id).await.unwrap();
    let retried = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 0, "a manual retry must reset attempts or the job could never be claimed again");
}

async fn cancel_job_only_affects_pending(backend: Arc<dyn QueueBackend>) {
    let pending = backend.add_job(JobOptions::new("conformance.cancel", serde_json::json!({}))).await.unwrap();
    backend.cancel_job(pending.id).await.unwrap();
    let cancelled = backend.get_job(pending.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let running = backend.add_job(JobOptions::new("conformance.cancel", serde_json::json!({}))).await.unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();
    backend.cancel_job(running.id).await.unwrap();
    let still_processing = backend.get_job(running.id).await.unwrap().unwrap();
    assert_eq!(still_processing.status, JobStatus::Processing, "cancel_job must be a no-op outside pending");
}

async fn edit_job_is_restricted_to_pending(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.edit", serde_json::json!({"v": 1}))).await.unwrap();
    let edited = backend
        .edit_job(job.id, JobEdit { priority: Some(9), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(edited.priority, 9);

    backend.get_next_batch("worker", 1, None).await.unwrap();
    let result = backend.edit_job(job.id, JobEdit { priority: Some(1), ..Default::default() }).await;
    assert!(result.is_err(), "editing a non-pending job must fail");
}

async fn wait_then_complete_waitpoint_requeues_job(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.token", serde_json::json!({}))).await.unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();

    let token = backend.create_waitpoint(Some(job.id), CreateTokenOptions::default()).await.unwrap();
    backend
        .wait_job(
            job.id,
            queue_core::WaitSpec {
                wait_until: None,
                wait_token_id: Some(token.id),
                step_data: Default::default(),
            },
        )
        .await
        .unwrap();

    let waiting = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, JobStatus::Waiting);

    backend.complete_waitpoint(token.id, Some(serde_json::json!({"ok": true}))).await.unwrap();

    let resumed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, JobStatus::Pending, "a completed waitpoint must requeue its waiting job");

    let resolved = backend.get_waitpoint(token.id).await.unwrap().unwrap();
    assert_eq!(resolved.data, Some(serde_json::json!({"ok": true})));
}

async fn expired_waitpoint_requeues_job_with_token_timeout(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.token_timeout", serde_json::json!({}))).await.unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();

    let token = backend
        .create_waitpoint(
            Some(job.id),
            CreateTokenOptions {
                timeout: Some("1s".to_string()),
                tags: Vec::new(),
            },
        )
        .await
        .unwrap();
    backend
        .wait_job(
            job.id,
            queue_core::WaitSpec {
                wait_until: None,
                wait_token_id: Some(token.id),
                step_data: Default::default(),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let expired_count = backend.expire_timed_out_waitpoints().await.unwrap();
    assert_eq!(expired_count, 1);

    let resumed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.failure_reason, Some(FailureReason::TokenTimeout));
}

async fn reclaim_stuck_jobs_does_not_increment_attempts(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.reclaim", serde_json::json!({}))).await.unwrap();
    let claimed = backend.get_next_batch("worker", 1, None).await.unwrap();
    let attempts_at_claim = claimed[0].attempts;

    // `max_minutes: 0` reclaims immediately regardless of true elapsed time.
    let reclaimed = backend.reclaim_stuck_jobs(0).await.unwrap();
    assert_eq!(reclaimed, 1);

    let row = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.attempts, attempts_at_claim, "reclaiming a stuck job must not count as a new attempt");
}

async fn tag_filter_modes_select_the_right_rows(backend: Arc<dyn QueueBackend>) {
    backend
        .add_job(JobOptions::new("conformance.tags", serde_json::json!({})).tags(vec!["a".into(), "b".into()]))
        .await
        .unwrap();
    backend
        .add_job(JobOptions::new("conformance.tags", serde_json::json!({})).tags(vec!["b".into(), "c".into()]))
        .await
        .unwrap();
    backend
        .add_job(JobOptions::new("conformance.tags", serde_json::json!({})).tags(vec!["d".into()]))
        .await
        .unwrap();

    let any = backend
        .get_jobs_by_tags(
            TagFilter { tags: vec!["b".into()], mode: TagQueryMode::Any },
            queue_core::PageQuery::new(100),
        )
        .await
        .unwrap();
    assert_eq!(any.items.len(), 2, "Any mode must match rows sharing at least one tag");

    let none = backend
        .get_jobs_by_tags(
            TagFilter { tags: vec!["b".into()], mode: TagQueryMode::None },
            queue_core::PageQuery::new(100),
        )
        .await
        .unwrap();
    assert_eq!(none.items.len(), 1, "None mode must match rows disjoint from the query set");

    let exact = backend
        .get_jobs_by_tags(
            TagFilter { tags: vec!["a".into(), "b".into()], mode: TagQueryMode::Exact },
            queue_core::PageQuery::new(100),
        )
        .await
        .unwrap();
    assert_eq!(exact.items.len(), 1);

    let all = backend
        .get_jobs_by_tags(
            TagFilter { tags: vec!["b".into()], mode: TagQueryMode::All },
            queue_core::PageQuery::new(100),
        )
        .await
        .unwrap();
    assert_eq!(all.items.len(), 2);
}

async fn timed_wait_resumes_after_wait_until_elapses(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.timed_wait", serde_json::json!({}))).await.unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();

    backend
        .wait_job(
            job.id,
            queue_core::WaitSpec {
                wait_until: Some(Utc::now() + chrono::Duration::milliseconds(200)),
                wait_token_id: None,
                step_data: Default::default(),
            },
        )
        .await
        .unwrap();

    let waiting = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, JobStatus::Waiting);
    assert!(
        backend.get_next_batch("worker", 1, None).await.unwrap().is_empty(),
        "a waiting job must never reappear in get_next_batch before its wait resolves"
    );

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let resumed_count = backend.resume_timed_waits().await.unwrap();
    assert_eq!(resumed_count, 1);

    let resumed = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);
    assert!(resumed.wait_until.is_none());
}

async fn cancel_all_upcoming_jobs_respects_filter(backend: Arc<dyn QueueBackend>) {
    let tagged = backend
        .add_job(JobOptions::new("conformance.cancel_all", serde_json::json!({})).tags(vec!["urgent".into()]))
        .await
        .unwrap();
    let untagged = backend
        .add_job(JobOptions::new("conformance.cancel_all", serde_json::json!({})))
        .await
        .unwrap();

    let cancelled = backend
        .cancel_all_upcoming_jobs(Some(TagFilter { tags: vec!["urgent".into()], mode: TagQueryMode::Any }))
        .await
        .unwrap();
    assert_eq!(cancelled, 1, "a filtered cancel-all must only affect matching rows");

    let tagged_row = backend.get_job(tagged.id).await.unwrap().unwrap();
    assert_eq!(tagged_row.status, JobStatus::Cancelled);
    let untagged_row = backend.get_job(untagged.id).await.unwrap().unwrap();
    assert_eq!(untagged_row.status, JobStatus::Pending, "cancel_all with a filter must leave non-matching rows alone");

    let cancelled_all = backend.cancel_all_upcoming_jobs(None).await.unwrap();
    assert_eq!(cancelled_all, 1, "an unfiltered cancel-all must cancel every remaining pending row");
    let remaining = backend.get_job(untagged.id).await.unwrap().unwrap();
    assert_eq!(remaining.status, JobStatus::Cancelled);
}

async fn set_output_persists_before_job_completes(backend: Arc<dyn QueueBackend>) {
    let job = backend.add_job(JobOptions::new("conformance.set_output", serde_json::json!({}))).await.unwrap();
    backend.get_next_batch("worker", 1, None).await.unwrap();

    backend.set_job_output(job.id, serde_json::json!({ "partial": true })).await.unwrap();

    let mid_flight = backend.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(
        mid_flight.output,
        Some(serde_json::json!({ "partial": true })),
        "set_job_output must be visible before the job completes"
    );
    assert_eq!(mid_flight.status, JobStatus::Processing, "set_job_output must not change job status");
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_memory::MemoryBackend;

    #[tokio::test]
    async fn memory_backend_satisfies_the_conformance_suite() {
        run_conformance_suite(|| async { Arc::new(MemoryBackend::new()) as Arc<dyn QueueBackend> }).await;
    }
}
