//! In-process, `DashMap`-backed implementation of `queue_core::QueueBackend`.
//!
//! This is the "key-value backend" parallel variant from the spec: no SQL,
//! no external process, a per-id lease for claims guarded by a single
//! coarse-grained critical section (a `tokio::sync::Mutex` around the
//! batch-select step) rather than `FOR UPDATE SKIP LOCKED`. It is suitable
//! for tests, demos, and embedders who don't need a relational store, and
//! implements the exact same `QueueBackend` contract `queue-postgres`
//! does — `queue-testing`'s conformance suite runs against both.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use queue_core::{
    BackendError, CreateTokenOptions, CronSchedule, CronScheduleEdit, CronScheduleOptions,
    CronScheduleStatus, ErrorEntry, EventType, FailureReason, Job, JobEdit, JobEvent, JobOptions,
    JobStatus, Page, PageQuery, QueueBackend, StepData, TagFilter, TagQueryMode, Waitpoint,
    WaitSpec, WaitpointStatus,
};
use uuid::Uuid;

/// Parse a `Ns | Nm | Nh | Nd` duration string into an absolute instant
/// relative to `now`.
fn parse_timeout(spec: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let (digits, unit) = spec.split_at(spec.len().saturating_sub(1));
    let n: i64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timeout spec '{spec}'"))?;
    let duration = match unit {
        "s" => Duration::seconds(n),
        "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        _ => anyhow::bail!("invalid timeout unit in '{spec}', expected one of s/m/h/d"),
    };
    Ok(now + duration)
}

fn backoff_delay(attempts: i32) -> Duration {
    let minutes = 2i64.saturating_pow((attempts - 1).max(0) as u32);
    Duration::minutes(minutes)
}

fn tags_match(job_tags: &[String], filter: &TagFilter) -> bool {
    use std::collections::HashSet;
    let job: HashSet<&str> = job_tags.iter().map(String::as_str).collect();
    let query: HashSet<&str> = filter.tags.iter().map(String::as_str).collect();
    match filter.mode {
        TagQueryMode::Exact => job == query,
        TagQueryMode::All => query.is_subset(&job),
        TagQueryMode::Any => !job.is_disjoint(&query),
        TagQueryMode::None => job.is_disjoint(&query),
    }
}

fn new_job(id: i64, now: DateTime<Utc>, options: JobOptions) -> Job {
    Job {
        id,
        job_type: options.job_type,
        payload: options.payload,
        status: JobStatus::Pending,
        priority: options.priority.unwrap_or(0),
        run_at: options.run_at.unwrap_or(now),
        attempts: 0,
        max_attempts: options.max_attempts.unwrap_or(3),
        next_attempt_at: None,
        locked_at: None,
        locked_by: None,
        timeout_ms: options.timeout_ms,
        force_kill_on_timeout: options.force_kill_on_timeout,
        tags: options.tags,
        idempotency_key: options.idempotency_key,
        error_history: Vec::new(),
        failure_reason: None,
        pending_reason: None,
        wait_until: None,
        wait_token_id: None,
        step_data: StepData::new(),
        progress: 0,
        output: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        last_retried_at: None,
        last_failed_at: None,
        last_cancelled_at: None,
    }
}

fn paginate<T: Clone>(mut items: Vec<(i64, T)>, query: &PageQuery) -> Page<T> {
    items.sort_by_key(|(id, _)| *id);
    if let Some(cursor) = query.cursor {
        items.retain(|(id, _)| *id < cursor);
    }
    let limit = if query.limit <= 0 { items.len() as i64 } else { query.limit };
    let next_cursor = if (limit as usize) < items.len() {
        items.get(limit as usize).map(|(id, _)| *id)
    } else {
        None
    };
    items.truncate(limit.max(0) as usize);
    Page {
        items: items.into_iter().map(|(_, v)| v).collect(),
        next_cursor,
    }
}

/// In-memory `QueueBackend`. Cloning shares the same underlying maps.
#[derive(Clone)]
pub struct MemoryBackend {
    jobs: Arc<DashMap<i64, Job>>,
    next_job_id: Arc<AtomicI64>,
    idempotency_index: Arc<DashMap<String, i64>>,
    events: Arc<DashMap<i64, JobEvent>>,
    next_event_id: Arc<AtomicI64>,
    waitpoints: Arc<DashMap<Uuid, Waitpoint>>,
    cron_schedules: Arc<DashMap<i64, CronSchedule>>,
    next_cron_id: Arc<AtomicI64>,
    claim_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_job_id: Arc::new(AtomicI64::new(1)),
            idempotency_index: Arc::new(DashMap::new()),
            events: Arc::new(DashMap::new()),
            next_event_id: Arc::new(AtomicI64::new(1)),
            waitpoints: Arc::new(DashMap::new()),
            cron_schedules: Arc::new(DashMap::new()),
            next_cron_id: Arc::new(AtomicI64::new(1)),
            claim_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn record_event(&self, job_id: i64, event_type: EventType, metadata: serde_json::Value) {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.events.insert(
            id,
            JobEvent {
                id,
                job_id,
                event_type,
                created_at: Utc::now(),
                metadata,
            },
        );
    }

    fn get_job_mut_or_err(&self, id: i64) -> Result<dashmap::mapref::one::RefMut<'_, i64, Job>, BackendError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| BackendError::permanent(anyhow::anyhow!("job {id} not found")))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn add_job(&self, options: JobOptions) -> Result<Job, BackendError> {
        // The idempotency check-then-insert must be atomic per key: two
        // concurrent `add_job` calls racing on the same key must not both
        // observe "absent" and both create a row. `DashMap::entry` holds
        // that key's shard lock across the whole match arm, so the second
        // caller either sees the first caller's id already there or blocks
        // until it is.
        if let Some(key) = options.idempotency_key.clone() {
            match self.idempotency_index.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(e) => {
                    let existing_id = *e.get();
                    if let Some(job) = self.jobs.get(&existing_id) {
                        return Ok(job.clone());
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
                    let job = new_job(id, Utc::now(), options);
                    e.insert(id);
                    self.jobs.insert(id, job.clone());
                    self.record_event(id, EventType::Added, serde_json::json!({ "job_type": job.job_type }));
                    return Ok(job);
                }
            }
        }

        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = new_job(id, Utc::now(), options);
        self.jobs.insert(id, job.clone());
        self.record_event(id, EventType::Added, serde_json::json!({ "job_type": job.job_type }));
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, BackendError> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn get_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let items: Vec<(i64, Job)> = self
            .jobs
            .iter()
            .filter(|e| query.job_type.as_deref().map_or(true, |t| e.job_type == t))
            .map(|e| (e.id, e.clone()))
            .collect();
        Ok(paginate(items, &query))
    }

    async fn get_jobs_by_status(&self, status: JobStatus, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let items: Vec<(i64, Job)> = self
            .jobs
            .iter()
            .filter(|e| e.status == status)
            .filter(|e| query.job_type.as_deref().map_or(true, |t| e.job_type == t))
            .map(|e| (e.id, e.clone()))
            .collect();
        Ok(paginate(items, &query))
    }

    async fn get_jobs_by_tags(&self, filter: TagFilter, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let items: Vec<(i64, Job)> = self
            .jobs
            .iter()
            .filter(|e| tags_match(&e.tags, &filter))
            .map(|e| (e.id, e.clone()))
            .collect();
        Ok(paginate(items, &query))
    }

    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: i64,
        job_type_filter: Option<&[String]>,
    ) -> Result<Vec<Job>, BackendError> {
        let _guard = self.claim_lock.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Pending
                    && e.run_at <= now
                    && e.next_attempt_at.map_or(true, |t| t <= now)
                    && e.attempts < e.max_attempts
                    && job_type_filter.map_or(true, |types| types.iter().any(|t| t == &e.job_type))
            })
            .map(|e| e.clone())
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(batch_size.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(mut job) = self.jobs.get_mut(&candidate.id) {
                job.status = JobStatus::Processing;
                job.locked_at = Some(now);
                job.locked_by = Some(worker_id.to_string());
                job.attempts += 1;
                job.started_at = job.started_at.or(Some(now));
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }

        for job in &claimed {
            self.record_event(job.id, EventType::Processing, serde_json::json!({ "worker_id": worker_id }));
        }

        Ok(claimed)
    }

    async fn complete_job(&self, id: i64, output: Option<serde_json::Value>) -> Result<(), BackendError> {
        let now = Utc::now();
        {
            let mut job = self.get_job_mut_or_err(id)?;
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.locked_at = None;
            job.locked_by = None;
            job.output = output;
            job.updated_at = now;
        }
        self.record_event(id, EventType::Completed, serde_json::Value::Null);
        Ok(())
    }

    async fn fail_job(&self, id: i64, error_message: &str, reason: FailureReason) -> Result<(), BackendError> {
        let now = Utc::now();
        {
            let mut job = self.get_job_mut_or_err(id)?;
            job.error_history.push(ErrorEntry {
                message: error_message.to_string(),
                timestamp: now,
            });
            job.failure_reason = Some(reason);
            job.locked_at = None;
            job.locked_by = None;

            if job.attempts < job.max_attempts {
                job.status = JobStatus::Pending;
                job.next_attempt_at = Some(now + backoff_delay(job.attempts));
                job.last_failed_at = Some(now);
            } else {
                job.status = JobStatus::Failed;
                job.last_failed_at = Some(now);
            }
            job.updated_at = now;
        }
        self.record_event(
            id,
            EventType::Failed,
            serde_json::json!({ "message": error_message, "reason": reason }),
        );
        Ok(())
    }

    async fn prolong_job(&self, id: i64) -> Result<(), BackendError> {
        let mut job = self.get_job_mut_or_err(id)?;
        if job.status == JobStatus::Processing {
            job.locked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn retry_job(&self, id: i64) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut job = self.get_job_mut_or_err(id)?;
        if job.status == JobStatus::Failed || job.status == JobStatus::Cancelled {
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.next_attempt_at = None;
            job.locked_at = None;
            job.locked_by = None;
            job.wait_until = None;
            job.wait_token_id = None;
            job.failure_reason = None;
            job.last_retried_at = Some(now);
            job.updated_at = now;
        }
        drop(job);
        self.record_event(id, EventType::Retried, serde_json::Value::Null);
        Ok(())
    }

    async fn cancel_job(&self, id: i64) -> Result<(), BackendError> {
        let now = Utc::now();
        let cancelled = {
            let mut job = self.get_job_mut_or_err(id)?;
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.last_cancelled_at = Some(now);
                job.updated_at = now;
                true
            } else {
                false
            }
        };
        if cancelled {
            self.record_event(id, EventType::Cancelled, serde_json::Value::Null);
        }
        Ok(())
    }

    async fn cancel_all_upcoming_jobs(&self, filter: Option<TagFilter>) -> Result<u64, BackendError> {
        let now = Utc::now();
        let ids: Vec<i64> = self
            .jobs
            .iter()
            .filter(|e| e.status == JobStatus::Pending)
            .filter(|e| filter.as_ref().map_or(true, |f| tags_match(&e.tags, f)))
            .map(|e| e.id)
            .collect();

        for id in &ids {
            if let Some(mut job) = self.jobs.get_mut(id) {
                job.status = JobStatus::Cancelled;
                job.last_cancelled_at = Some(now);
                job.updated_at = now;
            }
            self.record_event(*id, EventType::Cancelled, serde_json::Value::Null);
        }
        Ok(ids.len() as u64)
    }

    async fn edit_job(&self, id: i64, edit: JobEdit) -> Result<Job, BackendError> {
        let now = Utc::now();
        let mut job = self.get_job_mut_or_err(id)?;
        if job.status != JobStatus::Pending {
            return Err(BackendError::permanent(anyhow::anyhow!(
                "job {id} is not pending; only pending jobs may be edited"
            )));
        }
        if let Some(payload) = edit.payload {
            job.payload = payload;
        }
        if let Some(priority) = edit.priority {
            job.priority = priority;
        }
        if let Some(tags) = edit.tags {
            job.tags = tags;
        }
        if let Some(run_at) = edit.run_at {
            job.run_at = run_at;
        }
        if let Some(timeout_ms) = edit.timeout_ms {
            job.timeout_ms = Some(timeout_ms);
        }
        if let Some(max_attempts) = edit.max_attempts {
            job.max_attempts = max_attempts;
        }
        job.updated_at = now;
        let result = job.clone();
        drop(job);
        self.record_event(id, EventType::Edited, serde_json::Value::Null);
        Ok(result)
    }

    async fn edit_all_pending_jobs(&self, filter: Option<TagFilter>, edit: JobEdit) -> Result<u64, BackendError> {
        let ids: Vec<i64> = self
            .jobs
            .iter()
            .filter(|e| e.status == JobStatus::Pending)
            .filter(|e| filter.as_ref().map_or(true, |f| tags_match(&e.tags, f)))
            .map(|e| e.id)
            .collect();

        for id in &ids {
            self.edit_job(*id, edit.clone()).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn reclaim_stuck_jobs(&self, max_minutes: i64) -> Result<u64, BackendError> {
        let now = Utc::now();
        let threshold = now - Duration::minutes(max_minutes);
        let ids: Vec<i64> = self
            .jobs
            .iter()
            .filter(|e| e.status == JobStatus::Processing)
            .filter(|e| e.locked_at.map_or(false, |locked_at| locked_at < threshold))
            .map(|e| e.id)
            .collect();

        for id in &ids {
            if let Some(mut job) = self.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.locked_at = None;
                job.locked_by = None;
                job.updated_at = now;
            }
            self.record_event(*id, EventType::Reclaimed, serde_json::Value::Null);
        }
        Ok(ids.len() as u64)
    }

    async fn set_pending_reason_for_job_type(&self, job_type: &str, reason: &str) -> Result<u64, BackendError> {
        let mut n = 0u64;
        for mut entry in self.jobs.iter_mut() {
            if entry.job_type == job_type && entry.status == JobStatus::Pending {
                entry.pending_reason = Some(reason.to_string());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn cleanup_old_jobs(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        let threshold = Utc::now() - Duration::days(days);
        let mut deleted = 0u64;
        loop {
            let batch: Vec<i64> = self
                .jobs
                .iter()
                .filter(|e| e.status.is_terminal() && e.updated_at < threshold)
                .map(|e| e.id)
                .take(batch_size.max(1) as usize)
                .collect();
            if batch.is_empty() {
                break;
            }
            for id in &batch {
                if let Some((_, job)) = self.jobs.remove(id) {
                    if let Some(key) = job.idempotency_key {
                        self.idempotency_index.remove(&key);
                    }
                }
            }
            deleted += batch.len() as u64;
        }
        Ok(deleted)
    }

    async fn cleanup_old_job_events(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        let threshold = Utc::now() - Duration::days(days);
        let mut deleted = 0u64;
        loop {
            let batch: Vec<i64> = self
                .events
                .iter()
                .filter(|e| e.created_at < threshold)
                .map(|e| e.id)
                .take(batch_size.max(1) as usize)
                .collect();
            if batch.is_empty() {
                break;
            }
            for id in &batch {
                self.events.remove(id);
            }
            deleted += batch.len() as u64;
        }
        Ok(deleted)
    }

    async fn wait_job(&self, id: i64, wait: WaitSpec) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut job = self.get_job_mut_or_err(id)?;
        job.status = JobStatus::Waiting;
        job.wait_until = wait.wait_until;
        job.wait_token_id = wait.wait_token_id;
        job.step_data = wait.step_data;
        job.updated_at = now;
        drop(job);
        self.record_event(id, EventType::Waiting, serde_json::Value::Null);
        Ok(())
    }

    async fn update_step_data(&self, id: i64, step_data: StepData) -> Result<(), BackendError> {
        let mut job = self.get_job_mut_or_err(id)?;
        job.step_data = step_data;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_job_output(&self, id: i64, output: serde_json::Value) -> Result<(), BackendError> {
        let mut job = self.get_job_mut_or_err(id)?;
        job.output = Some(output);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn create_waitpoint(&self, job_id: Option<i64>, options: CreateTokenOptions) -> Result<Waitpoint, BackendError> {
        let now = Utc::now();
        let timeout_at = match options.timeout {
            Some(spec) => Some(parse_timeout(&spec, now).map_err(BackendError::permanent)?),
            None => None,
        };
        let waitpoint = Waitpoint {
            id: Uuid::new_v4(),
            job_id,
            status: WaitpointStatus::Pending,
            timeout_at,
            data: None,
            tags: options.tags,
            created_at: now,
        };
        self.waitpoints.insert(waitpoint.id, waitpoint.clone());
        Ok(waitpoint)
    }

    async fn get_waitpoint(&self, id: Uuid) -> Result<Option<Waitpoint>, BackendError> {
        Ok(self.waitpoints.get(&id).map(|w| w.clone()))
    }

    async fn complete_waitpoint(&self, id: Uuid, data: Option<serde_json::Value>) -> Result<(), BackendError> {
        let now = Utc::now();
        let job_id = {
            let mut waitpoint = match self.waitpoints.get_mut(&id) {
                Some(w) => w,
                None => return Ok(()),
            };
            if waitpoint.status != WaitpointStatus::Pending {
                return Ok(());
            }
            waitpoint.status = WaitpointStatus::Completed;
            waitpoint.data = data;
            waitpoint.job_id
        };

        if let Some(job_id) = job_id {
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                if job.status == JobStatus::Waiting && job.wait_token_id == Some(id) {
                    job.status = JobStatus::Pending;
                    job.wait_until = None;
                    job.wait_token_id = None;
                    job.updated_at = now;
                }
            }
            self.record_event(job_id, EventType::TokenCompleted, serde_json::json!({ "token_id": id }));
        }
        Ok(())
    }

    async fn expire_timed_out_waitpoints(&self) -> Result<u64, BackendError> {
        let now = Utc::now();
        let expired_ids: Vec<Uuid> = self
            .waitpoints
            .iter()
            .filter(|w| w.status == WaitpointStatus::Pending)
            .filter(|w| w.timeout_at.map_or(false, |t| t <= now))
            .map(|w| w.id)
            .collect();

        for id in &expired_ids {
            let job_id = {
                let mut waitpoint = match self.waitpoints.get_mut(id) {
                    Some(w) => w,
                    None => continue,
                };
                waitpoint.status = WaitpointStatus::Expired;
                waitpoint.job_id
            };
            if let Some(job_id) = job_id {
                if let Some(mut job) = self.jobs.get_mut(&job_id) {
                    if job.status == JobStatus::Waiting && job.wait_token_id == Some(*id) {
                        job.status = JobStatus::Pending;
                        job.wait_until = None;
                        job.wait_token_id = None;
                        job.failure_reason = Some(FailureReason::TokenTimeout);
                        job.updated_at = now;
                    }
                }
            }
        }
        Ok(expired_ids.len() as u64)
    }

    async fn resume_timed_waits(&self) -> Result<u64, BackendError> {
        let now = Utc::now();
        let ids: Vec<i64> = self
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Waiting
                    && e.wait_token_id.is_none()
                    && e.wait_until.map_or(false, |t| t <= now)
            })
            .map(|e| e.id)
            .collect();

        for id in &ids {
            if let Some(mut job) = self.jobs.get_mut(id) {
                job.status = JobStatus::Pending;
                job.wait_until = None;
                job.updated_at = now;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn add_cron_schedule(&self, options: CronScheduleOptions) -> Result<CronSchedule, BackendError> {
        for existing in self.cron_schedules.iter() {
            if existing.schedule_name == options.schedule_name {
                return Err(BackendError::permanent(anyhow::anyhow!(
                    "cron schedule name '{}' already exists",
                    options.schedule_name
                )));
            }
        }

        let id = self.next_cron_id.fetch_add(1, Ordering::SeqCst);
        let next_run_at = queue_core::get_next_occurrence(&options.cron_expression, &options.timezone, Utc::now())
            .map_err(BackendError::permanent)?;
        let schedule = CronSchedule {
            id,
            schedule_name: options.schedule_name,
            cron_expression: options.cron_expression,
            timezone: options.timezone,
            job_type: options.job_type,
            payload: options.payload,
            priority: options.priority,
            max_attempts: options.max_attempts,
            timeout_ms: options.timeout_ms,
            force_kill_on_timeout: options.force_kill_on_timeout,
            tags: options.tags,
            allow_overlap: options.allow_overlap,
            status: CronScheduleStatus::Active,
            next_run_at,
            last_enqueued_at: None,
            last_job_id: None,
        };
        self.cron_schedules.insert(id, schedule.clone());
        Ok(schedule)
    }

    async fn pause_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        let mut schedule = self
            .cron_schedules
            .get_mut(&id)
            .ok_or_else(|| BackendError::permanent(anyhow::anyhow!("cron schedule {id} not found")))?;
        schedule.status = CronScheduleStatus::Paused;
        Ok(())
    }

    async fn resume_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        let mut schedule = self
            .cron_schedules
            .get_mut(&id)
            .ok_or_else(|| BackendError::permanent(anyhow::anyhow!("cron schedule {id} not found")))?;
        schedule.status = CronScheduleStatus::Active;
        Ok(())
    }

    async fn edit_cron_schedule(&self, id: i64, edit: CronScheduleEdit) -> Result<CronSchedule, BackendError> {
        let mut schedule = self
            .cron_schedules
            .get_mut(&id)
            .ok_or_else(|| BackendError::permanent(anyhow::anyhow!("cron schedule {id} not found")))?;

        if let Some(expr) = edit.cron_expression {
            schedule.cron_expression = expr;
        }
        if let Some(tz) = edit.timezone {
            schedule.timezone = tz;
        }
        if let Some(payload) = edit.payload {
            schedule.payload = payload;
        }
        if let Some(priority) = edit.priority {
            schedule.priority = priority;
        }
        if let Some(max_attempts) = edit.max_attempts {
            schedule.max_attempts = max_attempts;
        }
        if let Some(timeout_ms) = edit.timeout_ms {
            schedule.timeout_ms = Some(timeout_ms);
        }
        if let Some(tags) = edit.tags {
            schedule.tags = tags;
        }
        if let Some(allow_overlap) = edit.allow_overlap {
            schedule.allow_overlap = allow_overlap;
        }
        schedule.next_run_at = queue_core::get_next_occurrence(&schedule.cron_expression, &schedule.timezone, Utc::now())
            .map_err(BackendError::permanent)?;
        Ok(schedule.clone())
    }

    async fn remove_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        self.cron_schedules.remove(&id);
        Ok(())
    }

    async fn list_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError> {
        Ok(self.cron_schedules.iter().map(|e| e.clone()).collect())
    }

    async fn get_cron_schedule(&self, id: i64) -> Result<Option<CronSchedule>, BackendError> {
        Ok(self.cron_schedules.get(&id).map(|e| e.clone()))
    }

    async fn get_cron_schedule_by_name(&self, name: &str) -> Result<Option<CronSchedule>, BackendError> {
        Ok(self.cron_schedules.iter().find(|e| e.schedule_name == name).map(|e| e.clone()))
    }

    async fn get_due_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError> {
        let now = Utc::now();
        Ok(self
            .cron_schedules
            .iter()
            .filter(|e| e.status == CronScheduleStatus::Active)
            .filter(|e| e.next_run_at.map_or(false, |t| t <= now))
            .map(|e| e.clone())
            .collect())
    }

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: i64,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        let mut schedule = self
            .cron_schedules
            .get_mut(&id)
            .ok_or_else(|| BackendError::permanent(anyhow::anyhow!("cron schedule {id} not found")))?;
        schedule.last_enqueued_at = Some(last_enqueued_at);
        schedule.last_job_id = Some(last_job_id);
        schedule.next_run_at = next_run_at;
        Ok(())
    }

    async fn is_job_non_terminal(&self, job_id: i64) -> Result<bool, BackendError> {
        Ok(self.jobs.get(&job_id).map_or(false, |j| !j.status.is_terminal()))
    }

    async fn record_job_event(&self, job_id: i64, event_type: EventType, metadata: serde_json::Value) -> Result<(), BackendError> {
        self.record_event(job_id, event_type, metadata);
        Ok(())
    }

    async fn get_job_events(&self, job_id: i64, query: PageQuery) -> Result<Page<JobEvent>, BackendError> {
        let items: Vec<(i64, JobEvent)> = self
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| (e.id, e.clone()))
            .collect();
        Ok(paginate(items, &query))
    }
}
