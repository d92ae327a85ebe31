//! PostgreSQL implementation of the durable job queue backend.
//!
//! The canonical `QueueBackend`: atomic claims via `FOR UPDATE SKIP
//! LOCKED`, exponential-backoff retry, tag filtering on `TEXT[]` columns,
//! and an append-only `job_events` audit log. Queries are built with
//! `sqlx::query` and read back via `Row::try_get`, the same
//! ad-hoc-query-plus-`Row::get` style the raw-SQL store this crate grew
//! from uses, rather than the `query!`/`query_as!` compile-time-checked
//! macros (those need a live database at build time, which this
//! workspace doesn't assume).
//!
//! # Schema
//!
//! See `migrations/`: `job_queue`, `job_events`, `waitpoints`,
//! `cron_schedules`, plus their enum types and indexes. Apply with
//! [`PgBackend::migrate`].

mod codec;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use queue_core::{
    BackendError, CreateTokenOptions, CronSchedule, CronScheduleEdit, CronScheduleOptions,
    ErrorEntry, EventType, FailureReason, Job, JobEdit, JobEvent, JobOptions, JobStatus, Page,
    PageQuery, QueueBackend, StepData, TagFilter, Waitpoint, WaitSpec,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use codec::*;

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

fn row_to_job(row: &PgRow) -> Result<Job, BackendError> {
    let status_str: String = row.try_get("status").map_err(classify_sqlx_error)?;
    let failure_reason_str: Option<String> = row.try_get("failure_reason").map_err(classify_sqlx_error)?;
    let error_history_json: serde_json::Value = row.try_get("error_history").map_err(classify_sqlx_error)?;
    let step_data_json: serde_json::Value = row.try_get("step_data").map_err(classify_sqlx_error)?;

    Ok(Job {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        job_type: row.try_get("job_type").map_err(classify_sqlx_error)?,
        payload: row.try_get("payload").map_err(classify_sqlx_error)?,
        status: job_status_from_str(&status_str)?,
        priority: row.try_get("priority").map_err(classify_sqlx_error)?,
        run_at: row.try_get("run_at").map_err(classify_sqlx_error)?,
        attempts: row.try_get("attempts").map_err(classify_sqlx_error)?,
        max_attempts: row.try_get("max_attempts").map_err(classify_sqlx_error)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(classify_sqlx_error)?,
        locked_at: row.try_get("locked_at").map_err(classify_sqlx_error)?,
        locked_by: row.try_get("locked_by").map_err(classify_sqlx_error)?,
        timeout_ms: row.try_get("timeout_ms").map_err(classify_sqlx_error)?,
        force_kill_on_timeout: row.try_get("force_kill_on_timeout").map_err(classify_sqlx_error)?,
        tags: row.try_get("tags").map_err(classify_sqlx_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(classify_sqlx_error)?,
        error_history: serde_json::from_value::<Vec<ErrorEntry>>(error_history_json)
            .map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?,
        failure_reason: failure_reason_str.map(|s| failure_reason_from_str(&s)).transpose()?,
        pending_reason: row.try_get("pending_reason").map_err(classify_sqlx_error)?,
        wait_until: row.try_get("wait_until").map_err(classify_sqlx_error)?,
        wait_token_id: row.try_get("wait_token_id").map_err(classify_sqlx_error)?,
        step_data: serde_json::from_value::<StepData>(step_data_json)
            .map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?,
        progress: row.try_get("progress").map_err(classify_sqlx_error)?,
        output: row.try_get("output").map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(classify_sqlx_error)?,
        started_at: row.try_get("started_at").map_err(classify_sqlx_error)?,
        completed_at: row.try_get("completed_at").map_err(classify_sqlx_error)?,
        last_retried_at: row.try_get("last_retried_at").map_err(classify_sqlx_error)?,
        last_failed_at: row.try_get("last_failed_at").map_err(classify_sqlx_error)?,
        last_cancelled_at: row.try_get("last_cancelled_at").map_err(classify_sqlx_error)?,
    })
}

fn row_to_job_event(row: &PgRow) -> Result<JobEvent, BackendError> {
    let event_type_str: String = row.try_get("event_type").map_err(classify_sqlx_error)?;
    Ok(JobEvent {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        job_id: row.try_get("job_id").map_err(classify_sqlx_error)?,
        event_type: event_type_from_str(&event_type_str)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        metadata: row.try_get("metadata").map_err(classify_sqlx_error)?,
    })
}

fn row_to_waitpoint(row: &PgRow) -> Result<Waitpoint, BackendError> {
    let status_str: String = row.try_get("status").map_err(classify_sqlx_error)?;
    Ok(Waitpoint {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        job_id: row.try_get("job_id").map_err(classify_sqlx_error)?,
        status: waitpoint_status_from_str(&status_str)?,
        timeout_at: row.try_get("timeout_at").map_err(classify_sqlx_error)?,
        data: row.try_get("data").map_err(classify_sqlx_error)?,
        tags: row.try_get("tags").map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
    })
}

fn row_to_cron_schedule(row: &PgRow) -> Result<CronSchedule, BackendError> {
    let status_str: String = row.try_get("status").map_err(classify_sqlx_error)?;
    Ok(CronSchedule {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        schedule_name: row.try_get("schedule_name").map_err(classify_sqlx_error)?,
        cron_expression: row.try_get("cron_expression").map_err(classify_sqlx_error)?,
        timezone: row.try_get("timezone").map_err(classify_sqlx_error)?,
        job_type: row.try_get("job_type").map_err(classify_sqlx_error)?,
        payload: row.try_get("payload").map_err(classify_sqlx_error)?,
        priority: row.try_get("priority").map_err(classify_sqlx_error)?,
        max_attempts: row.try_get("max_attempts").map_err(classify_sqlx_error)?,
        timeout_ms: row.try_get("timeout_ms").map_err(classify_sqlx_error)?,
        force_kill_on_timeout: row.try_get("force_kill_on_timeout").map_err(classify_sqlx_error)?,
        tags: row.try_get("tags").map_err(classify_sqlx_error)?,
        allow_overlap: row.try_get("allow_overlap").map_err(classify_sqlx_error)?,
        status: cron_schedule_status_from_str(&status_str)?,
        next_run_at: row.try_get("next_run_at").map_err(classify_sqlx_error)?,
        last_enqueued_at: row.try_get("last_enqueued_at").map_err(classify_sqlx_error)?,
        last_job_id: row.try_get("last_job_id").map_err(classify_sqlx_error)?,
    })
}

/// Build a `WHERE ... @ tag-operator ... $N` fragment and its bind value
/// for a [`TagFilter`], given the next free parameter index.
fn tag_clause(filter: &TagFilter, param_index: usize) -> String {
    tag_filter_sql(filter.mode).replace("$PARAM", &format!("${param_index}"))
}

/// A PostgreSQL-backed [`QueueBackend`].
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect using a `postgres://` URL (TLS mode, search_path, and
    /// other connection parameters are conveyed in the URL itself and
    /// forwarded to `sqlx` verbatim; this crate does not interpret them).
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool (e.g. one shared with other
    /// subsystems in the embedding application).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migration set. The library-level primitive an
    /// operator's schema-migration CLI would call; the CLI itself is not
    /// part of this crate.
    pub async fn migrate(&self) -> Result<(), BackendError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))
    }
}

#[async_trait]
impl QueueBackend for PgBackend {
    async fn add_job(&self, options: JobOptions) -> Result<Job, BackendError> {
        // `ON CONFLICT ... DO NOTHING` against the partial unique index on
        // `idempotency_key` makes the check-and-insert a single atomic
        // statement: a plain SELECT-then-INSERT would let two concurrent
        // callers with the same key both pass the check and race on the
        // insert, one of them hitting a unique-violation error instead of
        // the existing row it should have gotten back.
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_queue
                (job_type, payload, status, priority, run_at, max_attempts,
                 timeout_ms, force_kill_on_timeout, tags, idempotency_key,
                 error_history, step_data, created_at, updated_at)
            VALUES
                ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, $9, '[]', '{}', $10, $10)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&options.job_type)
        .bind(&options.payload)
        .bind(options.priority.unwrap_or(0))
        .bind(options.run_at.unwrap_or(now))
        .bind(options.max_attempts.unwrap_or(3))
        .bind(options.timeout_ms)
        .bind(options.force_kill_on_timeout)
        .bind(&options.tags)
        .bind(&options.idempotency_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let (row, is_new) = match inserted {
            Some(row) => (row, true),
            None => {
                // Only a concurrent insert on the same idempotency_key can
                // suppress RETURNING here (a NULL key never matches the
                // partial index, so it never conflicts).
                let key = options.idempotency_key.as_deref().unwrap_or_default();
                let row = sqlx::query("SELECT * FROM job_queue WHERE idempotency_key = $1")
                    .bind(key)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(classify_sqlx_error)?;
                (row, false)
            }
        };

        let job = row_to_job(&row)?;
        if is_new {
            self.record_job_event(job.id, EventType::Added, serde_json::json!({ "job_type": job.job_type }))
                .await?;
        }
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, BackendError> {
        let row = sqlx::query("SELECT * FROM job_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_jobs(&self, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let limit = if query.limit <= 0 { 100 } else { query.limit };
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_queue
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::bigint IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(&query.job_type)
        .bind(query.cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        page_from_rows(rows, limit, row_to_job)
    }

    async fn get_jobs_by_status(&self, status: JobStatus, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let limit = if query.limit <= 0 { 100 } else { query.limit };
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_queue
            WHERE status = $1
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::bigint IS NULL OR id < $3)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(job_status_to_str(status))
        .bind(&query.job_type)
        .bind(query.cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        page_from_rows(rows, limit, row_to_job)
    }

    async fn get_jobs_by_tags(&self, filter: TagFilter, query: PageQuery) -> Result<Page<Job>, BackendError> {
        let limit = if query.limit <= 0 { 100 } else { query.limit };
        let clause = tag_clause(&filter, 1);
        let sql = format!(
            r#"
            SELECT * FROM job_queue
            WHERE {clause}
              AND ($2::bigint IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&filter.tags)
            .bind(query.cursor)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        page_from_rows(rows, limit, row_to_job)
    }

    async fn get_next_batch(
        &self,
        worker_id: &str,
        batch_size: i64,
        job_type_filter: Option<&[String]>,
    ) -> Result<Vec<Job>, BackendError> {
        let now = Utc::now();
        let filter: Option<Vec<String>> = job_type_filter.map(|f| f.to_vec());

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                  AND run_at <= $4
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $4)
                  AND attempts < max_attempts
                  AND ($3::text[] IS NULL OR job_type = ANY($3))
                ORDER BY priority DESC, run_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE job_queue
            SET status = 'processing',
                locked_at = $4,
                locked_by = $1,
                attempts = attempts + 1,
                started_at = COALESCE(started_at, $4),
                updated_at = $4
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(batch_size)
        .bind(&filter)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        for job in &jobs {
            self.record_job_event(job.id, EventType::Processing, serde_json::json!({ "worker_id": worker_id }))
                .await?;
        }
        Ok(jobs)
    }

    async fn complete_job(&self, id: i64, output: Option<serde_json::Value>) -> Result<(), BackendError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'completed', completed_at = $2, locked_at = NULL,
                locked_by = NULL, output = $3, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(&output)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        self.record_job_event(id, EventType::Completed, serde_json::Value::Null).await
    }

    async fn fail_job(&self, id: i64, error_message: &str, reason: FailureReason) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let row = sqlx::query("SELECT attempts, max_attempts, error_history FROM job_queue WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

        let attempts: i32 = row.try_get("attempts").map_err(classify_sqlx_error)?;
        let max_attempts: i32 = row.try_get("max_attempts").map_err(classify_sqlx_error)?;
        let history_json: serde_json::Value = row.try_get("error_history").map_err(classify_sqlx_error)?;
        let mut history: Vec<ErrorEntry> =
            serde_json::from_value(history_json).map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?;
        history.push(ErrorEntry {
            message: error_message.to_string(),
            timestamp: now,
        });
        let history_json = serde_json::to_value(&history).map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?;

        if attempts < max_attempts {
            let delay_minutes = 2i64.saturating_pow((attempts - 1).max(0) as u32);
            let next_attempt_at = now + Duration::minutes(delay_minutes);
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'pending', next_attempt_at = $2, locked_at = NULL,
                    locked_by = NULL, error_history = $3, failure_reason = $4,
                    last_failed_at = $5, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(next_attempt_at)
            .bind(&history_json)
            .bind(failure_reason_to_str(reason))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        } else {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failed', locked_at = NULL, locked_by = NULL,
                    error_history = $2, failure_reason = $3, last_failed_at = $4,
                    updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&history_json)
            .bind(failure_reason_to_str(reason))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        self.record_job_event(
            id,
            EventType::Failed,
            serde_json::json!({ "message": error_message, "reason": reason }),
        )
        .await
    }

    async fn prolong_job(&self, id: i64) -> Result<(), BackendError> {
        sqlx::query("UPDATE job_queue SET locked_at = NOW() WHERE id = $1 AND status = 'processing'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn retry_job(&self, id: i64) -> Result<(), BackendError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', attempts = 0, next_attempt_at = NULL,
                locked_at = NULL, locked_by = NULL, wait_until = NULL,
                wait_token_id = NULL, failure_reason = NULL,
                last_retried_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        self.record_job_event(id, EventType::Retried, serde_json::Value::Null).await
    }

    async fn cancel_job(&self, id: i64) -> Result<(), BackendError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'cancelled', last_cancelled_at = $2, updated_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        if result.rows_affected() > 0 {
            self.record_job_event(id, EventType::Cancelled, serde_json::Value::Null).await?;
        }
        Ok(())
    }

    async fn cancel_all_upcoming_jobs(&self, filter: Option<TagFilter>) -> Result<u64, BackendError> {
        let now = Utc::now();
        let ids: Vec<i64> = match filter {
            Some(filter) => {
                let clause = tag_clause(&filter, 2);
                let sql = format!(
                    "UPDATE job_queue SET status = 'cancelled', last_cancelled_at = $1, updated_at = $1 \
                     WHERE status = 'pending' AND {clause} RETURNING id"
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(&filter.tags)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(classify_sqlx_error)?
                    .iter()
                    .map(|r| r.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()
                    .map_err(classify_sqlx_error)?
            }
            None => sqlx::query(
                "UPDATE job_queue SET status = 'cancelled', last_cancelled_at = $1, updated_at = $1 \
                 WHERE status = 'pending' RETURNING id",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(classify_sqlx_error)?,
        };

        for id in &ids {
            self.record_job_event(*id, EventType::Cancelled, serde_json::Value::Null).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn edit_job(&self, id: i64, edit: JobEdit) -> Result<Job, BackendError> {
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET payload = COALESCE($2, payload),
                priority = COALESCE($3, priority),
                tags = COALESCE($4, tags),
                run_at = COALESCE($5, run_at),
                timeout_ms = COALESCE($6, timeout_ms),
                max_attempts = COALESCE($7, max_attempts),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&edit.payload)
        .bind(edit.priority)
        .bind(&edit.tags)
        .bind(edit.run_at)
        .bind(edit.timeout_ms)
        .bind(edit.max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let row = row.ok_or_else(|| {
            BackendError::permanent(anyhow::anyhow!("job {id} is not pending; only pending jobs may be edited"))
        })?;
        let job = row_to_job(&row)?;
        self.record_job_event(id, EventType::Edited, serde_json::Value::Null).await?;
        Ok(job)
    }

    async fn edit_all_pending_jobs(&self, filter: Option<TagFilter>, edit: JobEdit) -> Result<u64, BackendError> {
        let base_sql = |clause: &str| {
            format!(
                r#"
                UPDATE job_queue
                SET payload = COALESCE($1, payload),
                    priority = COALESCE($2, priority),
                    tags = COALESCE($3, tags),
                    run_at = COALESCE($4, run_at),
                    timeout_ms = COALESCE($5, timeout_ms),
                    max_attempts = COALESCE($6, max_attempts),
                    updated_at = NOW()
                WHERE status = 'pending' {clause}
                RETURNING id
                "#
            )
        };

        let ids: Vec<i64> = match filter {
            Some(filter) => {
                let clause = tag_clause(&filter, 7);
                let sql = base_sql(&format!("AND {clause}"));
                sqlx::query(&sql)
                    .bind(&edit.payload)
                    .bind(edit.priority)
                    .bind(&edit.tags)
                    .bind(edit.run_at)
                    .bind(edit.timeout_ms)
                    .bind(edit.max_attempts)
                    .bind(&filter.tags)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(classify_sqlx_error)?
                    .iter()
                    .map(|r| r.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()
                    .map_err(classify_sqlx_error)?
            }
            None => {
                let sql = base_sql("");
                sqlx::query(&sql)
                    .bind(&edit.payload)
                    .bind(edit.priority)
                    .bind(&edit.tags)
                    .bind(edit.run_at)
                    .bind(edit.timeout_ms)
                    .bind(edit.max_attempts)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(classify_sqlx_error)?
                    .iter()
                    .map(|r| r.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()
                    .map_err(classify_sqlx_error)?
            }
        };

        for id in &ids {
            self.record_job_event(*id, EventType::Edited, serde_json::Value::Null).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn reclaim_stuck_jobs(&self, max_minutes: i64) -> Result<u64, BackendError> {
        let threshold = Utc::now() - Duration::minutes(max_minutes);
        let rows = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE status = 'processing' AND locked_at < $1
            RETURNING id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let ids: Vec<i64> = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(classify_sqlx_error)?;
        for id in &ids {
            self.record_job_event(*id, EventType::Reclaimed, serde_json::Value::Null).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn set_pending_reason_for_job_type(&self, job_type: &str, reason: &str) -> Result<u64, BackendError> {
        let result = sqlx::query(
            "UPDATE job_queue SET pending_reason = $2 WHERE job_type = $1 AND status = 'pending'",
        )
        .bind(job_type)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_jobs(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        let threshold = Utc::now() - Duration::days(days);
        let mut deleted = 0u64;
        loop {
            let result = sqlx::query(
                r#"
                DELETE FROM job_queue
                WHERE id IN (
                    SELECT id FROM job_queue
                    WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1
                    LIMIT $2
                )
                "#,
            )
            .bind(threshold)
            .bind(batch_size.max(1))
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
            if result.rows_affected() == 0 {
                break;
            }
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn cleanup_old_job_events(&self, days: i64, batch_size: i64) -> Result<u64, BackendError> {
        let threshold = Utc::now() - Duration::days(days);
        let mut deleted = 0u64;
        loop {
            let result = sqlx::query(
                r#"
                DELETE FROM job_events
                WHERE id IN (
                    SELECT id FROM job_events WHERE created_at < $1 LIMIT $2
                )
                "#,
            )
            .bind(threshold)
            .bind(batch_size.max(1))
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
            if result.rows_affected() == 0 {
                break;
            }
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn wait_job(&self, id: i64, wait: WaitSpec) -> Result<(), BackendError> {
        let step_data_json =
            serde_json::to_value(&wait.step_data).map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?;
        sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'waiting', wait_until = $2, wait_token_id = $3,
                step_data = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(wait.wait_until)
        .bind(wait.wait_token_id)
        .bind(&step_data_json)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        self.record_job_event(id, EventType::Waiting, serde_json::Value::Null).await
    }

    async fn update_step_data(&self, id: i64, step_data: StepData) -> Result<(), BackendError> {
        let step_data_json =
            serde_json::to_value(&step_data).map_err(|e| BackendError::permanent(anyhow::anyhow!(e)))?;
        sqlx::query("UPDATE job_queue SET step_data = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&step_data_json)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn set_job_output(&self, id: i64, output: serde_json::Value) -> Result<(), BackendError> {
        sqlx::query("UPDATE job_queue SET output = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&output)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn create_waitpoint(&self, job_id: Option<i64>, options: CreateTokenOptions) -> Result<Waitpoint, BackendError> {
        let now = Utc::now();
        let timeout_at = match &options.timeout {
            Some(spec) => Some(parse_timeout(spec, now).map_err(BackendError::permanent)?),
            None => None,
        };
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO waitpoints (id, job_id, status, timeout_at, tags, created_at)
            VALUES ($1, $2, 'pending', $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(job_id)
        .bind(timeout_at)
        .bind(&options.tags)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row_to_waitpoint(&row)
    }

    async fn get_waitpoint(&self, id: Uuid) -> Result<Option<Waitpoint>, BackendError> {
        let row = sqlx::query("SELECT * FROM waitpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref().map(row_to_waitpoint).transpose()
    }

    async fn complete_waitpoint(&self, id: Uuid, data: Option<serde_json::Value>) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let row = sqlx::query("SELECT status, job_id FROM waitpoints WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        let Some(row) = row else {
            return Ok(());
        };
        let status: String = row.try_get("status").map_err(classify_sqlx_error)?;
        if status != "pending" {
            return Ok(());
        }
        let job_id: Option<i64> = row.try_get("job_id").map_err(classify_sqlx_error)?;

        sqlx::query("UPDATE waitpoints SET status = 'completed', data = $2 WHERE id = $1")
            .bind(id)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

        if let Some(job_id) = job_id {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'pending', wait_until = NULL, wait_token_id = NULL, updated_at = NOW()
                WHERE id = $1 AND status = 'waiting' AND wait_token_id = $2
                "#,
            )
            .bind(job_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;

        if let Some(job_id) = job_id {
            self.record_job_event(job_id, EventType::TokenCompleted, serde_json::json!({ "token_id": id }))
                .await?;
        }
        Ok(())
    }

    async fn expire_timed_out_waitpoints(&self) -> Result<u64, BackendError> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE waitpoints
            SET status = 'expired'
            WHERE status = 'pending' AND timeout_at IS NOT NULL AND timeout_at <= $1
            RETURNING id, job_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut n = 0u64;
        for row in &rows {
            let id: Uuid = row.try_get("id").map_err(classify_sqlx_error)?;
            let job_id: Option<i64> = row.try_get("job_id").map_err(classify_sqlx_error)?;
            if let Some(job_id) = job_id {
                sqlx::query(
                    r#"
                    UPDATE job_queue
                    SET status = 'pending', wait_until = NULL, wait_token_id = NULL,
                        failure_reason = 'token_timeout', updated_at = $3
                    WHERE id = $1 AND status = 'waiting' AND wait_token_id = $2
                    "#,
                )
                .bind(job_id)
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;
            }
            n += 1;
        }
        Ok(n)
    }

    async fn resume_timed_waits(&self) -> Result<u64, BackendError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'pending', wait_until = NULL, updated_at = $1
            WHERE status = 'waiting' AND wait_token_id IS NULL AND wait_until <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn add_cron_schedule(&self, options: CronScheduleOptions) -> Result<CronSchedule, BackendError> {
        let next_run_at = queue_core::get_next_occurrence(&options.cron_expression, &options.timezone, Utc::now())
            .map_err(BackendError::permanent)?;

        let row = sqlx::query(
            r#"
            INSERT INTO cron_schedules
                (schedule_name, cron_expression, timezone, job_type, payload,
                 priority, max_attempts, timeout_ms, force_kill_on_timeout,
                 tags, allow_overlap, status, next_run_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'active', $12)
            RETURNING *
            "#,
        )
        .bind(&options.schedule_name)
        .bind(&options.cron_expression)
        .bind(&options.timezone)
        .bind(&options.job_type)
        .bind(&options.payload)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(options.timeout_ms)
        .bind(options.force_kill_on_timeout)
        .bind(&options.tags)
        .bind(options.allow_overlap)
        .bind(next_run_at)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        row_to_cron_schedule(&row)
    }

    async fn pause_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        sqlx::query("UPDATE cron_schedules SET status = 'paused' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn resume_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        sqlx::query("UPDATE cron_schedules SET status = 'active' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn edit_cron_schedule(&self, id: i64, edit: CronScheduleEdit) -> Result<CronSchedule, BackendError> {
        let row = sqlx::query(
            r#"
            UPDATE cron_schedules
            SET cron_expression = COALESCE($2, cron_expression),
                timezone = COALESCE($3, timezone),
                payload = COALESCE($4, payload),
                priority = COALESCE($5, priority),
                max_attempts = COALESCE($6, max_attempts),
                timeout_ms = COALESCE($7, timeout_ms),
                tags = COALESCE($8, tags),
                allow_overlap = COALESCE($9, allow_overlap)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&edit.cron_expression)
        .bind(&edit.timezone)
        .bind(&edit.payload)
        .bind(edit.priority)
        .bind(edit.max_attempts)
        .bind(edit.timeout_ms)
        .bind(&edit.tags)
        .bind(edit.allow_overlap)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let row = row.ok_or_else(|| BackendError::permanent(anyhow::anyhow!("cron schedule {id} not found")))?;
        let schedule = row_to_cron_schedule(&row)?;

        let next_run_at = queue_core::get_next_occurrence(&schedule.cron_expression, &schedule.timezone, Utc::now())
            .map_err(BackendError::permanent)?;
        let row = sqlx::query("UPDATE cron_schedules SET next_run_at = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(next_run_at)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row_to_cron_schedule(&row)
    }

    async fn remove_cron_schedule(&self, id: i64) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM cron_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn list_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError> {
        let rows = sqlx::query("SELECT * FROM cron_schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        rows.iter().map(row_to_cron_schedule).collect()
    }

    async fn get_cron_schedule(&self, id: i64) -> Result<Option<CronSchedule>, BackendError> {
        let row = sqlx::query("SELECT * FROM cron_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref().map(row_to_cron_schedule).transpose()
    }

    async fn get_cron_schedule_by_name(&self, name: &str) -> Result<Option<CronSchedule>, BackendError> {
        let row = sqlx::query("SELECT * FROM cron_schedules WHERE schedule_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref().map(row_to_cron_schedule).transpose()
    }

    async fn get_due_cron_schedules(&self) -> Result<Vec<CronSchedule>, BackendError> {
        // A single long-lived `FOR UPDATE SKIP LOCKED` claim (as used for
        // job rows) would need to stay open across the caller's
        // `add_job` + `update_cron_schedule_after_enqueue` round trip;
        // that's a wider transaction than this trait's call shape
        // allows. This assumes a single active supervisor per schedule
        // set, documented in DESIGN.md.
        let now = Utc::now();
        let rows = sqlx::query("SELECT * FROM cron_schedules WHERE status = 'active' AND next_run_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        rows.iter().map(row_to_cron_schedule).collect()
    }

    async fn update_cron_schedule_after_enqueue(
        &self,
        id: i64,
        last_enqueued_at: DateTime<Utc>,
        last_job_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        sqlx::query(
            "UPDATE cron_schedules SET last_enqueued_at = $2, last_job_id = $3, next_run_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(last_enqueued_at)
        .bind(last_job_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn is_job_non_terminal(&self, job_id: i64) -> Result<bool, BackendError> {
        let row = sqlx::query("SELECT status FROM job_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        match row {
            Some(row) => {
                let status_str: String = row.try_get("status").map_err(classify_sqlx_error)?;
                Ok(!job_status_from_str(&status_str)?.is_terminal())
            }
            None => Ok(false),
        }
    }

    async fn record_job_event(&self, job_id: i64, event_type: EventType, metadata: serde_json::Value) -> Result<(), BackendError> {
        sqlx::query("INSERT INTO job_events (job_id, event_type, metadata) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(event_type_to_str(event_type))
            .bind(&metadata)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn get_job_events(&self, job_id: i64, query: PageQuery) -> Result<Page<JobEvent>, BackendError> {
        let limit = if query.limit <= 0 { 100 } else { query.limit };
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_events
            WHERE job_id = $1 AND ($2::bigint IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(job_id)
        .bind(query.cursor)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        page_from_rows(rows, limit, row_to_job_event)
    }
}

fn page_from_rows<T>(
    mut rows: Vec<PgRow>,
    limit: i64,
    convert: impl Fn(&PgRow) -> Result<T, BackendError>,
) -> Result<Page<T>, BackendError> {
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit.max(0) as usize);
    let next_cursor = if has_more {
        rows.last().map(|r| r.try_get::<i64, _>("id")).transpose().map_err(classify_sqlx_error)?
    } else {
        None
    };
    let items = rows.iter().map(convert).collect::<Result<Vec<_>, _>>()?;
    Ok(Page { items, next_cursor })
}
