//! The handler execution context: step memoization, waits, tokens,
//! progress, and cancellation.
//!
//! `ctx.wait_for` / `ctx.wait_until` / `ctx.wait_for_token` never block —
//! they persist the suspension to the backend and return
//! `Err(JobError::Suspend)`, which the handler propagates with `?`. On the
//! next claim the handler body runs from the top; `ctx.run` and the wait
//! sites consult `step_data` (keyed by explicit name for `ctx.run`, by
//! call-order index for wait/token sites) and skip straight past anything
//! already memoized.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{QueueBackend, WaitSpec};
use crate::error::JobError;
use crate::model::{CreateTokenOptions, EventType, StepData};

/// Cooperative cancellation signal observed by well-behaved handlers.
///
/// Triggered on (a) the per-job timeout firing, or (b) the processor's
/// `stop_and_drain` exceeding its grace period. Cloning shares the same
/// underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    inner: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }
}

/// A relative duration for `ctx.wait_for`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelativeWait {
    pub seconds: i64,
    pub minutes: i64,
    pub hours: i64,
    pub days: i64,
}

impl RelativeWait {
    pub fn seconds(n: i64) -> Self {
        Self {
            seconds: n,
            ..Default::default()
        }
    }
    pub fn minutes(n: i64) -> Self {
        Self {
            minutes: n,
            ..Default::default()
        }
    }
    pub fn hours(n: i64) -> Self {
        Self {
            hours: n,
            ..Default::default()
        }
    }
    pub fn days(n: i64) -> Self {
        Self {
            days: n,
            ..Default::default()
        }
    }

    fn to_duration(self) -> ChronoDuration {
        ChronoDuration::seconds(self.seconds)
            + ChronoDuration::minutes(self.minutes)
            + ChronoDuration::hours(self.hours)
            + ChronoDuration::days(self.days)
    }
}

/// Result of awaiting a token: either it completed with data, or it
/// expired before completion.
#[derive(Debug, Clone)]
pub enum TokenWait {
    Completed(Option<Value>),
    TimedOut,
}

/// Per-invocation handle passed to a [`JobHandler`].
///
/// Mutable state (used step names, the replay call-order counter) lives
/// behind an internal `Mutex` so `ctx` can be shared/cloned freely inside
/// a handler without the caller juggling `&mut`.
pub struct HandlerCtx {
    job_id: i64,
    backend: Arc<dyn QueueBackend>,
    step_data: Arc<Mutex<StepData>>,
    used_names: Arc<Mutex<HashSet<String>>>,
    call_index: Arc<AtomicI64>,
    last_progress: Arc<AtomicI64>,
}

impl HandlerCtx {
    pub fn new(job_id: i64, backend: Arc<dyn QueueBackend>, step_data: StepData) -> Self {
        let used_names = step_data
            .keys()
            .filter(|k| !k.starts_with("__wait:") && !k.starts_with("__token:"))
            .cloned()
            .collect();
        Self {
            job_id,
            backend,
            step_data: Arc::new(Mutex::new(step_data)),
            used_names: Arc::new(Mutex::new(used_names)),
            call_index: Arc::new(AtomicI64::new(0)),
            last_progress: Arc::new(AtomicI64::new(-1)),
        }
    }

    /// A snapshot of the step data as currently persisted/known, used by
    /// the processor when building a `WaitSpec`.
    pub async fn snapshot_step_data(&self) -> StepData {
        self.step_data.lock().await.clone()
    }

    /// Step memoization. If `step_data[name]` already exists (from a prior
    /// attempt), returns the cached value without invoking `f`. Otherwise
    /// runs `f`, persists its return value, then returns it. Step names
    /// must be unique per job within one invocation; reuse is an error.
    pub async fn run<F, Fut, T>(&self, name: &str, f: F) -> Result<T, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
        T: Serialize + DeserializeOwned,
    {
        {
            let mut used = self.used_names.lock().await;
            if !used.insert(name.to_string()) {
                return Err(JobError::Handler(anyhow::anyhow!(
                    "step name '{name}' reused within one job invocation"
                )));
            }
        }

        if let Some(cached) = self.step_data.lock().await.get(name).cloned() {
            let value: T = serde_json::from_value(cached)
                .map_err(|e| JobError::Handler(anyhow::anyhow!("step '{name}' cache corrupt: {e}")))?;
            return Ok(value);
        }

        let result = f().await.map_err(JobError::Handler)?;
        let encoded = serde_json::to_value(&result)
            .map_err(|e| JobError::Handler(anyhow::anyhow!("step '{name}' not serializable: {e}")))?;

        let snapshot = {
            let mut guard = self.step_data.lock().await;
            guard.insert(name.to_string(), encoded);
            guard.clone()
        };
        if let Err(err) = self.backend.update_step_data(self.job_id, snapshot).await {
            tracing::warn!(job_id = self.job_id, error = %err, "failed to persist step data");
        }

        Ok(result)
    }

    fn next_call_index(&self) -> i64 {
        self.call_index.fetch_add(1, Ordering::SeqCst)
    }

    async fn wait_key_already_satisfied(&self, key: &str) -> bool {
        self.step_data.lock().await.contains_key(key)
    }

    /// Suspend until `wait.to_duration()` has elapsed. On replay, the same
    /// call-order index is reached deterministically (memoized steps
    /// before it are skipped) and this becomes a no-op `Ok(())`.
    pub async fn wait_for(&self, wait: RelativeWait) -> Result<(), JobError> {
        let idx = self.next_call_index();
        let key = format!("__wait:{idx}");
        if self.wait_key_already_satisfied(&key).await {
            return Ok(());
        }

        let wait_until = Utc::now() + wait.to_duration();
        let snapshot = {
            let mut guard = self.step_data.lock().await;
            guard.insert(key, Value::Bool(true));
            guard.clone()
        };
        self.backend
            .wait_job(
                self.job_id,
                WaitSpec {
                    wait_until: Some(wait_until),
                    wait_token_id: None,
                    step_data: snapshot,
                },
            )
            .await
            .map_err(|e| JobError::Handler(e.into()))?;
        Err(JobError::Suspend)
    }

    /// Suspend until the absolute instant `at`. Same replay semantics as
    /// [`HandlerCtx::wait_for`].
    pub async fn wait_until(&self, at: DateTime<Utc>) -> Result<(), JobError> {
        let idx = self.next_call_index();
        let key = format!("__wait:{idx}");
        if self.wait_key_already_satisfied(&key).await {
            return Ok(());
        }

        let snapshot = {
            let mut guard = self.step_data.lock().await;
            guard.insert(key, Value::Bool(true));
            guard.clone()
        };
        self.backend
            .wait_job(
                self.job_id,
                WaitSpec {
                    wait_until: Some(at),
                    wait_token_id: None,
                    step_data: snapshot,
                },
            )
            .await
            .map_err(|e| JobError::Handler(e.into()))?;
        Err(JobError::Suspend)
    }

    /// Create a waitpoint bound to this job. Memoized by call-order index
    /// so a replay after the token resolves returns the *same* token id
    /// rather than minting a second one.
    pub async fn create_token(&self, options: CreateTokenOptions) -> Result<Uuid, JobError> {
        let idx = self.next_call_index();
        let key = format!("__token:{idx}");

        if let Some(existing) = self.step_data.lock().await.get(&key).cloned() {
            if let Some(id) = existing.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                return Ok(id);
            }
        }

        let waitpoint = self
            .backend
            .create_waitpoint(Some(self.job_id), options)
            .await
            .map_err(|e| JobError::Handler(e.into()))?;

        let snapshot = {
            let mut guard = self.step_data.lock().await;
            guard.insert(key, Value::String(waitpoint.id.to_string()));
            guard.clone()
        };
        if let Err(err) = self.backend.update_step_data(self.job_id, snapshot).await {
            tracing::warn!(job_id = self.job_id, error = %err, "failed to persist created token id");
        }

        Ok(waitpoint.id)
    }

    /// Suspend until `token_id` is completed or expired. Returns
    /// `{ok: true, data}` on completion or `{ok: false}` on expiry — but
    /// because suspension is itself a non-local return, this only
    /// resolves with `Ok(TokenWait)` on **replay**, once the wait key is
    /// already satisfied; the first call always suspends via
    /// `Err(JobError::Suspend)`. By the time a replay reaches this site
    /// the backend has already transitioned the job back to `pending`
    /// (it only does so once the token is resolved), so the replay simply
    /// reads the waitpoint's current state rather than decoding anything
    /// out of the `step_data` marker itself.
    pub async fn wait_for_token(&self, token_id: Uuid) -> Result<TokenWait, JobError> {
        let idx = self.next_call_index();
        let key = format!("__wait:{idx}");

        if self.wait_key_already_satisfied(&key).await {
            let waitpoint = self
                .backend
                .get_waitpoint(token_id)
                .await
                .map_err(|e| JobError::Handler(e.into()))?;
            return match waitpoint {
                Some(wp) if wp.status == crate::model::WaitpointStatus::Completed => {
                    Ok(TokenWait::Completed(wp.data))
                }
                Some(wp) if wp.status == crate::model::WaitpointStatus::Expired => {
                    Ok(TokenWait::TimedOut)
                }
                _ => Err(JobError::Handler(anyhow::anyhow!(
                    "token {token_id} not yet resolved but wait site was already marked suspended"
                ))),
            };
        }

        let snapshot = {
            let mut guard = self.step_data.lock().await;
            guard.insert(key, Value::Bool(true));
            guard.clone()
        };
        self.backend
            .wait_job(
                self.job_id,
                WaitSpec {
                    wait_until: None,
                    wait_token_id: Some(token_id),
                    step_data: snapshot,
                },
            )
            .await
            .map_err(|e| JobError::Handler(e.into()))?;
        Err(JobError::Suspend)
    }

    /// Persist `value` on the job row immediately, rather than waiting for
    /// the handler to return it. Best-effort: a later suspension or crash
    /// that loses the in-flight return value still keeps this output.
    pub async fn set_output(&self, value: Value) -> Result<(), JobError> {
        self.backend
            .set_job_output(self.job_id, value)
            .await
            .map_err(|e| JobError::Handler(e.into()))
    }

    /// Heartbeat `locked_at` to prevent reclaim during a long-running step.
    pub async fn prolong(&self) -> Result<(), JobError> {
        self.backend
            .prolong_job(self.job_id)
            .await
            .map_err(|e| JobError::Handler(e.into()))
    }

    /// Set progress 0-100. Records a `progress` event only when the value
    /// actually changes.
    pub async fn set_progress(&self, value: i32) -> Result<(), JobError> {
        let clamped = value.clamp(0, 100) as i64;
        let previous = self.last_progress.swap(clamped, Ordering::SeqCst);
        if previous == clamped {
            return Ok(());
        }
        self.backend
            .record_job_event(
                self.job_id,
                EventType::Progress,
                serde_json::json!({ "progress": clamped }),
            )
            .await
            .map_err(|e| JobError::Handler(e.into()))
    }

    pub fn log(&self, message: &str) {
        tracing::info!(job_id = self.job_id, "{message}");
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }
}

/// A registered job handler. Implementations must be `Send + Sync
/// + 'static` — they are shared across concurrently executing tasks and,
/// when `force_kill_on_timeout` is set, spawned onto a task the processor
/// may `abort()`, which requires owned (not borrowed) captured state.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: Value,
        cancel: CancelSignal,
        ctx: HandlerCtx,
    ) -> Result<Value, JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Value, CancelSignal, HandlerCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, cancel: CancelSignal, ctx: HandlerCtx) -> Result<Value, JobError> {
        (self)(payload, cancel, ctx).await
    }
}

/// Marker trait a handler opts into to confirm it is safe to run under
/// `force_kill_on_timeout` isolation (no borrowed captures, purely owned
/// state) — the Rust analogue of the "validation helper [that] rejects
/// handlers that capture non-sendable state" from the design notes.
/// `JobHandler` already requires `Send + Sync + 'static`, so implementing
/// this marker is never unsound; it exists to make the opt-in explicit at
/// the registration call site (`Processor::register` with
/// `force_kill_on_timeout: true` requires `H: ForceKillable`) rather than
/// silently allowing every handler to be hard-killed.
pub trait ForceKillable: JobHandler {}
