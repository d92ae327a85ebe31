//! # Pipeline Demo
//!
//! Wires a `Queue` backed by the in-memory store to a `Processor` and a
//! `Supervisor`, and runs a three-step durable pipeline job alongside a
//! plain one-shot job, printing lifecycle events as they fire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use queue_core::{
    CancelSignal, HandlerCtx, JobError, JobHandler, JobOptions, ProcessorOptions, Queue,
    QueueEvent, SupervisorOptions,
};
use queue_memory::MemoryBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// A three-step pipeline: fetch -> transform -> load, each step memoized
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Fetched {
    raw: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Transformed {
    upper: String,
}

struct PipelineHandler;

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, payload: Value, _cancel: CancelSignal, ctx: HandlerCtx) -> Result<Value, JobError> {
        let url = payload["url"].as_str().unwrap_or("unknown").to_string();

        let fetched = ctx
            .run("fetch", || async move {
                ctx_log(&format!("fetching {url}"));
                Ok(Fetched { raw: format!("<html>{url}</html>") })
            })
            .await?;

        let transformed = ctx
            .run("transform", || async move { Ok(Transformed { upper: fetched.raw.to_uppercase() }) })
            .await?;

        ctx.set_progress(100).await?;

        Ok(serde_json::json!({ "loaded": transformed.upper }))
    }
}

fn ctx_log(message: &str) {
    tracing::info!("{message}");
}

// ============================================================================
// A plain job registered as a bare async closure
// ============================================================================

async fn greet(payload: Value, _cancel: CancelSignal, _ctx: HandlerCtx) -> Result<Value, JobError> {
    let name = payload["name"].as_str().unwrap_or("world");
    println!("hello, {name}!");
    Ok(serde_json::json!({ "greeted": name }))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let backend = Arc::new(MemoryBackend::new());
    let queue = Queue::new(backend);

    let mut events = queue.on();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::Added { job_id, job_type } => println!("[event] job {job_id} ({job_type}) added"),
                QueueEvent::Claimed { job_id, worker_id } => println!("[event] job {job_id} claimed by {worker_id}"),
                QueueEvent::Completed { job_id } => println!("[event] job {job_id} completed"),
                QueueEvent::Failed { job_id, reason, message } => {
                    println!("[event] job {job_id} failed ({reason:?}): {message}")
                }
                QueueEvent::Waiting { job_id } => println!("[event] job {job_id} suspended"),
                QueueEvent::TokenCompleted { token_id, .. } => println!("[event] token {token_id} completed"),
                QueueEvent::Error { context, message, .. } => println!("[event] error in {context}: {message}"),
            }
        }
    });

    queue
        .add_job(JobOptions::new("greet", serde_json::json!({ "name": "seesaw" })))
        .await?;
    queue
        .add_job(JobOptions::new("pipeline", serde_json::json!({ "url": "https://example.com" })).priority(1))
        .await?;

    let processor = Arc::new(
        queue
            .create_processor(ProcessorOptions {
                concurrency: 2,
                poll_interval: Duration::from_millis(200),
                ..Default::default()
            })
            .register("greet", greet)
            .register("pipeline", PipelineHandler),
    );
    processor.clone().start_in_background().await;

    let supervisor = Arc::new(queue.create_supervisor(SupervisorOptions {
        interval: Duration::from_secs(30),
        ..Default::default()
    }));
    supervisor.clone().start_in_background().await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    processor.stop_and_drain(Duration::from_secs(2)).await;
    supervisor.stop_and_drain(Duration::from_secs(2)).await;

    println!("all jobs drained");
    Ok(())
}
