//! Runs the shared backend conformance suite against a live Postgres
//! instance. Needs `DATABASE_URL` pointed at a scratch database; skipped
//! (not failed) when it isn't set, since CI without a database attached
//! should not redden on this test.

use std::sync::Arc;

use queue_core::QueueBackend;
use queue_postgres::PgBackend;

#[tokio::test]
async fn postgres_backend_satisfies_the_conformance_suite() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping postgres_backend_satisfies_the_conformance_suite: DATABASE_URL not set");
        return;
    };

    let backend = PgBackend::connect(&url).await.expect("connect to postgres");
    backend.migrate().await.expect("run migrations");

    queue_testing::run_conformance_suite(|| {
        let backend = backend.clone();
        async move {
            sqlx::query("TRUNCATE job_queue, job_events, waitpoints, cron_schedules RESTART IDENTITY CASCADE")
                .execute(backend.pool())
                .await
                .expect("truncate between conformance runs");
            Arc::new(backend) as Arc<dyn QueueBackend>
        }
    })
    .await;
}
