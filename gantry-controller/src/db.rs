use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create events table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id UUID PRIMARY KEY,
            queue_status VARCHAR(8) NOT NULL,
            in_time TIMESTAMPTZ NOT NULL,
            out_time TIMESTAMPTZ,
            retry INTEGER NOT NULL DEFAULT 0,
            project JSONB NOT NULL,
            pipeline JSONB NOT NULL,
            record JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Claim scans eligible events in FIFO order
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_queue ON events(queue_status, in_time)",
    )
    .execute(pool)
    .await?;

    // Create pipeline records table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_records (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            pipeline_id UUID NOT NULL,
            status VARCHAR(20) NOT NULL,
            record JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_records_pipeline ON pipeline_records(pipeline_id, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
