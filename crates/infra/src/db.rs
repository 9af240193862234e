//! Connection pool and schema bootstrap for the Postgres-backed stores.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notification_job (
        id BIGSERIAL PRIMARY KEY,
        target_url VARCHAR(2048) NOT NULL,
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        template_id BIGINT NULL,
        status TEXT NOT NULL,
        failure_reason TEXT NULL,
        failure_error_message TEXT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        next_retry_at TIMESTAMPTZ NULL,
        priority SMALLINT NOT NULL DEFAULT 3 CHECK (priority BETWEEN 1 AND 3),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notification_job_recovery
    ON notification_job (status, priority, next_retry_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notification_job_updated_at
    ON notification_job (updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leader_election (
        service_name TEXT PRIMARY KEY,
        host_id UUID NOT NULL,
        last_seen_active TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS template_config (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        content TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Create the tables and indexes used by the stores if they are missing.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database schema ready");
    Ok(())
}
