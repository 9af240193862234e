//! Postgres-backed job store.
//!
//! Every method is a single statement executed on the pool, so each write
//! commits on its own regardless of what the caller is doing.
//!
//! Recovery claims use `FOR UPDATE SKIP LOCKED` inside a CTE that also pushes
//! `next_retry_at` forward, making "find due rows" and "hide them from the
//! next claim" one atomic step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use hookrelay_core::{
    FailureReason, JobDraft, JobId, JobStatus, NotificationJob, Payload, Priority, TemplateId,
};

use super::store::{JobStore, JobStoreError};

const JOB_COLUMNS: &str = r#"
    id,
    target_url,
    headers,
    payload,
    template_id,
    status,
    failure_reason,
    failure_error_message,
    attempt_count,
    next_retry_at,
    priority,
    created_at,
    updated_at
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, draft), fields(priority = draft.priority.get()), err)]
    async fn insert(&self, draft: JobDraft) -> Result<NotificationJob, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO notification_job (
                target_url,
                headers,
                payload,
                template_id,
                status,
                attempt_count,
                next_retry_at,
                priority,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $6, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&draft.target_url)
            .bind(Json(&draft.headers))
            .bind(Json(&draft.payload))
            .bind(draft.template_id.map(i64::from))
            .bind(JobStatus::Pending.as_str())
            .bind(Utc::now())
            .bind(draft.priority.get() as i16)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

        job_from_row(&row)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update(&self, job: &NotificationJob) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_job
            SET target_url = $2,
                headers = $3,
                payload = $4,
                template_id = $5,
                status = $6,
                failure_reason = $7,
                failure_error_message = $8,
                attempt_count = $9,
                next_retry_at = $10,
                priority = $11,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(&job.target_url)
        .bind(Json(&job.headers))
        .bind(Json(&job.payload))
        .bind(job.template_id.map(i64::from))
        .bind(job.status.as_str())
        .bind(job.failure_reason.map(|r| r.as_str()))
        .bind(job.failure_message.as_deref())
        .bind(job.attempt_count as i32)
        .bind(job.next_retry_at)
        .bind(job.priority.get() as i16)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<NotificationJob>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM notification_job WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_for_recovery(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_ttl: Duration,
    ) -> Result<Vec<NotificationJob>, JobStoreError> {
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id, next_retry_at AS due_at
                FROM notification_job
                WHERE status = $1 AND next_retry_at <= $2
                ORDER BY priority ASC, next_retry_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notification_job
            SET next_retry_at = $4
            FROM due
            WHERE notification_job.id = due.id
            RETURNING due.due_at, {}
            "#,
            qualified_columns("notification_job")
        );

        let rows = sqlx::query(&sql)
            .bind(JobStatus::Failed.as_str())
            .bind(now)
            .bind(limit as i64)
            .bind(now + claim_ttl)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_for_recovery", e))?;

        // RETURNING does not preserve the CTE's ordering.
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let due_at: DateTime<Utc> = row.try_get("due_at").map_err(|e| corrupt("due_at", e))?;
            claimed.push((due_at, job_from_row(row)?));
        }
        claimed.sort_by(|(a_due, a), (b_due, b)| {
            (a.priority, a_due, a.id).cmp(&(b.priority, b_due, b.id))
        });

        Ok(claimed.into_iter().map(|(_, job)| job).collect())
    }

    #[instrument(skip(self), err)]
    async fn count_updated_since(&self, since: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notification_job WHERE updated_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_updated_since", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn count_with_failure_reason_since(
        &self,
        reason: FailureReason,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification_job WHERE failure_reason = $1 AND updated_at >= $2",
        )
        .bind(reason.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_with_failure_reason_since", e))?;
        Ok(count.max(0) as u64)
    }
}

fn qualified_columns(table: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{table}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &PgRow) -> Result<NotificationJob, JobStoreError> {
    let id: i64 = row.try_get("id").map_err(|e| corrupt("id", e))?;
    let headers: Json<BTreeMap<String, String>> =
        row.try_get("headers").map_err(|e| corrupt("headers", e))?;
    let payload: Json<Payload> = row.try_get("payload").map_err(|e| corrupt("payload", e))?;
    let template_id: Option<i64> = row
        .try_get("template_id")
        .map_err(|e| corrupt("template_id", e))?;
    let status: String = row.try_get("status").map_err(|e| corrupt("status", e))?;
    let failure_reason: Option<String> = row
        .try_get("failure_reason")
        .map_err(|e| corrupt("failure_reason", e))?;
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(|e| corrupt("attempt_count", e))?;
    let priority: i16 = row.try_get("priority").map_err(|e| corrupt("priority", e))?;

    Ok(NotificationJob {
        id: JobId::new(id),
        target_url: row
            .try_get("target_url")
            .map_err(|e| corrupt("target_url", e))?,
        headers: headers.0,
        payload: payload.0,
        template_id: template_id.map(TemplateId::new),
        status: status.parse::<JobStatus>().map_err(|e| corrupt("status", e))?,
        failure_reason: failure_reason
            .map(|r| r.parse::<FailureReason>())
            .transpose()
            .map_err(|e| corrupt("failure_reason", e))?,
        failure_message: row
            .try_get("failure_error_message")
            .map_err(|e| corrupt("failure_error_message", e))?,
        attempt_count: u32::try_from(attempt_count).map_err(|e| corrupt("attempt_count", e))?,
        next_retry_at: row
            .try_get("next_retry_at")
            .map_err(|e| corrupt("next_retry_at", e))?,
        priority: Priority::new(i32::from(priority)).map_err(|e| corrupt("priority", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| corrupt("created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| corrupt("updated_at", e))?,
    })
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Corrupt(format!("{column}: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            JobStoreError::Corrupt(format!("column {index} in {operation}: {source}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_columns_prefix_every_column() {
        let cols = qualified_columns("j");
        assert!(cols.starts_with("j.id, j.target_url"));
        assert!(cols.ends_with("j.updated_at"));
        assert_eq!(cols.matches("j.").count(), 13);
    }

    #[test]
    fn pool_closed_maps_to_storage_error() {
        let err = map_sqlx_error("get_job", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("get_job")));
    }
}
