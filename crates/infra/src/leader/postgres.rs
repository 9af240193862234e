//! Postgres-backed lease store.
//!
//! Acquire and renew are one `INSERT ... ON CONFLICT DO UPDATE` statement.
//! The row lock taken by the conflict path serialises concurrent contenders,
//! and the `CASE` arms only hand the row to a new host once the stored
//! heartbeat has fallen behind the cutoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use hookrelay_core::{HostId, Lease};

use super::store::{LeaseStore, LeaseStoreError};

/// Postgres-backed lease store over the `leader_election` table.
#[derive(Debug, Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self), fields(host_id = %host), err)]
    async fn try_acquire_or_renew(
        &self,
        service_name: &str,
        host: HostId,
        now: DateTime<Utc>,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<HostId, LeaseStoreError> {
        let holder: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO leader_election (service_name, host_id, last_seen_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (service_name) DO UPDATE
            SET host_id = CASE
                    WHEN leader_election.last_seen_active < $4 THEN EXCLUDED.host_id
                    ELSE leader_election.host_id
                END,
                last_seen_active = CASE
                    WHEN leader_election.last_seen_active < $4
                      OR leader_election.host_id = EXCLUDED.host_id
                    THEN EXCLUDED.last_seen_active
                    ELSE leader_election.last_seen_active
                END
            RETURNING host_id
            "#,
        )
        .bind(service_name)
        .bind(host.as_uuid())
        .bind(now)
        .bind(expiry_cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire_or_renew", e))?;

        Ok(HostId::from_uuid(holder))
    }

    #[instrument(skip(self), fields(host_id = %host), err)]
    async fn is_holder(
        &self,
        service_name: &str,
        host: HostId,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM leader_election
                WHERE service_name = $1 AND host_id = $2 AND last_seen_active >= $3
            )
            "#,
        )
        .bind(service_name)
        .bind(host.as_uuid())
        .bind(expiry_cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("is_holder", e))?;

        Ok(exists)
    }

    #[instrument(skip(self), err)]
    async fn current(&self, service_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let row = sqlx::query(
            "SELECT service_name, host_id, last_seen_active FROM leader_election WHERE service_name = $1",
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_lease", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let holder: Uuid = row
            .try_get("host_id")
            .map_err(|e| LeaseStoreError::Corrupt(format!("host_id: {e}")))?;
        Ok(Some(Lease {
            service_name: row
                .try_get("service_name")
                .map_err(|e| LeaseStoreError::Corrupt(format!("service_name: {e}")))?,
            holder: HostId::from_uuid(holder),
            last_heartbeat: row
                .try_get("last_seen_active")
                .map_err(|e| LeaseStoreError::Corrupt(format!("last_seen_active: {e}")))?,
        }))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LeaseStoreError {
    match err {
        sqlx::Error::Database(db_err) => LeaseStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LeaseStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => LeaseStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
