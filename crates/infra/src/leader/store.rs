//! Lease storage contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hookrelay_core::{HostId, Lease};

/// Lease store abstraction.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease if missing or expired, renew it if `host` holds it.
    ///
    /// Must be one atomic operation against the store. Returns the holder
    /// after the operation.
    async fn try_acquire_or_renew(
        &self,
        service_name: &str,
        host: HostId,
        now: DateTime<Utc>,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<HostId, LeaseStoreError>;

    /// True when `host` is the stored holder and heartbeated at or after `expiry_cutoff`.
    async fn is_holder(
        &self,
        service_name: &str,
        host: HostId,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError>;

    /// The stored lease row, if any.
    async fn current(&self, service_name: &str) -> Result<Option<Lease>, LeaseStoreError>;
}

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("corrupt lease row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory lease table shared by every election in the process.
///
/// One mutex guards the whole table, which makes `try_acquire_or_renew`
/// atomic the same way the Postgres upsert is.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire_or_renew(
        &self,
        service_name: &str,
        host: HostId,
        now: DateTime<Utc>,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<HostId, LeaseStoreError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Lease::contend(leases.get(service_name), service_name, host, now, expiry_cutoff);
        let holder = next.holder;
        leases.insert(service_name.to_string(), next);
        Ok(holder)
    }

    async fn is_holder(
        &self,
        service_name: &str,
        host: HostId,
        expiry_cutoff: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(leases
            .get(service_name)
            .is_some_and(|lease| lease.is_held_by(host, expiry_cutoff)))
    }

    async fn current(&self, service_name: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(leases.get(service_name).cloned())
    }
}
