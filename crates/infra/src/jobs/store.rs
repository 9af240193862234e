//! Job storage contract and in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use hookrelay_core::{FailureReason, JobDraft, JobId, NotificationJob};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new PENDING job and return it with its assigned identifier.
    async fn insert(&self, draft: JobDraft) -> Result<NotificationJob, JobStoreError>;

    /// Overwrite every mutable field of an existing job.
    async fn update(&self, job: &NotificationJob) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<NotificationJob>, JobStoreError>;

    /// Claim up to `limit` FAILED jobs whose next retry is due.
    ///
    /// Ordered by priority, then next retry time. Rows held by a concurrent
    /// claim are skipped, and claimed rows have their next retry pushed out
    /// by `claim_ttl` so later claims ignore them while they are in flight.
    async fn claim_for_recovery(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_ttl: Duration,
    ) -> Result<Vec<NotificationJob>, JobStoreError>;

    /// Count jobs updated at or after `since`.
    async fn count_updated_since(&self, since: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Count jobs with the given failure reason updated at or after `since`.
    async fn count_with_failure_reason_since(
        &self,
        reason: FailureReason,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<JobId, NotificationJob>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                jobs: BTreeMap::new(),
            }),
        }
    }

    /// Snapshot of every stored job, in id order.
    pub fn all(&self) -> Vec<NotificationJob> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.values().cloned().collect()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, draft: JobDraft) -> Result<NotificationJob, JobStoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = JobId::new(inner.next_id);
        inner.next_id += 1;

        let job = draft.into_job(id, Utc::now());
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn update(&self, job: &NotificationJob) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;

        let created_at = stored.created_at;
        *stored = job.clone();
        stored.created_at = created_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<NotificationJob>, JobStoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn claim_for_recovery(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_ttl: Duration,
    ) -> Result<Vec<NotificationJob>, JobStoreError> {
        // The write lock plays the part of FOR UPDATE SKIP LOCKED: a
        // concurrent claim only sees rows this one has already pushed out.
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let mut due: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.is_due_for_recovery(now))
            .map(|j| (j.priority, j.next_retry_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.next_retry_at = Some(now + claim_ttl);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn count_updated_since(&self, since: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.jobs.values().filter(|j| j.updated_at >= since).count() as u64)
    }

    async fn count_with_failure_reason_since(
        &self,
        reason: FailureReason,
        since: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.failure_reason == Some(reason) && j.updated_at >= since)
            .count() as u64)
    }
}

/// Convenience for tests: put a job straight into FAILED with a given retry time.
#[cfg(test)]
pub(crate) async fn seed_failed(
    store: &dyn JobStore,
    draft: JobDraft,
    attempts: u32,
    next_retry_at: DateTime<Utc>,
) -> NotificationJob {
    let mut job = store.insert(draft).await.unwrap();
    job.status = hookrelay_core::JobStatus::Failed;
    job.attempt_count = attempts;
    job.failure_reason = Some(FailureReason::ExternalServiceUnavailable);
    job.next_retry_at = Some(next_retry_at);
    store.update(&job).await.unwrap();
    store.get(job.id).await.unwrap().unwrap()
}
