//! Delivery attempt and retry state machine.
//!
//! A job leaves `process` with exactly one store write: the success update,
//! or the failure handler's update of a freshly re-read row. Terminal jobs
//! are never written.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use hookrelay_core::{FailureReason, JobId, JobStatus, NotificationJob, RetryPolicy};

use super::client::DeliveryClient;
use super::template::{TemplateError, TemplateRenderer};
use crate::jobs::{JobStore, JobStoreError};

/// How one call into the processor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Job was already terminal, or its failure was already recorded.
    Skipped,
    Delivered,
    /// Failure recorded; the job is due again after backoff.
    Failed {
        reason: FailureReason,
        attempts: u32,
    },
    /// Failure recorded and the retry ceiling reached.
    Exhausted {
        reason: FailureReason,
        attempts: u32,
    },
    /// The job row could not be found on re-read.
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Performs delivery attempts and owns the failure/backoff transition.
pub struct Processor {
    store: Arc<dyn JobStore>,
    client: Arc<dyn DeliveryClient>,
    renderer: Arc<dyn TemplateRenderer>,
    policy: RetryPolicy,
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn DeliveryClient>,
        renderer: Arc<dyn TemplateRenderer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            renderer,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one delivery attempt for `job`.
    ///
    /// The queued copy only names the job; status checks and the success
    /// write use the row as currently stored.
    pub async fn process(&self, job: NotificationJob) -> Result<ProcessOutcome, ProcessError> {
        let Some(mut fresh) = self.store.get(job.id).await? else {
            warn!(job_id = %job.id, "job vanished before delivery");
            return Ok(ProcessOutcome::Abandoned);
        };
        if fresh.is_terminal() {
            debug!(job_id = %fresh.id, status = %fresh.status, "job already terminal, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        let body = match self.render_body(&fresh).await {
            Ok(body) => body,
            Err(err) => {
                return self
                    .handle_failure(fresh.id, err.to_string(), FailureReason::Unknown)
                    .await;
            }
        };

        match self.client.post(&fresh.target_url, &fresh.headers, body).await {
            Ok(status) => {
                fresh.mark_succeeded(Utc::now());
                self.store.update(&fresh).await?;
                info!(job_id = %fresh.id, http_status = status, attempts = fresh.attempt_count, "notification delivered");
                Ok(ProcessOutcome::Delivered)
            }
            Err(err) => {
                self.handle_failure(fresh.id, err.to_string(), err.failure_reason())
                    .await
            }
        }
    }

    /// Record a failed attempt against the stored copy of the job.
    pub async fn handle_failure(
        &self,
        job_id: JobId,
        message: impl Into<String>,
        reason: FailureReason,
    ) -> Result<ProcessOutcome, ProcessError> {
        self.record_failure(job_id, message.into(), reason, None)
            .await
    }

    /// Like [`handle_failure`](Self::handle_failure), but only when the stored
    /// attempt count still equals `attempts_seen`.
    ///
    /// Used by paths racing the attempt itself (timeouts, crashed tasks) so a
    /// failure already recorded by the attempt is not counted twice.
    pub async fn handle_failure_once(
        &self,
        job_id: JobId,
        attempts_seen: u32,
        message: impl Into<String>,
        reason: FailureReason,
    ) -> Result<ProcessOutcome, ProcessError> {
        self.record_failure(job_id, message.into(), reason, Some(attempts_seen))
            .await
    }

    async fn record_failure(
        &self,
        job_id: JobId,
        message: String,
        reason: FailureReason,
        attempts_seen: Option<u32>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let Some(mut fresh) = self.store.get(job_id).await? else {
            warn!(job_id = %job_id, "job vanished before failure could be recorded");
            return Ok(ProcessOutcome::Abandoned);
        };

        if fresh.is_terminal() {
            debug!(job_id = %job_id, status = %fresh.status, "job already terminal, failure ignored");
            return Ok(ProcessOutcome::Skipped);
        }
        if attempts_seen.is_some_and(|seen| seen != fresh.attempt_count) {
            debug!(job_id = %job_id, attempts = fresh.attempt_count, "attempt already recorded");
            return Ok(ProcessOutcome::Skipped);
        }

        fresh.record_failure(message, reason, &self.policy, Utc::now());
        self.store.update(&fresh).await?;

        let attempts = fresh.attempt_count;
        if fresh.status == JobStatus::MaxRetries {
            warn!(
                job_id = %job_id,
                reason = %reason,
                attempts,
                error = fresh.failure_message.as_deref().unwrap_or_default(),
                "notification gave up after max retries"
            );
            Ok(ProcessOutcome::Exhausted { reason, attempts })
        } else {
            warn!(
                job_id = %job_id,
                reason = %reason,
                attempts,
                next_retry_at = ?fresh.next_retry_at,
                error = fresh.failure_message.as_deref().unwrap_or_default(),
                "notification delivery failed"
            );
            Ok(ProcessOutcome::Failed { reason, attempts })
        }
    }

    async fn render_body(&self, job: &NotificationJob) -> Result<String, TemplateError> {
        match job.template_id {
            Some(template_id) => self.renderer.render(template_id, &job.payload).await,
            None => serde_json::to_string(&job.payload)
                .map_err(|e| TemplateError::Render(format!("payload: {e}"))),
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{HandlebarsRenderer, InMemoryTemplateRepository, TemplateRepository};
    use crate::jobs::InMemoryJobStore;
    use crate::jobs::store::seed_failed;
    use crate::testing::{Reply, ScriptedClient};
    use chrono::Duration;
    use hookrelay_core::{JobDraft, Payload, Priority, TemplateId};
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        client: Arc<ScriptedClient>,
        templates: Arc<InMemoryTemplateRepository>,
        processor: Processor,
    }

    fn harness(client: ScriptedClient) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let client = Arc::new(client);
        let templates = Arc::new(InMemoryTemplateRepository::new());
        let processor = Processor::new(
            store.clone(),
            client.clone(),
            Arc::new(HandlebarsRenderer::new(templates.clone())),
            RetryPolicy::default(),
        );
        Harness {
            store,
            client,
            templates,
            processor,
        }
    }

    fn payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("event".into(), json!("order.paid"));
        payload
    }

    #[tokio::test]
    async fn success_posts_payload_json_and_marks_success() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let job = h
            .store
            .insert(
                JobDraft::new("http://receiver.test/a")
                    .with_payload(payload())
                    .with_priority(Priority::NORMAL),
            )
            .await
            .unwrap();

        let outcome = h.processor.process(job.clone()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Delivered);

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(
            h.client.calls(),
            vec![(
                "http://receiver.test/a".to_string(),
                r#"{"event":"order.paid"}"#.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn template_body_is_rendered_from_payload() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let template = h
            .templates
            .upsert("paid", r#"{"msg":"{{event}} received"}"#)
            .await
            .unwrap();
        let job = h
            .store
            .insert(
                JobDraft::new("http://receiver.test/t")
                    .with_payload(payload())
                    .with_template(template.id),
            )
            .await
            .unwrap();

        h.processor.process(job).await.unwrap();
        assert_eq!(h.client.calls()[0].1, r#"{"msg":"order.paid received"}"#);
    }

    #[tokio::test]
    async fn client_error_records_first_failure_with_backoff() {
        let h = harness(ScriptedClient::always(Reply::Status(404)));
        let job = h
            .store
            .insert(JobDraft::new("http://receiver.test/missing"))
            .await
            .unwrap();

        let before = Utc::now();
        let outcome = h.processor.process(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed {
                reason: FailureReason::ClientError,
                attempts: 1
            }
        );

        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.failure_reason, Some(FailureReason::ClientError));
        assert_eq!(stored.attempt_count, 1);
        let next = stored.next_retry_at.unwrap();
        assert!(next >= before + Duration::seconds(2));
        assert!(next <= Utc::now() + Duration::seconds(2));
    }

    #[tokio::test]
    async fn transport_and_server_errors_are_service_unavailable() {
        for reply in [Reply::Refuse, Reply::Status(502)] {
            let h = harness(ScriptedClient::always(reply));
            let job = h
                .store
                .insert(JobDraft::new("http://receiver.test/down"))
                .await
                .unwrap();
            h.processor.process(job.clone()).await.unwrap();
            let stored = h.store.get(job.id).await.unwrap().unwrap();
            assert_eq!(
                stored.failure_reason,
                Some(FailureReason::ExternalServiceUnavailable)
            );
        }
    }

    #[tokio::test]
    async fn missing_template_fails_as_unknown_without_calling_out() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let job = h
            .store
            .insert(JobDraft::new("http://receiver.test/t").with_template(TemplateId::new(77)))
            .await
            .unwrap();

        let outcome = h.processor.process(job.clone()).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed {
                reason: FailureReason::Unknown,
                ..
            }
        ));
        assert_eq!(h.client.call_count(), 0);
    }

    #[tokio::test]
    async fn terminal_jobs_are_left_alone() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let mut job = h
            .store
            .insert(JobDraft::new("http://receiver.test/done"))
            .await
            .unwrap();
        job.mark_succeeded(Utc::now());
        h.store.update(&job).await.unwrap();
        let before = h.store.get(job.id).await.unwrap().unwrap();

        assert_eq!(
            h.processor.process(before.clone()).await.unwrap(),
            ProcessOutcome::Skipped
        );
        assert_eq!(
            h.processor
                .handle_failure(job.id, "late", FailureReason::Unknown)
                .await
                .unwrap(),
            ProcessOutcome::Skipped
        );
        assert_eq!(h.client.call_count(), 0);
        assert_eq!(h.store.get(job.id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn fifth_failure_exhausts_retries() {
        let h = harness(ScriptedClient::always(Reply::Refuse));
        let job = seed_failed(
            h.store.as_ref(),
            JobDraft::new("http://receiver.test/down"),
            4,
            Utc::now(),
        )
        .await;

        let outcome = h.processor.process(job.clone()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Exhausted {
                reason: FailureReason::ExternalServiceUnavailable,
                attempts: 5
            }
        );
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::MaxRetries);
        assert_eq!(stored.next_retry_at, None);
    }

    #[tokio::test]
    async fn failure_handler_uses_fresh_row_not_caller_copy() {
        let h = harness(ScriptedClient::always(Reply::Refuse));
        let stale = h
            .store
            .insert(JobDraft::new("http://receiver.test/x"))
            .await
            .unwrap();
        h.processor
            .handle_failure(stale.id, "first", FailureReason::Unknown)
            .await
            .unwrap();

        // the caller still holds attempt_count 0; the handler must build on 1
        h.processor.process(stale.clone()).await.unwrap();
        let stored = h.store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn success_keeps_attempts_recorded_since_enqueue() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let stale = h
            .store
            .insert(JobDraft::new("http://receiver.test/x"))
            .await
            .unwrap();
        h.processor
            .handle_failure(stale.id, "first", FailureReason::ClientError)
            .await
            .unwrap();

        let outcome = h.processor.process(stale.clone()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Delivered);

        let stored = h.store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.failure_reason, Some(FailureReason::ClientError));
    }

    #[tokio::test]
    async fn stale_copy_of_delivered_job_is_not_posted_again() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let job = h
            .store
            .insert(JobDraft::new("http://receiver.test/x"))
            .await
            .unwrap();

        assert_eq!(
            h.processor.process(job.clone()).await.unwrap(),
            ProcessOutcome::Delivered
        );
        assert_eq!(
            h.processor.process(job.clone()).await.unwrap(),
            ProcessOutcome::Skipped
        );
        assert_eq!(h.client.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_abandoned_without_delivery() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let orphan = JobDraft::new("http://receiver.test/x").into_job(JobId::new(999), Utc::now());

        assert_eq!(
            h.processor.process(orphan).await.unwrap(),
            ProcessOutcome::Abandoned
        );
        assert_eq!(h.client.call_count(), 0);
    }

    #[tokio::test]
    async fn guarded_failure_is_counted_once() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let job = h
            .store
            .insert(JobDraft::new("http://receiver.test/x"))
            .await
            .unwrap();

        let first = h
            .processor
            .handle_failure_once(job.id, 0, "Timeout", FailureReason::Unknown)
            .await
            .unwrap();
        let second = h
            .processor
            .handle_failure_once(job.id, 0, "Timeout", FailureReason::Unknown)
            .await
            .unwrap();

        assert!(matches!(first, ProcessOutcome::Failed { attempts: 1, .. }));
        assert_eq!(second, ProcessOutcome::Skipped);
        assert_eq!(h.store.get(job.id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_row_is_abandoned() {
        let h = harness(ScriptedClient::always(Reply::Accept));
        let outcome = h
            .processor
            .handle_failure(JobId::new(404), "gone", FailureReason::Unknown)
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Abandoned);
    }
}
