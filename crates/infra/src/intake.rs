//! Submission of new notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use hookrelay_core::{DomainError, JobDraft, JobId, NotificationJob, Payload, Priority};

use crate::delivery::{TemplateError, TemplateRepository};
use crate::jobs::{JobStore, JobStoreError};
use crate::leader::LeaderElection;
use crate::queue::QueueManager;

/// A notification as submitted by a caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub target_url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub template_name: Option<String>,
    /// 1 (highest) to 3; defaults to 3
    pub priority: Option<i32>,
}

impl SubmitRequest {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("this instance is not the leader")]
    NotLeader,
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("unknown template: {0}")]
    TemplateNotFound(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<DomainError> for SubmitError {
    fn from(err: DomainError) -> Self {
        SubmitError::Validation(err.to_string())
    }
}

/// Accepts submissions on the leader: stores them PENDING and queues them.
pub struct NotificationService {
    store: Arc<dyn JobStore>,
    templates: Arc<dyn TemplateRepository>,
    queue: Arc<QueueManager>,
    leader: Arc<LeaderElection>,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn JobStore>,
        templates: Arc<dyn TemplateRepository>,
        queue: Arc<QueueManager>,
        leader: Arc<LeaderElection>,
    ) -> Self {
        Self {
            store,
            templates,
            queue,
            leader,
        }
    }

    /// Store and enqueue a new job. Returns as soon as it is queued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        if !self.leader.is_leader().await {
            debug!(target_url = %request.target_url, "rejecting submission, not leader");
            return Err(SubmitError::NotLeader);
        }

        let draft = self.draft(request).await?;
        let job = self.store.insert(draft).await?;
        let job_id = job.id;
        let lane = self.queue.push(job);
        info!(job_id = %job_id, lane = %lane, "notification accepted");
        Ok(job_id)
    }

    /// Current stored state of a job.
    pub async fn get(&self, id: JobId) -> Result<Option<NotificationJob>, JobStoreError> {
        self.store.get(id).await
    }

    async fn draft(&self, request: SubmitRequest) -> Result<JobDraft, SubmitError> {
        validate_target_url(&request.target_url)?;
        let priority = match request.priority {
            Some(value) => Priority::new(value)?,
            None => Priority::default(),
        };

        let mut draft = JobDraft::new(request.target_url)
            .with_payload(request.payload)
            .with_priority(priority);
        draft.headers = request.headers;

        if let Some(name) = request.template_name {
            let template = self
                .templates
                .find_by_name(&name)
                .await?
                .ok_or(SubmitError::TemplateNotFound(name))?;
            draft = draft.with_template(template.id);
        }
        Ok(draft)
    }
}

fn validate_target_url(raw: &str) -> Result<(), SubmitError> {
    if raw.trim().is_empty() {
        return Err(SubmitError::Validation("target URL is required".to_string()));
    }
    let parsed = url::Url::parse(raw)
        .map_err(|e| SubmitError::Validation(format!("target URL {raw:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SubmitError::Validation(format!(
            "target URL must be http or https (got {other})"
        ))),
    }
}
