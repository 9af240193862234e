//! The notification job and its delivery lifecycle.
//!
//! ```text
//! PENDING ──► SUCCESS
//!    │  ▲
//!    ▼  │ (recovery poller re-enqueues)
//! FAILED ───► MAX_RETRIES
//! ```
//!
//! SUCCESS and MAX_RETRIES are terminal. Only the processor mutates a job
//! after creation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TemplateId};
use crate::retry::RetryPolicy;

/// JSON object delivered (or fed to a template) for a job.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Delivery priority: 1 is highest, 3 is lowest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    pub fn new(value: i32) -> DomainResult<Self> {
        match value {
            1..=3 => Ok(Self(value as u8)),
            other => Err(DomainError::validation(format!(
                "priority must be 1, 2 or 3 (got {other})"
            ))),
        }
    }

    pub fn get(&self) -> i32 {
        i32::from(self.0)
    }

    /// Jobs with this priority go through the high-priority lane.
    pub fn is_high(&self) -> bool {
        *self == Self::HIGH
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::LOW
    }
}

impl TryFrom<i32> for Priority {
    type Error = DomainError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i32 {
    fn from(value: Priority) -> Self {
        value.get()
    }
}

/// Delivery status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, waiting for its first attempt
    Pending,
    /// Delivered
    Success,
    /// Last attempt failed; eligible for recovery once `next_retry_at` is due
    Failed,
    /// Retry ceiling reached
    MaxRetries,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::MaxRetries)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::MaxRetries => "MAX_RETRIES",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "MAX_RETRIES" => Ok(JobStatus::MaxRetries),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Why the last delivery attempt failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// The endpoint answered with a 4xx
    ClientError,
    /// The endpoint answered with a 5xx, or could not be reached
    ExternalServiceUnavailable,
    /// Anything else (rendering failures, timeouts, internal errors)
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ClientError => "CLIENT_ERROR",
            FailureReason::ExternalServiceUnavailable => "EXTERNAL_SERVICE_UNAVAILABLE",
            FailureReason::Unknown => "UNKNOWN",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FailureReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLIENT_ERROR" => Ok(FailureReason::ClientError),
            "EXTERNAL_SERVICE_UNAVAILABLE" => Ok(FailureReason::ExternalServiceUnavailable),
            "UNKNOWN" => Ok(FailureReason::Unknown),
            other => Err(DomainError::validation(format!(
                "unknown failure reason: {other}"
            ))),
        }
    }
}

/// A job as submitted, before the store has assigned it an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub target_url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub template_id: Option<TemplateId>,
    pub priority: Priority,
}

impl JobDraft {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            headers: BTreeMap::new(),
            payload: Payload::new(),
            template_id: None,
            priority: Priority::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Materialize the draft as a fresh PENDING job, due immediately.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> NotificationJob {
        NotificationJob {
            id,
            target_url: self.target_url,
            headers: self.headers,
            payload: self.payload,
            template_id: self.template_id,
            status: JobStatus::Pending,
            failure_reason: None,
            failure_message: None,
            attempt_count: 0,
            next_retry_at: Some(now),
            priority: self.priority,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A notification job as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: JobId,
    pub target_url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
    pub template_id: Option<TemplateId>,
    pub status: JobStatus,
    pub failure_reason: Option<FailureReason>,
    pub failure_message: Option<String>,
    /// Number of failed attempts so far (starts at 0, never decreases)
    pub attempt_count: u32,
    /// Only meaningful while `status == Failed`
    pub next_retry_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when the recovery poller may pick this job up.
    pub fn is_due_for_recovery(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Mark the job as delivered.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.updated_at = now;
    }

    /// Record one failed attempt and move to FAILED or MAX_RETRIES.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        reason: FailureReason,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) {
        self.failure_message = Some(message.into());
        self.failure_reason = Some(reason);
        self.attempt_count += 1;
        self.updated_at = now;

        if policy.is_exhausted(self.attempt_count) {
            self.status = JobStatus::MaxRetries;
            self.next_retry_at = None;
        } else {
            self.status = JobStatus::Failed;
            self.next_retry_at = Some(now + policy.backoff_for(self.attempt_count));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> NotificationJob {
        JobDraft::new("http://example.test/hook").into_job(JobId::new(1), Utc::now())
    }

    #[test]
    fn priority_defaults_to_low() {
        assert_eq!(Priority::default(), Priority::LOW);
        assert_eq!(JobDraft::new("http://x").priority.get(), 3);
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(4).is_err());
        assert!(Priority::new(1).unwrap().is_high());
        assert!(!Priority::new(2).unwrap().is_high());
    }

    #[test]
    fn priority_deserializes_with_validation() {
        let p: Priority = serde_json::from_str("2").unwrap();
        assert_eq!(p, Priority::NORMAL);
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn status_string_forms_match_storage() {
        for status in [
            JobStatus::Pending,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::MaxRetries,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&JobStatus::MaxRetries).unwrap(),
            "\"MAX_RETRIES\""
        );
    }

    #[test]
    fn new_job_is_pending_and_due_now() {
        let now = Utc::now();
        let job = JobDraft::new("http://x").into_job(JobId::new(7), now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.next_retry_at, Some(now));
        assert!(!job.is_due_for_recovery(now));
    }

    #[test]
    fn failure_schedules_exponential_retry() {
        let policy = RetryPolicy::default();
        let mut job = job();
        let now = Utc::now();

        job.record_failure("404 Not Found", FailureReason::ClientError, &policy, now);

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.failure_reason, Some(FailureReason::ClientError));
        assert_eq!(job.failure_message.as_deref(), Some("404 Not Found"));
        assert_eq!(job.next_retry_at, Some(now + Duration::seconds(2)));
        assert!(job.is_due_for_recovery(now + Duration::seconds(2)));
        assert!(!job.is_due_for_recovery(now + Duration::seconds(1)));
    }

    #[test]
    fn fifth_failure_is_terminal() {
        let policy = RetryPolicy::default();
        let mut job = job();
        let now = Utc::now();

        for _ in 0..4 {
            job.record_failure("down", FailureReason::ExternalServiceUnavailable, &policy, now);
            assert_eq!(job.status, JobStatus::Failed);
        }
        job.record_failure("down", FailureReason::ExternalServiceUnavailable, &policy, now);

        assert_eq!(job.status, JobStatus::MaxRetries);
        assert_eq!(job.attempt_count, 5);
        assert!(job.next_retry_at.is_none());
        assert!(job.is_terminal());
        assert!(!job.is_due_for_recovery(now + Duration::days(1)));
    }
}
