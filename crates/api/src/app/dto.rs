use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hookrelay_core::{NotificationJob, Payload};
use hookrelay_infra::delivery::TemplateConfig;
use hookrelay_infra::intake::SubmitRequest;
use hookrelay_infra::queue::QueueDepth;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitNotificationRequest {
    pub target_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Payload,
    pub template_name: Option<String>,
    pub priority: Option<i32>,
}

impl From<SubmitNotificationRequest> for SubmitRequest {
    fn from(req: SubmitNotificationRequest) -> Self {
        SubmitRequest {
            target_url: req.target_url,
            headers: req.headers,
            payload: req.payload,
            template_name: req.template_name,
            priority: req.priority,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpsertTemplateRequest {
    pub content: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitNotificationResponse {
    pub job_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: i64,
    pub target_url: String,
    pub status: String,
    pub priority: i32,
    pub attempt_count: u32,
    pub failure_reason: Option<String>,
    pub failure_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub template_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NotificationJob> for JobResponse {
    fn from(job: NotificationJob) -> Self {
        Self {
            id: job.id.get(),
            target_url: job.target_url,
            status: job.status.as_str().to_string(),
            priority: job.priority.get(),
            attempt_count: job.attempt_count,
            failure_reason: job.failure_reason.map(|r| r.as_str().to_string()),
            failure_message: job.failure_message,
            next_retry_at: job.next_retry_at,
            template_id: job.template_id.map(i64::from),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResponse {
    pub id: i64,
    pub name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl From<TemplateConfig> for TemplateResponse {
    fn from(template: TemplateConfig) -> Self {
        Self {
            id: template.id.get(),
            name: template.name,
            content: template.content,
            updated_at: template.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub host_id: String,
    pub leader: bool,
    pub backend: &'static str,
    pub queue: QueueDepthResponse,
}

#[derive(Debug, Serialize)]
pub struct QueueDepthResponse {
    pub high: usize,
    pub standard: usize,
}

impl From<QueueDepth> for QueueDepthResponse {
    fn from(depth: QueueDepth) -> Self {
        Self {
            high: depth.high,
            standard: depth.standard,
        }
    }
}
