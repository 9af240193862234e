use std::sync::Arc;

use axum::{Json, extract::Extension};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

/// `GET /health`: liveness plus this instance's leadership and queue depth.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        host_id: services.leader.host_id().to_string(),
        leader: services.leader.is_leader().await,
        backend: services.backend(),
        queue: services.queue.depth().into(),
    })
}
