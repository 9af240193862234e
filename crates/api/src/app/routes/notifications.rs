use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use hookrelay_core::JobId;

use crate::app::dto::{JobResponse, SubmitNotificationRequest, SubmitNotificationResponse};
use crate::app::errors;
use crate::app::services::AppServices;

/// `POST /api/v1/notifications`: accept a job and return its id without waiting for delivery.
pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SubmitNotificationRequest>,
) -> Response {
    match services.intake.submit(body.into()).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(SubmitNotificationResponse { job_id: id.get() }),
        )
            .into_response(),
        Err(err) => errors::submit_error_to_response(err),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> Response {
    let id = JobId::new(id);
    match services.intake.get(id).await {
        Ok(Some(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {id} not found"),
        ),
        Err(err) => errors::store_error_to_response(err),
    }
}
