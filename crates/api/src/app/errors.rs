use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use hookrelay_infra::delivery::TemplateError;
use hookrelay_infra::intake::SubmitError;
use hookrelay_infra::jobs::JobStoreError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::NotLeader => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "not_leader", "Not Leader")
        }
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SubmitError::TemplateNotFound(name) => json_error(
            StatusCode::BAD_REQUEST,
            "template_not_found",
            format!("unknown template: {name}"),
        ),
        SubmitError::Template(e) => template_error_to_response(e),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            other.to_string(),
        ),
    }
}

pub fn template_error_to_response(err: TemplateError) -> axum::response::Response {
    match err {
        TemplateError::NotFound(name) => json_error(
            StatusCode::NOT_FOUND,
            "template_not_found",
            format!("unknown template: {name}"),
        ),
        TemplateError::Render(msg) => json_error(StatusCode::BAD_REQUEST, "template_invalid", msg),
        TemplateError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
