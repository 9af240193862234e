use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use hookrelay_infra::delivery::TemplateRepository;

use crate::app::dto::{TemplateResponse, UpsertTemplateRequest};
use crate::app::errors;
use crate::app::services::AppServices;

pub async fn upsert(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
    Json(body): Json<UpsertTemplateRequest>,
) -> Response {
    if name.trim().is_empty() || body.content.is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "template name and content are required",
        );
    }

    match services.templates.upsert(&name, &body.content).await {
        Ok(template) => Json(TemplateResponse::from(template)).into_response(),
        Err(err) => errors::template_error_to_response(err),
    }
}

pub async fn get_template(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> Response {
    match services.templates.find_by_name(&name).await {
        Ok(Some(template)) => Json(TemplateResponse::from(template)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "template_not_found",
            format!("unknown template: {name}"),
        ),
        Err(err) => errors::template_error_to_response(err),
    }
}
