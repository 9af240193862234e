use axum::{
    Router,
    routing::{get, post, put},
};

pub mod notifications;
pub mod system;
pub mod templates;

/// Router for the versioned API (mounted under `/api/v1`).
pub fn router() -> Router {
    Router::new()
        .route("/notifications", post(notifications::submit))
        .route("/notifications/:id", get(notifications::get_job))
        .route(
            "/templates/:name",
            put(templates::upsert).get(templates::get_template),
        )
}
