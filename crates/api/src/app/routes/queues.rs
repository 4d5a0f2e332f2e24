use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/status", get(queue_status))
        .route("/fallback/process", post(process_fallback))
}

pub async fn queue_status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (StatusCode::OK, Json(services.facade.status().await)).into_response()
}

/// Manual trigger for one drain pass.
pub async fn process_fallback(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.facade.process_fallback_now().await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "drain_failed", e.to_string()),
    }
}
