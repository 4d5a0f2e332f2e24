use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode};

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// 200 once the queues are wired, 503 before.
pub async fn ready(Extension(services): Extension<Arc<AppServices>>) -> StatusCode {
    if services.facade.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
