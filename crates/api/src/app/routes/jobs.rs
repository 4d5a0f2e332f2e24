use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let queue = match dto::parse_queue(body.queue.as_deref()) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match services
        .facade
        .submit_to(queue, &body.name, &body.payload, body.options)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.facade.get_job(&id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::queue_error_to_response(e),
    }
}
