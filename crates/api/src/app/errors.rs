use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use mfgmon_queues::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotReady => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "queue system is starting, retry shortly",
        ),
        QueueError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        QueueError::Serialization(msg) => json_error(StatusCode::BAD_REQUEST, "serialization_error", msg),
        err @ (QueueError::Backend(_) | QueueError::Fallback(_)) => {
            json_error(StatusCode::BAD_GATEWAY, "rejected", err.to_string())
        }
        QueueError::Lookup(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "lookup_unavailable", msg),
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
