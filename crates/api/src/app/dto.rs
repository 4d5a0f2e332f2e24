use axum::http::StatusCode;
use serde::Deserialize;

use mfgmon_core::JobId;
use mfgmon_queues::{QueueKind, SubmitOptions};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// `operations` (default) or `database`
    pub queue: Option<String>,
    #[serde(default)]
    pub options: SubmitOptions,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_queue(raw: Option<&str>) -> Result<QueueKind, axum::response::Response> {
    match raw {
        None => Ok(QueueKind::default()),
        Some(s) => s.trim().to_lowercase().parse().map_err(|_| {
            errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_queue",
                "queue must be one of: operations, database",
            )
        }),
    }
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
