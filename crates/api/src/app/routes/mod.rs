use axum::{routing::get, Router};

pub mod jobs;
pub mod queues;
pub mod system;

/// Router for the job and queue endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/ready", get(system::ready))
        .nest("/jobs", jobs::router())
        .nest("/queues", queues::router())
}
