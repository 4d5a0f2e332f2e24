//! HTTP API: server, routing, and request/response mapping for job submission.

pub mod app;
