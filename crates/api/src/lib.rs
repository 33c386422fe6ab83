//! HTTP API: intake, upload-complete trigger and document queries.

pub mod app;
pub mod context;
pub mod middleware;
