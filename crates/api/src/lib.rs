//! HTTP API: intake, job status and health endpoints over the delivery engine.

pub mod app;
pub mod middleware;
