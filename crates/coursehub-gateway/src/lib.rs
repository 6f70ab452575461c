//! # CourseHub Gateway
//!
//! Thin axum layer over the activity log service and the notification worker.
//! Caller identity is taken from headers set by the upstream auth layer.

pub mod routes;
pub mod server;

pub use routes::ApiError;
pub use server::{AppState, build_router, start};
