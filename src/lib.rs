pub mod app;
pub mod auth;
pub mod banner;
pub mod config;
pub mod error;
pub mod handlers;
pub mod inject;
pub mod model_limits;
pub mod relay;
pub mod retry;
pub mod sse;
pub mod trace_sink;
pub mod upstream;
pub mod usage;

/// Correlation header set on every upstream call and client response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
