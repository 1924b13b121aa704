//! printwatch: telemetry ingest, fan-out, and per-print archival for
//! networked 3-D printers.
//!
//! The pipeline decodes textual telemetry datagrams into structured metric
//! records with absolute device timestamps, fans them out through a
//! broadcast hub with per-subscriber buffering, maintains a per-sender
//! active-print archive on disk, and serves archived prints back over HTTP.

pub mod archive;
pub mod config;
pub mod enrich;
pub mod frame;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod reorder;
pub mod ws;

pub use http::AppState;

use axum::{routing::get, Router};

/// Build the HTTP/WebSocket router over a running pipeline.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/api/status", get(http::status))
        .route("/api/archives", get(http::list_archives))
        .route("/api/archive/:date/:filename", get(http::get_archive))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
