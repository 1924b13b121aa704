//! HTTP endpoints for archived prints, plus the shared router state.
//!
//! Three routes: `GET /api/archives` (list), `GET /api/archive/{date}/{file}`
//! (stream one print back), and `GET /ws` (live fan-out upgrade, handled by
//! the `ws` module).

use crate::archive::{reader, ArchiveError};
use crate::hub::Hub;
use crate::pipeline::PipelineStats;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for the HTTP/WebSocket layer.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub stats: Arc<PipelineStats>,
    pub archive_root: PathBuf,
    /// Buffer capacity for per-connection hub subscriptions.
    pub subscriber_capacity: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn healthz() -> &'static str {
    "ok"
}

/// Live pipeline counters for the dashboard.
pub async fn status(State(state): State<AppState>) -> Response {
    #[derive(Serialize)]
    struct StatusBody {
        published: u64,
        decode_errors: u64,
        subscribers: usize,
    }
    (
        StatusCode::OK,
        Json(StatusBody {
            published: state.stats.published(),
            decode_errors: state.stats.decode_errors(),
            subscribers: state.hub.subscriber_count(),
        }),
    )
        .into_response()
}

pub async fn list_archives(State(state): State<AppState>) -> Response {
    match reader::list_archives(&state.archive_root) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_archive(
    State(state): State<AppState>,
    UrlPath((date, filename)): UrlPath<(String, String)>,
) -> Response {
    match reader::read_archive(&state.archive_root, &date, &filename) {
        Ok(packets) => (StatusCode::OK, Json(packets)).into_response(),
        Err(ArchiveError::InvalidName(name)) => {
            bad_request(format!("invalid archive name: {}", name))
        }
        Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            not_found("archive not found")
        }
        Err(e) => internal_error(e),
    }
}

// ---------------------------------------------------------------------------
// Error envelope helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HttpErrorEnvelope {
    code: String,
    message: String,
}

fn json_error(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        err.to_string(),
    )
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_helpers_set_status_and_envelope() {
        let response = not_found("archive not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("error json");
        assert_eq!(parsed["code"], "NOT_FOUND");
        assert_eq!(parsed["message"], "archive not found");
    }

    #[tokio::test]
    async fn bad_request_helper_sets_contract() {
        let response = bad_request("invalid archive name: ..");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("error json");
        assert_eq!(parsed["code"], "BAD_REQUEST");
    }
}
