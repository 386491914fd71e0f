//! Liveness endpoint.

use axum::http::StatusCode;

/// Returns a plain 200 OK to signal the process is alive and accepting connections.
pub(crate) async fn health() -> StatusCode {
    StatusCode::OK
}
