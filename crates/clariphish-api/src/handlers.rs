//! API request handlers

pub mod campaigns;
pub mod health;
pub mod metrics;
pub mod tracking;

use axum::{http::StatusCode, Json};
use clariphish_common::Error;
use serde::{Deserialize, Serialize};
use tracing::error;

pub use health::*;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Map a domain error onto its HTTP status and a JSON body.
///
/// Server-side failures are logged in full and answered with a generic message.
pub fn api_error(e: Error) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if status.is_server_error() {
        error!(error = %e, code = e.code(), "Request failed");
        "Internal server error".to_string()
    } else {
        e.to_string()
    };

    (
        status,
        Json(ErrorResponse {
            error: e.code().to_string(),
            message,
        }),
    )
}
