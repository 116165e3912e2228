//! Authentication module

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use clariphish_common::config::{ApiConfig, TrackingConfig};
use clariphish_core::{Aggregator, CampaignManager, Metrics, TrackingService};
use clariphish_storage::Repositories;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::handlers::ErrorResponse;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub tracking: TrackingService,
    pub aggregator: Aggregator,
    pub campaigns: Arc<CampaignManager>,
    pub metrics: Metrics,
    /// Title of the report-phishing confirmation page
    pub report_title: String,
    admin_token_digest: [u8; 32],
}

impl AppState {
    pub fn new(
        repos: Repositories,
        tracking: TrackingService,
        campaigns: Arc<CampaignManager>,
        metrics: Metrics,
        api: &ApiConfig,
        tracking_config: &TrackingConfig,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(repos.clone()),
            repos,
            tracking,
            campaigns,
            metrics,
            report_title: tracking_config.report_title.clone(),
            admin_token_digest: digest(&api.admin_token),
        }
    }

    /// Whether `token` is the configured admin token
    pub fn is_admin_token(&self, token: &str) -> bool {
        let candidate = digest(token);
        // Fixed-length digests, compared without early exit
        candidate
            .iter()
            .zip(self.admin_token_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Extract the bearer token from the Authorization header
pub fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Admin guard for `/api/v1`
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    match extract_bearer(&request) {
        Some(token) if state.is_admin_token(token) => Ok(next.run(request).await),
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected admin request with invalid token");
            Err(unauthorized("Invalid admin token"))
        }
        None => {
            warn!(path = %request.uri().path(), "Missing admin token");
            Err(unauthorized("Missing bearer token"))
        }
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_extract_bearer() {
        let req = Request::builder()
            .header("authorization", "Bearer abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req), Some("abc123"));

        let basic = Request::builder()
            .header("authorization", "Basic abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&basic), None);
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest("token"), digest("token"));
        assert_ne!(digest("token"), digest("token2"));
    }
}
