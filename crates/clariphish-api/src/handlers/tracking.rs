//! Public tracking handlers
//!
//! None of these ever answer with an error: a bad token gets the same
//! artifact as a good one.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Form, Json,
};
use clariphish_core::tracking::RID_FIELD;
use clariphish_core::{ClickOutcome, ClientInfo, SubmitOutcome, TRACKING_PIXEL_GIF};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::AppState;

const NO_CACHE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

/// Raw query pairs; repeated or oddly encoded parameters never reject a request
type QueryPairs = Option<Query<Vec<(String, String)>>>;

/// First `rid` parameter of the query string
fn rid_param(query: QueryPairs) -> Option<String> {
    query.and_then(|Query(pairs)| {
        pairs
            .into_iter()
            .find(|(name, _)| name == RID_FIELD)
            .map(|(_, value)| value)
    })
}

/// GET /track
pub async fn track(
    State(state): State<Arc<AppState>>,
    query: QueryPairs,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    state
        .tracking
        .open(rid_param(query).as_deref(), &client_info(&headers, connect))
        .await;

    (
        [(header::CONTENT_TYPE, "image/gif")],
        NO_CACHE,
        TRACKING_PIXEL_GIF,
    )
        .into_response()
}

/// GET /click
pub async fn click(
    State(state): State<Arc<AppState>>,
    query: QueryPairs,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let outcome = state
        .tracking
        .click(rid_param(query).as_deref(), &client_info(&headers, connect))
        .await;

    match outcome {
        ClickOutcome::Landing(html) => (NO_CACHE, Html(html)).into_response(),
        ClickOutcome::Redirect(url) => {
            (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
        }
    }
}

/// POST /report, the landing page form submission
pub async fn submit(
    State(state): State<Arc<AppState>>,
    query: QueryPairs,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    form: Option<Form<Vec<(String, String)>>>,
) -> Json<serde_json::Value> {
    let fields = form.map(|Form(fields)| fields).unwrap_or_default();
    let rid = rid_param(query).or_else(|| {
        fields
            .iter()
            .find(|(name, _)| name == RID_FIELD)
            .map(|(_, value)| value.clone())
    });

    let outcome = state
        .tracking
        .submit(rid.as_deref(), &fields, &client_info(&headers, connect))
        .await;

    match outcome {
        SubmitOutcome::Redirect(url) => Json(json!({ "redirect": url })),
        SubmitOutcome::Success => Json(json!({ "success": true })),
    }
}

/// GET /report-phishing
pub async fn report_phishing(
    State(state): State<Arc<AppState>>,
    query: QueryPairs,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    state
        .tracking
        .report(rid_param(query).as_deref(), &client_info(&headers, connect))
        .await;

    (NO_CACHE, Html(confirmation_page(&state.report_title))).into_response()
}

/// Client address and agent, preferring proxy headers over the socket peer
fn client_info(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .map(str::to_string);

    ClientInfo {
        ip: forwarded.or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string())),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

fn confirmation_page(title: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ font-family: sans-serif; background: #f4f6f8; display: flex; justify-content: center; padding-top: 10vh; }}
.card {{ background: #fff; border-radius: 8px; padding: 2rem 3rem; box-shadow: 0 2px 8px rgba(0,0,0,.1); text-align: center; }}
</style>
</head>
<body>
<div class="card">
<h1>{title}</h1>
<p>Your report has been recorded successfully.</p>
<p>Thank you for staying vigilant and reporting suspicious emails.</p>
</div>
</body>
</html>"#,
        title = escape_html(title)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_info_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Outlook"));
        let peer = ConnectInfo("192.0.2.1:4000".parse::<SocketAddr>().unwrap());

        let info = client_info(&headers, Some(peer));

        assert_eq!(info.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.user_agent.as_deref(), Some("Outlook"));
    }

    #[test]
    fn test_client_info_falls_back_to_peer() {
        let peer = ConnectInfo("192.0.2.1:4000".parse::<SocketAddr>().unwrap());
        let info = client_info(&HeaderMap::new(), Some(peer));
        assert_eq!(info.ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(info.user_agent, None);
    }

    #[test]
    fn test_confirmation_page_escapes_title() {
        let page = confirmation_page("<b>Thanks</b>");
        assert!(page.contains("&lt;b&gt;Thanks&lt;/b&gt;"));
        assert!(page.contains("Your report has been recorded successfully."));
    }
}
