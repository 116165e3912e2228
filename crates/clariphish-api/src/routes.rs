//! API routes

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{campaigns, health, metrics, tracking};

/// Create the application router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    // Public tracking surface
    let tracking_routes = Router::new()
        .route("/track", get(tracking::track))
        .route("/click", get(tracking::click))
        .route("/report", post(tracking::submit))
        .route("/report-phishing", get(tracking::report_phishing))
        .with_state(state.clone());

    // Campaign volume is not for the phishing audience
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state.clone());

    // Campaign routes
    let campaign_routes = Router::new()
        .route(
            "/",
            get(campaigns::list_campaigns).post(campaigns::create_campaign),
        )
        .route(
            "/:campaign_id",
            get(campaigns::get_campaign)
                .put(campaigns::update_campaign)
                .delete(campaigns::delete_campaign),
        )
        .route("/:campaign_id/launch", post(campaigns::launch_campaign))
        .route("/:campaign_id/complete", post(campaigns::complete_campaign))
        .route("/:campaign_id/stats", get(campaigns::get_campaign_stats))
        .route("/:campaign_id/results", get(campaigns::get_campaign_results))
        .route("/:campaign_id/events", get(campaigns::list_campaign_events))
        .route("/:campaign_id/credentials", get(campaigns::export_credentials))
        .route("/:campaign_id/timestamps", get(campaigns::audit_timestamps))
        .route(
            "/:campaign_id/timestamps/repair",
            post(campaigns::repair_timestamps),
        );

    // API v1 routes with authentication
    let mut api_v1 = Router::new()
        .nest("/campaigns", campaign_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state);

    if let Some(cors) = cors_layer(cors_origins) {
        api_v1 = api_v1.layer(cors);
    }

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .merge(tracking_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use clariphish_common::config::{ApiConfig, DispatchConfig, OutboxConfig, TrackingConfig};
    use clariphish_common::types::{EventKind, RecipientStatus, RecipientToken};
    use clariphish_core::{
        CampaignManager, DispatchEngine, Mailer, Metrics, Outbox, OutgoingEmail, TrackingService,
    };
    use clariphish_storage::fixtures::{self, Fixture};
    use clariphish_storage::models::SmtpProfile;
    use clariphish_storage::repository::{EventStore, StatusRegister};
    use clariphish_storage::Repositories;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const ADMIN_TOKEN: &str = "test-admin-token-0123456789abcdef0123";

    struct NullMailer;

    #[async_trait]
    impl Mailer for NullMailer {
        async fn send(
            &self,
            _profile: &SmtpProfile,
            _email: &OutgoingEmail,
        ) -> clariphish_common::Result<()> {
            Ok(())
        }
    }

    struct TestApp {
        fx: Fixture,
        router: Router,
        _spool: tempfile::TempDir,
    }

    async fn app(n: usize) -> TestApp {
        let fx = fixtures::seed(n).await;
        let spool = tempfile::tempdir().unwrap();
        let repos = Repositories::in_memory(fx.store.clone());
        let metrics = Metrics::new().unwrap();
        let (outbox, _worker) = Outbox::new(
            &OutboxConfig {
                spool_path: spool.path().join("outbox.jsonl"),
                ..OutboxConfig::default()
            },
            repos.events.clone(),
            metrics.clone(),
        );
        let tracking_config = TrackingConfig::default();
        let tracking = TrackingService::new(
            repos.clone(),
            outbox,
            metrics.clone(),
            tracking_config.fallback_redirect.clone(),
        );
        let engine = DispatchEngine::new(
            repos.clone(),
            Arc::new(NullMailer),
            metrics.clone(),
            &DispatchConfig {
                inter_send_delay_ms: 0,
                send_timeout_secs: 5,
            },
        )
        .unwrap();
        let manager = CampaignManager::new(repos.clone(), Arc::new(engine), None);
        let state = AppState::new(
            repos,
            tracking,
            Arc::new(manager),
            metrics,
            &ApiConfig {
                admin_token: ADMIN_TOKEN.to_string(),
                cors_origins: vec![],
            },
            &tracking_config,
        );

        TestApp {
            router: create_router(state, &[]),
            fx,
            _spool: spool,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn admin(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn count(app: &TestApp, kind: EventKind) -> usize {
        app.fx
            .store
            .list_by_kind(app.fx.campaign.id, kind)
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_track_returns_pixel_for_any_token() {
        let app = app(1).await;
        let valid = format!("/track?rid={}", app.fx.recipients[0].token);
        let unknown = format!("/track?rid={}", RecipientToken::generate());

        for uri in [valid.as_str(), unknown.as_str(), "/track?rid=nope", "/track"] {
            let response = send(&app.router, get(uri)).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["content-type"], "image/gif");
            assert!(response.headers()["cache-control"]
                .to_str()
                .unwrap()
                .contains("no-store"));
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(bytes.starts_with(b"GIF89a"));
        }

        assert_eq!(count(&app, EventKind::EmailOpened).await, 1);
    }

    #[tokio::test]
    async fn test_tracking_tolerates_odd_query_strings() {
        let app = app(1).await;
        let token = app.fx.recipients[0].token.clone();
        let odd = [
            format!("?rid={}&rid=x", token),
            "?rid=%FF".to_string(),
            "?foo=1".to_string(),
            "?rid&rid=".to_string(),
        ];

        for query in &odd {
            let pixel = send(&app.router, get(&format!("/track{}", query))).await;
            assert_eq!(pixel.status(), StatusCode::OK, "/track{}", query);
            let bytes = to_bytes(pixel.into_body(), usize::MAX).await.unwrap();
            assert!(bytes.starts_with(b"GIF89a"));

            let report = send(&app.router, get(&format!("/report-phishing{}", query))).await;
            assert_eq!(report.status(), StatusCode::OK, "/report-phishing{}", query);
            assert!(body_text(report).await.contains("Thank You!"));
        }

        let landing = send(&app.router, get(&format!("/click?rid={}&rid=x", token))).await;
        assert_eq!(landing.status(), StatusCode::OK);
        assert!(body_text(landing).await.contains(token.as_str()));
        for query in ["?rid=%FF", "?foo=1"] {
            let redirect = send(&app.router, get(&format!("/click{}", query))).await;
            assert_eq!(redirect.status(), StatusCode::FOUND, "/click{}", query);
        }

        // The first rid wins
        assert_eq!(count(&app, EventKind::EmailOpened).await, 1);
        assert_eq!(count(&app, EventKind::ReportedPhishing).await, 1);
        assert_eq!(count(&app, EventKind::LinkClicked).await, 1);
    }

    #[tokio::test]
    async fn test_repeated_track_is_idempotent() {
        let app = app(1).await;
        let uri = format!("/track?rid={}", app.fx.recipients[0].token);

        for _ in 0..4 {
            let response = send(&app.router, get(&uri)).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(count(&app, EventKind::EmailOpened).await, 1);
    }

    #[tokio::test]
    async fn test_click_serves_landing_page() {
        let app = app(1).await;
        let token = app.fx.recipients[0].token.clone();
        let request = Request::builder()
            .uri(format!("/click?rid={}", token))
            .header("user-agent", "Mozilla/5.0")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap();

        let response = send(&app.router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains(token.as_str()));
        assert!(html.contains("name=\"password\""));

        let clicks = app
            .fx
            .store
            .list_by_kind(app.fx.campaign.id, EventKind::LinkClicked)
            .await
            .unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].client_ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(clicks[0].user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_click_with_bad_token_redirects() {
        let app = app(1).await;

        let response = send(&app.router, get("/click?rid=0000")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/");
        assert_eq!(app.fx.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_with_form_rid() {
        let app = app(1).await;
        let token = app.fx.recipients[0].token.clone();
        let request = Request::builder()
            .method("POST")
            .uri("/report")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!("username=alice&password=hunter2&rid={}", token)))
            .unwrap();

        let response = send(&app.router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "redirect": fixtures::PAGE_REDIRECT })
        );
        let state = app
            .fx
            .store
            .get(app.fx.recipients[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, RecipientStatus::Submitted);
    }

    #[tokio::test]
    async fn test_submit_with_unknown_token_acknowledges() {
        let app = app(1).await;
        let request = Request::builder()
            .method("POST")
            .uri(format!("/report?rid={}", RecipientToken::generate()))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("username=alice"))
            .unwrap();

        let response = send(&app.router, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));
        assert_eq!(app.fx.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_report_phishing_confirms() {
        let app = app(1).await;
        let uri = format!("/report-phishing?rid={}", app.fx.recipients[0].token);

        for _ in 0..2 {
            let response = send(&app.router, get(&uri)).await;
            assert_eq!(response.status(), StatusCode::OK);
            let html = body_text(response).await;
            assert!(html.contains("Thank You!"));
        }

        assert_eq!(count(&app, EventKind::ReportedPhishing).await, 1);
        let bad = send(&app.router, get("/report-phishing")).await;
        assert_eq!(bad.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = app(1).await;

        let missing = send(&app.router, get("/api/v1/campaigns")).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/api/v1/campaigns")
            .header("authorization", "Bearer not-the-token")
            .body(Body::empty())
            .unwrap();
        let wrong = send(&app.router, wrong).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(wrong).await["error"], "UNAUTHORIZED");

        let ok = send(&app.router, admin("GET", "/api/v1/campaigns")).await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_campaign_detail_and_stats() {
        let app = app(2).await;
        let id = app.fx.campaign.id;

        let launched = send(&app.router, admin("POST", &format!("/api/v1/campaigns/{}/launch", id))).await;
        assert_eq!(launched.status(), StatusCode::ACCEPTED);

        // Dispatch runs in the background
        for _ in 0..100 {
            if count(&app, EventKind::EmailSent).await == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        send(
            &app.router,
            get(&format!("/track?rid={}", app.fx.recipients[0].token)),
        )
        .await;

        let stats = send(&app.router, admin("GET", &format!("/api/v1/campaigns/{}/stats", id))).await;
        assert_eq!(stats.status(), StatusCode::OK);
        let stats = body_json(stats).await;
        assert_eq!(stats["sent"], 2);
        assert_eq!(stats["opened"], 1);
        assert_eq!(stats["open_rate"], 50.0);

        let detail = send(&app.router, admin("GET", &format!("/api/v1/campaigns/{}", id))).await;
        let detail = body_json(detail).await;
        assert_eq!(detail["status"], "in_progress");
        assert_eq!(detail["results"].as_array().unwrap().len(), 2);

        let events = send(
            &app.router,
            admin("GET", &format!("/api/v1/campaigns/{}/events?order=desc", id)),
        )
        .await;
        let events = body_json(events).await;
        assert_eq!(events[0]["kind"], "email_opened");
    }

    #[tokio::test]
    async fn test_update_campaign_while_draft() {
        let app = app(1).await;
        let uri = format!("/api/v1/campaigns/{}", app.fx.campaign.id);
        let edit = |name: &str| {
            Request::builder()
                .method("PUT")
                .uri(uri.as_str())
                .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "name": name,
                        "url": "https://updates.example.com",
                        "template_id": app.fx.template.id,
                        "page_id": app.fx.page.id,
                        "smtp_profile_id": app.fx.smtp.id,
                    })
                    .to_string(),
                ))
                .unwrap()
        };

        let updated = send(&app.router, edit("Renamed")).await;
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = body_json(updated).await;
        assert_eq!(updated["name"], "Renamed");
        assert_eq!(updated["url"], "https://updates.example.com");

        let completed = send(&app.router, admin("POST", &format!("{}/complete", uri))).await;
        assert_eq!(completed.status(), StatusCode::OK);

        let late = send(&app.router, edit("Too late")).await;
        assert_eq!(late.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(late).await["error"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_404() {
        let app = app(1).await;
        let uri = format!("/api/v1/campaigns/{}/stats", uuid::Uuid::new_v4());

        let response = send(&app.router, admin("GET", &uri)).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_campaign_validation() {
        let app = app(1).await;
        let body = json!({
            "name": "No URL",
            "template_id": app.fx.template.id,
            "page_id": app.fx.page.id,
            "smtp_profile_id": app.fx.smtp.id,
            "group_ids": [app.fx.group_id],
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/campaigns")
            .header("authorization", format!("Bearer {}", ADMIN_TOKEN))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = send(&app.router, request).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let app = app(1).await;

        let ready = send(&app.router, get("/health/ready")).await;
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(body_json(ready).await["backend"], "memory");

        send(&app.router, get("/track?rid=bogus")).await;
        let anonymous = send(&app.router, get("/metrics")).await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let metrics = send(&app.router, admin("GET", "/metrics")).await;
        assert_eq!(metrics.status(), StatusCode::OK);
        let text = body_text(metrics).await;
        assert!(text.contains("clariphish_tracking_unresolved_total{trigger=\"open\"} 1"));
    }
}
