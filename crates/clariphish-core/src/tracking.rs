//! Tracking service behind the public open/click/submit/report triggers
//!
//! Every trigger degrades gracefully: a missing, malformed or unknown token
//! produces the same artifact as a valid one, and storage faults never reach
//! the caller.

use crate::html::insert_before_body_close;
use crate::metrics::{Metrics, Trigger};
use crate::outbox::{Outbox, PendingWrite};
use chrono::Utc;
use clariphish_common::types::{EventKind, RecipientToken};
use clariphish_storage::models::{NewEvent, Recipient};
use clariphish_storage::repository::Repositories;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Transparent 1x1 GIF served by the open trigger
pub const TRACKING_PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Form field carrying the recipient token
pub const RID_FIELD: &str = "rid";

/// Request metadata stored alongside tracking events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// What the click trigger serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Landing page with the token wired into its forms
    Landing(String),
    /// Generic redirect for unknown tokens or campaigns without a page
    Redirect(String),
}

/// What the submit trigger answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Redirect(String),
    Success,
}

/// Translates tracking triggers into event store writes
#[derive(Clone)]
pub struct TrackingService {
    repos: Repositories,
    outbox: Outbox,
    metrics: Metrics,
    fallback_redirect: String,
}

impl TrackingService {
    pub fn new(
        repos: Repositories,
        outbox: Outbox,
        metrics: Metrics,
        fallback_redirect: impl Into<String>,
    ) -> Self {
        Self {
            repos,
            outbox,
            metrics,
            fallback_redirect: fallback_redirect.into(),
        }
    }

    /// Open pixel fetched
    pub async fn open(&self, rid: Option<&str>, client: &ClientInfo) {
        if let Some(recipient) = self.resolve(rid, Trigger::Open).await {
            self.write(&recipient, EventKind::EmailOpened, None, client)
                .await;
        }
    }

    /// Tracked link followed
    pub async fn click(&self, rid: Option<&str>, client: &ClientInfo) -> ClickOutcome {
        let Some(recipient) = self.resolve(rid, Trigger::Click).await else {
            return ClickOutcome::Redirect(self.fallback_redirect.clone());
        };

        self.write(&recipient, EventKind::LinkClicked, None, client)
            .await;

        match self.repos.content.landing_page(recipient.campaign_id).await {
            Ok(Some(page)) => ClickOutcome::Landing(inject_rid(&page.html, &recipient.token)),
            Ok(None) => {
                warn!(campaign_id = %recipient.campaign_id, "Campaign has no landing page");
                ClickOutcome::Redirect(self.fallback_redirect.clone())
            }
            Err(e) => {
                warn!(error = %e, campaign_id = %recipient.campaign_id, "Landing page lookup failed");
                ClickOutcome::Redirect(self.fallback_redirect.clone())
            }
        }
    }

    /// Landing page form submitted. `fields` are the raw form pairs.
    pub async fn submit(
        &self,
        rid: Option<&str>,
        fields: &[(String, String)],
        client: &ClientInfo,
    ) -> SubmitOutcome {
        let Some(recipient) = self.resolve(rid, Trigger::Submit).await else {
            return SubmitOutcome::Success;
        };

        let page = match self.repos.content.landing_page(recipient.campaign_id).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, campaign_id = %recipient.campaign_id, "Landing page lookup failed");
                None
            }
        };

        let (capture_credentials, capture_passwords) = page
            .as_ref()
            .map(|p| (p.capture_credentials, p.capture_passwords))
            .unwrap_or((false, false));
        let details = captured_fields(fields, capture_credentials, capture_passwords);

        self.write(&recipient, EventKind::DataSubmitted, Some(details), client)
            .await;

        match page.and_then(|p| p.redirect_url).filter(|u| !u.is_empty()) {
            Some(url) => SubmitOutcome::Redirect(url),
            None => SubmitOutcome::Success,
        }
    }

    /// Recipient reported the email as phishing
    pub async fn report(&self, rid: Option<&str>, client: &ClientInfo) {
        if let Some(recipient) = self.resolve(rid, Trigger::Report).await {
            self.write(&recipient, EventKind::ReportedPhishing, None, client)
                .await;
        }
    }

    /// Resolve an untrusted token. Malformed and unknown tokens look the same.
    async fn resolve(&self, rid: Option<&str>, trigger: Trigger) -> Option<Recipient> {
        let Some(token) = rid.and_then(RecipientToken::parse) else {
            self.metrics.record_unresolved(trigger);
            debug!(trigger = trigger.as_str(), "Tracking request without a usable token");
            return None;
        };

        match self.repos.tokens.resolve(&token).await {
            Ok(Some(recipient)) => Some(recipient),
            Ok(None) => {
                self.metrics.record_unresolved(trigger);
                debug!(
                    trigger = trigger.as_str(),
                    rid = token.log_prefix(),
                    "Unknown tracking token"
                );
                None
            }
            Err(e) => {
                warn!(
                    error = %e,
                    trigger = trigger.as_str(),
                    rid = token.log_prefix(),
                    "Token lookup failed"
                );
                None
            }
        }
    }

    async fn write(
        &self,
        recipient: &Recipient,
        kind: EventKind,
        details: Option<Value>,
        client: &ClientInfo,
    ) {
        let mut event = NewEvent::for_recipient(recipient, kind, Utc::now())
            .with_client(client.ip.clone(), client.user_agent.clone());
        event.details = details;
        let transition = kind.transition();

        match self.repos.events.record(event.clone(), transition).await {
            Ok(outcome) if outcome.append.is_duplicate() => {
                self.metrics.record_duplicate(kind);
                debug!(recipient_id = %recipient.id, %kind, "Duplicate tracking event ignored");
            }
            Ok(outcome) => {
                self.metrics.record_event(kind);
                info!(
                    campaign_id = %recipient.campaign_id,
                    recipient_id = %recipient.id,
                    %kind,
                    status_changed = outcome.transitioned,
                    "Tracking event recorded"
                );
            }
            Err(e) if e.is_transient() => {
                warn!(
                    error = %e,
                    recipient_id = %recipient.id,
                    %kind,
                    "Event store unavailable, handing write to outbox"
                );
                self.outbox.enqueue(PendingWrite { event, transition }).await;
            }
            Err(e) => {
                warn!(error = %e, recipient_id = %recipient.id, %kind, "Tracking event rejected");
            }
        }
    }
}

/// Wire the token into every form of a landing page and route submissions
/// to the submit trigger, following a JSON `redirect` when one comes back.
pub fn inject_rid(html: &str, token: &RecipientToken) -> String {
    let script = format!(
        r#"<script>
document.addEventListener('DOMContentLoaded', function () {{
  var forms = document.getElementsByTagName('form');
  for (var i = 0; i < forms.length; i++) {{
    var input = document.createElement('input');
    input.type = 'hidden';
    input.name = '{field}';
    input.value = '{rid}';
    forms[i].appendChild(input);
    forms[i].addEventListener('submit', function (e) {{
      e.preventDefault();
      fetch('/report', {{
        method: 'POST',
        headers: {{ 'Content-Type': 'application/x-www-form-urlencoded' }},
        body: new URLSearchParams(new FormData(this))
      }}).then(function (r) {{ return r.json(); }}).then(function (data) {{
        if (data.redirect) {{ window.location.href = data.redirect; }}
      }});
    }});
  }}
}});
</script>"#,
        field = RID_FIELD,
        rid = token.as_str()
    );

    insert_before_body_close(html, &script)
}

/// Form fields worth storing, according to the landing page capture flags
pub fn captured_fields(
    fields: &[(String, String)],
    capture_credentials: bool,
    capture_passwords: bool,
) -> Value {
    let mut captured = Map::new();
    if !capture_credentials {
        return Value::Object(captured);
    }

    for (name, value) in fields {
        if name == RID_FIELD || captured.contains_key(name) {
            continue;
        }
        if !capture_passwords && looks_like_password(name) {
            continue;
        }
        captured.insert(name.clone(), Value::String(value.clone()));
    }
    Value::Object(captured)
}

fn looks_like_password(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["pass", "pwd", "secret", "pin"]
        .iter()
        .any(|needle| name.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clariphish_common::config::OutboxConfig;
    use clariphish_common::types::{RecipientStatus, SortOrder};
    use clariphish_storage::fixtures::{self, Fixture};
    use clariphish_storage::repository::{EventStore, StatusRegister};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        fx: Fixture,
        service: TrackingService,
        metrics: Metrics,
        _dir: tempfile::TempDir,
    }

    async fn harness(n: usize) -> Harness {
        let fx = fixtures::seed(n).await;
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new().unwrap();
        let repos = Repositories::in_memory(fx.store.clone());
        let (outbox, _worker) = Outbox::new(
            &OutboxConfig {
                spool_path: dir.path().join("outbox.jsonl"),
                ..OutboxConfig::default()
            },
            Arc::new(fx.store.clone()),
            metrics.clone(),
        );
        let service = TrackingService::new(repos, outbox, metrics.clone(), "/");
        Harness {
            fx,
            service,
            metrics,
            _dir: dir,
        }
    }

    async fn events_of(h: &Harness, kind: EventKind) -> usize {
        h.fx.store
            .list_by_kind(h.fx.campaign.id, kind)
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_repeated_open_stores_one_event() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();

        for _ in 0..5 {
            h.service.open(Some(&rid), &ClientInfo::default()).await;
        }

        assert_eq!(events_of(&h, EventKind::EmailOpened).await, 1);
        let state = h.fx.store.get(h.fx.recipients[0].id).await.unwrap().unwrap();
        assert_eq!(state.status, RecipientStatus::Opened);
    }

    #[tokio::test]
    async fn test_repeated_report_stores_one_event() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();

        for _ in 0..3 {
            h.service.report(Some(&rid), &ClientInfo::default()).await;
        }

        assert_eq!(events_of(&h, EventKind::ReportedPhishing).await, 1);
        let state = h.fx.store.get(h.fx.recipients[0].id).await.unwrap().unwrap();
        assert!(state.reported);
        assert_eq!(state.status, RecipientStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_clicks_are_not_deduplicated() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();

        for _ in 0..3 {
            let outcome = h.service.click(Some(&rid), &ClientInfo::default()).await;
            assert!(matches!(outcome, ClickOutcome::Landing(_)));
        }

        assert_eq!(events_of(&h, EventKind::LinkClicked).await, 3);
    }

    #[tokio::test]
    async fn test_click_serves_page_with_rid() {
        let h = harness(1).await;
        let token = h.fx.recipients[0].token.clone();

        let ClickOutcome::Landing(html) = h
            .service
            .click(Some(token.as_str()), &ClientInfo::default())
            .await
        else {
            panic!("expected landing page");
        };

        assert!(html.contains(token.as_str()));
        assert!(html.contains("fetch('/report'"));
        let script_at = html.find("<script>").unwrap();
        let body_close = html.rfind("</BODY>").unwrap();
        assert!(script_at < body_close);
    }

    #[tokio::test]
    async fn test_invalid_tokens_write_nothing() {
        let h = harness(1).await;
        let client = ClientInfo::default();
        let unknown = RecipientToken::generate().to_string();

        for rid in [None, Some("garbage"), Some(unknown.as_str())] {
            h.service.open(rid, &client).await;
            assert_eq!(
                h.service.click(rid, &client).await,
                ClickOutcome::Redirect("/".to_string())
            );
            assert_eq!(
                h.service
                    .submit(rid, &[("username".into(), "x".into())], &client)
                    .await,
                SubmitOutcome::Success
            );
            h.service.report(rid, &client).await;
        }

        assert_eq!(h.fx.store.event_count().await, 0);
        assert_eq!(h.metrics.unresolved_count(Trigger::Open), 3);
    }

    #[tokio::test]
    async fn test_submit_captures_fields_and_redirects() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();
        let client = ClientInfo {
            ip: Some("203.0.113.7".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        };
        let fields = vec![
            ("rid".to_string(), rid.clone()),
            ("username".to_string(), "alice".to_string()),
            ("password".to_string(), "hunter2".to_string()),
        ];

        let outcome = h.service.submit(Some(&rid), &fields, &client).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Redirect(fixtures::PAGE_REDIRECT.to_string())
        );

        let events = h
            .fx
            .store
            .list_by_kind(h.fx.campaign.id, EventKind::DataSubmitted)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].details,
            Some(json!({"username": "alice", "password": "hunter2"}))
        );
        assert_eq!(events[0].client_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(events[0].user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_late_open_does_not_regress_submitted() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();
        let client = ClientInfo::default();

        h.service.click(Some(&rid), &client).await;
        h.service.submit(Some(&rid), &[], &client).await;
        h.service.open(Some(&rid), &client).await;

        let state = h.fx.store.get(h.fx.recipients[0].id).await.unwrap().unwrap();
        assert_eq!(state.status, RecipientStatus::Submitted);
        let all = h
            .fx
            .store
            .list_by_campaign(h.fx.campaign.id, SortOrder::Asc)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_storage_fault_still_serves_artifact() {
        let h = harness(1).await;
        let rid = h.fx.recipients[0].token.to_string();
        h.fx.store.fail_event_writes(true);

        let outcome = h.service.click(Some(&rid), &ClientInfo::default()).await;
        assert!(matches!(outcome, ClickOutcome::Landing(_)));
        assert_eq!(h.fx.store.event_count().await, 0);
    }

    #[test]
    fn test_capture_flags() {
        let fields = vec![
            ("email".to_string(), "a@example.com".to_string()),
            ("Password".to_string(), "secret".to_string()),
            ("user_pwd".to_string(), "secret".to_string()),
        ];

        assert_eq!(captured_fields(&fields, false, true), json!({}));
        assert_eq!(
            captured_fields(&fields, true, false),
            json!({"email": "a@example.com"})
        );
        assert_eq!(
            captured_fields(&fields, true, true),
            json!({"email": "a@example.com", "Password": "secret", "user_pwd": "secret"})
        );
    }

    #[test]
    fn test_pixel_is_gif() {
        assert!(TRACKING_PIXEL_GIF.starts_with(b"GIF89a"));
        assert_eq!(TRACKING_PIXEL_GIF.len(), 43);
    }
}
