//! Seed data for tests built on [`MemoryStore`]

use crate::memory::MemoryStore;
use crate::models::{
    Campaign, CreateCampaign, EmailTemplate, Event, LandingPage, Recipient, SmtpProfile, Target,
};
use crate::repository::{CampaignDirectory, TokenRegistry};
use chrono::{DateTime, Utc};
use clariphish_common::types::{EventKind, GroupId};
use uuid::Uuid;

pub const CAMPAIGN_URL: &str = "https://phish.example.com";
pub const PAGE_REDIRECT: &str = "https://intranet.example.com/awareness";

pub const PAGE_HTML: &str = r#"<html><head><title>Sign in</title></head><BODY>
<form action="https://login.example.com/session" method="post">
<input name="username"><input type="password" name="password">
</form>
</BODY></html>"#;

/// A campaign with `n` enrolled recipients
pub struct Fixture {
    pub store: MemoryStore,
    pub campaign: Campaign,
    pub template: EmailTemplate,
    pub page: LandingPage,
    pub smtp: SmtpProfile,
    pub group_id: GroupId,
    pub targets: Vec<Target>,
    pub recipients: Vec<Recipient>,
}

pub fn template() -> EmailTemplate {
    EmailTemplate {
        id: Uuid::new_v4(),
        name: "Password expiry".to_string(),
        subject: "Action required, {{.FirstName}}".to_string(),
        text_body: "Hi {{.FirstName}}, review your account at {{.URL}}".to_string(),
        html_body: r#"<html><body><p>Hi {{.FirstName}} {{.LastName}}</p><a href="{{.URL}}">Review</a></body></html>"#
            .to_string(),
        created_at: Utc::now(),
    }
}

pub fn page() -> LandingPage {
    LandingPage {
        id: Uuid::new_v4(),
        name: "Sign in".to_string(),
        html: PAGE_HTML.to_string(),
        capture_credentials: true,
        capture_passwords: true,
        redirect_url: Some(PAGE_REDIRECT.to_string()),
        created_at: Utc::now(),
    }
}

pub fn smtp_profile() -> SmtpProfile {
    SmtpProfile {
        id: Uuid::new_v4(),
        name: "Relay".to_string(),
        host: "localhost:2525".to_string(),
        username: None,
        password: None,
        from_address: "IT Service Desk <it@example.com>".to_string(),
        ignore_cert_errors: false,
        created_at: Utc::now(),
    }
}

pub fn target(group_id: GroupId, email: &str) -> Target {
    let local = email.split('@').next().unwrap_or(email);
    Target {
        id: Uuid::new_v4(),
        group_id,
        first_name: local.to_string(),
        last_name: "Tester".to_string(),
        email: email.to_string(),
        position: "Analyst".to_string(),
    }
}

/// An event row as it would be read back, for importing corrupt history
pub fn raw_event(recipient: &Recipient, kind: EventKind, time: DateTime<Utc>) -> Event {
    Event {
        id: Uuid::now_v7(),
        campaign_id: recipient.campaign_id,
        recipient_id: recipient.id,
        email: recipient.email.clone(),
        kind,
        time,
        details: None,
        client_ip: None,
        user_agent: None,
    }
}

/// Create a draft campaign with its own template, page and SMTP profile
pub async fn campaign(store: &MemoryStore, name: &str) -> Campaign {
    let (template, page, smtp) = (template(), page(), smtp_profile());
    let input = CreateCampaign {
        name: name.to_string(),
        url: CAMPAIGN_URL.to_string(),
        template_id: template.id,
        page_id: page.id,
        smtp_profile_id: smtp.id,
    };
    store.insert_template(template).await;
    store.insert_page(page).await;
    store.insert_smtp_profile(smtp).await;

    store
        .create_campaign(input)
        .await
        .expect("fixture campaign")
}

/// Seed a store with one campaign and `n` enrolled recipients
pub async fn seed(n: usize) -> Fixture {
    seed_into(MemoryStore::new(), n).await
}

pub async fn seed_into(store: MemoryStore, n: usize) -> Fixture {
    let (template, page, smtp) = (template(), page(), smtp_profile());
    store.insert_template(template.clone()).await;
    store.insert_page(page.clone()).await;
    store.insert_smtp_profile(smtp.clone()).await;

    let campaign = store
        .create_campaign(CreateCampaign {
            name: "Quarterly awareness".to_string(),
            url: CAMPAIGN_URL.to_string(),
            template_id: template.id,
            page_id: page.id,
            smtp_profile_id: smtp.id,
        })
        .await
        .expect("fixture campaign");

    let group_id = Uuid::new_v4();
    let mut targets = Vec::with_capacity(n);
    for i in 0..n {
        let t = target(group_id, &format!("user{}@example.com", i));
        store.insert_target(t.clone()).await;
        targets.push(t);
    }

    let ids: Vec<_> = targets.iter().map(|t| t.id).collect();
    let recipients = store
        .issue_batch(campaign.id, &ids)
        .await
        .expect("fixture enrolment");

    Fixture {
        store,
        campaign,
        template,
        page,
        smtp,
        group_id,
        targets,
        recipients,
    }
}
