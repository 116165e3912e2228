//! Database models

use chrono::{DateTime, Utc};
use clariphish_common::types::{
    CampaignId, CampaignStatus, EventId, EventKind, GroupId, PageId, RecipientId,
    RecipientState, RecipientStatus, RecipientToken, SmtpProfileId, TargetId, TemplateId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Campaign model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    /// Base URL the tracking links and open pixel point at
    pub url: String,
    pub template_id: TemplateId,
    pub page_id: PageId,
    pub smtp_profile_id: SmtpProfileId,
    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Email template model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub created_at: DateTime<Utc>,
}

/// Landing page model
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct LandingPage {
    pub id: PageId,
    pub name: String,
    pub html: String,
    pub capture_credentials: bool,
    pub capture_passwords: bool,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// SMTP sending profile
#[derive(Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SmtpProfile {
    pub id: SmtpProfileId,
    pub name: String,
    /// `host` or `host:port`
    pub host: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub from_address: String,
    pub ignore_cert_errors: bool,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for SmtpProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("username", &self.username)
            .field("from_address", &self.from_address)
            .field("ignore_cert_errors", &self.ignore_cert_errors)
            .finish()
    }
}

/// Target model (a person in a group)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub group_id: GroupId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub position: String,
}

/// A target enrolled into a campaign, joined with the target's identity.
///
/// This row is both the token registry entry and the status register entry.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub target_id: TargetId,
    #[sqlx(try_from = "String")]
    pub token: RecipientToken,
    #[sqlx(try_from = "String")]
    pub status: RecipientStatus,
    pub reported: bool,
    pub reported_at: Option<DateTime<Utc>>,
    pub send_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
}

impl Recipient {
    /// Current status register entry
    pub fn state(&self) -> RecipientState {
        RecipientState {
            status: self.status,
            reported: self.reported,
        }
    }
}

/// Stored interaction event
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub email: String,
    #[sqlx(try_from = "String")]
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    /// Captured form fields for `DataSubmitted`, failure detail for `EmailError`
    pub details: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Event to be appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub email: String,
    pub kind: EventKind,
    pub time: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl NewEvent {
    /// Event for a recipient at `time`, without details or client data
    pub fn for_recipient(recipient: &Recipient, kind: EventKind, time: DateTime<Utc>) -> Self {
        Self {
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

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_client(mut self, client_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.client_ip = client_ip;
        self.user_agent = user_agent;
        self
    }
}

/// Result of an append
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// A new row was written
    Inserted(Event),
    /// An idempotent-once event already existed and is returned unchanged
    Duplicate(Event),
}

impl AppendOutcome {
    pub fn event(&self) -> &Event {
        match self {
            AppendOutcome::Inserted(e) | AppendOutcome::Duplicate(e) => e,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Result of appending an event together with its status transition
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub append: AppendOutcome,
    /// Whether the status register moved
    pub transitioned: bool,
}

/// Earliest event time of one kind for one recipient
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct FirstOccurrence {
    pub recipient_id: RecipientId,
    #[sqlx(try_from = "String")]
    pub kind: EventKind,
    pub first_time: DateTime<Utc>,
}

/// Campaign fields set at creation and editable while the campaign is a draft
#[derive(Debug, Clone)]
pub struct CreateCampaign {
    pub name: String,
    pub url: String,
    pub template_id: TemplateId,
    pub page_id: PageId,
    pub smtp_profile_id: SmtpProfileId,
}

/// Everything the dispatch engine needs for one campaign
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub campaign: Campaign,
    pub template: EmailTemplate,
    pub smtp: SmtpProfile,
}
