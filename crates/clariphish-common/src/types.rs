//! Common types for ClariPhish

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for targets (people in a group)
pub type TargetId = Uuid;

/// Unique identifier for groups of targets
pub type GroupId = Uuid;

/// Unique identifier for a target enrolled into a campaign
pub type RecipientId = Uuid;

/// Unique identifier for events
pub type EventId = Uuid;

/// Unique identifier for email templates
pub type TemplateId = Uuid;

/// Unique identifier for landing pages
pub type PageId = Uuid;

/// Unique identifier for SMTP sending profiles
pub type SmtpProfileId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Number of random bytes behind a recipient token (128 bits)
pub const TOKEN_BYTES: usize = 16;

/// Events stamped before this instant are treated as corrupt
pub fn min_plausible_timestamp() -> Timestamp {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Opaque per-recipient tracking token ("rid")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientToken(String);

impl RecipientToken {
    /// Generate a fresh token from the operating system CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse an untrusted token.
    ///
    /// Anything that is not exactly 32 lowercase hex characters yields `None`,
    /// which callers treat the same as an unknown token.
    pub fn parse(s: &str) -> Option<Self> {
        let well_formed = s.len() == TOKEN_BYTES * 2
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        well_formed.then(|| Self(s.to_string()))
    }

    /// Token as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe to put in log lines
    pub fn log_prefix(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for RecipientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a recorded interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EmailSent,
    EmailError,
    EmailOpened,
    LinkClicked,
    DataSubmitted,
    ReportedPhishing,
}

impl EventKind {
    /// All kinds, in funnel order
    pub const ALL: [EventKind; 6] = [
        EventKind::EmailSent,
        EventKind::EmailError,
        EventKind::EmailOpened,
        EventKind::LinkClicked,
        EventKind::DataSubmitted,
        EventKind::ReportedPhishing,
    ];

    /// At most one stored event of this kind per recipient
    pub fn is_idempotent_once(&self) -> bool {
        matches!(self, EventKind::EmailOpened | EventKind::ReportedPhishing)
    }

    /// Human readable label used in exports and audit views
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::EmailSent => "Email Sent",
            EventKind::EmailError => "Error Sending Email",
            EventKind::EmailOpened => "Email Opened",
            EventKind::LinkClicked => "Clicked Link",
            EventKind::DataSubmitted => "Submitted Data",
            EventKind::ReportedPhishing => "Reported Phishing",
        }
    }

    /// Status register change implied by this event
    pub fn transition(&self) -> Transition {
        match self {
            EventKind::EmailSent => Transition::Advance(RecipientStatus::Sent),
            EventKind::EmailError => Transition::Advance(RecipientStatus::Error),
            EventKind::EmailOpened => Transition::Advance(RecipientStatus::Opened),
            EventKind::LinkClicked => Transition::Advance(RecipientStatus::Clicked),
            EventKind::DataSubmitted => Transition::Advance(RecipientStatus::Submitted),
            EventKind::ReportedPhishing => Transition::Reported,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::EmailSent => write!(f, "email_sent"),
            EventKind::EmailError => write!(f, "email_error"),
            EventKind::EmailOpened => write!(f, "email_opened"),
            EventKind::LinkClicked => write!(f, "link_clicked"),
            EventKind::DataSubmitted => write!(f, "data_submitted"),
            EventKind::ReportedPhishing => write!(f, "reported_phishing"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_sent" => Ok(EventKind::EmailSent),
            "email_error" => Ok(EventKind::EmailError),
            "email_opened" => Ok(EventKind::EmailOpened),
            "link_clicked" => Ok(EventKind::LinkClicked),
            "data_submitted" => Ok(EventKind::DataSubmitted),
            "reported_phishing" => Ok(EventKind::ReportedPhishing),
            _ => Err(crate::Error::Validation(format!("Invalid event kind: {}", s))),
        }
    }
}

/// Lifecycle stage of a recipient along the funnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Scheduled,
    Sent,
    Error,
    Opened,
    Clicked,
    Submitted,
}

impl RecipientStatus {
    /// Position in the partial order. `Sent` and `Error` share a rank, so
    /// neither overwrites the other.
    pub fn rank(&self) -> u8 {
        match self {
            RecipientStatus::Scheduled => 0,
            RecipientStatus::Sent | RecipientStatus::Error => 1,
            RecipientStatus::Opened => 2,
            RecipientStatus::Clicked => 3,
            RecipientStatus::Submitted => 4,
        }
    }

    /// Whether moving from `self` to `next` goes strictly forward
    pub fn can_advance_to(&self, next: RecipientStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Statuses from which `self` is a forward move
    pub fn predecessors(&self) -> Vec<RecipientStatus> {
        [
            RecipientStatus::Scheduled,
            RecipientStatus::Sent,
            RecipientStatus::Error,
            RecipientStatus::Opened,
            RecipientStatus::Clicked,
            RecipientStatus::Submitted,
        ]
        .into_iter()
        .filter(|s| s.can_advance_to(*self))
        .collect()
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientStatus::Scheduled => write!(f, "scheduled"),
            RecipientStatus::Sent => write!(f, "sent"),
            RecipientStatus::Error => write!(f, "error"),
            RecipientStatus::Opened => write!(f, "opened"),
            RecipientStatus::Clicked => write!(f, "clicked"),
            RecipientStatus::Submitted => write!(f, "submitted"),
        }
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RecipientStatus::Scheduled),
            "sent" => Ok(RecipientStatus::Sent),
            "error" => Ok(RecipientStatus::Error),
            "opened" => Ok(RecipientStatus::Opened),
            "clicked" => Ok(RecipientStatus::Clicked),
            "submitted" => Ok(RecipientStatus::Submitted),
            _ => Err(crate::Error::Validation(format!(
                "Invalid recipient status: {}",
                s
            ))),
        }
    }
}

/// Requested change to a recipient's status register entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Move along the funnel; ignored unless strictly forward
    Advance(RecipientStatus),
    /// Set the orthogonal reported flag; ignored when already set
    Reported,
}

/// Current status register entry for a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientState {
    pub status: RecipientStatus,
    pub reported: bool,
}

impl RecipientState {
    /// Fresh state of a newly enrolled recipient
    pub fn scheduled() -> Self {
        Self {
            status: RecipientStatus::Scheduled,
            reported: false,
        }
    }

    /// Apply a transition, returning whether anything changed
    pub fn apply(&mut self, transition: Transition) -> bool {
        match transition {
            Transition::Advance(next) if self.status.can_advance_to(next) => {
                self.status = next;
                true
            }
            Transition::Advance(_) => false,
            Transition::Reported if !self.reported => {
                self.reported = true;
                true
            }
            Transition::Reported => false,
        }
    }
}

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    InProgress,
    Completed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::InProgress => write!(f, "in_progress"),
            CampaignStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "in_progress" => Ok(CampaignStatus::InProgress),
            "completed" => Ok(CampaignStatus::Completed),
            _ => Err(crate::Error::Validation(format!(
                "Invalid campaign status: {}",
                s
            ))),
        }
    }
}

/// Sort direction for event listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

macro_rules! try_from_text {
    ($($ty:ty),+) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = crate::Error;

                fn try_from(value: String) -> Result<Self, crate::Error> {
                    value.parse()
                }
            }
        )+
    };
}

try_from_text!(EventKind, RecipientStatus, CampaignStatus);

impl TryFrom<String> for RecipientToken {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecipientToken::parse(&value)
            .ok_or_else(|| crate::Error::Validation("Malformed recipient token".to_string()))
    }
}
