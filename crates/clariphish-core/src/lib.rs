//! ClariPhish Core - tracking, dispatch and campaign statistics
//!
//! This crate turns public tracking triggers into stored events, sends
//! campaign email through the configured relay, and derives funnel
//! statistics from the event store.

pub mod dispatch;
pub mod html;
pub mod manager;
pub mod metrics;
pub mod outbox;
pub mod stats;
pub mod tracking;

pub use dispatch::{DispatchEngine, DispatchReport, Mailer, OutgoingEmail, SmtpMailer};
pub use manager::{CampaignManager, CampaignUpdate, NewCampaign};
pub use metrics::{Metrics, Trigger};
pub use outbox::{Outbox, OutboxWorker, PendingWrite, ReplayReport};
pub use stats::{Aggregator, CampaignStats, RecipientResult, SubmittedData};
pub use tracking::{ClickOutcome, ClientInfo, SubmitOutcome, TrackingService, TRACKING_PIXEL_GIF};
