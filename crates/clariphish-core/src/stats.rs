//! Campaign funnel statistics and per-recipient results
//!
//! Everything here is derived from the event store on demand. Counts are
//! distinct recipients per event kind, so repeated clicks or submissions never
//! inflate the funnel.

use chrono::{DateTime, Utc};
use clariphish_common::types::{CampaignId, EventKind, RecipientId, RecipientStatus};
use clariphish_common::Result;
use clariphish_storage::models::{Event, Recipient};
use clariphish_storage::repository::Repositories;
use serde::Serialize;
use std::collections::HashMap;

/// Funnel counts and rates for one campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    /// Enrolled recipients
    pub total: i64,
    /// Distinct recipients with an `email_sent` event. Failed sends are not
    /// included; they are counted in `error`.
    pub sent: i64,
    pub opened: i64,
    pub clicked: i64,
    pub submitted: i64,
    pub reported: i64,
    /// Distinct recipients with an `email_error` event
    pub error: i64,
    /// Percentages of `sent`
    pub open_rate: f64,
    pub click_rate: f64,
    pub submit_rate: f64,
    pub report_rate: f64,
}

impl CampaignStats {
    /// Derive rates from distinct-recipient counts. All rates are 0 when nothing was sent.
    pub fn from_counts(
        total: i64,
        sent: i64,
        opened: i64,
        clicked: i64,
        submitted: i64,
        reported: i64,
        error: i64,
    ) -> Self {
        Self {
            total,
            sent,
            opened,
            clicked,
            submitted,
            reported,
            error,
            open_rate: rate(opened, sent),
            click_rate: rate(clicked, sent),
            submit_rate: rate(submitted, sent),
            report_rate: rate(reported, sent),
        }
    }
}

fn rate(count: i64, sent: i64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        count as f64 * 100.0 / sent as f64
    }
}

/// One row of the campaign result table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientResult {
    pub recipient_id: RecipientId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    pub status: RecipientStatus,
    pub reported: bool,
    pub send_date: Option<DateTime<Utc>>,
    pub open_date: Option<DateTime<Utc>>,
    pub click_date: Option<DateTime<Utc>>,
    pub submit_date: Option<DateTime<Utc>>,
    pub report_date: Option<DateTime<Utc>>,
}

/// A captured form submission for the credential export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmittedData {
    pub recipient_id: RecipientId,
    pub email: String,
    pub time: DateTime<Utc>,
    pub fields: serde_json::Value,
}

/// Read-side view over the event store
#[derive(Clone)]
pub struct Aggregator {
    repos: Repositories,
}

impl Aggregator {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    pub async fn stats(&self, campaign_id: CampaignId) -> Result<CampaignStats> {
        let events = &self.repos.events;
        let total = self.repos.tokens.count_by_campaign(campaign_id).await?;
        let sent = events
            .count_distinct_recipients(campaign_id, EventKind::EmailSent)
            .await?;
        let opened = events
            .count_distinct_recipients(campaign_id, EventKind::EmailOpened)
            .await?;
        let clicked = events
            .count_distinct_recipients(campaign_id, EventKind::LinkClicked)
            .await?;
        let submitted = events
            .count_distinct_recipients(campaign_id, EventKind::DataSubmitted)
            .await?;
        let reported = events
            .count_distinct_recipients(campaign_id, EventKind::ReportedPhishing)
            .await?;
        let error = events
            .count_distinct_recipients(campaign_id, EventKind::EmailError)
            .await?;

        Ok(CampaignStats::from_counts(
            total, sent, opened, clicked, submitted, reported, error,
        ))
    }

    /// One row per recipient with the first time each funnel stage was reached
    pub async fn results(&self, campaign_id: CampaignId) -> Result<Vec<RecipientResult>> {
        let recipients = self.repos.tokens.list_by_campaign(campaign_id).await?;
        let firsts = self.repos.events.first_occurrences(campaign_id).await?;

        let mut by_recipient: HashMap<(RecipientId, EventKind), DateTime<Utc>> =
            HashMap::with_capacity(firsts.len());
        for first in firsts {
            by_recipient.insert((first.recipient_id, first.kind), first.first_time);
        }

        Ok(recipients
            .into_iter()
            .map(|r| result_row(r, &by_recipient))
            .collect())
    }

    /// Form submissions captured during the campaign, oldest first
    pub async fn credentials(&self, campaign_id: CampaignId) -> Result<Vec<SubmittedData>> {
        let events = self
            .repos
            .events
            .list_by_kind(campaign_id, EventKind::DataSubmitted)
            .await?;

        Ok(events
            .into_iter()
            .map(|e| SubmittedData {
                recipient_id: e.recipient_id,
                email: e.email,
                time: e.time,
                fields: e.details.unwrap_or_else(|| serde_json::json!({})),
            })
            .collect())
    }

    /// Events stamped before `cutoff`, candidates for timestamp repair
    pub async fn timestamp_audit(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        self.repos.events.list_before(campaign_id, cutoff).await
    }
}

fn result_row(
    recipient: Recipient,
    firsts: &HashMap<(RecipientId, EventKind), DateTime<Utc>>,
) -> RecipientResult {
    let first = |kind: EventKind| firsts.get(&(recipient.id, kind)).copied();

    RecipientResult {
        recipient_id: recipient.id,
        status: recipient.status,
        reported: recipient.reported,
        send_date: first(EventKind::EmailSent).or(recipient.send_date),
        open_date: first(EventKind::EmailOpened),
        click_date: first(EventKind::LinkClicked),
        submit_date: first(EventKind::DataSubmitted),
        report_date: first(EventKind::ReportedPhishing).or(recipient.reported_at),
        email: recipient.email,
        first_name: recipient.first_name,
        last_name: recipient.last_name,
        position: recipient.position,
    }
}
