//! Dispatch Engine - sends a launched campaign to its scheduled recipients

use super::mailer::{Mailer, OutgoingEmail};
use super::template::{Personalization, TemplateRenderer};
use crate::metrics::Metrics;
use chrono::Utc;
use clariphish_common::config::DispatchConfig;
use clariphish_common::types::{CampaignId, EventKind, RecipientStatus, Transition};
use clariphish_common::{Error, Result};
use clariphish_storage::models::{DispatchPlan, NewEvent, Recipient};
use clariphish_storage::repository::Repositories;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one dispatch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Recipients a send was attempted for
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Recipients that left `scheduled` after the run started
    pub skipped: usize,
    /// Send outcomes that could not be written back
    pub record_failures: usize,
    pub cancelled: bool,
}

/// Sequential campaign sender
pub struct DispatchEngine {
    repos: Repositories,
    mailer: Arc<dyn Mailer>,
    renderer: TemplateRenderer,
    metrics: Metrics,
    inter_send_delay: Duration,
    send_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(
        repos: Repositories,
        mailer: Arc<dyn Mailer>,
        metrics: Metrics,
        config: &DispatchConfig,
    ) -> Result<Self> {
        Ok(Self {
            repos,
            mailer,
            renderer: TemplateRenderer::new()?,
            metrics,
            inter_send_delay: Duration::from_millis(config.inter_send_delay_ms),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        })
    }

    /// Send to every recipient of `campaign_id` still in `scheduled`.
    ///
    /// A failed send is recorded against its recipient and does not stop the
    /// run. Each recipient's status is re-read before its send so one that has
    /// moved on is skipped. `cancel` is checked between recipients.
    pub async fn dispatch(
        &self,
        campaign_id: CampaignId,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let plan = self
            .repos
            .campaigns
            .dispatch_plan(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {} not found", campaign_id)))?;
        let recipients = self.repos.tokens.list_scheduled(campaign_id).await?;

        info!(
            campaign_id = %campaign_id,
            recipients = recipients.len(),
            relay = %plan.smtp.host,
            "Dispatch started"
        );

        let mut report = DispatchReport::default();
        for (i, recipient) in recipients.iter().enumerate() {
            if i > 0 && !self.inter_send_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.inter_send_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.repos.status.get(recipient.id).await? {
                Some(state) if state.status == RecipientStatus::Scheduled => {}
                _ => {
                    debug!(recipient_id = %recipient.id, "Recipient no longer scheduled, skipping");
                    report.skipped += 1;
                    continue;
                }
            }

            report.attempted += 1;
            let outcome = self.send_one(&plan, recipient).await;
            self.metrics.record_send(outcome.is_ok());

            let (event, status) = match outcome {
                Ok(()) => {
                    report.sent += 1;
                    (
                        NewEvent::for_recipient(recipient, EventKind::EmailSent, Utc::now()),
                        RecipientStatus::Sent,
                    )
                }
                Err(message) => {
                    report.failed += 1;
                    warn!(
                        campaign_id = %campaign_id,
                        recipient_id = %recipient.id,
                        error = %message,
                        "Send failed"
                    );
                    (
                        NewEvent::for_recipient(recipient, EventKind::EmailError, Utc::now())
                            .with_details(json!({ "error": message })),
                        RecipientStatus::Error,
                    )
                }
            };

            if let Err(e) = self
                .repos
                .events
                .record(event, Transition::Advance(status))
                .await
            {
                report.record_failures += 1;
                error!(
                    campaign_id = %campaign_id,
                    recipient_id = %recipient.id,
                    error = %e,
                    "Failed to record send outcome"
                );
            }
        }

        info!(
            campaign_id = %campaign_id,
            attempted = report.attempted,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Dispatch finished"
        );
        Ok(report)
    }

    async fn send_one(
        &self,
        plan: &DispatchPlan,
        recipient: &Recipient,
    ) -> std::result::Result<(), String> {
        let values = Personalization::new(recipient, &plan.campaign.url);
        let full_name = format!("{} {}", recipient.first_name, recipient.last_name);
        let email = OutgoingEmail {
            to_name: Some(full_name.trim().to_string()).filter(|n| !n.is_empty()),
            to_address: recipient.email.clone(),
            subject: self.renderer.render(&plan.template.subject, &values),
            text_body: self.renderer.render(&plan.template.text_body, &values),
            html_body: self.renderer.render_html(&plan.template.html_body, &values),
        };

        match tokio::time::timeout(self.send_timeout, self.mailer.send(&plan.smtp, &email)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "Relay did not answer within {}s",
                self.send_timeout.as_secs()
            )),
        }
    }
}
