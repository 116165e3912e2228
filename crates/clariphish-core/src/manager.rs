//! Campaign Manager - campaign lifecycle and background dispatch

use crate::dispatch::DispatchEngine;
use chrono::{DateTime, Utc};
use clariphish_common::types::{
    CampaignId, CampaignStatus, GroupId, PageId, SmtpProfileId, TemplateId,
};
use clariphish_common::{Error, Result};
use clariphish_storage::models::{Campaign, CreateCampaign, Event};
use clariphish_storage::repository::Repositories;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Input for a new campaign
#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    /// Phishing base URL; the server's public URL when omitted
    #[serde(default)]
    pub url: Option<String>,
    pub template_id: TemplateId,
    pub page_id: PageId,
    pub smtp_profile_id: SmtpProfileId,
    pub group_ids: Vec<GroupId>,
}

/// Replacement fields for a draft campaign; enrolment stays as created
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignUpdate {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    pub template_id: TemplateId,
    pub page_id: PageId,
    pub smtp_profile_id: SmtpProfileId,
}

struct RunningDispatch {
    launch: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<CampaignId, RunningDispatch>>>;

/// Campaign Manager - owns in-flight dispatches keyed by campaign
pub struct CampaignManager {
    repos: Repositories,
    engine: Arc<DispatchEngine>,
    public_url: Option<String>,
    running: Registry,
    /// Serialises status changes so launch cannot revive a completed campaign
    lifecycle: Mutex<()>,
    launches: AtomicU64,
}

impl CampaignManager {
    pub fn new(repos: Repositories, engine: Arc<DispatchEngine>, public_url: Option<String>) -> Self {
        Self {
            repos,
            engine,
            public_url,
            running: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Mutex::new(()),
            launches: AtomicU64::new(0),
        }
    }

    /// Create a draft campaign and enrol every target of the selected groups
    pub async fn create(&self, input: NewCampaign) -> Result<Campaign> {
        let fields = self.fields(
            &input.name,
            input.url.as_deref(),
            input.template_id,
            input.page_id,
            input.smtp_profile_id,
        )?;
        if input.group_ids.is_empty() {
            return Err(Error::Validation("At least one group is required".to_string()));
        }

        let targets = self.repos.campaigns.targets_in_groups(&input.group_ids).await?;
        if targets.is_empty() {
            return Err(Error::Validation(
                "Selected groups contain no targets".to_string(),
            ));
        }

        let campaign = self
            .repos
            .campaigns
            .create_campaign(fields)
            .await?;

        let target_ids: Vec<_> = targets.iter().map(|t| t.id).collect();
        if let Err(e) = self.repos.tokens.issue_batch(campaign.id, &target_ids).await {
            warn!(campaign_id = %campaign.id, error = %e, "Enrolment failed, removing campaign");
            if let Err(cleanup) = self.repos.campaigns.delete_campaign(campaign.id).await {
                error!(campaign_id = %campaign.id, error = %cleanup, "Failed to remove campaign");
            }
            return Err(e);
        }

        info!(
            campaign_id = %campaign.id,
            recipients = target_ids.len(),
            "Campaign created"
        );
        Ok(campaign)
    }

    pub async fn get(&self, id: CampaignId) -> Result<Campaign> {
        self.repos
            .campaigns
            .get_campaign(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {} not found", id)))
    }

    pub async fn list(&self) -> Result<Vec<Campaign>> {
        self.repos.campaigns.list_campaigns().await
    }

    /// Edit a campaign that has not been launched yet
    pub async fn update(&self, id: CampaignId, input: CampaignUpdate) -> Result<Campaign> {
        let fields = self.fields(
            &input.name,
            input.url.as_deref(),
            input.template_id,
            input.page_id,
            input.smtp_profile_id,
        )?;

        let _lifecycle = self.lifecycle.lock().await;
        match self.repos.campaigns.update_draft(id, fields).await? {
            Some(campaign) => {
                info!(campaign_id = %id, "Campaign updated");
                Ok(campaign)
            }
            None => {
                let campaign = self.get(id).await?;
                Err(Error::Conflict(format!(
                    "Campaign {} is {} and can no longer be edited",
                    id, campaign.status
                )))
            }
        }
    }

    /// Mark the campaign in progress and start dispatch in the background.
    ///
    /// Returns as soon as the dispatch task is spawned.
    pub async fn launch(&self, id: CampaignId) -> Result<Campaign> {
        let _lifecycle = self.lifecycle.lock().await;
        let campaign = self.get(id).await?;
        if campaign.status == CampaignStatus::Completed {
            return Err(Error::Conflict(format!("Campaign {} is completed", id)));
        }

        let mut running = self.running.lock().await;
        if running.contains_key(&id) {
            return Err(Error::Conflict(format!("Campaign {} is already dispatching", id)));
        }

        let campaign = self
            .repos
            .campaigns
            .set_campaign_status(id, CampaignStatus::InProgress, Utc::now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {} not found", id)))?;

        let launch = self.launches.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_dispatch(
            Arc::clone(&self.engine),
            Arc::clone(&self.running),
            id,
            launch,
            cancel.clone(),
        ));
        running.insert(
            id,
            RunningDispatch {
                launch,
                cancel,
                handle,
            },
        );

        info!(campaign_id = %id, "Campaign launched");
        Ok(campaign)
    }

    /// End a campaign, stopping any dispatch still in flight
    pub async fn complete(&self, id: CampaignId) -> Result<Campaign> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_dispatch(id).await;
        let campaign = self
            .repos
            .campaigns
            .set_campaign_status(id, CampaignStatus::Completed, Utc::now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {} not found", id)))?;

        info!(campaign_id = %id, "Campaign completed");
        Ok(campaign)
    }

    /// Delete a campaign with its recipients and events
    pub async fn delete(&self, id: CampaignId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_dispatch(id).await;
        if !self.repos.campaigns.delete_campaign(id).await? {
            return Err(Error::NotFound(format!("Campaign {} not found", id)));
        }
        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Remove events stamped before `cutoff` and return them for audit
    pub async fn repair_timestamps(
        &self,
        id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        self.get(id).await?;
        let removed = self.repos.events.repair_timestamps(id, cutoff).await?;
        if !removed.is_empty() {
            warn!(
                campaign_id = %id,
                removed = removed.len(),
                cutoff = %cutoff,
                "Removed events with implausible timestamps"
            );
        }
        Ok(removed)
    }

    pub async fn is_dispatching(&self, id: CampaignId) -> bool {
        self.running.lock().await.contains_key(&id)
    }

    /// Cancel every in-flight dispatch and wait for them to stop
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.running.lock().await.drain().collect();
        for (_, dispatch) in &drained {
            dispatch.cancel.cancel();
        }
        for (id, dispatch) in drained {
            if let Err(e) = dispatch.handle.await {
                error!(campaign_id = %id, error = %e, "Dispatch task failed");
            }
        }
    }

    /// Validate and normalise the editable campaign fields
    fn fields(
        &self,
        name: &str,
        url: Option<&str>,
        template_id: TemplateId,
        page_id: PageId,
        smtp_profile_id: SmtpProfileId,
    ) -> Result<CreateCampaign> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Campaign name is required".to_string()));
        }
        let url = url
            .or(self.public_url.as_deref())
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Validation("Campaign URL is required".to_string()))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Validation(format!("Campaign URL must be http(s): {}", url)));
        }

        Ok(CreateCampaign {
            name: name.to_string(),
            url,
            template_id,
            page_id,
            smtp_profile_id,
        })
    }

    async fn stop_dispatch(&self, id: CampaignId) {
        let dispatch = self.running.lock().await.remove(&id);
        if let Some(dispatch) = dispatch {
            dispatch.cancel.cancel();
            if let Err(e) = dispatch.handle.await {
                error!(campaign_id = %id, error = %e, "Dispatch task failed");
            }
        }
    }
}

async fn run_dispatch(
    engine: Arc<DispatchEngine>,
    running: Registry,
    id: CampaignId,
    launch: u64,
    cancel: CancellationToken,
) {
    if let Err(e) = engine.dispatch(id, &cancel).await {
        error!(campaign_id = %id, error = %e, "Dispatch aborted");
    }

    let mut running = running.lock().await;
    if running.get(&id).map(|d| d.launch) == Some(launch) {
        running.remove(&id);
    }
}
