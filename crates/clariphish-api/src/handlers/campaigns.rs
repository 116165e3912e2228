//! Campaign handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use clariphish_common::types::{min_plausible_timestamp, CampaignId, SortOrder};
use clariphish_core::{CampaignStats, CampaignUpdate, NewCampaign, RecipientResult, SubmittedData};
use clariphish_storage::models::{Campaign, Event};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{api_error, ApiResult};
use crate::auth::AppState;

/// Campaign detail: the campaign, its funnel and the result table
#[derive(Debug, Serialize)]
pub struct CampaignDetail {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub stats: CampaignStats,
    pub results: Vec<RecipientResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub order: SortOrder,
}

/// Cutoff for the timestamp audit and repair; defaults to the plausibility floor
#[derive(Debug, Default, Deserialize)]
pub struct CutoffQuery {
    pub cutoff: Option<DateTime<Utc>>,
}

impl CutoffQuery {
    fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff.unwrap_or_else(min_plausible_timestamp)
    }
}

#[derive(Debug, Serialize)]
pub struct RepairResponse {
    pub cutoff: DateTime<Utc>,
    pub removed: Vec<Event>,
}

/// GET /api/v1/campaigns
pub async fn list_campaigns(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Campaign>>> {
    state.campaigns.list().await.map(Json).map_err(api_error)
}

/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = state.campaigns.create(input).await.map_err(api_error)?;
    info!(campaign_id = %campaign.id, "Campaign created via API");
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /api/v1/campaigns/:id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<CampaignDetail>> {
    let campaign = state.campaigns.get(id).await.map_err(api_error)?;
    let stats = state.aggregator.stats(id).await.map_err(api_error)?;
    let results = state.aggregator.results(id).await.map_err(api_error)?;

    Ok(Json(CampaignDetail {
        campaign,
        stats,
        results,
    }))
}

/// PUT /api/v1/campaigns/:id, drafts only
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    Json(input): Json<CampaignUpdate>,
) -> ApiResult<Json<Campaign>> {
    state.campaigns.update(id, input).await.map(Json).map_err(api_error)
}

/// DELETE /api/v1/campaigns/:id
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<StatusCode> {
    state.campaigns.delete(id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/campaigns/:id/launch
///
/// Dispatch continues in the background after the response.
pub async fn launch_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = state.campaigns.launch(id).await.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(campaign)))
}

/// POST /api/v1/campaigns/:id/complete
pub async fn complete_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<Campaign>> {
    state.campaigns.complete(id).await.map(Json).map_err(api_error)
}

/// GET /api/v1/campaigns/:id/stats
pub async fn get_campaign_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<CampaignStats>> {
    state.campaigns.get(id).await.map_err(api_error)?;
    state.aggregator.stats(id).await.map(Json).map_err(api_error)
}

/// GET /api/v1/campaigns/:id/results
pub async fn get_campaign_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<Vec<RecipientResult>>> {
    state.campaigns.get(id).await.map_err(api_error)?;
    state.aggregator.results(id).await.map(Json).map_err(api_error)
}

/// GET /api/v1/campaigns/:id/events
pub async fn list_campaign_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    state.campaigns.get(id).await.map_err(api_error)?;
    state
        .repos
        .events
        .list_by_campaign(id, query.order)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/v1/campaigns/:id/credentials
pub async fn export_credentials(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
) -> ApiResult<Json<Vec<SubmittedData>>> {
    state.campaigns.get(id).await.map_err(api_error)?;
    state
        .aggregator
        .credentials(id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/v1/campaigns/:id/timestamps
pub async fn audit_timestamps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    Query(query): Query<CutoffQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    state.campaigns.get(id).await.map_err(api_error)?;
    state
        .aggregator
        .timestamp_audit(id, query.cutoff())
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/v1/campaigns/:id/timestamps/repair
pub async fn repair_timestamps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<CampaignId>,
    Query(query): Query<CutoffQuery>,
) -> ApiResult<Json<RepairResponse>> {
    let cutoff = query.cutoff();
    let removed = state
        .campaigns
        .repair_timestamps(id, cutoff)
        .await
        .map_err(api_error)?;
    Ok(Json(RepairResponse { cutoff, removed }))
}
