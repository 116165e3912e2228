//! Campaign directory and landing page content

use crate::db::{db_err, DatabasePool};
use crate::models::{
    Campaign, CreateCampaign, DispatchPlan, EmailTemplate, LandingPage, SmtpProfile, Target,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clariphish_common::types::{CampaignId, CampaignStatus, GroupId};
use clariphish_common::{Error, Result};
use uuid::Uuid;

/// Read/write access to campaigns and the read-only directory around them
#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn list_campaigns(&self) -> Result<Vec<Campaign>>;
    /// Replace the editable fields of a draft campaign.
    ///
    /// `None` when the campaign is missing or no longer a draft.
    async fn update_draft(&self, id: CampaignId, input: CreateCampaign)
        -> Result<Option<Campaign>>;
    /// Delete a campaign together with its recipients and events
    async fn delete_campaign(&self, id: CampaignId) -> Result<bool>;
    /// Move a campaign to `status`, stamping launch or completion time
    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>>;
    /// Targets of the given groups, one per distinct email address
    async fn targets_in_groups(&self, group_ids: &[GroupId]) -> Result<Vec<Target>>;
    async fn dispatch_plan(&self, id: CampaignId) -> Result<Option<DispatchPlan>>;
}

/// Landing page lookup for the click and submit triggers
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn landing_page(&self, campaign_id: CampaignId) -> Result<Option<LandingPage>>;
}

/// Unknown template, page or SMTP profile references are the caller's fault
fn reference_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => Error::Validation(
            "Template, landing page or SMTP profile does not exist".to_string(),
        ),
        other => db_err(other),
    }
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignDirectory for DbCampaignRepository {
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (id, name, status, url, template_id, page_id, smtp_profile_id, created_at)
            VALUES ($1, $2, 'draft', $3, $4, $5, $6, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.url)
        .bind(input.template_id)
        .bind(input.page_id)
        .bind(input.smtp_profile_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(reference_err)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns ORDER BY created_at DESC")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn update_draft(
        &self,
        id: CampaignId,
        input: CreateCampaign,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns
            SET name = $2, url = $3, template_id = $4, page_id = $5, smtp_profile_id = $6
            WHERE id = $1 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.url)
        .bind(input.template_id)
        .bind(input.page_id)
        .bind(input.smtp_profile_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(reference_err)
    }

    async fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns
            SET status = $2,
                launched_at = CASE WHEN $2 = 'in_progress' THEN COALESCE(launched_at, $3) ELSE launched_at END,
                completed_at = CASE WHEN $2 = 'completed' THEN COALESCE(completed_at, $3) ELSE completed_at END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn targets_in_groups(&self, group_ids: &[GroupId]) -> Result<Vec<Target>> {
        sqlx::query_as::<_, Target>(
            r#"
            SELECT DISTINCT ON (lower(email)) id, group_id, first_name, last_name, email, position
            FROM targets
            WHERE group_id = ANY($1)
            ORDER BY lower(email), id
            "#,
        )
        .bind(group_ids)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn dispatch_plan(&self, id: CampaignId) -> Result<Option<DispatchPlan>> {
        let Some(campaign) = self.get_campaign(id).await? else {
            return Ok(None);
        };

        let template =
            sqlx::query_as::<_, EmailTemplate>("SELECT * FROM templates WHERE id = $1")
                .bind(campaign.template_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(db_err)?;

        let smtp = sqlx::query_as::<_, SmtpProfile>("SELECT * FROM smtp_profiles WHERE id = $1")
            .bind(campaign.smtp_profile_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?;

        match (template, smtp) {
            (Some(template), Some(smtp)) => Ok(Some(DispatchPlan {
                campaign,
                template,
                smtp,
            })),
            _ => Err(Error::NotFound(format!(
                "Template or SMTP profile of campaign {} is missing",
                id
            ))),
        }
    }
}

#[async_trait]
impl ContentResolver for DbCampaignRepository {
    async fn landing_page(&self, campaign_id: CampaignId) -> Result<Option<LandingPage>> {
        sqlx::query_as::<_, LandingPage>(
            r#"
            SELECT p.* FROM pages p
            JOIN campaigns c ON c.page_id = p.id
            WHERE c.id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
