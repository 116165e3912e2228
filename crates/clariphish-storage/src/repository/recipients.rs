//! Token registry and status register, both backed by `campaign_recipients`

use crate::db::{db_err, DatabasePool};
use crate::models::Recipient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clariphish_common::types::{
    CampaignId, RecipientId, RecipientState, RecipientStatus, RecipientToken, TargetId,
    Transition,
};
use clariphish_common::{Error, Result};
use sqlx::PgConnection;
use tracing::warn;
use uuid::Uuid;

/// Fresh tokens tried before an enrolment gives up
pub const MAX_TOKEN_ATTEMPTS: usize = 5;

/// Maps opaque recipient tokens to campaign/target identity
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Enrol one target and bind it to a fresh token
    async fn issue(&self, campaign_id: CampaignId, target_id: TargetId) -> Result<Recipient>;
    /// Enrol several targets at once; all or nothing
    async fn issue_batch(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
    ) -> Result<Vec<Recipient>>;
    async fn resolve(&self, token: &RecipientToken) -> Result<Option<Recipient>>;
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>>;
    /// Recipients still waiting for dispatch
    async fn list_scheduled(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>>;
    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64>;
}

/// Current lifecycle stage per recipient
#[async_trait]
pub trait StatusRegister: Send + Sync {
    /// Apply a transition. Returns `false` when it would not move the recipient forward.
    async fn transition(
        &self,
        recipient_id: RecipientId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn get(&self, recipient_id: RecipientId) -> Result<Option<RecipientState>>;
}

const RECIPIENT_SELECT: &str = r#"
    SELECT r.id, r.campaign_id, r.target_id, r.token, r.status, r.reported,
           r.reported_at, r.send_date, r.created_at,
           t.email, t.first_name, t.last_name, t.position
    FROM campaign_recipients r
    JOIN targets t ON t.id = r.target_id
"#;

/// Database recipient repository
pub struct DbRecipientRepository {
    pool: DatabasePool,
}

impl DbRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: RecipientId) -> Result<Recipient> {
        sqlx::query_as::<_, Recipient>(&format!("{} WHERE r.id = $1", RECIPIENT_SELECT))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::Internal("Enrolled recipient vanished".to_string()))
    }
}

/// Insert one enrolment row, retrying on token collision
async fn insert_recipient(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
    target_id: TargetId,
) -> Result<RecipientId> {
    for attempt in 1..=MAX_TOKEN_ATTEMPTS {
        let id = Uuid::now_v7();
        let token = RecipientToken::generate();

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO campaign_recipients (id, campaign_id, target_id, token, status, created_at)
            VALUES ($1, $2, $3, $4, 'scheduled', NOW())
            ON CONFLICT (token) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(campaign_id)
        .bind(target_id)
        .bind(token.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::Conflict(
                format!("Target {} is already enrolled in campaign {}", target_id, campaign_id),
            ),
            other => db_err(other),
        })?;

        if let Some((id,)) = inserted {
            return Ok(id);
        }

        warn!(%campaign_id, attempt, "Recipient token collision, retrying");
    }

    Err(Error::Internal(
        "Could not allocate a unique recipient token".to_string(),
    ))
}

/// Apply a status transition on an open connection
pub(crate) async fn apply_transition(
    conn: &mut PgConnection,
    recipient_id: RecipientId,
    transition: Transition,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = match transition {
        Transition::Advance(next) => {
            let predecessors: Vec<String> =
                next.predecessors().iter().map(|s| s.to_string()).collect();
            let stamps_send_date = next == RecipientStatus::Sent;

            sqlx::query(
                r#"
                UPDATE campaign_recipients
                SET status = $2,
                    send_date = CASE WHEN $3 THEN $4 ELSE send_date END
                WHERE id = $1 AND status = ANY($5)
                "#,
            )
            .bind(recipient_id)
            .bind(next.to_string())
            .bind(stamps_send_date)
            .bind(at)
            .bind(&predecessors)
            .execute(&mut *conn)
            .await
        }
        Transition::Reported => {
            sqlx::query(
                r#"
                UPDATE campaign_recipients
                SET reported = TRUE, reported_at = $2
                WHERE id = $1 AND reported = FALSE
                "#,
            )
            .bind(recipient_id)
            .bind(at)
            .execute(&mut *conn)
            .await
        }
    }
    .map_err(db_err)?;

    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl TokenRegistry for DbRecipientRepository {
    async fn issue(&self, campaign_id: CampaignId, target_id: TargetId) -> Result<Recipient> {
        let mut conn = self.pool.pool().acquire().await.map_err(db_err)?;
        let id = insert_recipient(&mut conn, campaign_id, target_id).await?;
        drop(conn);
        self.fetch(id).await
    }

    async fn issue_batch(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
    ) -> Result<Vec<Recipient>> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;
        for target_id in target_ids {
            insert_recipient(&mut tx, campaign_id, *target_id).await?;
        }
        tx.commit().await.map_err(db_err)?;

        self.list_by_campaign(campaign_id).await
    }

    async fn resolve(&self, token: &RecipientToken) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>(&format!("{} WHERE r.token = $1", RECIPIENT_SELECT))
            .bind(token.as_str())
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>> {
        sqlx::query_as::<_, Recipient>(&format!(
            "{} WHERE r.campaign_id = $1 ORDER BY r.created_at ASC, r.id ASC",
            RECIPIENT_SELECT
        ))
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_scheduled(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>> {
        sqlx::query_as::<_, Recipient>(&format!(
            "{} WHERE r.campaign_id = $1 AND r.status = 'scheduled' ORDER BY r.created_at ASC, r.id ASC",
            RECIPIENT_SELECT
        ))
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM campaign_recipients WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(db_err)?;
        Ok(count)
    }
}

#[async_trait]
impl StatusRegister for DbRecipientRepository {
    async fn transition(
        &self,
        recipient_id: RecipientId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.pool.pool().acquire().await.map_err(db_err)?;
        apply_transition(&mut conn, recipient_id, transition, at).await
    }

    async fn get(&self, recipient_id: RecipientId) -> Result<Option<RecipientState>> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT status, reported FROM campaign_recipients WHERE id = $1")
                .bind(recipient_id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(db_err)?;

        row.map(|(status, reported)| {
            Ok::<_, Error>(RecipientState {
                status: status.parse()?,
                reported,
            })
        })
        .transpose()
    }
}
