//! Event store

use crate::db::{db_err, DatabasePool};
use crate::models::{AppendOutcome, Event, FirstOccurrence, NewEvent, RecordOutcome};
use crate::repository::recipients::apply_transition;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clariphish_common::types::{
    min_plausible_timestamp, CampaignId, EventKind, SortOrder, Transition,
};
use clariphish_common::{Error, Result};
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

/// How far ahead of the server clock an event may be stamped
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Append-only ledger of interaction events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event. Idempotent-once kinds return the stored event on repeat.
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome>;

    /// Append an event and apply its status transition atomically.
    ///
    /// A suppressed duplicate leaves the status register untouched.
    async fn record(&self, event: NewEvent, transition: Transition) -> Result<RecordOutcome>;

    async fn list_by_campaign(&self, campaign_id: CampaignId, order: SortOrder)
        -> Result<Vec<Event>>;
    async fn list_by_kind(&self, campaign_id: CampaignId, kind: EventKind) -> Result<Vec<Event>>;
    async fn count_distinct_recipients(&self, campaign_id: CampaignId, kind: EventKind)
        -> Result<i64>;
    async fn first_occurrences(&self, campaign_id: CampaignId) -> Result<Vec<FirstOccurrence>>;

    /// Events stamped before `cutoff`, for audit display
    async fn list_before(&self, campaign_id: CampaignId, cutoff: DateTime<Utc>)
        -> Result<Vec<Event>>;

    /// Delete events stamped before `cutoff` and return what was removed
    async fn repair_timestamps(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>>;
}

/// Reject timestamps that cannot be real: before 2020 or in the future beyond clock skew
pub fn check_plausible(time: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if time < min_plausible_timestamp() {
        return Err(Error::Validation(format!(
            "Event timestamp {} predates {}",
            time,
            min_plausible_timestamp()
        )));
    }
    if time > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(Error::Validation(format!(
            "Event timestamp {} is in the future",
            time
        )));
    }
    Ok(())
}

/// Database event store
pub struct DbEventStore {
    pool: DatabasePool,
}

impl DbEventStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

/// Insert, or return the existing row when an idempotent-once kind already exists
async fn append_on(conn: &mut PgConnection, event: &NewEvent) -> Result<AppendOutcome> {
    check_plausible(event.time, Utc::now())?;

    let inserted = sqlx::query_as::<_, Event>(
        r#"
        INSERT INTO events (
            id, campaign_id, recipient_id, email, kind, time, details, client_ip, user_agent
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(event.campaign_id)
    .bind(event.recipient_id)
    .bind(&event.email)
    .bind(event.kind.to_string())
    .bind(event.time)
    .bind(&event.details)
    .bind(&event.client_ip)
    .bind(&event.user_agent)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    if let Some(event) = inserted {
        return Ok(AppendOutcome::Inserted(event));
    }

    let existing = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE recipient_id = $1 AND kind = $2 ORDER BY time ASC LIMIT 1",
    )
    .bind(event.recipient_id)
    .bind(event.kind.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| Error::Internal("Event insert skipped without a conflicting row".to_string()))?;

    debug!(
        recipient_id = %event.recipient_id,
        kind = %event.kind,
        "Duplicate event suppressed"
    );
    Ok(AppendOutcome::Duplicate(existing))
}

#[async_trait]
impl EventStore for DbEventStore {
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome> {
        let mut conn = self.pool.pool().acquire().await.map_err(db_err)?;
        append_on(&mut conn, &event).await
    }

    async fn record(&self, event: NewEvent, transition: Transition) -> Result<RecordOutcome> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let append = append_on(&mut tx, &event).await?;
        let transitioned = match append {
            AppendOutcome::Inserted(_) => {
                apply_transition(&mut tx, event.recipient_id, transition, event.time).await?
            }
            AppendOutcome::Duplicate(_) => false,
        };

        tx.commit().await.map_err(db_err)?;

        Ok(RecordOutcome {
            append,
            transitioned,
        })
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        order: SortOrder,
    ) -> Result<Vec<Event>> {
        let sql = match order {
            SortOrder::Asc => "SELECT * FROM events WHERE campaign_id = $1 ORDER BY time ASC, id ASC",
            SortOrder::Desc => {
                "SELECT * FROM events WHERE campaign_id = $1 ORDER BY time DESC, id DESC"
            }
        };

        sqlx::query_as::<_, Event>(sql)
            .bind(campaign_id)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn list_by_kind(&self, campaign_id: CampaignId, kind: EventKind) -> Result<Vec<Event>> {
        sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE campaign_id = $1 AND kind = $2 ORDER BY time ASC, id ASC",
        )
        .bind(campaign_id)
        .bind(kind.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn count_distinct_recipients(
        &self,
        campaign_id: CampaignId,
        kind: EventKind,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT recipient_id) FROM events WHERE campaign_id = $1 AND kind = $2",
        )
        .bind(campaign_id)
        .bind(kind.to_string())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(count)
    }

    async fn first_occurrences(&self, campaign_id: CampaignId) -> Result<Vec<FirstOccurrence>> {
        sqlx::query_as::<_, FirstOccurrence>(
            r#"
            SELECT recipient_id, kind, MIN(time) AS first_time
            FROM events
            WHERE campaign_id = $1
            GROUP BY recipient_id, kind
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn list_before(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE campaign_id = $1 AND time < $2 ORDER BY time ASC, id ASC",
        )
        .bind(campaign_id)
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn repair_timestamps(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        sqlx::query_as::<_, Event>(
            "DELETE FROM events WHERE campaign_id = $1 AND time < $2 RETURNING *",
        )
        .bind(campaign_id)
        .bind(cutoff)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
