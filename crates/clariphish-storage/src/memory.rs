//! In-memory implementation of every repository trait
//!
//! Shares the semantics of the PostgreSQL repositories: unique tokens,
//! idempotent-once events, forward-only status transitions and cascading
//! campaign deletion. Used by tests and local experiments.

use crate::db::Backend;
use crate::models::{
    AppendOutcome, Campaign, CreateCampaign, DispatchPlan, EmailTemplate, Event,
    FirstOccurrence, LandingPage, NewEvent, Recipient, RecordOutcome, SmtpProfile, Target,
};
use crate::repository::campaigns::{CampaignDirectory, ContentResolver};
use crate::repository::events::{check_plausible, EventStore};
use crate::repository::recipients::{StatusRegister, TokenRegistry, MAX_TOKEN_ATTEMPTS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clariphish_common::types::{
    CampaignId, CampaignStatus, EventKind, GroupId, PageId, RecipientId, RecipientState,
    RecipientStatus, RecipientToken, SmtpProfileId, SortOrder, TargetId, TemplateId, Transition,
};
use clariphish_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    templates: HashMap<TemplateId, EmailTemplate>,
    pages: HashMap<PageId, LandingPage>,
    smtp_profiles: HashMap<SmtpProfileId, SmtpProfile>,
    targets: Vec<Target>,
    campaigns: HashMap<CampaignId, Campaign>,
    recipients: HashMap<RecipientId, Recipient>,
    tokens: HashMap<RecipientToken, RecipientId>,
    events: Vec<Event>,
}

impl Inner {
    fn recipient_mut(&mut self, id: RecipientId) -> Option<&mut Recipient> {
        self.recipients.get_mut(&id)
    }

    fn enrol(
        &mut self,
        campaign_id: CampaignId,
        target_id: TargetId,
    ) -> Result<Recipient> {
        if !self.campaigns.contains_key(&campaign_id) {
            return Err(Error::NotFound(format!("Campaign {} not found", campaign_id)));
        }
        let target = self
            .targets
            .iter()
            .find(|t| t.id == target_id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("Target {} does not exist", target_id)))?;
        if self
            .recipients
            .values()
            .any(|r| r.campaign_id == campaign_id && r.target_id == target_id)
        {
            return Err(Error::Conflict(format!(
                "Target {} is already enrolled in campaign {}",
                target_id, campaign_id
            )));
        }

        let token = (0..MAX_TOKEN_ATTEMPTS)
            .map(|_| RecipientToken::generate())
            .find(|t| !self.tokens.contains_key(t))
            .ok_or_else(|| {
                Error::Internal("Could not allocate a unique recipient token".to_string())
            })?;

        let recipient = Recipient {
            id: Uuid::now_v7(),
            campaign_id,
            target_id,
            token: token.clone(),
            status: RecipientStatus::Scheduled,
            reported: false,
            reported_at: None,
            send_date: None,
            created_at: Utc::now(),
            email: target.email,
            first_name: target.first_name,
            last_name: target.last_name,
            position: target.position,
        };
        self.tokens.insert(token, recipient.id);
        self.recipients.insert(recipient.id, recipient.clone());
        Ok(recipient)
    }

    fn append(&mut self, event: &NewEvent) -> Result<AppendOutcome> {
        check_plausible(event.time, Utc::now())?;
        if !self.recipients.contains_key(&event.recipient_id) {
            return Err(Error::Constraint(format!(
                "Recipient {} does not exist",
                event.recipient_id
            )));
        }

        if event.kind.is_idempotent_once() {
            if let Some(existing) = self
                .events
                .iter()
                .filter(|e| e.recipient_id == event.recipient_id && e.kind == event.kind)
                .min_by_key(|e| e.time)
            {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
        }

        let stored = Event {
            id: Uuid::now_v7(),
            campaign_id: event.campaign_id,
            recipient_id: event.recipient_id,
            email: event.email.clone(),
            kind: event.kind,
            time: event.time,
            details: event.details.clone(),
            client_ip: event.client_ip.clone(),
            user_agent: event.user_agent.clone(),
        };
        self.events.push(stored.clone());
        Ok(AppendOutcome::Inserted(stored))
    }

    fn transition(
        &mut self,
        recipient_id: RecipientId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(recipient) = self.recipient_mut(recipient_id) else {
            return false;
        };

        let mut state = recipient.state();
        if !state.apply(transition) {
            return false;
        }

        recipient.status = state.status;
        if transition == Transition::Advance(RecipientStatus::Sent) {
            recipient.send_date = Some(at);
        }
        if transition == Transition::Reported {
            recipient.reported = true;
            recipient.reported_at = Some(at);
        }
        true
    }

    fn check_references(&self, input: &CreateCampaign) -> Result<()> {
        if !self.templates.contains_key(&input.template_id)
            || !self.pages.contains_key(&input.page_id)
            || !self.smtp_profiles.contains_key(&input.smtp_profile_id)
        {
            return Err(Error::Validation(
                "Template, landing page or SMTP profile does not exist".to_string(),
            ));
        }
        Ok(())
    }

    fn sorted_recipients(&self, campaign_id: CampaignId) -> Vec<Recipient> {
        let mut recipients: Vec<Recipient> = self
            .recipients
            .values()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect();
        recipients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        recipients
    }
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    event_writes_failing: Arc<AtomicBool>,
    event_write_budget: Arc<Mutex<Option<usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make event writes fail with a database error, as if storage were down
    pub fn fail_event_writes(&self, failing: bool) {
        self.event_writes_failing.store(failing, Ordering::SeqCst);
        *self.write_budget() = None;
    }

    /// Let the next `writes` event writes through, then fail every later one
    pub fn fail_event_writes_after(&self, writes: usize) {
        *self.write_budget() = Some(writes);
    }

    fn write_budget(&self) -> std::sync::MutexGuard<'_, Option<usize>> {
        self.event_write_budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.event_writes_failing.load(Ordering::SeqCst) {
            return Err(Error::Database("event store unavailable".to_string()));
        }
        if let Some(remaining) = self.write_budget().as_mut() {
            if *remaining == 0 {
                return Err(Error::Database("event store unavailable".to_string()));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    pub async fn insert_template(&self, template: EmailTemplate) {
        self.inner
            .write()
            .await
            .templates
            .insert(template.id, template);
    }

    pub async fn insert_page(&self, page: LandingPage) {
        self.inner.write().await.pages.insert(page.id, page);
    }

    pub async fn insert_smtp_profile(&self, profile: SmtpProfile) {
        self.inner
            .write()
            .await
            .smtp_profiles
            .insert(profile.id, profile);
    }

    pub async fn insert_target(&self, target: Target) {
        self.inner.write().await.targets.push(target);
    }

    /// Store an event exactly as given, skipping validation and deduplication
    pub async fn import_event(&self, event: Event) {
        self.inner.write().await.events.push(event);
    }

    /// Number of stored events across all campaigns
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }
}

#[async_trait]
impl Backend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TokenRegistry for MemoryStore {
    async fn issue(&self, campaign_id: CampaignId, target_id: TargetId) -> Result<Recipient> {
        let mut inner = self.inner.write().await;
        inner.enrol(campaign_id, target_id)
    }

    async fn issue_batch(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
    ) -> Result<Vec<Recipient>> {
        let mut inner = self.inner.write().await;
        let mut enrolled = Vec::with_capacity(target_ids.len());

        for target_id in target_ids {
            match inner.enrol(campaign_id, *target_id) {
                Ok(recipient) => enrolled.push(recipient),
                Err(e) => {
                    for recipient in enrolled {
                        inner.recipients.remove(&recipient.id);
                        inner.tokens.remove(&recipient.token);
                    }
                    return Err(e);
                }
            }
        }

        Ok(inner.sorted_recipients(campaign_id))
    }

    async fn resolve(&self, token: &RecipientToken) -> Result<Option<Recipient>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .get(token)
            .and_then(|id| inner.recipients.get(id))
            .cloned())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>> {
        Ok(self.inner.read().await.sorted_recipients(campaign_id))
    }

    async fn list_scheduled(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>> {
        Ok(self
            .inner
            .read()
            .await
            .sorted_recipients(campaign_id)
            .into_iter()
            .filter(|r| r.status == RecipientStatus::Scheduled)
            .collect())
    }

    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .recipients
            .values()
            .filter(|r| r.campaign_id == campaign_id)
            .count() as i64)
    }
}

#[async_trait]
impl StatusRegister for MemoryStore {
    async fn transition(
        &self,
        recipient_id: RecipientId,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .transition(recipient_id, transition, at))
    }

    async fn get(&self, recipient_id: RecipientId) -> Result<Option<RecipientState>> {
        let inner = self.inner.read().await;
        Ok(inner.recipients.get(&recipient_id).map(Recipient::state))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome> {
        self.check_writable()?;
        self.inner.write().await.append(&event)
    }

    async fn record(&self, event: NewEvent, transition: Transition) -> Result<RecordOutcome> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;

        let append = inner.append(&event)?;
        let transitioned = match append {
            AppendOutcome::Inserted(_) => {
                inner.transition(event.recipient_id, transition, event.time)
            }
            AppendOutcome::Duplicate(_) => false,
        };

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
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        if order == SortOrder::Desc {
            events.reverse();
        }
        Ok(events)
    }

    async fn list_by_kind(&self, campaign_id: CampaignId, kind: EventKind) -> Result<Vec<Event>> {
        Ok(EventStore::list_by_campaign(self, campaign_id, SortOrder::Asc)
            .await?
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect())
    }

    async fn count_distinct_recipients(
        &self,
        campaign_id: CampaignId,
        kind: EventKind,
    ) -> Result<i64> {
        let inner = self.inner.read().await;
        let recipients: HashSet<RecipientId> = inner
            .events
            .iter()
            .filter(|e| e.campaign_id == campaign_id && e.kind == kind)
            .map(|e| e.recipient_id)
            .collect();
        Ok(recipients.len() as i64)
    }

    async fn first_occurrences(&self, campaign_id: CampaignId) -> Result<Vec<FirstOccurrence>> {
        let inner = self.inner.read().await;
        let mut firsts: BTreeMap<(RecipientId, String), FirstOccurrence> = BTreeMap::new();

        for event in inner.events.iter().filter(|e| e.campaign_id == campaign_id) {
            firsts
                .entry((event.recipient_id, event.kind.to_string()))
                .and_modify(|f| {
                    if event.time < f.first_time {
                        f.first_time = event.time;
                    }
                })
                .or_insert_with(|| FirstOccurrence {
                    recipient_id: event.recipient_id,
                    kind: event.kind,
                    first_time: event.time,
                });
        }

        Ok(firsts.into_values().collect())
    }

    async fn list_before(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        Ok(EventStore::list_by_campaign(self, campaign_id, SortOrder::Asc)
            .await?
            .into_iter()
            .filter(|e| e.time < cutoff)
            .collect())
    }

    async fn repair_timestamps(
        &self,
        campaign_id: CampaignId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut inner = self.inner.write().await;
        let (removed, kept): (Vec<Event>, Vec<Event>) = inner
            .events
            .drain(..)
            .partition(|e| e.campaign_id == campaign_id && e.time < cutoff);
        inner.events = kept;
        Ok(removed)
    }
}

#[async_trait]
impl CampaignDirectory for MemoryStore {
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        let mut inner = self.inner.write().await;
        inner.check_references(&input)?;

        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: input.name,
            status: CampaignStatus::Draft,
            url: input.url,
            template_id: input.template_id,
            page_id: input.page_id,
            smtp_profile_id: input.smtp_profile_id,
            created_at: Utc::now(),
            launched_at: None,
            completed_at: None,
        };
        inner.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.inner.read().await.campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> =
            self.inner.read().await.campaigns.values().cloned().collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn update_draft(
        &self,
        id: CampaignId,
        input: CreateCampaign,
    ) -> Result<Option<Campaign>> {
        let mut inner = self.inner.write().await;
        inner.check_references(&input)?;
        let Some(campaign) = inner
            .campaigns
            .get_mut(&id)
            .filter(|c| c.status == CampaignStatus::Draft)
        else {
            return Ok(None);
        };

        campaign.name = input.name;
        campaign.url = input.url;
        campaign.template_id = input.template_id;
        campaign.page_id = input.page_id;
        campaign.smtp_profile_id = input.smtp_profile_id;
        Ok(Some(campaign.clone()))
    }

    async fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.campaigns.remove(&id).is_none() {
            return Ok(false);
        }

        inner.recipients.retain(|_, r| r.campaign_id != id);
        let Inner {
            recipients, tokens, ..
        } = &mut *inner;
        tokens.retain(|_, rid| recipients.contains_key(rid));
        inner.events.retain(|e| e.campaign_id != id);
        Ok(true)
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let mut inner = self.inner.write().await;
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Ok(None);
        };

        campaign.status = status;
        match status {
            CampaignStatus::InProgress => {
                campaign.launched_at.get_or_insert(at);
            }
            CampaignStatus::Completed => {
                campaign.completed_at.get_or_insert(at);
            }
            CampaignStatus::Draft => {}
        }
        Ok(Some(campaign.clone()))
    }

    async fn targets_in_groups(&self, group_ids: &[GroupId]) -> Result<Vec<Target>> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        let mut targets: Vec<Target> = inner
            .targets
            .iter()
            .filter(|t| group_ids.contains(&t.group_id))
            .cloned()
            .collect();
        targets.sort_by(|a, b| a.email.to_lowercase().cmp(&b.email.to_lowercase()));
        targets.retain(|t| seen.insert(t.email.to_lowercase()));
        Ok(targets)
    }

    async fn dispatch_plan(&self, id: CampaignId) -> Result<Option<DispatchPlan>> {
        let inner = self.inner.read().await;
        let Some(campaign) = inner.campaigns.get(&id).cloned() else {
            return Ok(None);
        };

        match (
            inner.templates.get(&campaign.template_id).cloned(),
            inner.smtp_profiles.get(&campaign.smtp_profile_id).cloned(),
        ) {
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
impl ContentResolver for MemoryStore {
    async fn landing_page(&self, campaign_id: CampaignId) -> Result<Option<LandingPage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .campaigns
            .get(&campaign_id)
            .and_then(|c| inner.pages.get(&c.page_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_issue_and_resolve() {
        let fx = fixtures::seed(3).await;
        let recipients = TokenRegistry::list_by_campaign(&fx.store, fx.campaign.id)
            .await
            .unwrap();
        assert_eq!(recipients.len(), 3);

        for recipient in &recipients {
            let resolved = fx.store.resolve(&recipient.token).await.unwrap().unwrap();
            assert_eq!(resolved.id, recipient.id);
            assert_eq!(resolved.campaign_id, fx.campaign.id);
            assert_eq!(resolved.status, RecipientStatus::Scheduled);
        }

        let unknown = RecipientToken::generate();
        assert!(fx.store.resolve(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_enrolment_is_conflict() {
        let fx = fixtures::seed(1).await;
        let target_id = fx.targets[0].id;
        let err = fx.store.issue(fx.campaign.id, target_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_nothing_behind() {
        let fx = fixtures::seed(2).await;
        let other = fixtures::campaign(&fx.store, "second").await;

        let result = fx
            .store
            .issue_batch(other.id, &[fx.targets[0].id, Uuid::new_v4()])
            .await;
        assert!(result.is_err());
        assert_eq!(fx.store.count_by_campaign(other.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_suppresses_duplicate_open() {
        let fx = fixtures::seed(1).await;
        let recipient = &fx.recipients[0];
        let now = Utc::now();

        let first = fx
            .store
            .record(
                NewEvent::for_recipient(recipient, EventKind::EmailOpened, now),
                Transition::Advance(RecipientStatus::Opened),
            )
            .await
            .unwrap();
        assert!(!first.append.is_duplicate());
        assert!(first.transitioned);

        let second = fx
            .store
            .record(
                NewEvent::for_recipient(recipient, EventKind::EmailOpened, now),
                Transition::Advance(RecipientStatus::Opened),
            )
            .await
            .unwrap();
        assert!(second.append.is_duplicate());
        assert!(!second.transitioned);
        assert_eq!(second.append.event().id, first.append.event().id);
        assert_eq!(fx.store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_rejects_implausible_time() {
        let fx = fixtures::seed(1).await;
        let zero = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let err = fx
            .store
            .append(NewEvent::for_recipient(
                &fx.recipients[0],
                EventKind::LinkClicked,
                zero,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(fx.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_sent_transition_stamps_send_date() {
        let fx = fixtures::seed(1).await;
        let recipient = &fx.recipients[0];
        let at = Utc::now();

        assert!(fx
            .store
            .transition(recipient.id, Transition::Advance(RecipientStatus::Sent), at)
            .await
            .unwrap());
        let stored = fx.store.resolve(&recipient.token).await.unwrap().unwrap();
        assert_eq!(stored.send_date, Some(at));
        assert_eq!(stored.status, RecipientStatus::Sent);
    }

    #[tokio::test]
    async fn test_repair_timestamps_returns_removed() {
        let fx = fixtures::seed(1).await;
        let recipient = &fx.recipients[0];
        let bad = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
        let good = Utc::now() - Duration::minutes(1);

        fx.store
            .append(NewEvent::for_recipient(recipient, EventKind::LinkClicked, good))
            .await
            .unwrap();
        fx.store
            .import_event(fixtures::raw_event(recipient, EventKind::EmailOpened, bad))
            .await;

        let cutoff = clariphish_common::types::min_plausible_timestamp();
        let audit = fx.store.list_before(fx.campaign.id, cutoff).await.unwrap();
        assert_eq!(audit.len(), 1);

        let removed = fx
            .store
            .repair_timestamps(fx.campaign.id, cutoff)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].time, bad);
        assert_eq!(fx.store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let fx = fixtures::seed(2).await;
        fx.store
            .append(NewEvent::for_recipient(
                &fx.recipients[0],
                EventKind::LinkClicked,
                Utc::now(),
            ))
            .await
            .unwrap();

        assert!(fx.store.delete_campaign(fx.campaign.id).await.unwrap());
        assert_eq!(fx.store.count_by_campaign(fx.campaign.id).await.unwrap(), 0);
        assert_eq!(fx.store.event_count().await, 0);
        assert!(fx
            .store
            .resolve(&fx.recipients[0].token)
            .await
            .unwrap()
            .is_none());
        assert!(!fx.store.delete_campaign(fx.campaign.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_event_for_deleted_recipient_is_constraint_violation() {
        let fx = fixtures::seed(1).await;
        assert!(fx.store.delete_campaign(fx.campaign.id).await.unwrap());

        let err = fx
            .store
            .record(
                NewEvent::for_recipient(&fx.recipients[0], EventKind::LinkClicked, Utc::now()),
                Transition::Advance(RecipientStatus::Clicked),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_write_budget_fails_later_writes() {
        let fx = fixtures::seed(2).await;
        fx.store.fail_event_writes_after(1);

        let click = |i: usize| {
            NewEvent::for_recipient(&fx.recipients[i], EventKind::LinkClicked, Utc::now())
        };
        fx.store.append(click(0)).await.unwrap();
        let err = fx.store.append(click(1)).await.unwrap_err();
        assert!(err.is_transient());

        fx.store.fail_event_writes(false);
        fx.store.append(click(1)).await.unwrap();
        assert_eq!(fx.store.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_targets_in_groups_dedups_email() {
        let store = MemoryStore::new();
        let group_a = Uuid::new_v4();
        let group_b = Uuid::new_v4();
        store
            .insert_target(fixtures::target(group_a, "alice@example.com"))
            .await;
        store
            .insert_target(fixtures::target(group_b, "Alice@example.com"))
            .await;
        store
            .insert_target(fixtures::target(group_b, "bob@example.com"))
            .await;

        let targets = store.targets_in_groups(&[group_a, group_b]).await.unwrap();
        assert_eq!(targets.len(), 2);

        let only_a = store.targets_in_groups(&[group_a]).await.unwrap();
        assert_eq!(only_a.len(), 1);
    }
}
