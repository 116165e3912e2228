//! Durable outbox for tracking writes
//!
//! A tracking request never waits on storage faults. When an event write
//! fails with a transient error it is queued here; a background worker retries
//! it with exponential backoff and, once attempts run out, appends it to a
//! JSON-lines spool file that is replayed on the next start. Replay works on a
//! `.replaying` copy that is removed only after every line is settled, so a
//! crash during replay loses nothing.

use crate::metrics::Metrics;
use clariphish_common::config::OutboxConfig;
use clariphish_common::types::Transition;
use clariphish_common::{Error, Result};
use clariphish_storage::models::NewEvent;
use clariphish_storage::repository::EventStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An event write waiting to be stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub event: NewEvent,
    pub transition: Transition,
}

/// Outcome of replaying the spool file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub stored: usize,
    pub respooled: usize,
    pub discarded: usize,
    /// Lines that could not be respooled; the replay file is kept for the next start
    pub retained: usize,
}

/// JSON-lines file holding writes that exhausted their retries
struct Spool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Spool {
    async fn append(&self, write: &PendingWrite) -> Result<()> {
        let mut line = serde_json::to_string(write)
            .map_err(|e| Error::Internal(format!("Failed to encode outbox entry: {}", e)))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Internal(format!("Failed to create spool dir: {}", e)))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to open spool: {}", e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Internal(format!("Failed to write spool: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("Failed to flush spool: {}", e)))?;
        Ok(())
    }

    fn replaying_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".replaying");
        self.path.with_file_name(name)
    }

    /// Move the spool aside and return the lines to replay.
    ///
    /// A replay file left behind by an interrupted run is replayed again,
    /// together with anything spooled since.
    async fn begin_replay(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let replaying = self.replaying_path();

        if let Some(pending) = read_optional(&self.path).await? {
            if tokio::fs::try_exists(&replaying)
                .await
                .map_err(|e| spool_err("inspect", e))?
            {
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&replaying)
                    .await
                    .map_err(|e| spool_err("open", e))?;
                file.write_all(format!("\n{}", pending).as_bytes())
                    .await
                    .map_err(|e| spool_err("write", e))?;
                file.sync_all().await.map_err(|e| spool_err("sync", e))?;
                tokio::fs::remove_file(&self.path)
                    .await
                    .map_err(|e| spool_err("clear", e))?;
            } else {
                tokio::fs::rename(&self.path, &replaying)
                    .await
                    .map_err(|e| spool_err("rename", e))?;
            }
        }

        Ok(read_optional(&replaying)
            .await?
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn finish_replay(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.replaying_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(spool_err("clear", e)),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(spool_err("read", e)),
    }
}

fn spool_err(action: &str, e: std::io::Error) -> Error {
    Error::Internal(format!("Failed to {} spool: {}", action, e))
}

/// Producer handle used by the tracking service
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<PendingWrite>,
    spool: Arc<Spool>,
    metrics: Metrics,
}

/// Consumer side; run it on its own task
pub struct OutboxWorker {
    rx: mpsc::Receiver<PendingWrite>,
    events: Arc<dyn EventStore>,
    spool: Arc<Spool>,
    metrics: Metrics,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Outbox {
    pub fn new(
        config: &OutboxConfig,
        events: Arc<dyn EventStore>,
        metrics: Metrics,
    ) -> (Outbox, OutboxWorker) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let spool = Arc::new(Spool {
            path: config.spool_path.clone(),
            lock: Mutex::new(()),
        });

        let outbox = Outbox {
            tx,
            spool: spool.clone(),
            metrics: metrics.clone(),
        };
        let worker = OutboxWorker {
            rx,
            events,
            spool,
            metrics,
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        };
        (outbox, worker)
    }

    /// Queue a write for retry. Falls back to the spool when the queue is full.
    pub async fn enqueue(&self, write: PendingWrite) {
        match self.tx.try_send(write) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(write))
            | Err(mpsc::error::TrySendError::Closed(write)) => {
                warn!(
                    recipient_id = %write.event.recipient_id,
                    kind = %write.event.kind,
                    "Outbox queue unavailable, spooling tracking write"
                );
                if let Err(e) = self.spool.append(&write).await {
                    error!(error = %e, "Tracking write lost");
                    self.metrics.record_outbox_dropped();
                }
            }
        }
    }

    pub fn spool_path(&self) -> &Path {
        &self.spool.path
    }
}

impl OutboxWorker {
    /// Replay writes spooled by a previous run. Call before `run`.
    ///
    /// Transient failures go back to the spool; rejected writes are dropped.
    pub async fn replay_spool(&self) -> Result<ReplayReport> {
        let lines = self.spool.begin_replay().await?;
        let mut report = ReplayReport::default();

        for line in lines {
            let write: PendingWrite = match serde_json::from_str(&line) {
                Ok(write) => write,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable spool entry");
                    report.discarded += 1;
                    continue;
                }
            };

            match self
                .events
                .record(write.event.clone(), write.transition)
                .await
            {
                Ok(_) => report.stored += 1,
                Err(e) if e.is_transient() => match self.spool.append(&write).await {
                    Ok(()) => report.respooled += 1,
                    Err(spool_error) => {
                        error!(error = %spool_error, "Failed to respool tracking write");
                        report.retained += 1;
                    }
                },
                Err(e) => {
                    warn!(error = %e, kind = %write.event.kind, "Discarding rejected spool entry");
                    self.metrics.record_outbox_dropped();
                    report.discarded += 1;
                }
            }
        }

        if report.retained == 0 {
            self.spool.finish_replay().await?;
        } else {
            warn!(
                retained = report.retained,
                path = %self.spool.replaying_path().display(),
                "Keeping replay file for the next start"
            );
        }

        if report != ReplayReport::default() {
            info!(
                stored = report.stored,
                respooled = report.respooled,
                discarded = report.discarded,
                "Outbox spool replayed"
            );
        }
        Ok(report)
    }

    /// Process queued writes until `shutdown` fires, then spool what is left
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Outbox worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(write) => self.deliver(write, &shutdown).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        while let Ok(write) = self.rx.try_recv() {
            self.spool_or_drop(&write).await;
        }
        info!("Outbox worker stopped");
    }

    async fn deliver(&self, write: PendingWrite, shutdown: &CancellationToken) {
        for attempt in 1..=self.max_attempts {
            match self
                .events
                .record(write.event.clone(), write.transition)
                .await
            {
                Ok(_) => {
                    debug!(
                        recipient_id = %write.event.recipient_id,
                        kind = %write.event.kind,
                        attempt,
                        "Outbox write stored"
                    );
                    return;
                }
                Err(e) if !e.is_transient() => {
                    warn!(error = %e, kind = %write.event.kind, "Outbox write rejected");
                    self.metrics.record_outbox_dropped();
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    self.metrics.record_outbox_retry();
                    let delay = self.base_backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(error = %e, attempt, ?delay, "Outbox write failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempts = attempt, "Outbox retries exhausted");
                }
            }
        }

        self.spool_or_drop(&write).await;
    }

    async fn spool_or_drop(&self, write: &PendingWrite) {
        if let Err(e) = self.spool.append(write).await {
            error!(error = %e, "Tracking write lost");
            self.metrics.record_outbox_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clariphish_common::types::{EventKind, RecipientStatus};
    use clariphish_storage::fixtures;
    use clariphish_storage::repository::{CampaignDirectory, EventStore, StatusRegister};
    use pretty_assertions::assert_eq;

    fn config(dir: &tempfile::TempDir) -> OutboxConfig {
        OutboxConfig {
            capacity: 8,
            max_attempts: 3,
            base_backoff_ms: 1,
            spool_path: dir.path().join("outbox.jsonl"),
        }
    }

    fn click(fx: &fixtures::Fixture) -> PendingWrite {
        PendingWrite {
            event: NewEvent::for_recipient(&fx.recipients[0], EventKind::LinkClicked, Utc::now()),
            transition: Transition::Advance(RecipientStatus::Clicked),
        }
    }

    #[tokio::test]
    async fn test_worker_stores_queued_write() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(1).await;
        let (outbox, worker) = Outbox::new(
            &config(&dir),
            Arc::new(fx.store.clone()),
            Metrics::new().unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        outbox.enqueue(click(&fx)).await;
        for _ in 0..100 {
            if fx.store.event_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(fx.store.event_count().await, 1);
        let state = fx.store.get(fx.recipients[0].id).await.unwrap().unwrap();
        assert_eq!(state.status, RecipientStatus::Clicked);
    }

    #[tokio::test]
    async fn test_exhausted_write_is_spooled_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(1).await;
        fx.store.fail_event_writes(true);

        let (_outbox, worker) = Outbox::new(
            &config(&dir),
            Arc::new(fx.store.clone()),
            Metrics::new().unwrap(),
        );
        worker.deliver(click(&fx), &CancellationToken::new()).await;

        let spooled = tokio::fs::read_to_string(dir.path().join("outbox.jsonl"))
            .await
            .unwrap();
        assert_eq!(spooled.lines().count(), 1);
        assert_eq!(fx.store.event_count().await, 0);

        fx.store.fail_event_writes(false);
        let report = worker.replay_spool().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                stored: 1,
                ..Default::default()
            }
        );
        assert_eq!(fx.store.event_count().await, 1);
        assert!(!dir.path().join("outbox.jsonl").exists());
        assert!(!dir.path().join("outbox.jsonl.replaying").exists());
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(1).await;
        let (_outbox, worker) = Outbox::new(
            &config(&dir),
            Arc::new(fx.store.clone()),
            Metrics::new().unwrap(),
        );

        let mut write = click(&fx);
        write.event.time = chrono::DateTime::<Utc>::MIN_UTC;
        worker.deliver(write, &CancellationToken::new()).await;

        assert!(!dir.path().join("outbox.jsonl").exists());
        assert_eq!(fx.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_replay_keeps_unreadable_lines_out() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(1).await;
        let cfg = config(&dir);
        let good = serde_json::to_string(&click(&fx)).unwrap();
        tokio::fs::write(&cfg.spool_path, format!("not json\n{}\n", good))
            .await
            .unwrap();

        let (_outbox, worker) =
            Outbox::new(&cfg, Arc::new(fx.store.clone()), Metrics::new().unwrap());
        let report = worker.replay_spool().await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(
            EventStore::list_by_campaign(
                &fx.store,
                fx.campaign.id,
                clariphish_common::types::SortOrder::Asc
            )
            .await
            .unwrap()
            .len(),
            1
        );
    }

    fn spool_lines(writes: &[PendingWrite]) -> String {
        writes
            .iter()
            .map(|w| serde_json::to_string(w).unwrap() + "\n")
            .collect()
    }

    fn click_for(recipient: &clariphish_storage::models::Recipient) -> PendingWrite {
        PendingWrite {
            event: NewEvent::for_recipient(recipient, EventKind::LinkClicked, Utc::now()),
            transition: Transition::Advance(RecipientStatus::Clicked),
        }
    }

    #[tokio::test]
    async fn test_replay_respools_writes_after_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(3).await;
        let cfg = config(&dir);
        let writes: Vec<PendingWrite> = fx.recipients.iter().map(click_for).collect();
        tokio::fs::write(&cfg.spool_path, spool_lines(&writes))
            .await
            .unwrap();

        let (_outbox, worker) =
            Outbox::new(&cfg, Arc::new(fx.store.clone()), Metrics::new().unwrap());
        fx.store.fail_event_writes_after(1);
        let report = worker.replay_spool().await.unwrap();

        assert_eq!(
            report,
            ReplayReport {
                stored: 1,
                respooled: 2,
                ..Default::default()
            }
        );
        let spooled = tokio::fs::read_to_string(&cfg.spool_path).await.unwrap();
        assert_eq!(spooled.lines().count(), 2);
        assert!(!dir.path().join("outbox.jsonl.replaying").exists());

        fx.store.fail_event_writes(false);
        let report = worker.replay_spool().await.unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(fx.store.event_count().await, 3);
        assert!(!cfg.spool_path.exists());
    }

    #[tokio::test]
    async fn test_interrupted_replay_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(2).await;
        let cfg = config(&dir);
        let replaying = dir.path().join("outbox.jsonl.replaying");
        tokio::fs::write(&replaying, spool_lines(&[click_for(&fx.recipients[0])]))
            .await
            .unwrap();
        tokio::fs::write(&cfg.spool_path, spool_lines(&[click_for(&fx.recipients[1])]))
            .await
            .unwrap();

        let (_outbox, worker) =
            Outbox::new(&cfg, Arc::new(fx.store.clone()), Metrics::new().unwrap());
        let report = worker.replay_spool().await.unwrap();

        assert_eq!(report.stored, 2);
        assert_eq!(fx.store.event_count().await, 2);
        assert!(!replaying.exists());
        assert!(!cfg.spool_path.exists());
    }

    #[tokio::test]
    async fn test_constraint_violations_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixtures::seed(1).await;
        let cfg = config(&dir);
        let orphan = click(&fx);
        fx.store.delete_campaign(fx.campaign.id).await.unwrap();

        let (_outbox, worker) =
            Outbox::new(&cfg, Arc::new(fx.store.clone()), Metrics::new().unwrap());
        worker
            .deliver(orphan.clone(), &CancellationToken::new())
            .await;
        assert!(!cfg.spool_path.exists());

        tokio::fs::write(&cfg.spool_path, spool_lines(&[orphan]))
            .await
            .unwrap();
        let report = worker.replay_spool().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                discarded: 1,
                ..Default::default()
            }
        );
        assert!(!cfg.spool_path.exists());
        assert!(!dir.path().join("outbox.jsonl.replaying").exists());
    }
}
