//! Prometheus metrics for the tracking core
//!
//! Metrics live in a registry owned by the application rather than the
//! process-wide default, so several instances can coexist in one test binary.

use clariphish_common::types::EventKind;
use prometheus::{opts, CounterVec, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Which public trigger received an unresolvable token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Open,
    Click,
    Submit,
    Report,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Open => "open",
            Trigger::Click => "click",
            Trigger::Submit => "submit",
            Trigger::Report => "report",
        }
    }
}

/// Tracking, dispatch and outbox counters
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    /// Labels: `kind`
    tracking_events: CounterVec,

    /// Labels: `trigger`
    tracking_unresolved: CounterVec,

    /// Labels: `kind`
    tracking_duplicates: CounterVec,

    /// Labels: `outcome` (sent, error)
    dispatch_sends: CounterVec,

    outbox_retries: IntCounter,
    outbox_dropped: IntCounter,
}

impl Metrics {
    /// Create and register all metrics in a fresh registry
    ///
    /// # Errors
    ///
    /// Returns error if metric registration fails
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tracking_events = CounterVec::new(
            opts!(
                "clariphish_tracking_events_total",
                "Tracking events stored, by kind"
            ),
            &["kind"],
        )?;
        let tracking_unresolved = CounterVec::new(
            opts!(
                "clariphish_tracking_unresolved_total",
                "Tracking requests whose token did not resolve"
            ),
            &["trigger"],
        )?;
        let tracking_duplicates = CounterVec::new(
            opts!(
                "clariphish_tracking_duplicates_total",
                "Idempotent-once events suppressed as duplicates"
            ),
            &["kind"],
        )?;
        let dispatch_sends = CounterVec::new(
            opts!(
                "clariphish_dispatch_sends_total",
                "Campaign emails attempted, by outcome"
            ),
            &["outcome"],
        )?;
        let outbox_retries = IntCounter::new(
            "clariphish_outbox_retries_total",
            "Tracking writes retried from the outbox",
        )?;
        let outbox_dropped = IntCounter::new(
            "clariphish_outbox_dropped_total",
            "Tracking writes that could be neither stored nor spooled",
        )?;

        registry.register(Box::new(tracking_events.clone()))?;
        registry.register(Box::new(tracking_unresolved.clone()))?;
        registry.register(Box::new(tracking_duplicates.clone()))?;
        registry.register(Box::new(dispatch_sends.clone()))?;
        registry.register(Box::new(outbox_retries.clone()))?;
        registry.register(Box::new(outbox_dropped.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            tracking_events,
            tracking_unresolved,
            tracking_duplicates,
            dispatch_sends,
            outbox_retries,
            outbox_dropped,
        })
    }

    pub fn record_event(&self, kind: EventKind) {
        self.tracking_events
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn record_unresolved(&self, trigger: Trigger) {
        self.tracking_unresolved
            .with_label_values(&[trigger.as_str()])
            .inc();
    }

    pub fn record_duplicate(&self, kind: EventKind) {
        self.tracking_duplicates
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn record_send(&self, sent: bool) {
        let outcome = if sent { "sent" } else { "error" };
        self.dispatch_sends.with_label_values(&[outcome]).inc();
    }

    pub fn record_outbox_retry(&self) {
        self.outbox_retries.inc();
    }

    pub fn record_outbox_dropped(&self) {
        self.outbox_dropped.inc();
    }

    /// Current value of the unresolved-token counter for `trigger`
    pub fn unresolved_count(&self, trigger: Trigger) -> u64 {
        self.tracking_unresolved
            .with_label_values(&[trigger.as_str()])
            .get() as u64
    }

    /// Export metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families)
    }
}
