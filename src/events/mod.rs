//! Event catalog integrations.
//!
//! Defines the `EventCatalog` trait through which placement, cancellation
//! and settlement read event state, plus two implementations:
//! - `InMemoryCatalog`: fixture-backed, driven by operators and tests
//! - `HttpCatalog`: read-only client for a remote event service

pub mod http;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{
    EventId, EventSnapshot, EventStatus, Outcome, Resolution, SettlementTrigger, WalletError,
    WalletResult,
};

pub use http::HttpCatalog;

/// Read-only source of event snapshots.
///
/// Implementors must return the state as of the call; the wallet never
/// caches snapshots across operations.
#[async_trait]
pub trait EventCatalog: Send + Sync {
    /// Current snapshot of an event, `None` if the catalog does not know it.
    async fn snapshot(&self, event_id: &str) -> WalletResult<Option<EventSnapshot>>;

    /// Catalog name for logging and identification.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// In-memory catalog
// ---------------------------------------------------------------------------

/// Catalog held in memory. Resolving an event emits a `SettlementTrigger`
/// on the attached channel.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    events: RwLock<HashMap<EventId, EventSnapshot>>,
    triggers: Option<mpsc::Sender<SettlementTrigger>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the channel that receives settlement triggers.
    pub fn with_triggers(mut self, triggers: mpsc::Sender<SettlementTrigger>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Load events from a JSON array of snapshots.
    pub fn from_fixture(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read event fixture: {path}"))?;
        let events: Vec<EventSnapshot> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse event fixture: {path}"))?;

        let catalog = Self::new();
        for event in events {
            catalog.upsert(event);
        }
        info!(path, events = catalog.len(), "Event fixture loaded");
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All events ordered by start time.
    pub fn events(&self) -> Vec<EventSnapshot> {
        let mut events: Vec<EventSnapshot> = self.read().values().cloned().collect();
        events.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        events
    }

    /// Triggers for every event that is already resolved. Settlement is
    /// idempotent, so re-sending these at startup is safe.
    pub fn pending_resolutions(&self) -> Vec<SettlementTrigger> {
        self.events()
            .iter()
            .filter_map(|e| e.resolution().map(|r| SettlementTrigger::new(&e.event_id, r)))
            .collect()
    }

    pub fn upsert(&self, event: EventSnapshot) {
        self.write().insert(event.event_id.clone(), event);
    }

    /// Mark an event as in play.
    pub fn start(&self, event_id: &str) -> WalletResult<()> {
        self.update(event_id, |e| e.status = EventStatus::Live)
    }

    /// Declare the winning outcome and request settlement.
    pub async fn finish(&self, event_id: &str, outcome: Outcome) -> WalletResult<SettlementTrigger> {
        self.update(event_id, |e| {
            e.status = EventStatus::Finished;
            e.outcome = Some(outcome);
        })?;
        self.emit(SettlementTrigger::new(event_id, Resolution::Finished(outcome)))
            .await
    }

    /// Void an event and request refunds.
    pub async fn void(&self, event_id: &str) -> WalletResult<SettlementTrigger> {
        self.update(event_id, |e| {
            e.status = EventStatus::Voided;
            e.outcome = None;
        })?;
        self.emit(SettlementTrigger::new(event_id, Resolution::Voided))
            .await
    }

    fn update(&self, event_id: &str, change: impl FnOnce(&mut EventSnapshot)) -> WalletResult<()> {
        let mut events = self.write();
        let event = events
            .get_mut(event_id)
            .ok_or_else(|| WalletError::EventNotFound(event_id.to_string()))?;
        change(event);
        info!(event_id, status = %event.status, "Event updated");
        Ok(())
    }

    async fn emit(&self, trigger: SettlementTrigger) -> WalletResult<SettlementTrigger> {
        match &self.triggers {
            Some(tx) => {
                if tx.send(trigger.clone()).await.is_err() {
                    warn!(event_id = %trigger.event_id, "Settlement channel closed, trigger dropped");
                    return Err(WalletError::Catalog(
                        "settlement channel closed".to_string(),
                    ));
                }
            }
            None => warn!(event_id = %trigger.event_id, "No settlement channel attached"),
        }
        Ok(trigger)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EventId, EventSnapshot>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<EventId, EventSnapshot>> {
        self.events.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventCatalog for InMemoryCatalog {
    async fn snapshot(&self, event_id: &str) -> WalletResult<Option<EventSnapshot>> {
        Ok(self.read().get(event_id).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn event(id: &str) -> EventSnapshot {
        EventSnapshot {
            event_id: id.to_string(),
            name: "Home vs Away".to_string(),
            odds: BTreeMap::from([
                (Outcome::Home, dec!(2.5)),
                (Outcome::Draw, dec!(3.2)),
                (Outcome::Away, dec!(2.8)),
            ]),
            start_time: Utc::now() + Duration::hours(2),
            status: EventStatus::Scheduled,
            outcome: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert(event("e1"));

        let snap = catalog.snapshot("e1").await.unwrap().unwrap();
        assert_eq!(snap.coefficient(Outcome::Home), Some(dec!(2.5)));
        assert!(catalog.snapshot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_emits_trigger() {
        let (tx, mut rx) = mpsc::channel(4);
        let catalog = InMemoryCatalog::new().with_triggers(tx);
        catalog.upsert(event("e1"));

        catalog.finish("e1", Outcome::Away).await.unwrap();
        let trigger = rx.recv().await.unwrap();
        assert_eq!(trigger.event_id, "e1");
        assert_eq!(trigger.resolution, Resolution::Finished(Outcome::Away));

        let snap = catalog.snapshot("e1").await.unwrap().unwrap();
        assert_eq!(snap.status, EventStatus::Finished);
        assert_eq!(snap.resolution(), Some(Resolution::Finished(Outcome::Away)));
    }

    #[tokio::test]
    async fn test_void_and_start() {
        let (tx, mut rx) = mpsc::channel(4);
        let catalog = InMemoryCatalog::new().with_triggers(tx);
        catalog.upsert(event("e1"));
        catalog.upsert(event("e2"));

        catalog.start("e2").unwrap();
        assert_eq!(
            catalog.snapshot("e2").await.unwrap().unwrap().status,
            EventStatus::Live
        );

        catalog.void("e1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().resolution, Resolution::Voided);
        assert_eq!(catalog.pending_resolutions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let catalog = InMemoryCatalog::new();
        let err = catalog.finish("nope", Outcome::Home).await.unwrap_err();
        assert_eq!(err, WalletError::EventNotFound("nope".into()));
        assert!(catalog.start("nope").is_err());
    }

    #[test]
    fn test_fixture_loads() {
        let catalog = InMemoryCatalog::from_fixture("fixtures/events.json").unwrap();
        assert_eq!(catalog.len(), 3);
        let events = catalog.events();
        assert!(events.windows(2).all(|w| w[0].start_time <= w[1].start_time));
        let pending = catalog.pending_resolutions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, "evt-0999");
    }
}
