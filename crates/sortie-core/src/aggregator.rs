//! Event Aggregator
//!
//! Drains the at-least-once event bus into the persistent log and the
//! resource ledger. A message is acknowledged only after its event is durably
//! appended, so a crash between the two causes a redelivery that the dedup
//! set absorbs.

use crate::error::{SortieError, StoreError};
use crate::events::{EventKey, EventKind, LogEvent};
use crate::ledger::{ResourceLedger, ResourceRecord};
use crate::ports::EventBus;
use crate::store::CampaignStore;
use crate::types::CampaignId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Read model for one work item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemProgress {
    pub last_event: Option<EventKind>,
    pub last_seen: Option<DateTime<Utc>>,
    /// The workload reported `cleanup_complete`
    pub completed: bool,
    pub events: usize,
    pub errors: usize,
}

/// What one `pump` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub foreign: usize,
}

/// Bus consumer feeding the log and the ledger
pub struct EventAggregator {
    campaign_id: CampaignId,
    bus: Arc<dyn EventBus>,
    store: Arc<dyn CampaignStore>,
    ledger: Arc<ResourceLedger>,
    batch_size: usize,
    seen: Mutex<HashSet<EventKey>>,
    progress: DashMap<String, WorkItemProgress>,
}

impl EventAggregator {
    #[must_use]
    pub fn new(
        campaign_id: CampaignId,
        bus: Arc<dyn EventBus>,
        store: Arc<dyn CampaignStore>,
        ledger: Arc<ResourceLedger>,
        batch_size: usize,
    ) -> Self {
        Self {
            campaign_id,
            bus,
            store,
            ledger,
            batch_size: batch_size.max(1),
            seen: Mutex::new(HashSet::new()),
            progress: DashMap::new(),
        }
    }

    /// Rebuild dedup state and read models from the persisted log
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let entries = self.store.load_events(&self.campaign_id).await?;
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            seen.insert(entry.event.key());
            self.apply(&entry.event);
        }
        *self.seen.lock() = seen;
        debug!(events = entries.len(), "Event log replayed");
        Ok(entries.len())
    }

    /// Drain everything currently on the bus
    #[instrument(skip(self), fields(campaign_id = %self.campaign_id))]
    pub async fn pump(&self) -> Result<PumpStats, SortieError> {
        let mut stats = PumpStats::default();
        loop {
            let deliveries = self.bus.receive(self.batch_size).await?;
            if deliveries.is_empty() {
                break;
            }
            stats.received += deliveries.len();

            let mut fresh = Vec::new();
            {
                let mut seen = self.seen.lock();
                for delivery in &deliveries {
                    let event: LogEvent = match serde_json::from_str(&delivery.payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(delivery_id = delivery.delivery_id, error = %e, "Dropping malformed event");
                            stats.malformed += 1;
                            continue;
                        }
                    };
                    if event.campaign_id != self.campaign_id.to_string() {
                        stats.foreign += 1;
                        continue;
                    }
                    if seen.insert(event.key()) {
                        fresh.push(event);
                    } else {
                        stats.duplicates += 1;
                    }
                }
            }

            if !fresh.is_empty() {
                if let Err(e) = self.store.append_events(&self.campaign_id, &fresh).await {
                    let mut seen = self.seen.lock();
                    for event in &fresh {
                        seen.remove(&event.key());
                    }
                    return Err(e.into());
                }
                for event in &fresh {
                    self.apply(event);
                }
                stats.applied += fresh.len();
            }

            for delivery in &deliveries {
                if let Err(e) = self.bus.ack(delivery.delivery_id).await {
                    warn!(delivery_id = delivery.delivery_id, error = %e, "Ack failed, expecting redelivery");
                }
            }
        }

        metrics::counter!("sortie_events_applied_total").increment(stats.applied as u64);
        metrics::counter!("sortie_events_duplicate_total").increment(stats.duplicates as u64);
        if stats.received > 0 {
            debug!(
                received = stats.received,
                applied = stats.applied,
                duplicates = stats.duplicates,
                malformed = stats.malformed,
                "Event bus drained"
            );
        }
        Ok(stats)
    }

    fn apply(&self, event: &LogEvent) {
        {
            let mut progress = self.progress.entry(event.work_item.clone()).or_default();
            progress.events += 1;
            if progress.last_seen.map_or(true, |seen| event.timestamp >= seen) {
                progress.last_seen = Some(event.timestamp);
                progress.last_event = Some(event.event_type);
            }
            match event.event_type {
                EventKind::CleanupComplete => progress.completed = true,
                EventKind::Error => progress.errors += 1,
                _ => {}
            }
        }

        let Some(resource_id) = event.resource_id.as_deref() else {
            return;
        };
        let mut record = ResourceRecord::created(
            self.campaign_id,
            event.work_item.as_str(),
            resource_id,
            event.resource_type.clone().unwrap_or_default(),
            event.timestamp,
        );
        record.parent_id = event.parent_id();

        match event.event_type {
            EventKind::ResourceCreated => self.ledger.merge(record),
            EventKind::ResourceDeleted => self.ledger.mark_deleted(&record, event.timestamp),
            EventKind::Error if is_failed_delete(event) => {
                self.ledger.merge(record);
                self.ledger.record_attempt(resource_id, 1, &event.message);
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn progress(&self, work_item: &str) -> Option<WorkItemProgress> {
        self.progress.get(work_item).map(|p| p.value().clone())
    }

    #[must_use]
    pub fn all_progress(&self) -> BTreeMap<String, WorkItemProgress> {
        self.progress
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect()
    }
}

/// Workload reported that its own deletion of a resource failed
fn is_failed_delete(event: &LogEvent) -> bool {
    event.details.get("action").and_then(serde_json::Value::as_str) == Some("delete")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::events::Severity;
    use crate::ledger::RecordStatus;
    use crate::ports::{Delivery, MockEventBus};
    use crate::store::MemoryStore;

    fn payload(event: &LogEvent) -> String {
        serde_json::to_string(event).unwrap()
    }

    fn bus_with(batches: Vec<Vec<Delivery>>) -> MockEventBus {
        let batches = Mutex::new(batches.into_iter());
        let mut bus = MockEventBus::new();
        bus.expect_receive()
            .returning(move |_| Ok(batches.lock().next().unwrap_or_default()));
        bus.expect_ack().returning(|_| Ok(()));
        bus
    }

    #[tokio::test]
    async fn redelivered_events_apply_once() {
        let id = CampaignId::new();
        let created = LogEvent::new(EventKind::ResourceCreated, id.to_string(), "w1", Severity::Info, "sa")
            .with_resource("/rg/sa", "storage_account")
            .with_sequence(1);
        let deliveries = vec![
            Delivery { delivery_id: 1, payload: payload(&created) },
            Delivery { delivery_id: 2, payload: payload(&created) },
        ];
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(ResourceLedger::new());
        let aggregator = EventAggregator::new(
            id,
            Arc::new(bus_with(vec![deliveries.clone(), deliveries])),
            store.clone(),
            ledger.clone(),
            16,
        );

        let stats = aggregator.pump().await.unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.duplicates, 3);
        assert_eq!(store.load_events(&id).await.unwrap().len(), 1);
        assert_eq!(ledger.get("/rg/sa").unwrap().status, RecordStatus::Created);
        assert_eq!(aggregator.progress("w1").unwrap().events, 1);
    }

    #[tokio::test]
    async fn malformed_and_foreign_events_are_acked_and_skipped() {
        let id = CampaignId::new();
        let foreign = LogEvent::new(EventKind::Started, "someone-else", "w1", Severity::Info, "hi");
        let deliveries = vec![
            Delivery { delivery_id: 1, payload: "{not json".into() },
            Delivery { delivery_id: 2, payload: payload(&foreign) },
        ];
        let mut bus = MockEventBus::new();
        let batches = Mutex::new(vec![deliveries].into_iter());
        bus.expect_receive()
            .returning(move |_| Ok(batches.lock().next().unwrap_or_default()));
        bus.expect_ack().times(2).returning(|_| Ok(()));
        let aggregator = EventAggregator::new(
            id,
            Arc::new(bus),
            Arc::new(MemoryStore::new()),
            Arc::new(ResourceLedger::new()),
            16,
        );

        let stats = aggregator.pump().await.unwrap();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.foreign, 1);
        assert_eq!(stats.applied, 0);
    }

    #[tokio::test]
    async fn restore_rebuilds_dedup_state() {
        let id = CampaignId::new();
        let store = Arc::new(MemoryStore::new());
        let done = LogEvent::new(EventKind::CleanupComplete, id.to_string(), "w1", Severity::Info, "done")
            .with_sequence(9);
        store.append_events(&id, &[done.clone()]).await.unwrap();

        let aggregator = EventAggregator::new(
            id,
            Arc::new(bus_with(vec![vec![Delivery { delivery_id: 5, payload: payload(&done) }]])),
            store.clone(),
            Arc::new(ResourceLedger::new()),
            16,
        );
        assert_eq!(aggregator.restore().await.unwrap(), 1);
        assert!(aggregator.progress("w1").unwrap().completed);

        let stats = aggregator.pump().await.unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(store.load_events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deletion_and_failed_delete_update_ledger() {
        let id = CampaignId::new();
        let created = LogEvent::new(EventKind::ResourceCreated, id.to_string(), "w1", Severity::Info, "vm")
            .with_resource("/rg/vm", "virtual_machine")
            .with_sequence(1);
        let failed = LogEvent::new(EventKind::Error, id.to_string(), "w1", Severity::Error, "locked")
            .with_resource("/rg/vm", "virtual_machine")
            .with_detail("action", serde_json::json!("delete"))
            .with_sequence(2);
        let deleted_other = LogEvent::new(EventKind::ResourceDeleted, id.to_string(), "w1", Severity::Info, "nic")
            .with_resource("/rg/nic", "network_interface")
            .with_sequence(3);
        let batch = [created, failed, deleted_other]
            .iter()
            .enumerate()
            .map(|(i, e)| Delivery { delivery_id: i as u64, payload: payload(e) })
            .collect();
        let ledger = Arc::new(ResourceLedger::new());
        let aggregator = EventAggregator::new(
            id,
            Arc::new(bus_with(vec![batch])),
            Arc::new(MemoryStore::new()),
            ledger.clone(),
            16,
        );
        aggregator.pump().await.unwrap();

        let vm = ledger.get("/rg/vm").unwrap();
        assert_eq!(vm.status, RecordStatus::Created);
        assert_eq!(vm.deletion_attempts, 1);
        assert_eq!(vm.last_error.as_deref(), Some("locked"));
        assert_eq!(ledger.get("/rg/nic").unwrap().status, RecordStatus::Deleted);
        assert_eq!(aggregator.progress("w1").unwrap().errors, 1);
    }

    #[tokio::test]
    async fn bus_failure_propagates() {
        let mut bus = MockEventBus::new();
        bus.expect_receive()
            .returning(|_| Err(ApiError::Transient("broker down".into())));
        let aggregator = EventAggregator::new(
            CampaignId::new(),
            Arc::new(bus),
            Arc::new(MemoryStore::new()),
            Arc::new(ResourceLedger::new()),
            16,
        );
        let err = aggregator.pump().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
