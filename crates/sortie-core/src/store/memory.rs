//! In-process store
//!
//! Survives an orchestrator being dropped and rebuilt, which is what the
//! resume tests and the simulator need. Not durable across processes.

use super::{chain_onto, CampaignStore};
use crate::context::{CampaignContext, CampaignReport};
use crate::error::StoreError;
use crate::events::{verify_chain, ChainedEvent, LogEvent};
use crate::types::CampaignId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Store backed by concurrent maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: DashMap<CampaignId, CampaignContext>,
    events: DashMap<CampaignId, Arc<Mutex<Vec<ChainedEvent>>>>,
    reports: DashMap<CampaignId, CampaignReport>,
    checkpoint_writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints written so far
    #[must_use]
    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::Relaxed)
    }

    fn log(&self, id: &CampaignId) -> Arc<Mutex<Vec<ChainedEvent>>> {
        Arc::clone(self.events.entry(*id).or_default().value())
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn save_checkpoint(&self, context: &CampaignContext) -> Result<(), StoreError> {
        self.checkpoints.insert(context.campaign.id, context.clone());
        self.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_checkpoint(&self, id: &CampaignId) -> Result<Option<CampaignContext>, StoreError> {
        Ok(self.checkpoints.get(id).map(|c| c.value().clone()))
    }

    async fn append_events(&self, id: &CampaignId, events: &[LogEvent]) -> Result<u64, StoreError> {
        let log = self.log(id);
        let mut log = log.lock();
        let linked = chain_onto(log.last(), events)?;
        log.extend(linked);
        Ok(log.len() as u64)
    }

    async fn load_events(&self, id: &CampaignId) -> Result<Vec<ChainedEvent>, StoreError> {
        let entries = match self.events.get(id) {
            Some(log) => log.lock().clone(),
            None => Vec::new(),
        };
        verify_chain(&entries)?;
        Ok(entries)
    }

    async fn save_report(&self, report: &CampaignReport) -> Result<(), StoreError> {
        self.reports.insert(report.campaign.id, report.clone());
        Ok(())
    }

    async fn load_report(&self, id: &CampaignId) -> Result<Option<CampaignReport>, StoreError> {
        Ok(self.reports.get(id).map(|r| r.value().clone()))
    }

    async fn list_campaigns(&self) -> Result<Vec<CampaignId>, StoreError> {
        let mut ids: Vec<_> = self.checkpoints.iter().map(|c| *c.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, Severity};

    #[tokio::test]
    async fn appends_form_one_chain() {
        let store = MemoryStore::new();
        let id = CampaignId::new();
        let event = |seq| LogEvent::new(EventKind::Operation, id.to_string(), "w1", Severity::Info, "op").with_sequence(seq);

        assert_eq!(store.append_events(&id, &[event(1), event(2)]).await.unwrap(), 2);
        assert_eq!(store.append_events(&id, &[event(3)]).await.unwrap(), 3);

        let log = store.load_events(&id).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].prev_hash, log[1].hash);
        assert!(store.load_events(&CampaignId::new()).await.unwrap().is_empty());
    }
}
