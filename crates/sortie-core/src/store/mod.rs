//! Campaign persistence
//!
//! Three kinds of documents per campaign:
//! - the latest checkpoint of the [`CampaignContext`], overwritten on every transition
//! - the append-only event log, hash-chained so tampering or truncation is detected
//! - the final [`CampaignReport`], written once

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::context::{CampaignContext, CampaignReport};
use crate::error::StoreError;
use crate::events::{ChainedEvent, LogEvent};
use crate::types::CampaignId;
use async_trait::async_trait;

/// Durable campaign storage
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Replace the checkpoint for `context.campaign.id`
    async fn save_checkpoint(&self, context: &CampaignContext) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, id: &CampaignId) -> Result<Option<CampaignContext>, StoreError>;

    /// Append events in order; returns the new log length
    async fn append_events(&self, id: &CampaignId, events: &[LogEvent]) -> Result<u64, StoreError>;

    /// Whole log, chain verified
    async fn load_events(&self, id: &CampaignId) -> Result<Vec<ChainedEvent>, StoreError>;

    async fn save_report(&self, report: &CampaignReport) -> Result<(), StoreError>;

    async fn load_report(&self, id: &CampaignId) -> Result<Option<CampaignReport>, StoreError>;

    /// Every campaign with a checkpoint
    async fn list_campaigns(&self) -> Result<Vec<CampaignId>, StoreError>;
}

/// Link `events` onto a chain whose last entry is `tail`
pub(crate) fn chain_onto(
    tail: Option<&ChainedEvent>,
    events: &[LogEvent],
) -> Result<Vec<ChainedEvent>, StoreError> {
    let (mut index, mut prev) = match tail {
        Some(last) => (last.index + 1, last.hash.clone()),
        None => (0, crate::events::GENESIS_HASH.to_string()),
    };
    let mut linked = Vec::with_capacity(events.len());
    for event in events {
        let entry = ChainedEvent::link(index, &prev, event.clone())?;
        prev.clone_from(&entry.hash);
        index += 1;
        linked.push(entry);
    }
    Ok(linked)
}
