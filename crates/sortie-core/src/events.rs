//! Workload event schema and the append-only, hash-chained event log
//!
//! Workloads publish JSON events on the bus:
//!
//! ```json
//! {"event_type": "resource_created", "timestamp": "...", "work_item": "...",
//!  "campaign_id": "...", "severity": "info", "message": "...",
//!  "resource_id": "...", "resource_type": "...", "details": {}, "sequence": 3}
//! ```
//!
//! Event kinds the engine does not know deserialize to [`EventKind::Unknown`]
//! instead of failing, so newer workloads can talk to older engines.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Closed set of event kinds plus a forward-compatible catch-all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    ResourceCreated,
    ResourceDeleted,
    Operation,
    CleanupComplete,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    Critical,
}

/// One event reported by a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub work_item: String,
    pub campaign_id: String,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Per-work-item counter assigned by the publisher
    #[serde(default)]
    pub sequence: u64,
}

impl LogEvent {
    /// Create an event with no resource reference
    #[must_use]
    pub fn new(
        event_type: EventKind,
        campaign_id: impl Into<String>,
        work_item: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            work_item: work_item.into(),
            campaign_id: campaign_id.into(),
            severity,
            message: message.into(),
            resource_id: None,
            resource_type: None,
            details: BTreeMap::new(),
            sequence: 0,
        }
    }

    /// With resource reference
    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self.resource_type = Some(resource_type.into());
        self
    }

    /// With publisher sequence number
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// With explicit timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// With a detail entry
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Deduplication key for at-least-once delivery
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey {
            work_item: self.work_item.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }

    /// Parent resource named in details, if any
    #[must_use]
    pub fn parent_id(&self) -> Option<String> {
        self.details
            .get("parent_id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

/// Identity of an event across redeliveries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub work_item: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// Persisted form of an event, chained to its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedEvent {
    pub index: u64,
    pub event: LogEvent,
    pub prev_hash: String,
    pub hash: String,
}

/// Hash of the empty log
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

impl ChainedEvent {
    /// Chain `event` after an entry with `prev_hash` at position `index`
    pub fn link(index: u64, prev_hash: &str, event: LogEvent) -> Result<Self, StoreError> {
        let hash = compute_hash(index, prev_hash, &event)?;
        Ok(Self {
            index,
            event,
            prev_hash: prev_hash.to_string(),
            hash,
        })
    }
}

/// Check a persisted log is an unbroken chain
pub fn verify_chain(entries: &[ChainedEvent]) -> Result<(), StoreError> {
    let mut prev = GENESIS_HASH.to_string();
    for (position, entry) in entries.iter().enumerate() {
        if entry.index != position as u64 || entry.prev_hash != prev {
            return Err(StoreError::IntegrityViolation { index: position as u64 });
        }
        if compute_hash(entry.index, &entry.prev_hash, &entry.event)? != entry.hash {
            return Err(StoreError::IntegrityViolation { index: entry.index });
        }
        prev = entry.hash.clone();
    }
    Ok(())
}

fn compute_hash(index: u64, prev_hash: &str, event: &LogEvent) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    hasher.update(index.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(event)?);
    Ok(hex::encode(hasher.finalize()))
}
