//! Resource Ledger
//!
//! Single source of truth for every resource a campaign created. Written
//! concurrently by the event aggregator (creations reported by workloads) and
//! the cleanup enforcer (deletions). All writes are merges keyed by
//! `resource_id`, so no lock is needed across writers: a merge can only move a
//! record forward, never erase what an earlier write recorded.

use crate::ports::TaggedResource;
use crate::types::CampaignId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Reported created by its workload
    Created,
    /// Observed in the tenant (index query or adoption)
    Exists,
    /// Every deletion attempt failed; recorded in the cleanup report
    DeletionFailed,
    Deleted,
}

impl RecordStatus {
    /// Monotonic order used by merges
    #[inline]
    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Exists => 1,
            Self::DeletionFailed => 2,
            Self::Deleted => 3,
        }
    }

    /// No further cleanup action will change this record
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::DeletionFailed)
    }
}

/// Tracked state of one externally created resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub resource_type: String,
    pub campaign_id: CampaignId,
    pub work_item: String,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub deletion_attempts: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ResourceRecord {
    /// Record for a resource a workload reported creating
    #[must_use]
    pub fn created(
        campaign_id: CampaignId,
        work_item: impl Into<String>,
        resource_id: impl Into<String>,
        resource_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let work_item = work_item.into();
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            tags: crate::ports::campaign_tags(&campaign_id.to_string(), &work_item, created_at),
            campaign_id,
            work_item,
            created_at,
            deleted_at: None,
            status: RecordStatus::Created,
            deletion_attempts: 0,
            parent_id: None,
            last_error: None,
        }
    }

    /// Record for a resource found in the tagged index
    #[must_use]
    pub fn observed(campaign_id: CampaignId, resource: &TaggedResource, now: DateTime<Utc>) -> Self {
        let created_at = resource
            .tags
            .get(crate::ports::tags::CREATED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or(now, |at| at.with_timezone(&Utc));
        Self {
            resource_id: resource.resource_id.clone(),
            resource_type: resource.resource_type.clone(),
            campaign_id,
            work_item: resource.work_item().unwrap_or_default().to_string(),
            tags: resource.tags.clone(),
            created_at,
            deleted_at: None,
            status: RecordStatus::Exists,
            deletion_attempts: 0,
            parent_id: resource.parent_id.clone(),
            last_error: None,
        }
    }

    /// Fold `other` into `self`. Commutative, associative and idempotent for
    /// everything except `last_error`, where the newer write wins.
    pub fn merge(&mut self, other: &ResourceRecord) {
        if other.status.rank() > self.status.rank() {
            self.status = other.status;
        }
        self.deletion_attempts = self.deletion_attempts.max(other.deletion_attempts);
        self.created_at = self.created_at.min(other.created_at);
        self.deleted_at = match (self.deleted_at, other.deleted_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if self.resource_type.is_empty() {
            self.resource_type.clone_from(&other.resource_type);
        }
        if self.work_item.is_empty() {
            self.work_item.clone_from(&other.work_item);
        }
        if self.parent_id.is_none() {
            self.parent_id.clone_from(&other.parent_id);
        }
        for (key, value) in &other.tags {
            self.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        if other.last_error.is_some() {
            self.last_error.clone_from(&other.last_error);
        }
    }
}

/// Counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub created: usize,
    pub exists: usize,
    pub deleted: usize,
    pub deletion_failed: usize,
}

impl LedgerCounts {
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.created + self.exists + self.deleted + self.deletion_failed
    }

    /// Records still present in the tenant
    #[inline]
    #[must_use]
    pub fn live(&self) -> usize {
        self.created + self.exists
    }
}

/// Concurrent resource ledger
#[derive(Debug, Default)]
pub struct ResourceLedger {
    records: DashMap<String, ResourceRecord>,
}

impl ResourceLedger {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a checkpoint snapshot
    #[must_use]
    pub fn from_snapshot(records: Vec<ResourceRecord>) -> Self {
        let ledger = Self::new();
        for record in records {
            ledger.merge(record);
        }
        ledger
    }

    /// Insert or fold into the existing record
    pub fn merge(&self, record: ResourceRecord) {
        self.records
            .entry(record.resource_id.clone())
            .and_modify(|existing| existing.merge(&record))
            .or_insert(record);
    }

    /// Mark deleted at `at`, creating a record if the id was never seen
    pub fn mark_deleted(&self, template: &ResourceRecord, at: DateTime<Utc>) {
        let mut update = template.clone();
        update.status = RecordStatus::Deleted;
        update.deleted_at = Some(at);
        update.last_error = None;
        self.merge(update);
    }

    /// Count a failed deletion attempt without changing status
    pub fn record_attempt(&self, resource_id: &str, attempts: u32, error: &str) {
        if let Some(mut record) = self.records.get_mut(resource_id) {
            record.deletion_attempts = record.deletion_attempts.max(attempts);
            record.last_error = Some(error.to_string());
        }
    }

    /// Record that every deletion attempt was exhausted
    pub fn mark_failed(&self, resource_id: &str, attempts: u32, error: &str) {
        if let Some(mut record) = self.records.get_mut(resource_id) {
            let update = ResourceRecord {
                status: RecordStatus::DeletionFailed,
                deletion_attempts: attempts,
                last_error: Some(error.to_string()),
                ..record.clone()
            };
            record.merge(&update);
        }
    }

    #[must_use]
    pub fn get(&self, resource_id: &str) -> Option<ResourceRecord> {
        self.records.get(resource_id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records ordered by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        records
    }

    /// Records still in `created` or `exists`
    #[must_use]
    pub fn live(&self) -> Vec<ResourceRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect()
    }

    /// Whether every record of `work_item` is deleted or finally failed
    #[must_use]
    pub fn work_item_settled(&self, work_item: &str) -> bool {
        self.records
            .iter()
            .filter(|r| r.work_item == work_item)
            .all(|r| r.status.is_terminal())
    }

    #[must_use]
    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for record in self.records.iter() {
            match record.status {
                RecordStatus::Created => counts.created += 1,
                RecordStatus::Exists => counts.exists += 1,
                RecordStatus::Deleted => counts.deleted += 1,
                RecordStatus::DeletionFailed => counts.deletion_failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: &str, status: RecordStatus, attempts: u32) -> ResourceRecord {
        let mut r = ResourceRecord::created(
            CampaignId(ulid::Ulid::nil()),
            "w1",
            id,
            "storage_account",
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        r.status = status;
        r.deletion_attempts = attempts;
        r
    }

    #[test]
    fn deleted_is_absorbing() {
        let ledger = ResourceLedger::new();
        ledger.merge(record("r1", RecordStatus::Created, 0));
        ledger.mark_deleted(&record("r1", RecordStatus::Created, 0), Utc::now());
        ledger.merge(record("r1", RecordStatus::Exists, 2));

        let r = ledger.get("r1").unwrap();
        assert_eq!(r.status, RecordStatus::Deleted);
        assert_eq!(r.deletion_attempts, 2);
        assert!(r.deleted_at.is_some());
    }

    #[test]
    fn failed_can_still_become_deleted() {
        let ledger = ResourceLedger::new();
        ledger.merge(record("r1", RecordStatus::Exists, 0));
        ledger.mark_failed("r1", 7, "forbidden");
        assert_eq!(ledger.get("r1").unwrap().status, RecordStatus::DeletionFailed);

        ledger.mark_deleted(&record("r1", RecordStatus::Exists, 0), Utc::now());
        let r = ledger.get("r1").unwrap();
        assert_eq!(r.status, RecordStatus::Deleted);
        assert_eq!(r.deletion_attempts, 7);
    }

    #[test]
    fn settled_per_work_item() {
        let ledger = ResourceLedger::new();
        ledger.merge(record("r1", RecordStatus::Deleted, 1));
        ledger.merge(record("r2", RecordStatus::Exists, 0));
        assert!(!ledger.work_item_settled("w1"));
        ledger.mark_failed("r2", 3, "locked");
        assert!(ledger.work_item_settled("w1"));
        assert!(ledger.work_item_settled("nothing-here"));

        let counts = ledger.counts();
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.deletion_failed, 1);
        assert_eq!(counts.live(), 0);
    }

    fn status_strategy() -> impl Strategy<Value = RecordStatus> {
        prop_oneof![
            Just(RecordStatus::Created),
            Just(RecordStatus::Exists),
            Just(RecordStatus::DeletionFailed),
            Just(RecordStatus::Deleted),
        ]
    }

    proptest! {
        #[test]
        fn prop_merge_order_does_not_matter(
            updates in prop::collection::vec((status_strategy(), 0u32..10), 1..12)
        ) {
            let forward = ResourceLedger::new();
            let backward = ResourceLedger::new();
            for (status, attempts) in &updates {
                forward.merge(record("r", *status, *attempts));
            }
            for (status, attempts) in updates.iter().rev() {
                backward.merge(record("r", *status, *attempts));
            }
            let a = forward.get("r").unwrap();
            let b = backward.get("r").unwrap();
            prop_assert_eq!(a.status, b.status);
            prop_assert_eq!(a.deletion_attempts, b.deletion_attempts);

            let max_rank = updates.iter().map(|(s, _)| s.rank()).max().unwrap();
            prop_assert_eq!(a.status.rank(), max_rank);
        }
    }
}
