//! Campaign context, report and status read model
//!
//! [`CampaignContext`] is the one value threaded through every phase and
//! checkpointed after every transition. Nothing the orchestrator needs to
//! resume lives anywhere else.

use crate::aggregator::WorkItemProgress;
use crate::cleanup::CleanupReport;
use crate::config::CampaignConfig;
use crate::events::EventKind;
use crate::ledger::{LedgerCounts, ResourceRecord};
use crate::types::{
    Campaign, CampaignId, CampaignStatus, Identity, IdentityStatus, Phase, WorkItemSelection, Workload,
    WorkloadStatus,
};
use crate::validator::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Checkpointed campaign state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignContext {
    pub campaign: Campaign,
    pub config: CampaignConfig,
    pub validation: Option<ValidationReport>,
    pub selections: Vec<WorkItemSelection>,
    /// By work item key
    pub identities: BTreeMap<String, Identity>,
    /// By work item key
    pub workloads: BTreeMap<String, Workload>,
    /// First error that failed each work item
    pub item_errors: BTreeMap<String, String>,
    /// Resources verification found alive
    pub remaining: Vec<ResourceRecord>,
    /// Ledger snapshot taken at the last checkpoint
    pub ledger: Vec<ResourceRecord>,
    pub cleanup: Option<CleanupReport>,
    /// Next monitoring wake-up
    pub next_wake_at: Option<DateTime<Utc>>,
    /// Times PROVISIONING has been entered, including resumes
    pub provisioning_attempts: u32,
    /// Why the campaign is heading for FAILED
    pub failure: Option<String>,
    /// Incremented on every checkpoint
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl CampaignContext {
    #[must_use]
    pub fn new(config: CampaignConfig, now: DateTime<Utc>) -> Self {
        let window = chrono::Duration::from_std(config.operating_window()).unwrap_or_default();
        Self {
            campaign: Campaign::new(now, window),
            config,
            validation: None,
            selections: Vec::new(),
            identities: BTreeMap::new(),
            workloads: BTreeMap::new(),
            item_errors: BTreeMap::new(),
            remaining: Vec::new(),
            ledger: Vec::new(),
            cleanup: None,
            next_wake_at: None,
            provisioning_attempts: 0,
            failure: None,
            revision: 0,
            updated_at: now,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> CampaignId {
        self.campaign.id
    }

    /// Record the first error for a work item
    pub fn fail_item(&mut self, work_item: &str, error: impl Into<String>) {
        self.item_errors
            .entry(work_item.to_string())
            .or_insert_with(|| error.into());
    }

    /// Work items that got a running compute unit
    #[must_use]
    pub fn deployed_count(&self) -> usize {
        self.workloads
            .values()
            .filter(|w| w.external_resource_id.is_some())
            .count()
    }

    /// Terminal status:
    /// - `failed` when validation or selection failed or nothing deployed
    /// - `partial` when any work item failed or timed out, or cleanup left survivors
    /// - `completed` otherwise
    #[must_use]
    pub fn final_status(&self) -> CampaignStatus {
        if self.failure.is_some() || self.deployed_count() == 0 {
            return CampaignStatus::Failed;
        }
        let item_failed = !self.item_errors.is_empty()
            || self
                .workloads
                .values()
                .any(|w| matches!(w.status, WorkloadStatus::Failed | WorkloadStatus::TimedOut));
        let cleanup_failed = self.cleanup.as_ref().is_some_and(|c| !c.is_clean());
        if item_failed || cleanup_failed {
            CampaignStatus::Partial
        } else {
            CampaignStatus::Completed
        }
    }

    /// Outcome row for every selected work item
    #[must_use]
    pub fn outcomes(&self, progress: &BTreeMap<String, WorkItemProgress>) -> Vec<WorkItemOutcome> {
        self.selections
            .iter()
            .map(|selection| {
                let key = &selection.catalog_key;
                let workload = self.workloads.get(key);
                let error = self
                    .item_errors
                    .get(key)
                    .cloned()
                    .or_else(|| workload.and_then(|w| w.error.clone()));
                WorkItemOutcome {
                    work_item: key.clone(),
                    category: selection.category.clone(),
                    identity: self.identities.get(key).map(|i| i.status),
                    workload: workload.map(|w| w.status),
                    events: progress.get(key).map_or(0, |p| p.events),
                    reported_complete: progress.get(key).is_some_and(|p| p.completed),
                    error,
                }
            })
            .collect()
    }
}

/// Final state of one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemOutcome {
    pub work_item: String,
    pub category: String,
    pub identity: Option<IdentityStatus>,
    pub workload: Option<WorkloadStatus>,
    pub events: usize,
    pub reported_complete: bool,
    pub error: Option<String>,
}

/// Written once when the campaign reaches a terminal phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign: Campaign,
    pub validation: Option<ValidationReport>,
    pub cleanup: Option<CleanupReport>,
    pub work_items: Vec<WorkItemOutcome>,
    /// Final disposition of every tracked resource
    pub resources: Vec<ResourceRecord>,
    pub failure: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Live status of one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemStatus {
    pub work_item: String,
    pub workload: Option<WorkloadStatus>,
    pub last_event: Option<EventKind>,
    pub last_seen: Option<DateTime<Utc>>,
    pub completed: bool,
}

/// Query surface for a running or finished campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub campaign_id: CampaignId,
    pub phase: Phase,
    pub status: CampaignStatus,
    pub scheduled_end_at: DateTime<Utc>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub work_items: Vec<WorkItemStatus>,
    pub resources: LedgerCounts,
    pub identities_live: usize,
    pub identities_deleted: usize,
    pub cleanup: Option<CleanupReport>,
}

impl StatusSnapshot {
    /// Build from a checkpoint and the aggregator read model
    #[must_use]
    pub fn from_context(
        context: &CampaignContext,
        progress: &BTreeMap<String, WorkItemProgress>,
        resources: LedgerCounts,
    ) -> Self {
        let work_items = context
            .selections
            .iter()
            .map(|selection| {
                let key = &selection.catalog_key;
                let seen = progress.get(key);
                WorkItemStatus {
                    work_item: key.clone(),
                    workload: context.workloads.get(key).map(|w| w.status),
                    last_event: seen.and_then(|p| p.last_event),
                    last_seen: seen.and_then(|p| p.last_seen),
                    completed: seen.is_some_and(|p| p.completed),
                }
            })
            .collect();
        Self {
            campaign_id: context.campaign.id,
            phase: context.campaign.phase,
            status: context.campaign.status,
            scheduled_end_at: context.campaign.scheduled_end_at,
            next_wake_at: context.next_wake_at,
            work_items,
            resources,
            identities_live: context.identities.values().filter(|i| i.status.is_live()).count(),
            identities_deleted: context
                .identities
                .values()
                .filter(|i| i.status == IdentityStatus::Deleted)
                .count(),
            cleanup: context.cleanup.clone(),
        }
    }
}
