//! Cleanup Verifier & Enforcer
//!
//! Verification asks the tagged-resource index what is still alive, without
//! trusting the ledger, and reconciles the two. Enforcement deletes what is
//! left in dependency order:
//!
//! 1. Resources are grouped into waves by height in the parent graph
//!    (leaves first), then by the configured resource-type rank.
//! 2. Each wave runs with bounded fan-out. Every resource retries on its own:
//!    "has dependents" waits the requeue delay, transient errors back off
//!    exponentially, "not found" means already gone.
//! 3. A work item's identity is deleted only once every resource record of
//!    that work item is deleted or recorded as a deletion failure.

use crate::config::{CampaignConfig, RetryPolicy};
use crate::error::{ApiError, CleanupError};
use crate::identity::IdentityManager;
use crate::ledger::{ResourceLedger, ResourceRecord};
use crate::ports::{tags, ResourceIndex};
use crate::retry::retry_transient;
use crate::types::{CampaignId, Identity, IdentityStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Resource type recorded for identity failures
pub const IDENTITY_RESOURCE_TYPE: &str = "identity";

/// A resource or identity that survived cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFailure {
    pub resource_id: String,
    pub resource_type: String,
    pub work_item: String,
    pub attempts: u32,
    pub error: String,
}

/// Terminal cleanup summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub campaign_id: CampaignId,
    /// Resources verification found still alive
    pub expected_deleted: usize,
    pub actually_deleted: usize,
    /// Deleted after at least one failed attempt
    pub forced_deletions: usize,
    pub deletion_failures: Vec<DeletionFailure>,
    /// Names of identities confirmed deleted
    pub identities_deleted: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl CleanupReport {
    /// Nothing survived
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.deletion_failures.is_empty()
    }
}

/// Enforcement result: the report plus every identity's final state
#[derive(Debug, Clone)]
pub struct CleanupOutcome {
    pub report: CleanupReport,
    pub identities: Vec<Identity>,
}

enum Disposition {
    Deleted { forced: bool },
    Failed(DeletionFailure),
}

/// Verifies and forces campaign cleanup
pub struct CleanupEnforcer {
    resources: Arc<dyn ResourceIndex>,
    identities: Arc<IdentityManager>,
    ledger: Arc<ResourceLedger>,
    retry: RetryPolicy,
    query_retry: RetryPolicy,
    dependency_requeue: Duration,
    max_concurrency: usize,
    type_rank: HashMap<String, usize>,
}

impl CleanupEnforcer {
    #[must_use]
    pub fn new(
        resources: Arc<dyn ResourceIndex>,
        identities: Arc<IdentityManager>,
        ledger: Arc<ResourceLedger>,
        config: &CampaignConfig,
    ) -> Self {
        let type_rank = config
            .delete_order
            .iter()
            .enumerate()
            .map(|(rank, ty)| (ty.clone(), rank))
            .collect();
        Self {
            resources,
            identities,
            ledger,
            retry: config.deletion_retry.clone(),
            query_retry: config.identity_retry.clone(),
            dependency_requeue: config.dependency_requeue(),
            max_concurrency: config.max_concurrency.max(1),
            type_rank,
        }
    }

    /// Query the index by campaign tag and reconcile the ledger against it.
    ///
    /// Ledger records the index no longer has become `deleted`; index entries
    /// the ledger never heard of are adopted. Returns every resource the index
    /// still holds.
    #[instrument(skip_all, fields(%campaign_id))]
    pub async fn verify(&self, campaign_id: CampaignId) -> Result<Vec<ResourceRecord>, CleanupError> {
        let value = campaign_id.to_string();
        let found = retry_transient(&self.query_retry, "index.query", || {
            self.resources.query_by_tag(tags::CAMPAIGN_ID, &value)
        })
        .await
        .map_err(CleanupError::QueryFailed)?;

        let now = Utc::now();
        let alive: HashSet<&str> = found.iter().map(|r| r.resource_id.as_str()).collect();
        let mut reconciled = 0usize;
        for record in self.ledger.live() {
            if !alive.contains(record.resource_id.as_str()) {
                self.ledger.mark_deleted(&record, now);
                reconciled += 1;
            }
        }

        let mut adopted = 0usize;
        let mut remaining = Vec::with_capacity(found.len());
        for resource in &found {
            if self.ledger.get(&resource.resource_id).is_none() {
                adopted += 1;
            }
            self.ledger
                .merge(ResourceRecord::observed(campaign_id, resource, now));
            if let Some(record) = self.ledger.get(&resource.resource_id) {
                remaining.push(record);
            }
        }

        info!(remaining = remaining.len(), reconciled, adopted, "Cleanup verified");
        Ok(remaining)
    }

    /// Delete `remaining`, then every settled work item's identity
    #[instrument(skip_all, fields(%campaign_id, remaining = remaining.len()))]
    pub async fn enforce(
        &self,
        campaign_id: CampaignId,
        remaining: Vec<ResourceRecord>,
        identities: Vec<Identity>,
    ) -> CleanupOutcome {
        let expected_deleted = remaining.len();
        let mut actually_deleted = 0usize;
        let mut forced_deletions = 0usize;
        let mut deletion_failures = Vec::new();

        for (wave_no, wave) in self.waves(remaining).into_iter().enumerate() {
            debug!(wave = wave_no, size = wave.len(), "Deleting wave");
            let results: Vec<Disposition> = stream::iter(wave)
                .map(|record| self.delete_resource(record))
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;
            for result in results {
                match result {
                    Disposition::Deleted { forced } => {
                        actually_deleted += 1;
                        if forced {
                            forced_deletions += 1;
                        }
                    }
                    Disposition::Failed(failure) => deletion_failures.push(failure),
                }
            }
        }

        // Records that stayed live without ever reaching the index query
        for record in self.ledger.live() {
            if !deletion_failures.iter().any(|f| f.resource_id == record.resource_id) {
                let error = "not found by verification, state unknown".to_string();
                self.ledger.mark_failed(&record.resource_id, record.deletion_attempts, &error);
                deletion_failures.push(DeletionFailure {
                    resource_id: record.resource_id,
                    resource_type: record.resource_type,
                    work_item: record.work_item,
                    attempts: record.deletion_attempts,
                    error,
                });
            }
        }

        let (identities, identities_deleted, identity_failures) = self.delete_identities(identities).await;
        deletion_failures.extend(identity_failures);

        metrics::counter!("sortie_cleanup_deleted_total").increment(actually_deleted as u64);
        metrics::counter!("sortie_cleanup_forced_total").increment(forced_deletions as u64);
        metrics::counter!("sortie_cleanup_failures_total").increment(deletion_failures.len() as u64);
        info!(
            expected_deleted,
            actually_deleted,
            forced_deletions,
            failures = deletion_failures.len(),
            identities_deleted = identities_deleted.len(),
            "Cleanup enforced"
        );

        CleanupOutcome {
            report: CleanupReport {
                campaign_id,
                expected_deleted,
                actually_deleted,
                forced_deletions,
                deletion_failures,
                identities_deleted,
                completed_at: Utc::now(),
            },
            identities,
        }
    }

    /// Group into deletion waves: children before parents, then type rank
    fn waves(&self, remaining: Vec<ResourceRecord>) -> Vec<Vec<ResourceRecord>> {
        let ids: HashSet<String> = remaining.iter().map(|r| r.resource_id.clone()).collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for record in &remaining {
            if let Some(parent) = record.parent_id.as_deref().filter(|p| ids.contains(*p)) {
                children.entry(parent).or_default().push(&record.resource_id);
            }
        }

        let mut heights: HashMap<String, usize> = HashMap::new();
        for record in &remaining {
            height(&record.resource_id, &children, &mut heights, &mut HashSet::new());
        }

        let mut waves: BTreeMap<(usize, usize), Vec<ResourceRecord>> = BTreeMap::new();
        for record in remaining {
            let h = heights.get(&record.resource_id).copied().unwrap_or(0);
            let rank = self.type_rank.get(&record.resource_type).copied().unwrap_or(0);
            waves.entry((h, rank)).or_default().push(record);
        }
        waves.into_values().collect()
    }

    async fn delete_resource(&self, record: ResourceRecord) -> Disposition {
        let max_attempts = self.retry.max_attempts.max(1);
        let previously_failed = record.deletion_attempts > 0;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.resources.delete(&record.resource_id).await {
                Ok(()) | Err(ApiError::NotFound(_)) => {
                    let forced = previously_failed || attempts > 1;
                    self.ledger.mark_deleted(&record, Utc::now());
                    if forced {
                        info!(resource_id = %record.resource_id, attempts, "Forced deletion succeeded");
                    }
                    return Disposition::Deleted { forced };
                }
                Err(e) => e,
            };

            let total = record.deletion_attempts + attempts;
            self.ledger.record_attempt(&record.resource_id, total, &error.to_string());
            let delay = match &error {
                ApiError::HasDependents(_) => Some(self.dependency_requeue),
                e if e.is_transient() => Some(self.retry.delay_for(attempts - 1)),
                _ => None,
            };

            match delay {
                Some(delay) if attempts < max_attempts => {
                    debug!(
                        resource_id = %record.resource_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Deletion requeued"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    warn!(resource_id = %record.resource_id, attempts, error = %error, "Deletion failed permanently");
                    self.ledger.mark_failed(&record.resource_id, total, &error.to_string());
                    return Disposition::Failed(DeletionFailure {
                        resource_id: record.resource_id,
                        resource_type: record.resource_type,
                        work_item: record.work_item,
                        attempts: total,
                        error: error.to_string(),
                    });
                }
            }
        }
    }

    async fn delete_identities(
        &self,
        identities: Vec<Identity>,
    ) -> (Vec<Identity>, Vec<String>, Vec<DeletionFailure>) {
        let mut done = Vec::with_capacity(identities.len());
        let mut deletable = Vec::new();
        let mut failures = Vec::new();

        for mut identity in identities {
            if !identity.status.is_live() {
                done.push(identity);
            } else if self.ledger.work_item_settled(&identity.work_item) {
                deletable.push(identity);
            } else {
                warn!(identity = %identity.name, "Identity withheld, work item still has live resources");
                identity.status = IdentityStatus::DeletionFailed;
                failures.push(DeletionFailure {
                    resource_id: identity.external_id.clone(),
                    resource_type: IDENTITY_RESOURCE_TYPE.to_string(),
                    work_item: identity.work_item.clone(),
                    attempts: 0,
                    error: "withheld: work item still has live resources".to_string(),
                });
                done.push(identity);
            }
        }

        let deletions: Vec<_> = stream::iter(deletable)
            .map(|identity| async move { self.identities.delete(&identity).await })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut deleted_names = Vec::new();
        for deletion in deletions {
            match deletion.error {
                None => deleted_names.push(deletion.identity.name.clone()),
                Some(error) => failures.push(DeletionFailure {
                    resource_id: deletion.identity.external_id.clone(),
                    resource_type: IDENTITY_RESOURCE_TYPE.to_string(),
                    work_item: deletion.identity.work_item.clone(),
                    attempts: 1,
                    error,
                }),
            }
            done.push(deletion.identity);
        }
        deleted_names.sort();
        done.sort_by(|a, b| a.work_item.cmp(&b.work_item));
        (done, deleted_names, failures)
    }
}

/// Longest path down to a leaf; cycles count as leaves
fn height(
    id: &str,
    children: &HashMap<&str, Vec<&str>>,
    memo: &mut HashMap<String, usize>,
    visiting: &mut HashSet<String>,
) -> usize {
    if let Some(h) = memo.get(id) {
        return *h;
    }
    if !visiting.insert(id.to_string()) {
        return 0;
    }
    let h = children
        .get(id)
        .map(|kids| {
            kids.iter()
                .map(|kid| height(kid, children, memo, visiting) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    visiting.remove(id);
    memo.insert(id.to_string(), h);
    h
}
