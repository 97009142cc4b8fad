//! Core types for Sortie
//!
//! Defines the data model threaded through every phase:
//! - Campaign identity, phase and terminal status
//! - Catalog entries and the immutable work item selections made from them
//! - Ephemeral identities and deployed workloads

use crate::error::MalformedEntry;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Work item keys end up inside identity and sandbox names
static WORK_ITEM_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,46}[a-z0-9]$").expect("static regex"));

/// Unique campaign identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub Ulid);

impl CampaignId {
    /// Generate new campaign ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CampaignId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Campaign lifecycle phase
///
/// ```text
/// VALIDATING -> SELECTING -> PROVISIONING -> MONITORING -> VERIFYING_CLEANUP
///      |             |             |                              |
///      v             +-------------+-------------> (cleanup)      v
///   FAILED                                           FORCING_CLEANUP -> REPORTING -> COMPLETED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Validating,
    Selecting,
    Provisioning,
    Monitoring,
    VerifyingCleanup,
    ForcingCleanup,
    Reporting,
    Completed,
    Failed,
}

impl Phase {
    /// Returns true if no further transitions are possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true once the campaign has entered the cleanup half
    #[inline]
    #[must_use]
    pub const fn is_cleanup(&self) -> bool {
        matches!(
            self,
            Self::VerifyingCleanup | Self::ForcingCleanup | Self::Reporting
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "VALIDATING",
            Self::Selecting => "SELECTING",
            Self::Provisioning => "PROVISIONING",
            Self::Monitoring => "MONITORING",
            Self::VerifyingCleanup => "VERIFYING_CLEANUP",
            Self::ForcingCleanup => "FORCING_CLEANUP",
            Self::Reporting => "REPORTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Overall campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Running,
    Completed,
    Failed,
    /// Finished, but some work item failed or some resource survived cleanup
    Partial,
}

/// One end-to-end execution of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    pub status: CampaignStatus,
}

impl Campaign {
    /// Create a campaign starting now that runs for `window`
    #[must_use]
    pub fn new(started_at: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            id: CampaignId::new(),
            phase: Phase::Validating,
            started_at,
            scheduled_end_at: started_at + window,
            status: CampaignStatus::Running,
        }
    }
}

/// Campaign size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// Number of work items selected for this class
    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        match self {
            Self::Small => 5,
            Self::Medium => 15,
            Self::Large => 30,
        }
    }
}

impl FromStr for SizeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(format!("unknown size class: {other}")),
        }
    }
}

/// Raw catalog entry, possibly malformed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub doc_reference: String,
}

impl CatalogEntry {
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        category: impl Into<String>,
        doc_reference: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            category: category.into(),
            doc_reference: doc_reference.into(),
        }
    }
}

/// A catalog entry chosen for a campaign. Immutable once chosen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemSelection {
    pub catalog_key: String,
    pub category: String,
    pub doc_reference: String,
}

impl TryFrom<&CatalogEntry> for WorkItemSelection {
    type Error = MalformedEntry;

    fn try_from(entry: &CatalogEntry) -> Result<Self, Self::Error> {
        if !WORK_ITEM_KEY.is_match(&entry.key) {
            return Err(MalformedEntry::InvalidKey(entry.key.clone()));
        }
        if entry.category.trim().is_empty() {
            return Err(MalformedEntry::MissingCategory(entry.key.clone()));
        }
        if entry.doc_reference.trim().is_empty() {
            return Err(MalformedEntry::MissingDocReference(entry.key.clone()));
        }
        Ok(Self {
            catalog_key: entry.key.clone(),
            category: entry.category.trim().to_string(),
            doc_reference: entry.doc_reference.trim().to_string(),
        })
    }
}

/// Opaque pointer to a secret held in the vault. Never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status shared by identities and resource records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// Created by this campaign
    Created,
    /// Found in the tenant, left over from an interrupted provisioning attempt
    Exists,
    Deleted,
    DeletionFailed,
}

impl IdentityStatus {
    #[inline]
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Exists)
    }
}

/// Short-lived credential scoped to one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub work_item: String,
    pub external_id: String,
    pub principal_id: String,
    /// Vault pointer; `None` only for identities adopted after a crash
    pub secret_ref: Option<SecretRef>,
    pub roles: Vec<String>,
    pub status: IdentityStatus,
    pub created_at: DateTime<Utc>,
    /// Role assignment is eventually consistent; unusable before this instant
    pub usable_at: DateTime<Utc>,
}

impl Identity {
    /// Whether the propagation delay has elapsed
    #[inline]
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == IdentityStatus::Created && now >= self.usable_at
    }
}

/// Deployed workload status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl WorkloadStatus {
    #[inline]
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Isolated compute unit executing one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub work_item: String,
    pub external_resource_id: Option<String>,
    pub status: WorkloadStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    /// Execution timeout expressed as a wall-clock deadline
    pub deadline: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Compute unit has been deleted during cleanup
    #[serde(default)]
    pub torn_down: bool,
}

impl Workload {
    /// A workload that never got a compute unit
    #[must_use]
    pub fn failed(name: impl Into<String>, work_item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            work_item: work_item.into(),
            external_resource_id: None,
            status: WorkloadStatus::Failed,
            deployed_at: None,
            deadline: None,
            error: Some(error.into()),
            torn_down: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_counts() {
        assert_eq!(SizeClass::Small.count(), 5);
        assert_eq!(SizeClass::Medium.count(), 15);
        assert_eq!(SizeClass::Large.count(), 30);
        assert_eq!("MEDIUM".parse::<SizeClass>(), Ok(SizeClass::Medium));
        assert!("huge".parse::<SizeClass>().is_err());
    }

    #[test]
    fn catalog_entry_validation() {
        let ok = CatalogEntry::new("storage-exfil", "storage", "docs/storage.md");
        assert!(WorkItemSelection::try_from(&ok).is_ok());

        let bad_key = CatalogEntry::new("Bad Key!", "storage", "docs/x.md");
        assert!(matches!(
            WorkItemSelection::try_from(&bad_key),
            Err(MalformedEntry::InvalidKey(_))
        ));

        let no_doc = CatalogEntry::new("vm-escape", "compute", "  ");
        assert!(matches!(
            WorkItemSelection::try_from(&no_doc),
            Err(MalformedEntry::MissingDocReference(_))
        ));
    }

    #[test]
    fn phase_serde_and_display() {
        let json = serde_json::to_string(&Phase::VerifyingCleanup).unwrap();
        assert_eq!(json, "\"VERIFYING_CLEANUP\"");
        assert_eq!(Phase::ForcingCleanup.to_string(), "FORCING_CLEANUP");
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Reporting.is_terminal());
    }

    #[test]
    fn campaign_id_roundtrip() {
        let id = CampaignId::new();
        let parsed: CampaignId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
