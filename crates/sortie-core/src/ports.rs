//! Interfaces to the external collaborators the engine drives
//!
//! Every side effect on the tenant goes through one of these traits, so the
//! engine can run against the real cloud, a simulator, or mocks.

use crate::error::ApiError;
use crate::store::CampaignStore;
use crate::types::SecretRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Tag keys stamped on everything a campaign creates
pub mod tags {
    pub const MANAGED_BY: &str = "managed-by";
    pub const CAMPAIGN_ID: &str = "campaign_id";
    pub const WORK_ITEM: &str = "work_item";
    pub const CREATED_AT: &str = "created_at";
}

/// Raw secret material. Only ever handed straight to the vault.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret to the vault implementation
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Existing identity as seen by the identity API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHandle {
    pub external_id: String,
    pub principal_id: String,
}

/// Result of creating an identity
#[derive(Debug)]
pub struct CreatedIdentity {
    pub handle: IdentityHandle,
    pub secret: SecretValue,
}

/// Entry returned by the tagged-resource index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedResource {
    pub resource_id: String,
    pub resource_type: String,
    pub tags: BTreeMap<String, String>,
    /// Containing resource, deleted after this one
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl TaggedResource {
    #[must_use]
    pub fn work_item(&self) -> Option<&str> {
        self.tags.get(tags::WORK_ITEM).map(String::as_str)
    }
}

/// Launch request for an isolated compute unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub memory_mb: u32,
    pub cpu_millicores: u32,
    pub timeout_ms: u64,
    /// Plain configuration
    pub env: BTreeMap<String, String>,
    /// Secret pointers, resolved only inside the sandbox
    pub secret_env: BTreeMap<String, SecretRef>,
    pub tags: BTreeMap<String, String>,
}

/// Observed state of a compute unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SandboxState {
    Pending,
    Running,
    Succeeded,
    Crashed { reason: String },
    Missing,
}

/// Message pulled from the event bus, unacknowledged until `ack`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub payload: String,
}

/// Reachability and quota probes for the validator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Authenticated test call against the control plane
    async fn check_control_plane(&self, tenant_id: &str, root_identity: &str) -> Result<String, ApiError>;

    /// Test call against the reasoning backend used by workloads
    async fn check_reasoning_backend(&self) -> Result<String, ApiError>;

    /// Number of additional compute units the tenant can host
    async fn quota_headroom(&self, tenant_id: &str) -> Result<u32, ApiError>;
}

/// Finds tool binaries
#[cfg_attr(test, mockall::automock)]
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: &str) -> Option<PathBuf>;
}

/// Searches the directories of `PATH`
#[derive(Debug, Clone, Copy, Default)]
pub struct PathToolLocator;

impl ToolLocator for PathToolLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(tool))
            .find(|candidate| candidate.is_file())
    }
}

/// Identity-management API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<IdentityHandle>, ApiError>;

    async fn create(&self, name: &str) -> Result<CreatedIdentity, ApiError>;

    async fn assign_role(&self, principal_id: &str, role: &str) -> Result<(), ApiError>;

    async fn delete(&self, external_id: &str) -> Result<(), ApiError>;
}

/// Secret vault holding identity credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn put(&self, name: &str, value: SecretValue) -> Result<SecretRef, ApiError>;

    /// Reference of the secret stored under `name`, if any
    async fn lookup(&self, name: &str) -> Result<Option<SecretRef>, ApiError>;

    async fn delete(&self, reference: &SecretRef) -> Result<(), ApiError>;

    async fn exists(&self, reference: &SecretRef) -> Result<bool, ApiError>;
}

/// Tagged-resource query and deletion API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceIndex: Send + Sync {
    async fn query_by_tag(&self, key: &str, value: &str) -> Result<Vec<TaggedResource>, ApiError>;

    async fn delete(&self, resource_id: &str) -> Result<(), ApiError>;
}

/// Compute-sandbox deployment API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Launch a unit, returning its external resource id
    async fn create(&self, spec: &SandboxSpec) -> Result<String, ApiError>;

    async fn state(&self, external_id: &str) -> Result<SandboxState, ApiError>;

    async fn delete(&self, external_id: &str) -> Result<(), ApiError>;
}

/// Durable at-least-once event bus subscription
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Pull up to `max` pending messages without blocking
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, ApiError>;

    /// Acknowledge a message; unacknowledged messages are redelivered
    async fn ack(&self, delivery_id: u64) -> Result<(), ApiError>;
}

/// Every collaborator the orchestrator needs
#[derive(Clone)]
pub struct Ports {
    pub probe: Arc<dyn EnvironmentProbe>,
    pub tools: Arc<dyn ToolLocator>,
    pub identities: Arc<dyn IdentityApi>,
    pub vault: Arc<dyn SecretVault>,
    pub resources: Arc<dyn ResourceIndex>,
    pub sandbox: Arc<dyn SandboxApi>,
    pub events: Arc<dyn EventBus>,
    pub store: Arc<dyn CampaignStore>,
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}

/// Tags for something created on behalf of `work_item`
#[must_use]
pub fn campaign_tags(
    campaign_id: &str,
    work_item: &str,
    created_at: chrono::DateTime<chrono::Utc>,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (tags::MANAGED_BY.to_string(), "true".to_string()),
        (tags::CAMPAIGN_ID.to_string(), campaign_id.to_string()),
        (tags::WORK_ITEM.to_string(), work_item.to_string()),
        (tags::CREATED_AT.to_string(), created_at.to_rfc3339()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_value_debug_is_redacted() {
        let secret = SecretValue::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn campaign_tags_schema() {
        let stamped = campaign_tags("c1", "w1", chrono::Utc::now());
        assert_eq!(stamped.get(tags::MANAGED_BY).map(String::as_str), Some("true"));
        assert_eq!(stamped.get(tags::CAMPAIGN_ID).map(String::as_str), Some("c1"));
        assert_eq!(stamped.get(tags::WORK_ITEM).map(String::as_str), Some("w1"));
        assert!(stamped.contains_key(tags::CREATED_AT));
    }

    #[test]
    fn sandbox_state_wire_format() {
        let json = serde_json::to_string(&SandboxState::Crashed { reason: "oom".into() }).unwrap();
        assert_eq!(json, r#"{"state":"crashed","reason":"oom"}"#);
    }

    #[test]
    fn path_locator_misses_unknown_tool() {
        assert!(PathToolLocator.locate("definitely-not-a-real-tool-7f3a").is_none());
    }
}
