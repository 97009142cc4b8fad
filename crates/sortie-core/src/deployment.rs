//! Workload Deployment Manager
//!
//! Launches one isolated compute unit per work item. The unit receives the
//! vault reference of its identity, never the secret, and an execution
//! timeout strictly longer than the operating window.

use crate::config::{CampaignConfig, ComputeResources, RetryPolicy};
use crate::error::{ApiError, DeploymentError};
use crate::ports::{campaign_tags, SandboxApi, SandboxSpec, SandboxState};
use crate::retry::retry_transient;
use crate::types::{CampaignId, Identity, WorkItemSelection, Workload, WorkloadStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Environment variable carrying the vault reference
pub const SECRET_REF_ENV: &str = "SORTIE_SECRET_REF";

/// Deploys, polls and tears down workloads
pub struct DeploymentManager {
    sandbox: Arc<dyn SandboxApi>,
    retry: RetryPolicy,
    prefix: String,
    image: String,
    tenant_id: String,
    request: ComputeResources,
    floor: ComputeResources,
    operating_window: Duration,
    execution_timeout: Duration,
    max_concurrency: usize,
}

impl DeploymentManager {
    #[must_use]
    pub fn new(sandbox: Arc<dyn SandboxApi>, config: &CampaignConfig) -> Self {
        Self {
            sandbox,
            retry: config.identity_retry.clone(),
            prefix: config.name_prefix.clone(),
            image: config.workload_image.clone(),
            tenant_id: config.tenant_id.clone(),
            request: config.workload_resources,
            floor: config.resource_floor,
            operating_window: config.operating_window(),
            execution_timeout: config.execution_timeout(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    #[must_use]
    pub fn workload_name(&self, work_item: &str) -> String {
        format!("{}-{}-wl", self.prefix, work_item)
    }

    /// Launch request for one work item
    #[must_use]
    pub fn sandbox_spec(
        &self,
        campaign_id: CampaignId,
        selection: &WorkItemSelection,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<SandboxSpec> {
        let secret_ref = identity.secret_ref.clone()?;
        let resources = self.request.at_least(self.floor);
        let env = BTreeMap::from([
            ("CAMPAIGN_ID".to_string(), campaign_id.to_string()),
            ("WORK_ITEM".to_string(), selection.catalog_key.clone()),
            ("TENANT_ID".to_string(), self.tenant_id.clone()),
            ("CATEGORY".to_string(), selection.category.clone()),
            ("DOC_REFERENCE".to_string(), selection.doc_reference.clone()),
            ("IDENTITY_CLIENT_ID".to_string(), identity.external_id.clone()),
            (
                "OPERATING_WINDOW_MS".to_string(),
                self.operating_window.as_millis().to_string(),
            ),
        ]);
        Some(SandboxSpec {
            name: self.workload_name(&selection.catalog_key),
            image: self.image.clone(),
            memory_mb: resources.memory_mb,
            cpu_millicores: resources.cpu_millicores,
            timeout_ms: self.execution_timeout.as_millis() as u64,
            env,
            secret_env: BTreeMap::from([(SECRET_REF_ENV.to_string(), secret_ref)]),
            tags: campaign_tags(&campaign_id.to_string(), &selection.catalog_key, now),
        })
    }

    /// Deploy one workload. The identity must be past its propagation delay.
    #[instrument(skip_all, fields(work_item = %selection.catalog_key))]
    pub async fn deploy(
        &self,
        campaign_id: CampaignId,
        selection: &WorkItemSelection,
        identity: &Identity,
    ) -> Result<Workload, DeploymentError> {
        let now = Utc::now();
        if !identity.is_usable_at(now) {
            return Err(DeploymentError::IdentityNotReady {
                work_item: selection.catalog_key.clone(),
                reason: format!("status {:?}, usable at {}", identity.status, identity.usable_at),
            });
        }
        let spec = self
            .sandbox_spec(campaign_id, selection, identity, now)
            .ok_or_else(|| DeploymentError::IdentityNotReady {
                work_item: selection.catalog_key.clone(),
                reason: "no vault reference".to_string(),
            })?;

        let external_id = retry_transient(&self.retry, "sandbox.create", || self.sandbox.create(&spec))
            .await
            .map_err(|source| DeploymentError::LaunchFailed {
                work_item: selection.catalog_key.clone(),
                source,
            })?;

        let deadline = now + chrono::Duration::from_std(self.execution_timeout).unwrap_or_default();
        info!(%external_id, memory_mb = spec.memory_mb, cpu_millicores = spec.cpu_millicores, "Workload deployed");
        Ok(Workload {
            name: spec.name,
            work_item: selection.catalog_key.clone(),
            external_resource_id: Some(external_id),
            status: WorkloadStatus::Running,
            deployed_at: Some(now),
            deadline: Some(deadline),
            error: None,
            torn_down: false,
        })
    }

    /// Deploy every pair with bounded fan-out. A failed launch marks only
    /// that workload failed.
    pub async fn deploy_all(
        &self,
        campaign_id: CampaignId,
        items: Vec<(WorkItemSelection, Identity)>,
    ) -> Vec<Workload> {
        stream::iter(items)
            .map(|(selection, identity)| async move {
                match self.deploy(campaign_id, &selection, &identity).await {
                    Ok(workload) => workload,
                    Err(e) => {
                        warn!(work_item = %selection.catalog_key, error = %e, "Deployment failed");
                        Workload::failed(
                            self.workload_name(&selection.catalog_key),
                            selection.catalog_key.clone(),
                            e.to_string(),
                        )
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }

    /// Poll the sandbox and apply the execution deadline
    pub async fn refresh(&self, workload: &Workload, now: DateTime<Utc>) -> Workload {
        let mut updated = workload.clone();
        if workload.status.is_finished() {
            return updated;
        }
        let Some(external_id) = workload.external_resource_id.as_deref() else {
            return updated;
        };

        match self.sandbox.state(external_id).await {
            Ok(SandboxState::Pending) => updated.status = WorkloadStatus::Pending,
            Ok(SandboxState::Running) => updated.status = WorkloadStatus::Running,
            Ok(SandboxState::Succeeded) => updated.status = WorkloadStatus::Completed,
            Ok(SandboxState::Crashed { reason }) => {
                updated.status = WorkloadStatus::Failed;
                updated.error = Some(reason);
            }
            Ok(SandboxState::Missing) => {
                updated.status = WorkloadStatus::Failed;
                updated.error = Some("compute unit disappeared".to_string());
            }
            Err(e) => warn!(workload = %workload.name, error = %e, "Sandbox status unavailable"),
        }

        if !updated.status.is_finished() && workload.deadline.is_some_and(|deadline| now >= deadline) {
            updated.status = WorkloadStatus::TimedOut;
            updated.error = Some("execution timeout exceeded".to_string());
        }
        if updated.status != workload.status {
            info!(workload = %workload.name, from = ?workload.status, to = ?updated.status, "Workload status changed");
        }
        updated
    }

    /// Delete the compute unit. Already gone counts as success.
    pub async fn teardown(&self, workload: &Workload) -> Result<Workload, DeploymentError> {
        let mut updated = workload.clone();
        let Some(external_id) = workload.external_resource_id.as_deref() else {
            updated.torn_down = true;
            return Ok(updated);
        };
        if workload.torn_down {
            return Ok(updated);
        }
        match retry_transient(&self.retry, "sandbox.delete", || self.sandbox.delete(external_id)).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {
                updated.torn_down = true;
                Ok(updated)
            }
            Err(source) => Err(DeploymentError::TeardownFailed {
                name: workload.name.clone(),
                source,
            }),
        }
    }

    /// Tear down every workload with bounded fan-out. Failures leave the
    /// workload untouched for the cleanup verifier to find.
    pub async fn teardown_all(&self, workloads: Vec<Workload>) -> Vec<Workload> {
        stream::iter(workloads)
            .map(|workload| async move {
                match self.teardown(&workload).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(error = %e, "Workload teardown failed");
                        workload
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MockSandboxApi;
    use crate::types::{IdentityStatus, SecretRef};

    fn config() -> CampaignConfig {
        let mut config = CampaignConfig::new()
            .with_tenant("tenant-a", "root")
            .with_operating_window(Duration::from_secs(3600));
        config.identity_retry = RetryPolicy::immediate(3);
        config
    }

    fn selection(key: &str) -> WorkItemSelection {
        WorkItemSelection {
            catalog_key: key.into(),
            category: "storage".into(),
            doc_reference: "docs/storage.md".into(),
        }
    }

    fn identity(key: &str) -> Identity {
        let past = Utc::now() - chrono::Duration::seconds(1);
        Identity {
            name: format!("sortie-{key}-admin"),
            work_item: key.into(),
            external_id: format!("app-{key}"),
            principal_id: format!("sp-{key}"),
            secret_ref: Some(SecretRef(format!("vault://{key}"))),
            roles: vec!["Contributor".into()],
            status: IdentityStatus::Created,
            created_at: past,
            usable_at: past,
        }
    }

    #[test]
    fn spec_carries_reference_floor_and_timeout() {
        let config = config();
        let manager = DeploymentManager::new(Arc::new(MockSandboxApi::new()), &config);
        let id = CampaignId::new();
        let spec = manager
            .sandbox_spec(id, &selection("w1"), &identity("w1"), Utc::now())
            .unwrap();

        assert_eq!(spec.name, "sortie-w1-wl");
        assert_eq!(spec.memory_mb, 1536);
        assert_eq!(spec.cpu_millicores, 1000);
        assert!(spec.timeout_ms > config.operating_window_ms);
        assert_eq!(spec.secret_env[SECRET_REF_ENV], SecretRef("vault://w1".into()));
        assert!(spec.env.values().all(|v| !v.contains("vault://")));
        assert_eq!(spec.tags["campaign_id"], id.to_string());
    }

    #[tokio::test]
    async fn one_failed_launch_is_isolated() {
        let mut sandbox = MockSandboxApi::new();
        sandbox.expect_create().returning(|spec| {
            if spec.name.contains("bad") {
                Err(ApiError::Other("image pull failed".into()))
            } else {
                Ok(format!("/containers/{}", spec.name))
            }
        });
        let manager = DeploymentManager::new(Arc::new(sandbox), &config());

        let mut workloads = manager
            .deploy_all(
                CampaignId::new(),
                vec![
                    (selection("good"), identity("good")),
                    (selection("bad"), identity("bad")),
                ],
            )
            .await;
        workloads.sort_by(|a, b| a.work_item.cmp(&b.work_item));

        assert_eq!(workloads[0].status, WorkloadStatus::Failed);
        assert!(workloads[0].error.as_deref().unwrap().contains("image pull"));
        assert_eq!(workloads[1].status, WorkloadStatus::Running);
        assert!(workloads[1].deadline.is_some());
    }

    #[tokio::test]
    async fn identity_in_propagation_is_not_deployed() {
        let manager = DeploymentManager::new(Arc::new(MockSandboxApi::new()), &config());
        let mut fresh = identity("w1");
        fresh.usable_at = Utc::now() + chrono::Duration::seconds(60);

        let err = manager
            .deploy(CampaignId::new(), &selection("w1"), &fresh)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::IdentityNotReady { .. }));
    }

    #[tokio::test]
    async fn refresh_maps_states_and_deadline() {
        let mut sandbox = MockSandboxApi::new();
        sandbox.expect_state().returning(|id| match id {
            "crashed" => Ok(SandboxState::Crashed { reason: "oom".into() }),
            "done" => Ok(SandboxState::Succeeded),
            _ => Ok(SandboxState::Running),
        });
        let manager = DeploymentManager::new(Arc::new(sandbox), &config());
        let now = Utc::now();
        let running = |id: &str| Workload {
            name: id.into(),
            work_item: id.into(),
            external_resource_id: Some(id.into()),
            status: WorkloadStatus::Running,
            deployed_at: Some(now),
            deadline: Some(now + chrono::Duration::minutes(5)),
            error: None,
            torn_down: false,
        };

        let crashed = manager.refresh(&running("crashed"), now).await;
        assert_eq!(crashed.status, WorkloadStatus::Failed);
        assert_eq!(crashed.error.as_deref(), Some("oom"));

        let done = manager.refresh(&running("done"), now).await;
        assert_eq!(done.status, WorkloadStatus::Completed);

        let late = manager
            .refresh(&running("slow"), now + chrono::Duration::minutes(6))
            .await;
        assert_eq!(late.status, WorkloadStatus::TimedOut);
    }

    #[tokio::test]
    async fn teardown_treats_missing_as_done() {
        let mut sandbox = MockSandboxApi::new();
        sandbox
            .expect_delete()
            .returning(|_| Err(ApiError::NotFound("gone".into())));
        let manager = DeploymentManager::new(Arc::new(sandbox), &config());
        let workload = Workload {
            name: "w".into(),
            work_item: "w".into(),
            external_resource_id: Some("/c/w".into()),
            status: WorkloadStatus::Completed,
            deployed_at: None,
            deadline: None,
            error: None,
            torn_down: false,
        };
        assert!(manager.teardown(&workload).await.unwrap().torn_down);
    }
}
