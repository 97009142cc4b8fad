//! In-memory tenant implementing every port
//!
//! A sandbox launch runs a scripted workload on the spot: it creates a
//! resource group holding a storage account and a key vault, tags them for
//! the campaign, and publishes the matching events on the bus. Faults are
//! injected through [`FaultPlan`].

use async_trait::async_trait;
use parking_lot::Mutex;
use sortie_core::events::{EventKind, LogEvent, Severity};
use sortie_core::ports::{
    tags, CreatedIdentity, Delivery, EnvironmentProbe, EventBus, IdentityApi, IdentityHandle, Ports,
    ResourceIndex, SandboxApi, SandboxSpec, SandboxState, SecretValue, SecretVault, TaggedResource,
    ToolLocator,
};
use sortie_core::store::CampaignStore;
use sortie_core::{ApiError, SecretRef};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Failures to inject into the simulated tenant
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Control-plane test call is rejected
    pub invalid_credentials: bool,
    pub backend_down: bool,
    /// Compute units the tenant can still host
    pub quota: u32,
    /// Tools missing from `PATH`
    pub missing_tools: HashSet<String>,
    /// First N identity creations are rate limited
    pub rate_limited_creates: u32,
    /// Work items whose workload crashes after creating its resources
    pub crashing_work_items: HashSet<String>,
    /// Work items that report completion but whose compute unit never exits
    pub hanging_work_items: HashSet<String>,
    /// Work items whose workload goes silent after its resources and never exits
    pub stalled_work_items: HashSet<String>,
    /// Errors returned, in order, by the next deletes of a resource type
    pub delete_faults: HashMap<String, VecDeque<ApiError>>,
    /// Resource types that can never be deleted
    pub undeletable_types: HashSet<String>,
    /// Every event is published twice
    pub duplicate_deliveries: bool,
    /// Status polls a healthy workload reports `running` before succeeding
    pub polls_until_done: u32,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            invalid_credentials: false,
            backend_down: false,
            quota: 100,
            missing_tools: HashSet::new(),
            rate_limited_creates: 0,
            crashing_work_items: HashSet::new(),
            hanging_work_items: HashSet::new(),
            stalled_work_items: HashSet::new(),
            delete_faults: HashMap::new(),
            undeletable_types: HashSet::new(),
            duplicate_deliveries: false,
            polls_until_done: 1,
        }
    }
}

impl FaultPlan {
    #[must_use]
    pub fn healthy() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_invalid_credentials(mut self) -> Self {
        self.invalid_credentials = true;
        self
    }

    #[must_use]
    pub fn with_crash(mut self, work_item: impl Into<String>) -> Self {
        self.crashing_work_items.insert(work_item.into());
        self
    }

    #[must_use]
    pub fn with_hang(mut self, work_item: impl Into<String>) -> Self {
        self.hanging_work_items.insert(work_item.into());
        self
    }

    #[must_use]
    pub fn with_stall(mut self, work_item: impl Into<String>) -> Self {
        self.stalled_work_items.insert(work_item.into());
        self
    }

    #[must_use]
    pub fn with_delete_fault(mut self, resource_type: impl Into<String>, error: ApiError) -> Self {
        self.delete_faults
            .entry(resource_type.into())
            .or_default()
            .push_back(error);
        self
    }

    #[must_use]
    pub fn with_undeletable(mut self, resource_type: impl Into<String>) -> Self {
        self.undeletable_types.insert(resource_type.into());
        self
    }

    #[must_use]
    pub fn with_rate_limited_creates(mut self, n: u32) -> Self {
        self.rate_limited_creates = n;
        self
    }

    #[must_use]
    pub fn with_duplicate_deliveries(mut self) -> Self {
        self.duplicate_deliveries = true;
        self
    }

    #[must_use]
    pub fn with_quota(mut self, quota: u32) -> Self {
        self.quota = quota;
        self
    }
}

/// How the scripted workload ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Finishes,
    Crashes,
    Stalls,
}

#[derive(Debug)]
struct Sandbox {
    work_item: String,
    polls: u32,
    outcome: SandboxState,
}

#[derive(Debug, Default)]
struct TenantState {
    identities: HashMap<String, IdentityHandle>,
    role_assignments: Vec<(String, String)>,
    secrets: HashMap<String, String>,
    resources: BTreeMap<String, TaggedResource>,
    sandboxes: HashMap<String, Sandbox>,
    pending: VecDeque<Delivery>,
    in_flight: BTreeMap<u64, Delivery>,
    next_delivery: u64,
    next_sequence: HashMap<String, u64>,
    identity_creates: u32,
    delete_calls: u64,
}

/// Counters for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantStats {
    pub identities: usize,
    pub secrets: usize,
    pub resources: usize,
    pub sandboxes: usize,
    pub role_assignments: usize,
    pub unacked_events: usize,
    pub delete_calls: u64,
}

/// Simulated cloud tenant
#[derive(Debug)]
pub struct SimulatedTenant {
    tenant_id: String,
    faults: Mutex<FaultPlan>,
    state: Mutex<TenantState>,
}

impl SimulatedTenant {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, faults: FaultPlan) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            faults: Mutex::new(faults),
            state: Mutex::new(TenantState::default()),
        }
    }

    /// Wire every port to this tenant
    #[must_use]
    pub fn ports(self: &Arc<Self>, store: Arc<dyn CampaignStore>) -> Ports {
        Ports {
            probe: self.clone(),
            tools: self.clone(),
            identities: self.clone(),
            vault: self.clone(),
            resources: self.clone(),
            sandbox: self.clone(),
            events: self.clone(),
            store,
        }
    }

    #[must_use]
    pub fn stats(&self) -> TenantStats {
        let state = self.state.lock();
        TenantStats {
            identities: state.identities.len(),
            secrets: state.secrets.len(),
            resources: state.resources.len(),
            sandboxes: state.sandboxes.len(),
            role_assignments: state.role_assignments.len(),
            unacked_events: state.pending.len() + state.in_flight.len(),
            delete_calls: state.delete_calls,
        }
    }

    /// Resources still tagged for `campaign_id`
    #[must_use]
    pub fn resources_for(&self, campaign_id: &str) -> Vec<TaggedResource> {
        self.state
            .lock()
            .resources
            .values()
            .filter(|r| r.tags.get(tags::CAMPAIGN_ID).map(String::as_str) == Some(campaign_id))
            .cloned()
            .collect()
    }

    /// Put a resource straight into the index, as if created out of band
    pub fn plant_resource(&self, resource: TaggedResource) {
        self.state
            .lock()
            .resources
            .insert(resource.resource_id.clone(), resource);
    }

    /// Put an identity in place, as if left by an earlier run
    pub fn plant_identity(&self, name: impl Into<String>) -> IdentityHandle {
        let handle = IdentityHandle {
            external_id: format!("app-{}", uuid::Uuid::new_v4()),
            principal_id: format!("sp-{}", uuid::Uuid::new_v4()),
        };
        self.state.lock().identities.insert(name.into(), handle.clone());
        handle
    }

    /// Put a secret in the vault, as if stored by an earlier run
    pub fn plant_secret(&self, name: &str) -> SecretRef {
        let reference = self.secret_reference(name);
        self.state
            .lock()
            .secrets
            .insert(reference.clone(), uuid::Uuid::new_v4().to_string());
        SecretRef(reference)
    }

    fn secret_reference(&self, name: &str) -> String {
        format!("vault://{}/{name}", self.tenant_id)
    }

    /// Publish a raw payload, as a workload would
    pub fn publish_raw(&self, payload: impl Into<String>) {
        let mut state = self.state.lock();
        state.next_delivery += 1;
        let delivery_id = state.next_delivery;
        state.pending.push_back(Delivery {
            delivery_id,
            payload: payload.into(),
        });
    }

    fn publish(&self, state: &mut TenantState, event: LogEvent) {
        let seq = state.next_sequence.entry(event.work_item.clone()).or_insert(0);
        *seq += 1;
        let event = event.with_sequence(*seq);
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        let copies = if self.faults.lock().duplicate_deliveries { 2 } else { 1 };
        for _ in 0..copies {
            state.next_delivery += 1;
            state.pending.push_back(Delivery {
                delivery_id: state.next_delivery,
                payload: payload.clone(),
            });
        }
    }

    /// Scripted workload: three resources, then success, a crash or silence
    fn run_workload(&self, state: &mut TenantState, spec: &SandboxSpec, ending: Ending) {
        let campaign_id = spec.env.get("CAMPAIGN_ID").cloned().unwrap_or_default();
        let work_item = spec.env.get("WORK_ITEM").cloned().unwrap_or_default();
        let created_at = chrono::Utc::now();
        let mut resource_tags = spec.tags.clone();
        resource_tags.insert(tags::CREATED_AT.to_string(), created_at.to_rfc3339());

        let group = format!("/tenants/{}/resourceGroups/{}-rg", self.tenant_id, spec.name);
        let layout = [
            (group.clone(), "resource_group", None),
            (format!("{group}/storageAccounts/sa{}", short_id()), "storage_account", Some(group.clone())),
            (format!("{group}/vaults/kv{}", short_id()), "key_vault", Some(group.clone())),
        ];

        self.publish(
            state,
            LogEvent::new(EventKind::Started, &campaign_id, &work_item, Severity::Info, "workload started"),
        );
        for (resource_id, resource_type, parent) in layout {
            state.resources.insert(
                resource_id.clone(),
                TaggedResource {
                    resource_id: resource_id.clone(),
                    resource_type: resource_type.to_string(),
                    tags: resource_tags.clone(),
                    parent_id: parent.clone(),
                },
            );
            let mut event = LogEvent::new(
                EventKind::ResourceCreated,
                &campaign_id,
                &work_item,
                Severity::Info,
                format!("created {resource_type}"),
            )
            .with_resource(resource_id, resource_type);
            if let Some(parent) = parent {
                event = event.with_detail("parent_id", serde_json::Value::String(parent));
            }
            self.publish(state, event);
        }

        match ending {
            Ending::Crashes => self.publish(
                state,
                LogEvent::new(EventKind::Error, &campaign_id, &work_item, Severity::Critical, "workload crashed"),
            ),
            Ending::Stalls => {}
            Ending::Finishes => {
                self.publish(
                    state,
                    LogEvent::new(EventKind::Operation, &campaign_id, &work_item, Severity::Info, "actions executed"),
                );
                self.publish(
                    state,
                    LogEvent::new(
                        EventKind::CleanupComplete,
                        &campaign_id,
                        &work_item,
                        Severity::Info,
                        "workload finished",
                    ),
                );
            }
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[async_trait]
impl EnvironmentProbe for SimulatedTenant {
    async fn check_control_plane(&self, tenant_id: &str, root_identity: &str) -> Result<String, ApiError> {
        if self.faults.lock().invalid_credentials {
            return Err(ApiError::Unauthorized(format!("{root_identity} rejected by {tenant_id}")));
        }
        if tenant_id != self.tenant_id {
            return Err(ApiError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(format!("{root_identity} authenticated against {tenant_id}"))
    }

    async fn check_reasoning_backend(&self) -> Result<String, ApiError> {
        if self.faults.lock().backend_down {
            return Err(ApiError::Transient("backend unavailable".into()));
        }
        Ok("backend reachable".into())
    }

    async fn quota_headroom(&self, _tenant_id: &str) -> Result<u32, ApiError> {
        Ok(self.faults.lock().quota)
    }
}

impl ToolLocator for SimulatedTenant {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        if self.faults.lock().missing_tools.contains(tool) {
            None
        } else {
            Some(PathBuf::from("/usr/local/bin").join(tool))
        }
    }
}

#[async_trait]
impl IdentityApi for SimulatedTenant {
    async fn lookup(&self, name: &str) -> Result<Option<IdentityHandle>, ApiError> {
        Ok(self.state.lock().identities.get(name).cloned())
    }

    async fn create(&self, name: &str) -> Result<CreatedIdentity, ApiError> {
        let mut state = self.state.lock();
        state.identity_creates += 1;
        if state.identity_creates <= self.faults.lock().rate_limited_creates {
            return Err(ApiError::RateLimited("too many identity requests".into()));
        }
        if state.identities.contains_key(name) {
            return Err(ApiError::Conflict(name.to_string()));
        }
        let handle = IdentityHandle {
            external_id: format!("app-{}", uuid::Uuid::new_v4()),
            principal_id: format!("sp-{}", uuid::Uuid::new_v4()),
        };
        state.identities.insert(name.to_string(), handle.clone());
        Ok(CreatedIdentity {
            handle,
            secret: SecretValue::new(uuid::Uuid::new_v4().to_string()),
        })
    }

    async fn assign_role(&self, principal_id: &str, role: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if !state.identities.values().any(|h| h.principal_id == principal_id) {
            return Err(ApiError::NotFound(principal_id.to_string()));
        }
        state
            .role_assignments
            .push((principal_id.to_string(), role.to_string()));
        Ok(())
    }

    async fn delete(&self, external_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let Some(name) = state
            .identities
            .iter()
            .find(|(_, h)| h.external_id == external_id)
            .map(|(name, _)| name.clone())
        else {
            return Err(ApiError::NotFound(external_id.to_string()));
        };
        if let Some(handle) = state.identities.remove(&name) {
            state.role_assignments.retain(|(p, _)| *p != handle.principal_id);
        }
        Ok(())
    }
}

#[async_trait]
impl SecretVault for SimulatedTenant {
    async fn put(&self, name: &str, value: SecretValue) -> Result<SecretRef, ApiError> {
        let reference = self.secret_reference(name);
        self.state
            .lock()
            .secrets
            .insert(reference.clone(), value.expose().to_string());
        Ok(SecretRef(reference))
    }

    async fn lookup(&self, name: &str) -> Result<Option<SecretRef>, ApiError> {
        let reference = self.secret_reference(name);
        Ok(self
            .state
            .lock()
            .secrets
            .contains_key(&reference)
            .then(|| SecretRef(reference)))
    }

    async fn delete(&self, reference: &SecretRef) -> Result<(), ApiError> {
        match self.state.lock().secrets.remove(&reference.0) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(reference.0.clone())),
        }
    }

    async fn exists(&self, reference: &SecretRef) -> Result<bool, ApiError> {
        Ok(self.state.lock().secrets.contains_key(&reference.0))
    }
}

#[async_trait]
impl ResourceIndex for SimulatedTenant {
    async fn query_by_tag(&self, key: &str, value: &str) -> Result<Vec<TaggedResource>, ApiError> {
        Ok(self
            .state
            .lock()
            .resources
            .values()
            .filter(|r| r.tags.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn delete(&self, resource_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        let Some(resource) = state.resources.get(resource_id).cloned() else {
            return Err(ApiError::NotFound(resource_id.to_string()));
        };
        {
            let mut faults = self.faults.lock();
            if faults.undeletable_types.contains(&resource.resource_type) {
                return Err(ApiError::Other(format!("{resource_id} is locked")));
            }
            if let Some(error) = faults
                .delete_faults
                .get_mut(&resource.resource_type)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
        }
        if state
            .resources
            .values()
            .any(|r| r.parent_id.as_deref() == Some(resource_id))
        {
            return Err(ApiError::HasDependents(resource_id.to_string()));
        }
        state.resources.remove(resource_id);
        state.sandboxes.remove(resource_id);
        debug!(resource_id, "Simulated resource deleted");
        Ok(())
    }
}

#[async_trait]
impl SandboxApi for SimulatedTenant {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, ApiError> {
        let work_item = spec.env.get("WORK_ITEM").cloned().unwrap_or_default();
        let (ending, hangs) = {
            let faults = self.faults.lock();
            let ending = if faults.crashing_work_items.contains(&work_item) {
                Ending::Crashes
            } else if faults.stalled_work_items.contains(&work_item) {
                Ending::Stalls
            } else {
                Ending::Finishes
            };
            (ending, faults.hanging_work_items.contains(&work_item))
        };
        let external_id = format!("/tenants/{}/containerGroups/{}", self.tenant_id, spec.name);

        let mut state = self.state.lock();
        if state.sandboxes.contains_key(&external_id) {
            return Err(ApiError::Conflict(external_id));
        }
        state.resources.insert(
            external_id.clone(),
            TaggedResource {
                resource_id: external_id.clone(),
                resource_type: "container_group".to_string(),
                tags: spec.tags.clone(),
                parent_id: None,
            },
        );
        self.run_workload(&mut state, spec, ending);
        let outcome = if ending == Ending::Crashes {
            SandboxState::Crashed {
                reason: "workload process exited with code 137".to_string(),
            }
        } else if hangs || ending == Ending::Stalls {
            SandboxState::Running
        } else {
            SandboxState::Succeeded
        };
        state.sandboxes.insert(
            external_id.clone(),
            Sandbox {
                work_item,
                polls: 0,
                outcome,
            },
        );
        Ok(external_id)
    }

    async fn state(&self, external_id: &str) -> Result<SandboxState, ApiError> {
        let polls_until_done = self.faults.lock().polls_until_done;
        let mut state = self.state.lock();
        let Some(sandbox) = state.sandboxes.get_mut(external_id) else {
            return Ok(SandboxState::Missing);
        };
        sandbox.polls += 1;
        if sandbox.polls <= polls_until_done {
            return Ok(SandboxState::Running);
        }
        debug!(work_item = %sandbox.work_item, outcome = ?sandbox.outcome, "Sandbox polled");
        Ok(sandbox.outcome.clone())
    }

    async fn delete(&self, external_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let removed = state.sandboxes.remove(external_id);
        state.resources.remove(external_id);
        match removed {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(external_id.to_string())),
        }
    }
}

#[async_trait]
impl EventBus for SimulatedTenant {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, ApiError> {
        let mut state = self.state.lock();
        // Unacknowledged messages go back to the head of the queue
        let unacked: Vec<_> = std::mem::take(&mut state.in_flight).into_values().collect();
        for delivery in unacked.into_iter().rev() {
            state.pending.push_front(delivery);
        }
        let take = max.min(state.pending.len());
        let batch: Vec<Delivery> = state.pending.drain(..take).collect();
        for delivery in &batch {
            state.in_flight.insert(delivery.delivery_id, delivery.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, delivery_id: u64) -> Result<(), ApiError> {
        self.state.lock().in_flight.remove(&delivery_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(work_item: &str) -> SandboxSpec {
        SandboxSpec {
            name: format!("sortie-{work_item}-wl"),
            image: "img".into(),
            memory_mb: 1536,
            cpu_millicores: 1000,
            timeout_ms: 1000,
            env: BTreeMap::from([
                ("CAMPAIGN_ID".to_string(), "c1".to_string()),
                ("WORK_ITEM".to_string(), work_item.to_string()),
            ]),
            secret_env: BTreeMap::new(),
            tags: sortie_core::ports::campaign_tags("c1", work_item, chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn workload_creates_tagged_resources_and_events() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy());
        let id = SandboxApi::create(&tenant, &spec("w1")).await.unwrap();

        let found = tenant.query_by_tag(tags::CAMPAIGN_ID, "c1").await.unwrap();
        assert_eq!(found.len(), 4);
        assert!(found.iter().any(|r| r.resource_id == id));

        let events = tenant.receive(100).await.unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(SandboxApi::state(&tenant, &id).await.unwrap(), SandboxState::Running);
        assert_eq!(SandboxApi::state(&tenant, &id).await.unwrap(), SandboxState::Succeeded);
    }

    #[tokio::test]
    async fn stalled_workload_goes_silent_and_keeps_running() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy().with_stall("w1"));
        let id = SandboxApi::create(&tenant, &spec("w1")).await.unwrap();

        let events = tenant.receive(100).await.unwrap();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|d| !d.payload.contains("cleanup_complete")));
        for _ in 0..3 {
            assert_eq!(SandboxApi::state(&tenant, &id).await.unwrap(), SandboxState::Running);
        }
    }

    #[tokio::test]
    async fn planted_secret_is_found_by_name() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy());
        assert_eq!(SecretVault::lookup(&tenant, "id-secret").await.unwrap(), None);

        let planted = tenant.plant_secret("id-secret");
        let found = SecretVault::lookup(&tenant, "id-secret").await.unwrap();
        assert_eq!(found, Some(planted.clone()));
        SecretVault::delete(&tenant, &planted).await.unwrap();
        assert_eq!(tenant.stats().secrets, 0);
    }

    #[tokio::test]
    async fn parents_refuse_deletion_while_children_exist() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy());
        SandboxApi::create(&tenant, &spec("w1")).await.unwrap();
        let group = tenant
            .resources_for("c1")
            .into_iter()
            .find(|r| r.resource_type == "resource_group")
            .unwrap();

        let err = ResourceIndex::delete(&tenant, &group.resource_id).await.unwrap_err();
        assert!(matches!(err, ApiError::HasDependents(_)));
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy());
        tenant.publish_raw("one");
        tenant.publish_raw("two");

        let first = tenant.receive(10).await.unwrap();
        tenant.ack(first[0].delivery_id).await.unwrap();
        let second = tenant.receive(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, "two");
    }

    #[tokio::test]
    async fn rate_limits_then_conflicts() {
        let tenant = SimulatedTenant::new("t", FaultPlan::healthy().with_rate_limited_creates(1));
        assert!(matches!(
            IdentityApi::create(&tenant, "a").await,
            Err(ApiError::RateLimited(_))
        ));
        assert!(IdentityApi::create(&tenant, "a").await.is_ok());
        assert!(matches!(
            IdentityApi::create(&tenant, "a").await,
            Err(ApiError::Conflict(_))
        ));
    }
}
