//! Testing utilities for Sortie workspace
//!
//! Shared fixtures: a config with millisecond timings and a harness that
//! wires an orchestrator to a simulated tenant and an in-memory store.

#![allow(missing_docs)]

use sortie_core::prelude::*;
use sortie_core::store::CampaignStore;
use sortie_core::{MemoryStore, RetryPolicy, Result, WorkSelector};
use sortie_sim::{demo_catalog, FaultPlan, SimulatedTenant, DEFAULT_TENANT};
use std::sync::Arc;
use std::time::Duration;

/// Initialize test logging (safe to call from every test)
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Campaign config whose every wait is a few milliseconds
#[must_use]
pub fn fast_config() -> CampaignConfig {
    let mut config = CampaignConfig::new()
        .with_tenant(DEFAULT_TENANT, "root@sim-tenant")
        .with_operating_window(Duration::from_millis(300))
        .with_propagation_delay(Duration::from_millis(5));
    config.execution_timeout_margin_ms = 200;
    config.dependency_requeue_ms = 1;
    config.monitoring.wake_interval_ms = 10;
    config.identity_retry = RetryPolicy::immediate(3);
    config.deletion_retry = RetryPolicy::immediate(4);
    config
}

/// Simulated tenant plus the store it checkpoints to
pub struct Harness {
    pub tenant: Arc<SimulatedTenant>,
    pub store: Arc<MemoryStore>,
    pub config: CampaignConfig,
    pub catalog: Vec<CatalogEntry>,
}

impl Harness {
    #[must_use]
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            tenant: Arc::new(SimulatedTenant::new(DEFAULT_TENANT, faults)),
            store: Arc::new(MemoryStore::new()),
            config: fast_config(),
            catalog: demo_catalog(50),
        }
    }

    #[must_use]
    pub fn healthy() -> Self {
        Self::new(FaultPlan::healthy())
    }

    #[must_use]
    pub fn with_config(mut self, config: CampaignConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn ports(&self) -> Ports {
        let store: Arc<dyn CampaignStore> = self.store.clone();
        self.tenant.ports(store)
    }

    /// New campaign with a seeded selector
    pub async fn start(&self, seed: u64) -> Result<Orchestrator> {
        let orchestrator = Orchestrator::start(self.config.clone(), self.catalog.clone(), self.ports()).await?;
        Ok(orchestrator.with_selector(WorkSelector::with_seed(seed)))
    }

    /// Rebuild a campaign from its last checkpoint
    pub async fn resume(&self, campaign_id: CampaignId) -> Result<Orchestrator> {
        Orchestrator::resume(campaign_id, self.catalog.clone(), self.ports()).await
    }

    /// Run a fresh campaign to completion
    pub async fn run(&self, seed: u64) -> Result<CampaignReport> {
        self.start(seed).await?.run().await
    }
}
