//! Sortie Core - checkpointed campaign lifecycle engine
//!
//! Runs time-boxed campaigns against a cloud tenant:
//! - Validates the environment before anything is created
//! - Selects work items from a catalog
//! - Provisions one ephemeral identity and one isolated workload per work item
//! - Aggregates workload events into a resource ledger while they run
//! - Verifies and forces cleanup of everything the campaign created
//! - Reports the final disposition of every work item and resource
//!
//! Every side effect goes through the traits in [`ports`]; the campaign state
//! is checkpointed through a [`store::CampaignStore`] after every phase.
//!
//! # Example
//!
//! ```rust,ignore
//! use sortie_core::prelude::*;
//!
//! # async fn example(ports: Ports, catalog: Vec<CatalogEntry>) -> sortie_core::Result<()> {
//! let config = CampaignConfig::new().with_tenant("tenant-a", "root@tenant-a");
//! let mut orchestrator = Orchestrator::start(config, catalog, ports).await?;
//! let report = orchestrator.run().await?;
//!
//! println!("{:?}: {} work items", report.campaign.status, report.work_items.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod aggregator;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod deployment;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod orchestrator;
pub mod ports;
pub mod retry;
pub mod selector;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod validator;

// Re-exports for convenience
pub use aggregator::{EventAggregator, PumpStats, WorkItemProgress};
pub use cleanup::{CleanupEnforcer, CleanupOutcome, CleanupReport, DeletionFailure};
pub use config::{CampaignConfig, ComputeResources, MonitoringConfig, RetryPolicy};
pub use context::{CampaignContext, CampaignReport, StatusSnapshot, WorkItemOutcome, WorkItemStatus};
pub use deployment::DeploymentManager;
pub use error::{
    ApiError, CleanupError, ConfigError, DeploymentError, ErrorKind, IdentityError, MalformedEntry, Result,
    SelectionError, SortieError, StoreError, ValidationError,
};
pub use events::{ChainedEvent, EventKind, LogEvent, Severity};
pub use identity::{IdentityDeletion, IdentityManager};
pub use ledger::{LedgerCounts, RecordStatus, ResourceLedger, ResourceRecord};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use ports::Ports;
pub use selector::WorkSelector;
pub use store::{CampaignStore, FileStore, MemoryStore};
pub use types::{
    Campaign, CampaignId, CampaignStatus, CatalogEntry, Identity, IdentityStatus, Phase, SecretRef, SizeClass,
    WorkItemSelection, Workload, WorkloadStatus,
};
pub use validator::{CheckResult, EnvironmentValidator, ValidationReport};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running campaigns
    pub use crate::{
        CampaignConfig, CampaignId, CampaignReport, CampaignStatus, CatalogEntry, Orchestrator, Phase, Ports,
        SizeClass, StatusSnapshot, StepOutcome,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
