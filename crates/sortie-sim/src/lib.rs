//! Sortie Sim - in-memory tenant for running campaigns without a cloud
//!
//! [`SimulatedTenant`] implements every port the engine drives. Workloads it
//! launches run a short script on the spot: they create a tagged resource
//! group with two children and report it on the event bus. Failures are
//! injected with a [`FaultPlan`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod catalog;
pub mod tenant;

pub use catalog::{demo_catalog, noisy_catalog};
pub use tenant::{FaultPlan, SimulatedTenant, TenantStats};

/// Tenant id used by the simulator unless told otherwise
pub const DEFAULT_TENANT: &str = "sim-tenant";
