//! Campaign configuration
//!
//! Loaded from TOML; every field has a default so a config file only needs the
//! tenant coordinates. Durations are plain integers with a unit suffix.

use crate::error::ConfigError;
use crate::types::SizeClass;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Campaign configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Target tenant
    pub tenant_id: String,
    /// Root identity used by the orchestrator itself
    pub root_identity: String,
    /// How many work items to select
    pub size_class: SizeClass,
    /// Prefix for identity and workload names
    pub name_prefix: String,
    /// Roles assigned to every ephemeral identity
    pub roles: Vec<String>,
    /// Binaries that must be on `PATH` before anything is created
    pub required_tools: Vec<String>,
    /// Fan-out cap for provisioning and forced cleanup
    pub max_concurrency: usize,
    /// How long workloads operate unattended
    pub operating_window_ms: u64,
    /// Added to the operating window to form the execution timeout
    pub execution_timeout_margin_ms: u64,
    /// Wait after role assignment before an identity is usable
    pub propagation_delay_ms: u64,
    /// Delay before retrying a resource that still has dependents
    pub dependency_requeue_ms: u64,
    /// Container image run by every workload
    pub workload_image: String,
    /// Retry policy for identity API calls
    pub identity_retry: RetryPolicy,
    /// Retry policy for resource deletions
    pub deletion_retry: RetryPolicy,
    pub monitoring: MonitoringConfig,
    /// Minimum resources any compute unit gets
    pub resource_floor: ComputeResources,
    /// Resources requested per workload, raised to the floor
    pub workload_resources: ComputeResources,
    /// Resource types in deletion order (earlier deleted first)
    pub delete_order: Vec<String>,
}

impl CampaignConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// With tenant coordinates
    #[inline]
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>, root_identity: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self.root_identity = root_identity.into();
        self
    }

    /// With size class
    #[inline]
    #[must_use]
    pub fn with_size_class(mut self, size_class: SizeClass) -> Self {
        self.size_class = size_class;
        self
    }

    /// With fan-out cap
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// With operating window
    #[inline]
    #[must_use]
    pub fn with_operating_window(mut self, window: Duration) -> Self {
        self.operating_window_ms = window.as_millis() as u64;
        self
    }

    /// With role propagation delay
    #[inline]
    #[must_use]
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay_ms = delay.as_millis() as u64;
        self
    }

    /// With required tool binaries
    #[inline]
    #[must_use]
    pub fn with_required_tools(mut self, tools: Vec<String>) -> Self {
        self.required_tools = tools;
        self
    }

    /// Reject values the engine cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ConfigError::invalid("tenant_id", "must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be at least 1"));
        }
        if self.operating_window_ms == 0 {
            return Err(ConfigError::invalid("operating_window_ms", "must be positive"));
        }
        if self.execution_timeout_margin_ms == 0 {
            return Err(ConfigError::invalid(
                "execution_timeout_margin_ms",
                "execution timeout must be strictly greater than the operating window",
            ));
        }
        if self.monitoring.wake_interval_ms == 0 {
            return Err(ConfigError::invalid("monitoring.wake_interval_ms", "must be positive"));
        }
        if self.roles.is_empty() {
            return Err(ConfigError::invalid("roles", "at least one role is required"));
        }
        self.identity_retry.validate("identity_retry")?;
        self.deletion_retry.validate("deletion_retry")?;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn operating_window(&self) -> Duration {
        Duration::from_millis(self.operating_window_ms)
    }

    /// Always strictly greater than the operating window
    #[inline]
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.operating_window_ms + self.execution_timeout_margin_ms.max(1))
    }

    #[inline]
    #[must_use]
    pub fn propagation_delay(&self) -> Duration {
        Duration::from_millis(self.propagation_delay_ms)
    }

    #[inline]
    #[must_use]
    pub fn dependency_requeue(&self) -> Duration {
        Duration::from_millis(self.dependency_requeue_ms)
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            root_identity: String::new(),
            size_class: SizeClass::Small,
            name_prefix: "sortie".to_string(),
            roles: vec!["Contributor".to_string()],
            required_tools: Vec::new(),
            max_concurrency: 5,
            operating_window_ms: 6 * 60 * 60 * 1000,
            execution_timeout_margin_ms: 30 * 60 * 1000,
            propagation_delay_ms: 60_000,
            dependency_requeue_ms: 30_000,
            workload_image: "sortie/workload:latest".to_string(),
            identity_retry: RetryPolicy {
                max_attempts: 5,
                initial_delay_ms: 1_000,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
            deletion_retry: RetryPolicy::default(),
            monitoring: MonitoringConfig::default(),
            resource_floor: ComputeResources::default(),
            workload_resources: ComputeResources {
                memory_mb: 1024,
                cpu_millicores: 500,
            },
            delete_order: vec![
                "role_assignment".to_string(),
                "function_app".to_string(),
                "virtual_machine".to_string(),
                "network_interface".to_string(),
                "storage_account".to_string(),
                "key_vault".to_string(),
                "virtual_network".to_string(),
                "resource_group".to_string(),
            ],
        }
    }
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 1s doubling to a 60s cap, seven attempts
    fn default() -> Self {
        Self {
            max_attempts: 7,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and simulations
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (0-based):
    /// `initial * multiplier^retry`, capped at `max_delay`
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.min(63) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(field, "max_attempts must be at least 1"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(field, "initial delay exceeds max delay"));
        }
        Ok(())
    }
}

/// Monitoring wake loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Period between status checks
    pub wake_interval_ms: u64,
    /// Max bus messages pulled per receive call
    pub batch_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            wake_interval_ms: 15 * 60 * 1000,
            batch_size: 256,
        }
    }
}

impl MonitoringConfig {
    #[inline]
    #[must_use]
    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }
}

/// Memory and CPU for a compute unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeResources {
    pub memory_mb: u32,
    pub cpu_millicores: u32,
}

impl ComputeResources {
    /// Raise each dimension to at least `floor`
    #[inline]
    #[must_use]
    pub fn at_least(self, floor: ComputeResources) -> Self {
        Self {
            memory_mb: self.memory_mb.max(floor.memory_mb),
            cpu_millicores: self.cpu_millicores.max(floor.cpu_millicores),
        }
    }
}

impl Default for ComputeResources {
    fn default() -> Self {
        Self {
            memory_mb: 1536,
            cpu_millicores: 1000,
        }
    }
}
