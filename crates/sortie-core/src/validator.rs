//! Environment Validator
//!
//! Runs every pre-flight check before anything is created in the tenant.
//! All checks run even when an early one fails so the report shows the whole
//! picture at once.

use crate::config::CampaignConfig;
use crate::error::ValidationError;
use crate::ports::{EnvironmentProbe, ToolLocator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of one pre-flight check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// All checks run for a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    /// True when every check passed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    #[must_use]
    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Convert a failing report into the fatal error
    pub fn ensure_passed(&self) -> Result<(), ValidationError> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(());
        }
        let summary = failures
            .iter()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ValidationError::ChecksFailed {
            failed: failures.len(),
            total: self.checks.len(),
            summary,
        })
    }
}

/// Pre-flight checker
pub struct EnvironmentValidator {
    probe: Arc<dyn EnvironmentProbe>,
    tools: Arc<dyn ToolLocator>,
}

impl EnvironmentValidator {
    #[must_use]
    pub fn new(probe: Arc<dyn EnvironmentProbe>, tools: Arc<dyn ToolLocator>) -> Self {
        Self { probe, tools }
    }

    /// Run every check. Never short-circuits.
    #[instrument(skip_all, fields(tenant = %config.tenant_id))]
    pub async fn validate(&self, config: &CampaignConfig) -> ValidationReport {
        let requested = config.size_class.count();
        let (control_plane, backend, quota) = tokio::join!(
            self.probe
                .check_control_plane(&config.tenant_id, &config.root_identity),
            self.probe.check_reasoning_backend(),
            self.probe.quota_headroom(&config.tenant_id),
        );

        let mut checks = Vec::with_capacity(3 + config.required_tools.len());
        checks.push(match control_plane {
            Ok(detail) => CheckResult::pass("control_plane", detail),
            Err(e) => CheckResult::fail("control_plane", e.to_string()),
        });
        checks.push(match backend {
            Ok(detail) => CheckResult::pass("reasoning_backend", detail),
            Err(e) => CheckResult::fail("reasoning_backend", e.to_string()),
        });
        checks.push(match quota {
            Ok(headroom) if headroom as usize >= requested => CheckResult::pass(
                "quota",
                format!("{headroom} units available, {requested} needed"),
            ),
            Ok(headroom) => CheckResult::fail(
                "quota",
                format!("{headroom} units available, {requested} needed"),
            ),
            Err(e) => CheckResult::fail("quota", e.to_string()),
        });
        for tool in &config.required_tools {
            let name = format!("tool:{tool}");
            checks.push(match self.tools.locate(tool) {
                Some(path) => CheckResult::pass(name, path.display().to_string()),
                None => CheckResult::fail(name, "not found on PATH"),
            });
        }

        let report = ValidationReport {
            checks,
            checked_at: Utc::now(),
        };
        if report.passed() {
            info!(checks = report.checks.len(), "Environment validated");
        } else {
            for failure in report.failures() {
                warn!(check = %failure.name, detail = %failure.detail, "Environment check failed");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::ports::{MockEnvironmentProbe, MockToolLocator};
    use std::path::PathBuf;

    fn healthy_probe() -> MockEnvironmentProbe {
        let mut probe = MockEnvironmentProbe::new();
        probe
            .expect_check_control_plane()
            .returning(|_, _| Ok("subscription ok".into()));
        probe
            .expect_check_reasoning_backend()
            .returning(|| Ok("model ok".into()));
        probe.expect_quota_headroom().returning(|_| Ok(10));
        probe
    }

    fn config() -> CampaignConfig {
        CampaignConfig::new()
            .with_tenant("tenant-a", "root")
            .with_required_tools(vec!["az".into()])
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let mut tools = MockToolLocator::new();
        tools
            .expect_locate()
            .returning(|t| Some(PathBuf::from(format!("/usr/bin/{t}"))));
        let validator = EnvironmentValidator::new(Arc::new(healthy_probe()), Arc::new(tools));

        let report = validator.validate(&config()).await;
        assert!(report.passed());
        assert_eq!(report.checks.len(), 4);
        assert!(report.ensure_passed().is_ok());
    }

    #[tokio::test]
    async fn reports_every_failure() {
        let mut probe = MockEnvironmentProbe::new();
        probe
            .expect_check_control_plane()
            .returning(|_, _| Err(ApiError::Unauthorized("token expired".into())));
        probe
            .expect_check_reasoning_backend()
            .returning(|| Ok("model ok".into()));
        probe.expect_quota_headroom().returning(|_| Ok(2));
        let mut tools = MockToolLocator::new();
        tools.expect_locate().returning(|_| None);
        let validator = EnvironmentValidator::new(Arc::new(probe), Arc::new(tools));

        let report = validator.validate(&config()).await;
        assert!(!report.passed());
        let failed: Vec<_> = report.failures().iter().map(|c| c.name.clone()).collect();
        assert_eq!(failed, vec!["control_plane", "quota", "tool:az"]);
        assert!(matches!(
            report.ensure_passed(),
            Err(ValidationError::ChecksFailed { failed: 3, total: 4, .. })
        ));
    }
}
