//! Error types for Sortie Core
//!
//! Errors are grouped by the component that raises them and classified into
//! four kinds that decide how far a failure propagates:
//! - `Transient`: rate limits and network blips, retried with backoff
//! - `Fatal`: bad credentials, config or quota, aborts before provisioning
//! - `WorkItem`: isolated to one work item, siblings keep going
//! - `Cleanup`: a resource survived every retry, recorded in the report

use crate::types::Phase;

/// Failure classification used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retried with exponential backoff up to a bound
    Transient,
    /// Aborts the campaign before any provisioning
    Fatal,
    /// Marks one work item failed
    WorkItem,
    /// Recorded in the cleanup report, never blocks completion
    Cleanup,
}

/// Main Sortie error type
#[derive(Debug, thiserror::Error)]
pub enum SortieError {
    /// Environment validation failed
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Work selection failed
    #[error("selection failed: {0}")]
    Selection(#[from] SelectionError),

    /// Identity lifecycle failure
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Workload deployment failure
    #[error("deployment error: {0}")]
    Deployment(#[from] DeploymentError),

    /// Cleanup failure
    #[error("cleanup error: {0}")]
    Cleanup(#[from] CleanupError),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// External API error that escaped a component
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Attempted phase transition is not in the lifecycle graph
    #[error("illegal phase transition: {from:?} -> {to:?}")]
    IllegalTransition { from: Phase, to: Phase },

    /// Campaign checkpoint does not exist
    #[error("campaign not found: {0}")]
    CampaignNotFound(String),
}

impl SortieError {
    /// Classify this error for propagation
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Selection(_) | Self::Config(_) => ErrorKind::Fatal,
            Self::Identity(e) if e.is_retryable() => ErrorKind::Transient,
            Self::Identity(_) | Self::Deployment(_) => ErrorKind::WorkItem,
            Self::Cleanup(_) => ErrorKind::Cleanup,
            Self::Api(e) if e.is_transient() => ErrorKind::Transient,
            Self::Store(StoreError::Io(_)) => ErrorKind::Transient,
            Self::Api(_)
            | Self::Store(_)
            | Self::IllegalTransition { .. }
            | Self::CampaignNotFound(_) => ErrorKind::Fatal,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Errors returned by external collaborators (identity, index, sandbox, bus)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Throttled by the control plane
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network or service hiccup
    #[error("transient failure: {0}")]
    Transient(String),

    /// Target does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Target cannot be deleted while children exist
    #[error("resource has dependents: {0}")]
    HasDependents(String),

    /// Credentials rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Rate limits and transient failures are worth retrying
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

/// Environment validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// One or more checks failed
    #[error("{failed} of {total} environment checks failed: {summary}")]
    ChecksFailed {
        failed: usize,
        total: usize,
        summary: String,
    },
}

/// Work selection errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// Catalog smaller than the requested size class
    #[error("catalog has {available} entries, {requested} requested")]
    CatalogTooSmall { requested: usize, available: usize },

    /// Re-sampling ran out of well-formed entries
    #[error("only {valid} well-formed entries available, {requested} requested")]
    InsufficientValidEntries { requested: usize, valid: usize },
}

/// Catalog entry rejected by the selector
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEntry {
    #[error("catalog key {0:?} is not a valid work item key")]
    InvalidKey(String),

    #[error("catalog entry {0} has no category")]
    MissingCategory(String),

    #[error("catalog entry {0} has no doc reference")]
    MissingDocReference(String),
}

/// Identity lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// An identity with the derived name already exists
    #[error("identity {name} already exists")]
    Conflict {
        name: String,
        existing: Option<crate::ports::IdentityHandle>,
    },

    /// A provisioning step failed; `created` holds what must still be cleaned up
    #[error("identity {name} failed during {step}: {source}")]
    Provisioning {
        name: String,
        step: &'static str,
        #[source]
        source: ApiError,
        created: Option<Box<crate::types::Identity>>,
    },
}

impl IdentityError {
    /// Only transient provisioning failures are retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provisioning { source, .. } if source.is_transient())
    }

    /// Identity that exists in the tenant despite the failure
    #[must_use]
    pub fn leftover(&self) -> Option<&crate::types::Identity> {
        match self {
            Self::Provisioning { created, .. } => created.as_deref(),
            Self::Conflict { .. } => None,
        }
    }
}

/// Workload deployment errors
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    /// Identity not ready for use
    #[error("identity for {work_item} is not usable: {reason}")]
    IdentityNotReady { work_item: String, reason: String },

    /// Sandbox API rejected the launch
    #[error("sandbox launch for {work_item} failed: {source}")]
    LaunchFailed {
        work_item: String,
        #[source]
        source: ApiError,
    },

    /// Teardown failed
    #[error("sandbox teardown of {name} failed: {source}")]
    TeardownFailed {
        name: String,
        #[source]
        source: ApiError,
    },
}

/// Cleanup verification errors
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    /// Tagged-resource index could not be queried
    #[error("resource index query failed: {0}")]
    QueryFailed(#[source] ApiError),
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Appended event log failed its hash chain check
    #[error("event log integrity violation at entry {index}")]
    IntegrityViolation { index: u64 },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Convenience result alias
pub type Result<T, E = SortieError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_transience() {
        assert!(ApiError::RateLimited("429".into()).is_transient());
        assert!(ApiError::Transient("reset".into()).is_transient());
        assert!(!ApiError::HasDependents("rg".into()).is_transient());
        assert!(!ApiError::Unauthorized("bad token".into()).is_transient());
    }

    #[test]
    fn error_kinds() {
        let fatal = SortieError::Selection(SelectionError::CatalogTooSmall {
            requested: 5,
            available: 2,
        });
        assert_eq!(fatal.kind(), ErrorKind::Fatal);

        let transient = SortieError::Api(ApiError::RateLimited("slow down".into()));
        assert!(transient.is_retryable());

        let item = SortieError::Deployment(DeploymentError::LaunchFailed {
            work_item: "w1".into(),
            source: ApiError::Other("quota".into()),
        });
        assert_eq!(item.kind(), ErrorKind::WorkItem);
    }

    #[test]
    fn retryable_identity_error() {
        let err = IdentityError::Provisioning {
            name: "sortie-w1-admin".into(),
            step: "assign_role",
            source: ApiError::Transient("timeout".into()),
            created: None,
        };
        assert!(err.is_retryable());
        assert!(err.leftover().is_none());
        assert!(err.to_string().contains("assign_role"));
    }

    #[test]
    fn error_display() {
        let err = SortieError::IllegalTransition {
            from: Phase::Monitoring,
            to: Phase::Selecting,
        };
        assert!(err.to_string().contains("illegal phase transition"));
    }
}
