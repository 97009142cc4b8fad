//! Identity Lifecycle Manager
//!
//! One ephemeral identity per work item, named `<prefix>-<work_item>-admin`.
//! An existing identity with that name is a conflict, never reused, but the
//! conflict carries its handle so the caller can still clean it up. The
//! secret goes straight into the vault as `<identity>-secret`; only its
//! reference leaves this module.

use crate::config::{CampaignConfig, RetryPolicy};
use crate::error::{ApiError, IdentityError};
use crate::ports::{IdentityApi, IdentityHandle, SecretVault};
use crate::retry::retry_transient;
use crate::types::{Identity, IdentityStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of a deletion attempt
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityDeletion {
    pub identity: Identity,
    /// Set when the identity is `deletion_failed`
    pub error: Option<String>,
}

/// Creates, waits on, and deletes ephemeral identities
pub struct IdentityManager {
    api: Arc<dyn IdentityApi>,
    vault: Arc<dyn SecretVault>,
    retry: RetryPolicy,
    prefix: String,
    propagation_delay: Duration,
}

impl IdentityManager {
    #[must_use]
    pub fn new(api: Arc<dyn IdentityApi>, vault: Arc<dyn SecretVault>, config: &CampaignConfig) -> Self {
        Self {
            api,
            vault,
            retry: config.identity_retry.clone(),
            prefix: config.name_prefix.clone(),
            propagation_delay: config.propagation_delay(),
        }
    }

    #[must_use]
    pub fn identity_name(&self, work_item: &str) -> String {
        format!("{}-{}-admin", self.prefix, work_item)
    }

    /// Create the identity for `work_item`, assign `roles` and vault its secret.
    ///
    /// The returned identity is not usable before `usable_at`. When a step
    /// after creation fails, the error carries the half-built identity so it
    /// can still be cleaned up.
    #[instrument(skip(self, roles), fields(identity = tracing::field::Empty))]
    pub async fn create(&self, work_item: &str, roles: &[String]) -> Result<Identity, IdentityError> {
        let name = self.identity_name(work_item);
        tracing::Span::current().record("identity", name.as_str());

        let existing = retry_transient(&self.retry, "identity.lookup", || self.api.lookup(&name))
            .await
            .map_err(|source| IdentityError::Provisioning {
                name: name.clone(),
                step: "lookup",
                source,
                created: None,
            })?;
        if let Some(existing) = existing {
            warn!(external_id = %existing.external_id, "Identity name already taken");
            return Err(IdentityError::Conflict {
                name,
                existing: Some(existing),
            });
        }

        let created = match retry_transient(&self.retry, "identity.create", || self.api.create(&name)).await {
            Ok(created) => created,
            Err(ApiError::Conflict(_)) => {
                // A retried create can collide with its own first attempt
                let existing = self.api.lookup(&name).await.unwrap_or_else(|e| {
                    warn!(error = %e, "Lookup after create conflict failed");
                    None
                });
                return Err(IdentityError::Conflict { name, existing });
            }
            Err(source) => {
                return Err(IdentityError::Provisioning {
                    name,
                    step: "create",
                    source,
                    created: None,
                })
            }
        };

        let now = Utc::now();
        let mut identity = Identity {
            name: name.clone(),
            work_item: work_item.to_string(),
            external_id: created.handle.external_id.clone(),
            principal_id: created.handle.principal_id.clone(),
            secret_ref: None,
            roles: Vec::with_capacity(roles.len()),
            status: IdentityStatus::Created,
            created_at: now,
            usable_at: now,
        };

        for role in roles {
            let assigned = retry_transient(&self.retry, "identity.assign_role", || {
                self.api.assign_role(&identity.principal_id, role)
            })
            .await;
            if let Err(source) = assigned {
                return Err(IdentityError::Provisioning {
                    name,
                    step: "assign_role",
                    source,
                    created: Some(Box::new(identity)),
                });
            }
            identity.roles.push(role.clone());
        }

        let secret_name = secret_name(&name);
        let stored = retry_transient(&self.retry, "vault.put", || {
            self.vault.put(&secret_name, created.secret.clone())
        })
        .await;
        match stored {
            Ok(reference) => identity.secret_ref = Some(reference),
            Err(source) => {
                return Err(IdentityError::Provisioning {
                    name,
                    step: "store_secret",
                    source,
                    created: Some(Box::new(identity)),
                })
            }
        }

        identity.usable_at = Utc::now() + chrono::Duration::from_std(self.propagation_delay).unwrap_or_default();
        info!(usable_at = %identity.usable_at, roles = identity.roles.len(), "Identity created");
        Ok(identity)
    }

    /// Track an identity found in the tenant so cleanup deletes it. Its secret
    /// reference is unknown; [`delete`](Self::delete) finds it by name.
    #[must_use]
    pub fn adopt(&self, work_item: &str, handle: IdentityHandle, now: DateTime<Utc>) -> Identity {
        Identity {
            name: self.identity_name(work_item),
            work_item: work_item.to_string(),
            external_id: handle.external_id,
            principal_id: handle.principal_id,
            secret_ref: None,
            roles: Vec::new(),
            status: IdentityStatus::Exists,
            created_at: now,
            usable_at: now,
        }
    }

    /// Best-effort delete of the vault secret and the identity, verified by
    /// lookup. Never fails: the outcome is in the returned status.
    #[instrument(skip_all, fields(identity = %identity.name))]
    pub async fn delete(&self, identity: &Identity) -> IdentityDeletion {
        let mut errors = Vec::new();

        let secret_ref = match &identity.secret_ref {
            Some(reference) => Some(reference.clone()),
            None => {
                let secret_name = secret_name(&identity.name);
                match retry_transient(&self.retry, "vault.lookup", || self.vault.lookup(&secret_name)).await {
                    Ok(found) => found,
                    Err(e) => {
                        errors.push(format!("secret lookup: {e}"));
                        None
                    }
                }
            }
        };
        if let Some(reference) = &secret_ref {
            debug!(secret = %reference, "Deleting vault secret");
            match retry_transient(&self.retry, "vault.delete", || self.vault.delete(reference)).await {
                Ok(()) | Err(ApiError::NotFound(_)) => {}
                Err(e) => errors.push(format!("secret: {e}")),
            }
            match self.vault.exists(reference).await {
                Ok(false) => {}
                Ok(true) => errors.push("secret still present after delete".to_string()),
                Err(e) => errors.push(format!("secret check: {e}")),
            }
        }

        match retry_transient(&self.retry, "identity.delete", || self.api.delete(&identity.external_id)).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(e) => errors.push(format!("identity: {e}")),
        }

        match self.api.lookup(&identity.name).await {
            Ok(None) => {}
            Ok(Some(_)) => errors.push("identity still present after delete".to_string()),
            Err(e) => errors.push(format!("verification: {e}")),
        }

        let mut identity = identity.clone();
        identity.secret_ref = secret_ref;
        if errors.is_empty() {
            identity.status = IdentityStatus::Deleted;
            info!("Identity deleted");
            IdentityDeletion { identity, error: None }
        } else {
            identity.status = IdentityStatus::DeletionFailed;
            let error = errors.join("; ");
            warn!(%error, "Identity deletion failed");
            IdentityDeletion {
                identity,
                error: Some(error),
            }
        }
    }
}

fn secret_name(identity_name: &str) -> String {
    format!("{identity_name}-secret")
}
