//! Campaign orchestrator
//!
//! Drives a [`CampaignContext`] through the phase graph one `step()` at a
//! time. Every transition is checkpointed before the step returns, so a
//! process that dies at any point can be rebuilt with
//! [`Orchestrator::resume`] and picks up at the last checkpoint. Long waits
//! (role propagation, the monitoring interval) are returned to the caller as
//! wake times instead of being slept inside a step.

use crate::aggregator::EventAggregator;
use crate::cleanup::CleanupEnforcer;
use crate::config::CampaignConfig;
use crate::context::{CampaignContext, CampaignReport, StatusSnapshot};
use crate::deployment::DeploymentManager;
use crate::error::{IdentityError, Result, SortieError};
use crate::identity::IdentityManager;
use crate::ledger::ResourceLedger;
use crate::ports::Ports;
use crate::selector::WorkSelector;
use crate::state_machine::validate_transition;
use crate::types::{CampaignId, CatalogEntry, CampaignStatus, Phase, WorkloadStatus};
use crate::validator::EnvironmentValidator;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What one `step()` did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Moved to a new phase
    Advanced(Phase),
    /// Nothing to do before `until`
    Sleep { until: DateTime<Utc> },
    /// Terminal phase reached
    Finished(Box<CampaignReport>),
}

/// Single coordinator for one campaign
pub struct Orchestrator {
    ctx: CampaignContext,
    ports: Ports,
    catalog: Vec<CatalogEntry>,
    ledger: Arc<ResourceLedger>,
    aggregator: EventAggregator,
    validator: EnvironmentValidator,
    selector: WorkSelector,
    identities: Arc<IdentityManager>,
    deployments: DeploymentManager,
    cleanup: CleanupEnforcer,
}

impl Orchestrator {
    /// Create a new campaign and write its first checkpoint
    pub async fn start(config: CampaignConfig, catalog: Vec<CatalogEntry>, ports: Ports) -> Result<Self> {
        config.validate()?;
        let ctx = CampaignContext::new(config, Utc::now());
        let orchestrator = Self::assemble(ctx, catalog, ports, Arc::new(ResourceLedger::new()));
        orchestrator.ports.store.save_checkpoint(&orchestrator.ctx).await?;
        info!(campaign_id = %orchestrator.ctx.id(), scheduled_end_at = %orchestrator.ctx.campaign.scheduled_end_at, "Campaign started");
        Ok(orchestrator)
    }

    /// Rebuild from the last checkpoint of `campaign_id`
    pub async fn resume(campaign_id: CampaignId, catalog: Vec<CatalogEntry>, ports: Ports) -> Result<Self> {
        let ctx = ports
            .store
            .load_checkpoint(&campaign_id)
            .await?
            .ok_or_else(|| SortieError::CampaignNotFound(campaign_id.to_string()))?;
        let ledger = Arc::new(ResourceLedger::from_snapshot(ctx.ledger.clone()));
        let orchestrator = Self::assemble(ctx, catalog, ports, ledger);
        let replayed = orchestrator.aggregator.restore().await?;
        info!(
            %campaign_id,
            phase = %orchestrator.ctx.campaign.phase,
            revision = orchestrator.ctx.revision,
            replayed,
            "Campaign resumed"
        );
        Ok(orchestrator)
    }

    /// Use a deterministic work selector
    #[must_use]
    pub fn with_selector(mut self, selector: WorkSelector) -> Self {
        self.selector = selector;
        self
    }

    fn assemble(ctx: CampaignContext, catalog: Vec<CatalogEntry>, ports: Ports, ledger: Arc<ResourceLedger>) -> Self {
        let config = &ctx.config;
        let identities = Arc::new(IdentityManager::new(
            Arc::clone(&ports.identities),
            Arc::clone(&ports.vault),
            config,
        ));
        let aggregator = EventAggregator::new(
            ctx.campaign.id,
            Arc::clone(&ports.events),
            Arc::clone(&ports.store),
            Arc::clone(&ledger),
            config.monitoring.batch_size,
        );
        let validator = EnvironmentValidator::new(Arc::clone(&ports.probe), Arc::clone(&ports.tools));
        let deployments = DeploymentManager::new(Arc::clone(&ports.sandbox), config);
        let cleanup = CleanupEnforcer::new(
            Arc::clone(&ports.resources),
            Arc::clone(&identities),
            Arc::clone(&ledger),
            config,
        );
        Self {
            ctx,
            ports,
            catalog,
            ledger,
            aggregator,
            validator,
            selector: WorkSelector::new(),
            identities,
            deployments,
            cleanup,
        }
    }

    #[inline]
    #[must_use]
    pub fn campaign_id(&self) -> CampaignId {
        self.ctx.id()
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.ctx.campaign.phase
    }

    #[must_use]
    pub fn context(&self) -> &CampaignContext {
        &self.ctx
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::from_context(&self.ctx, &self.aggregator.all_progress(), self.ledger.counts())
    }

    /// Run until a terminal phase, sleeping through wake times
    pub async fn run(&mut self) -> Result<CampaignReport> {
        loop {
            match self.step().await? {
                StepOutcome::Advanced(_) => {}
                StepOutcome::Sleep { until } => {
                    let wait = (until - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }
                StepOutcome::Finished(report) => return Ok(*report),
            }
        }
    }

    /// Execute the current phase once
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let phase = self.ctx.campaign.phase;
        let span = info_span!("phase", campaign_id = %self.ctx.id(), %phase);
        async move {
            match phase {
                Phase::Validating => self.validating().await,
                Phase::Selecting => self.selecting().await,
                Phase::Provisioning => self.provisioning().await,
                Phase::Monitoring => self.monitoring().await,
                Phase::VerifyingCleanup => self.verifying_cleanup().await,
                Phase::ForcingCleanup => self.forcing_cleanup().await,
                Phase::Reporting => self.reporting().await,
                Phase::Completed | Phase::Failed => self.finished().await,
            }
        }
        .instrument(span)
        .await
    }

    async fn validating(&mut self) -> Result<StepOutcome> {
        let report = self.validator.validate(&self.ctx.config).await;
        let verdict = report.ensure_passed();
        self.ctx.validation = Some(report);
        if let Err(e) = verdict {
            error!(error = %e, "Validation failed, nothing was created");
            self.ctx.failure = Some(e.to_string());
            self.ctx.campaign.status = CampaignStatus::Failed;
            self.transition(Phase::Failed).await?;
            let report = self.build_report();
            self.ports.store.save_report(&report).await?;
            return Ok(StepOutcome::Finished(Box::new(report)));
        }
        self.advance(Phase::Selecting).await
    }

    async fn selecting(&mut self) -> Result<StepOutcome> {
        match self.selector.select(self.ctx.config.size_class, &self.catalog) {
            Ok(selections) => {
                info!(
                    count = selections.len(),
                    keys = ?selections.iter().map(|s| s.catalog_key.as_str()).collect::<Vec<_>>(),
                    "Work items selected"
                );
                self.ctx.selections = selections;
                self.advance(Phase::Provisioning).await
            }
            Err(e) => {
                error!(error = %e, "Selection failed");
                self.ctx.failure = Some(SortieError::from(e).to_string());
                self.advance(Phase::VerifyingCleanup).await
            }
        }
    }

    async fn provisioning(&mut self) -> Result<StepOutcome> {
        let pending: Vec<_> = self
            .ctx
            .selections
            .iter()
            .filter(|s| {
                !self.ctx.identities.contains_key(&s.catalog_key) && !self.ctx.item_errors.contains_key(&s.catalog_key)
            })
            .cloned()
            .collect();

        if !pending.is_empty() {
            self.ctx.provisioning_attempts += 1;
            self.checkpoint().await?;
            let resumed = self.ctx.provisioning_attempts > 1;
            let roles = self.ctx.config.roles.clone();
            let identities = Arc::clone(&self.identities);
            let results: Vec<_> = stream::iter(pending)
                .map(|selection| {
                    let identities = Arc::clone(&identities);
                    let roles = &roles;
                    async move {
                        let result = identities.create(&selection.catalog_key, roles).await;
                        (selection, result)
                    }
                })
                .buffer_unordered(self.ctx.config.max_concurrency.max(1))
                .collect()
                .await;

            let now = Utc::now();
            for (selection, result) in results {
                let key = selection.catalog_key;
                match result {
                    Ok(identity) => {
                        self.ctx.identities.insert(key, identity);
                    }
                    Err(IdentityError::Conflict {
                        name,
                        existing: Some(handle),
                    }) => {
                        warn!(work_item = %key, identity = %name, resumed, "Adopting conflicting identity for cleanup");
                        let adopted = self.identities.adopt(&key, handle, now);
                        if resumed {
                            self.ctx
                                .fail_item(&key, "identity left over from an interrupted provisioning attempt");
                        } else {
                            self.ctx.fail_item(&key, format!("identity {name} already exists"));
                        }
                        self.ctx.identities.insert(key, adopted);
                    }
                    Err(e) => {
                        warn!(work_item = %key, error = %e, "Identity provisioning failed");
                        if let Some(leftover) = e.leftover() {
                            self.ctx.identities.insert(key.clone(), leftover.clone());
                        }
                        self.ctx.fail_item(&key, e.to_string());
                    }
                }
            }
            self.checkpoint().await?;
        }

        let ready: Vec<_> = self
            .ctx
            .selections
            .iter()
            .filter(|s| !self.ctx.workloads.contains_key(&s.catalog_key) && !self.ctx.item_errors.contains_key(&s.catalog_key))
            .filter_map(|s| self.ctx.identities.get(&s.catalog_key).map(|i| (s.clone(), i.clone())))
            .collect();

        if let Some(usable_at) = ready.iter().map(|(_, i)| i.usable_at).max() {
            if usable_at > Utc::now() {
                return Ok(StepOutcome::Sleep { until: usable_at });
            }
        }

        if !ready.is_empty() {
            let workloads = self.deployments.deploy_all(self.ctx.id(), ready).await;
            for workload in workloads {
                if let Some(error) = workload.error.clone().filter(|_| workload.status == WorkloadStatus::Failed) {
                    self.ctx.fail_item(&workload.work_item, error);
                }
                self.ctx.workloads.insert(workload.work_item.clone(), workload);
            }
        }

        let deployed = self.ctx.deployed_count();
        info!(deployed, failed = self.ctx.item_errors.len(), "Provisioning finished");
        if deployed == 0 {
            self.ctx.failure = Some("no work item was deployed".to_string());
            return self.advance(Phase::VerifyingCleanup).await;
        }
        self.advance(Phase::Monitoring).await
    }

    async fn monitoring(&mut self) -> Result<StepOutcome> {
        match self.aggregator.pump().await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => warn!(error = %e, "Event pump failed, retrying next wake"),
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let current: Vec<_> = self.ctx.workloads.values().cloned().collect();
        let refreshed: Vec<_> = stream::iter(current)
            .map(|workload| {
                let deployments = &self.deployments;
                async move { deployments.refresh(&workload, now).await }
            })
            .buffer_unordered(self.ctx.config.max_concurrency.max(1))
            .collect()
            .await;
        for workload in refreshed {
            self.ctx.workloads.insert(workload.work_item.clone(), workload);
        }

        if now >= self.ctx.campaign.scheduled_end_at {
            for workload in self.ctx.workloads.values_mut() {
                if !workload.status.is_finished() {
                    workload.status = WorkloadStatus::TimedOut;
                    workload.error = Some("operating window ended".to_string());
                }
            }
            info!("Operating window ended");
            self.ctx.next_wake_at = None;
            return self.advance(Phase::VerifyingCleanup).await;
        }

        let reported = |work_item: &str| {
            self.aggregator
                .progress(work_item)
                .is_some_and(|progress| progress.completed)
        };
        let settled = self
            .ctx
            .workloads
            .values()
            .all(|w| w.status.is_finished() || reported(&w.work_item));
        if settled {
            for workload in self.ctx.workloads.values_mut() {
                if !workload.status.is_finished() {
                    debug!(work_item = %workload.work_item, "Workload reported completion before its compute unit exited");
                    workload.status = WorkloadStatus::Completed;
                }
            }
            info!("All workloads finished");
            self.ctx.next_wake_at = None;
            return self.advance(Phase::VerifyingCleanup).await;
        }

        let interval = chrono::Duration::from_std(self.ctx.config.monitoring.wake_interval()).unwrap_or_default();
        let until = (now + interval).min(self.ctx.campaign.scheduled_end_at);
        self.ctx.next_wake_at = Some(until);
        self.checkpoint().await?;
        Ok(StepOutcome::Sleep { until })
    }

    async fn verifying_cleanup(&mut self) -> Result<StepOutcome> {
        let workloads: Vec<_> = self.ctx.workloads.values().cloned().collect();
        for workload in self.deployments.teardown_all(workloads).await {
            self.ctx.workloads.insert(workload.work_item.clone(), workload);
        }

        match self.aggregator.pump().await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => warn!(error = %e, "Final event pump failed"),
            Err(e) => return Err(e),
        }

        self.ctx.remaining = match self.cleanup.verify(self.ctx.id()).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(error = %e, "Verification query failed, falling back to the ledger");
                self.ledger.live()
            }
        };
        self.advance(Phase::ForcingCleanup).await
    }

    async fn forcing_cleanup(&mut self) -> Result<StepOutcome> {
        let remaining = std::mem::take(&mut self.ctx.remaining);
        let identities: Vec<_> = self.ctx.identities.values().cloned().collect();
        let outcome = self.cleanup.enforce(self.ctx.id(), remaining, identities).await;
        for identity in outcome.identities {
            self.ctx.identities.insert(identity.work_item.clone(), identity);
        }
        self.ctx.cleanup = Some(outcome.report);
        self.advance(Phase::Reporting).await
    }

    async fn reporting(&mut self) -> Result<StepOutcome> {
        let status = self.ctx.final_status();
        self.ctx.campaign.status = status;
        let terminal = if status == CampaignStatus::Failed {
            Phase::Failed
        } else {
            Phase::Completed
        };
        self.transition(terminal).await?;
        let report = self.build_report();
        self.ports.store.save_report(&report).await?;
        info!(?status, "Campaign finished");
        Ok(StepOutcome::Finished(Box::new(report)))
    }

    async fn finished(&mut self) -> Result<StepOutcome> {
        let report = match self.ports.store.load_report(&self.ctx.id()).await? {
            Some(report) => report,
            None => {
                let report = self.build_report();
                self.ports.store.save_report(&report).await?;
                report
            }
        };
        Ok(StepOutcome::Finished(Box::new(report)))
    }

    fn build_report(&self) -> CampaignReport {
        CampaignReport {
            campaign: self.ctx.campaign.clone(),
            validation: self.ctx.validation.clone(),
            cleanup: self.ctx.cleanup.clone(),
            work_items: self.ctx.outcomes(&self.aggregator.all_progress()),
            resources: self.ledger.snapshot(),
            failure: self.ctx.failure.clone(),
            finished_at: Utc::now(),
        }
    }

    async fn advance(&mut self, to: Phase) -> Result<StepOutcome> {
        self.transition(to).await?;
        Ok(StepOutcome::Advanced(to))
    }

    async fn transition(&mut self, to: Phase) -> Result<()> {
        let from = self.ctx.campaign.phase;
        validate_transition(from, to)?;
        self.ctx.campaign.phase = to;
        self.checkpoint().await?;
        metrics::counter!("sortie_phase_transitions_total", "to" => to.to_string()).increment(1);
        info!(%from, %to, revision = self.ctx.revision, "Phase transition");
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.ctx.ledger = self.ledger.snapshot();
        self.ctx.revision += 1;
        self.ctx.updated_at = Utc::now();
        self.ports.store.save_checkpoint(&self.ctx).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("campaign_id", &self.ctx.id())
            .field("phase", &self.ctx.campaign.phase)
            .field("revision", &self.ctx.revision)
            .finish_non_exhaustive()
    }
}
