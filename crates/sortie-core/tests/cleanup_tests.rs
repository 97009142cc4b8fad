use pretty_assertions::assert_eq;
use sortie_core::ports::{campaign_tags, TaggedResource};
use sortie_core::prelude::*;
use sortie_core::{ApiError, CleanupEnforcer, IdentityManager, IdentityStatus, RecordStatus, ResourceLedger};
use sortie_sim::FaultPlan;
use sortie_test_utils::Harness;
use std::sync::Arc;

#[tokio::test]
async fn dependency_conflict_is_requeued_and_counted_as_forced() {
    let harness = Harness::new(
        FaultPlan::healthy().with_delete_fault("resource_group", ApiError::HasDependents("still attached".into())),
    );

    let report = harness.run(21).await.unwrap();

    let cleanup = report.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.expected_deleted, 15);
    assert_eq!(cleanup.actually_deleted, 15);
    assert_eq!(cleanup.forced_deletions, 1);
    assert!(cleanup.deletion_failures.is_empty());
    assert_eq!(report.campaign.status, CampaignStatus::Completed);
    assert!(harness.tenant.resources_for(&report.campaign.id.to_string()).is_empty());
}

#[tokio::test]
async fn undeletable_resources_are_reported_not_hidden() {
    let harness = Harness::new(FaultPlan::healthy().with_undeletable("key_vault"));

    let report = harness.run(4).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Partial);
    let cleanup = report.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.expected_deleted, 15);
    // Storage accounts go; vaults are locked and their groups keep a child
    assert_eq!(cleanup.actually_deleted, 5);
    assert_eq!(cleanup.deletion_failures.len(), 10);
    assert!(cleanup
        .deletion_failures
        .iter()
        .all(|f| f.resource_type == "key_vault" || f.resource_type == "resource_group"));

    let survivors = harness.tenant.resources_for(&report.campaign.id.to_string());
    assert_eq!(survivors.len(), 10);
    let failed_records = report
        .resources
        .iter()
        .filter(|r| r.status == RecordStatus::DeletionFailed)
        .count();
    assert_eq!(failed_records, 10);

    // Failed records are final, so identities are still removed
    assert_eq!(cleanup.identities_deleted.len(), 5);
    assert!(report
        .work_items
        .iter()
        .all(|w| w.identity == Some(IdentityStatus::Deleted)));
}

#[tokio::test]
async fn resources_missing_from_the_ledger_are_found_by_tag() {
    let harness = Harness::healthy();
    let mut orchestrator = harness.start(8).await.unwrap();
    let campaign_id = orchestrator.campaign_id();
    harness.tenant.plant_resource(TaggedResource {
        resource_id: "/tenants/sim-tenant/disks/orphan".to_string(),
        resource_type: "disk".to_string(),
        tags: campaign_tags(&campaign_id.to_string(), "unreported", chrono::Utc::now()),
        parent_id: None,
    });

    let report = orchestrator.run().await.unwrap();

    let cleanup = report.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.expected_deleted, 16);
    assert_eq!(cleanup.actually_deleted, 16);
    assert!(harness.tenant.resources_for(&campaign_id.to_string()).is_empty());
    assert!(report
        .resources
        .iter()
        .any(|r| r.resource_id.ends_with("/orphan") && r.status == RecordStatus::Deleted));
}

#[tokio::test]
async fn second_cleanup_pass_is_a_no_op() {
    let harness = Harness::healthy();
    let report = harness.run(6).await.unwrap();
    let calls_after_campaign = harness.tenant.stats().delete_calls;

    let ports = harness.ports();
    let ledger = Arc::new(ResourceLedger::from_snapshot(report.resources.clone()));
    let identities = Arc::new(IdentityManager::new(ports.identities.clone(), ports.vault.clone(), &harness.config));
    let enforcer = CleanupEnforcer::new(ports.resources.clone(), identities, ledger.clone(), &harness.config);

    let remaining = enforcer.verify(report.campaign.id).await.unwrap();
    assert!(remaining.is_empty());
    let outcome = enforcer.enforce(report.campaign.id, remaining, Vec::new()).await;

    assert_eq!(outcome.report.expected_deleted, 0);
    assert_eq!(outcome.report.actually_deleted, 0);
    assert_eq!(outcome.report.forced_deletions, 0);
    assert!(outcome.report.is_clean());
    assert_eq!(harness.tenant.stats().delete_calls, calls_after_campaign);
    assert_eq!(ledger.counts(), ResourceLedger::from_snapshot(report.resources).counts());
}
