use pretty_assertions::assert_eq;
use sortie_core::prelude::*;
use sortie_core::store::CampaignStore;
use sortie_core::{IdentityStatus, WorkloadStatus};
use sortie_sim::{demo_catalog, FaultPlan};
use sortie_test_utils::{fast_config, init_test_logging, Harness};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn healthy_campaign_completes_and_leaves_nothing_behind() {
    init_test_logging();
    let harness = Harness::healthy();

    let report = harness.run(7).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Completed);
    assert_eq!(report.campaign.phase, Phase::Completed);
    assert_eq!(report.failure, None);
    assert_eq!(report.work_items.len(), 5);
    for item in &report.work_items {
        assert_eq!(item.workload, Some(WorkloadStatus::Completed), "{}", item.work_item);
        assert_eq!(item.identity, Some(IdentityStatus::Deleted), "{}", item.work_item);
        assert_eq!(item.events, 6);
        assert!(item.reported_complete);
        assert_eq!(item.error, None);
    }

    let cleanup = report.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.expected_deleted, 15);
    assert_eq!(cleanup.actually_deleted, 15);
    assert_eq!(cleanup.forced_deletions, 0);
    assert!(cleanup.is_clean());
    assert_eq!(cleanup.identities_deleted.len(), 5);

    assert!(harness.tenant.resources_for(&report.campaign.id.to_string()).is_empty());
    let stats = harness.tenant.stats();
    assert_eq!(stats.identities, 0);
    assert_eq!(stats.secrets, 0);
    assert_eq!(stats.sandboxes, 0);
    assert_eq!(stats.unacked_events, 0);
}

#[tokio::test]
async fn selects_five_distinct_items_from_fifty() {
    let harness = Harness::healthy();

    let report = harness.run(11).await.unwrap();

    let keys: HashSet<_> = report.work_items.iter().map(|w| w.work_item.clone()).collect();
    assert_eq!(keys.len(), 5);
    let catalog: HashSet<_> = demo_catalog(50).into_iter().map(|e| e.key).collect();
    assert!(keys.is_subset(&catalog));
}

#[tokio::test]
async fn invalid_credentials_fail_before_anything_is_created() {
    let harness = Harness::new(FaultPlan::healthy().with_invalid_credentials());

    let report = harness.run(1).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Failed);
    assert_eq!(report.campaign.phase, Phase::Failed);
    assert!(report.failure.is_some());
    assert!(report.work_items.is_empty());
    assert!(report.cleanup.is_none());
    let validation = report.validation.expect("validation recorded");
    assert!(!validation.passed());
    assert!(validation.failures().iter().any(|c| c.name == "control_plane"));

    let stats = harness.tenant.stats();
    assert_eq!(stats.identities, 0);
    assert_eq!(stats.sandboxes, 0);
    assert_eq!(stats.resources, 0);
}

#[tokio::test]
async fn one_crashed_workload_makes_the_campaign_partial() {
    let mut harness = Harness::new(FaultPlan::healthy().with_crash("storage-000"));
    harness.catalog = demo_catalog(5);

    let report = harness.run(3).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Partial);
    assert_eq!(report.campaign.phase, Phase::Completed);
    let crashed = report
        .work_items
        .iter()
        .find(|w| w.work_item == "storage-000")
        .expect("crashed item reported");
    assert_eq!(crashed.workload, Some(WorkloadStatus::Failed));
    assert!(crashed.error.is_some());
    assert!(!crashed.reported_complete);
    assert_eq!(
        report
            .work_items
            .iter()
            .filter(|w| w.workload == Some(WorkloadStatus::Completed))
            .count(),
        4
    );

    // The crashed item's resources are cleaned up like everyone else's
    let cleanup = report.cleanup.expect("cleanup ran");
    assert_eq!(cleanup.actually_deleted, 15);
    assert!(cleanup.is_clean());
    assert!(harness.tenant.resources_for(&report.campaign.id.to_string()).is_empty());
    assert_eq!(harness.tenant.stats().identities, 0);
}

#[tokio::test]
async fn stalled_workload_times_out_at_the_end_of_the_window() {
    let mut harness = Harness::new(FaultPlan::healthy().with_stall("network-003"));
    harness.catalog = demo_catalog(5);

    let report = harness.run(5).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Partial);
    let hung = report
        .work_items
        .iter()
        .find(|w| w.work_item == "network-003")
        .expect("hung item reported");
    assert_eq!(hung.workload, Some(WorkloadStatus::TimedOut));
    assert!(report.finished_at >= report.campaign.scheduled_end_at);
    assert!(harness.tenant.resources_for(&report.campaign.id.to_string()).is_empty());
}

#[tokio::test]
async fn reported_completion_ends_monitoring_before_the_window() {
    let config = fast_config().with_operating_window(Duration::from_secs(3600));
    let mut harness = Harness::new(FaultPlan::healthy().with_hang("network-003")).with_config(config);
    harness.catalog = demo_catalog(5);

    let report = tokio::time::timeout(Duration::from_secs(10), harness.run(5))
        .await
        .expect("campaign left monitoring once every item reported completion")
        .unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Completed);
    assert!(report.finished_at < report.campaign.scheduled_end_at);
    let lingering = report
        .work_items
        .iter()
        .find(|w| w.work_item == "network-003")
        .expect("lingering item reported");
    assert!(lingering.reported_complete);
    assert_eq!(lingering.workload, Some(WorkloadStatus::Completed));
    assert_eq!(harness.tenant.stats().sandboxes, 0);
    assert!(harness.tenant.resources_for(&report.campaign.id.to_string()).is_empty());
}

#[tokio::test]
async fn identity_name_already_taken_fails_the_item_and_is_cleaned_up() {
    let mut harness = Harness::healthy();
    harness.catalog = demo_catalog(5);
    harness.tenant.plant_identity("sortie-secrets-004-admin");
    harness.tenant.plant_secret("sortie-secrets-004-admin-secret");

    let report = harness.run(15).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Partial);
    let taken = report
        .work_items
        .iter()
        .find(|w| w.work_item == "secrets-004")
        .expect("item reported");
    assert!(taken.error.as_deref().unwrap().contains("already exists"));
    assert_eq!(taken.identity, Some(IdentityStatus::Deleted));
    let stats = harness.tenant.stats();
    assert_eq!(stats.identities, 0);
    assert_eq!(stats.secrets, 0);
}

#[tokio::test]
async fn duplicate_deliveries_are_applied_once() {
    let harness = Harness::new(FaultPlan::healthy().with_duplicate_deliveries());

    let report = harness.run(9).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Completed);
    assert!(report.work_items.iter().all(|w| w.events == 6));
    let log = harness
        .store
        .load_events(&report.campaign.id)
        .await
        .unwrap();
    assert_eq!(log.len(), 30);
}

#[tokio::test]
async fn rate_limited_identity_creation_is_retried() {
    let harness = Harness::new(FaultPlan::healthy().with_rate_limited_creates(2));

    let report = harness.run(13).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Completed);
    assert!(report.work_items.iter().all(|w| w.error.is_none()));
}

#[tokio::test]
async fn too_small_catalog_fails_without_provisioning() {
    let mut harness = Harness::healthy();
    harness.catalog = demo_catalog(3);

    let report = harness.run(2).await.unwrap();

    assert_eq!(report.campaign.status, CampaignStatus::Failed);
    assert_eq!(report.campaign.phase, Phase::Failed);
    assert!(report.failure.unwrap().contains("catalog"));
    assert_eq!(report.cleanup.map(|c| c.expected_deleted), Some(0));
    assert_eq!(harness.tenant.stats().identities, 0);
}
