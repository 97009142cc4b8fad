use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use sortie_core::prelude::*;
use sortie_core::store::CampaignStore;
use sortie_core::{ApiError, FileStore, MemoryStore, RetryPolicy, WorkSelector};
use sortie_sim::{demo_catalog, FaultPlan, SimulatedTenant, DEFAULT_TENANT};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn cli() -> Command {
    Command::new("sortie-sim")
        .version(sortie_core::VERSION)
        .about("Run Sortie campaigns against a simulated tenant")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run one campaign end to end")
                .arg(
                    Arg::new("size")
                        .long("size")
                        .value_parser(value_parser!(SizeClass))
                        .help("Size class: small, medium or large [default: from config, else small]"),
                )
                .arg(
                    Arg::new("catalog")
                        .long("catalog")
                        .default_value("50")
                        .value_parser(value_parser!(usize))
                        .help("Number of entries in the demo catalog"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Seed for work-item selection"),
                )
                .arg(
                    Arg::new("window-ms")
                        .long("window-ms")
                        .default_value("2000")
                        .value_parser(value_parser!(u64))
                        .help("Operating window in milliseconds"),
                )
                .arg(
                    Arg::new("crash")
                        .long("crash")
                        .action(ArgAction::Append)
                        .help("Work item whose workload crashes (repeatable)"),
                )
                .arg(
                    Arg::new("dependency-fault")
                        .long("dependency-fault")
                        .action(ArgAction::SetTrue)
                        .help("First resource-group deletion reports remaining dependents"),
                )
                .arg(
                    Arg::new("invalid-credentials")
                        .long("invalid-credentials")
                        .action(ArgAction::SetTrue)
                        .help("Reject the control-plane test call"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML campaign configuration"),
                )
                .arg(
                    Arg::new("store-dir")
                        .long("store-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Persist checkpoints here instead of in memory"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show campaigns persisted in a store directory")
                .arg(
                    Arg::new("store-dir")
                        .long("store-dir")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Store directory written by `simulate --store-dir`"),
                )
                .arg(
                    Arg::new("campaign")
                        .long("campaign")
                        .value_parser(value_parser!(CampaignId))
                        .help("Campaign to show; all campaigns when omitted"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

/// Defaults sized for a simulation that finishes in seconds
fn simulation_config(window: Duration) -> CampaignConfig {
    let mut config = CampaignConfig::new()
        .with_tenant(DEFAULT_TENANT, "root@sim-tenant")
        .with_operating_window(window)
        .with_propagation_delay(Duration::from_millis(50));
    config.execution_timeout_margin_ms = 1_000;
    config.dependency_requeue_ms = 10;
    config.monitoring.wake_interval_ms = 100;
    config.identity_retry = RetryPolicy::immediate(3);
    config.deletion_retry = RetryPolicy::immediate(5);
    config
}

async fn open_store(dir: Option<&PathBuf>) -> Result<Arc<dyn CampaignStore>> {
    Ok(match dir {
        Some(dir) => Arc::new(
            FileStore::open(dir)
                .await
                .with_context(|| format!("opening store at {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    })
}

async fn simulate(args: &clap::ArgMatches) -> Result<bool> {
    let window = Duration::from_millis(args.get_one::<u64>("window-ms").copied().unwrap_or(2_000));
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => CampaignConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => simulation_config(window),
    };
    if let Some(size) = args.get_one::<SizeClass>("size") {
        config.size_class = *size;
    }

    let mut faults = FaultPlan::healthy();
    for work_item in args.get_many::<String>("crash").into_iter().flatten() {
        faults = faults.with_crash(work_item.clone());
    }
    if args.get_flag("dependency-fault") {
        faults = faults.with_delete_fault("resource_group", ApiError::HasDependents("simulated".into()));
    }
    if args.get_flag("invalid-credentials") {
        faults = faults.with_invalid_credentials();
    }

    let tenant = Arc::new(SimulatedTenant::new(config.tenant_id.clone(), faults));
    let store = open_store(args.get_one::<PathBuf>("store-dir")).await?;
    let catalog = demo_catalog(args.get_one::<usize>("catalog").copied().unwrap_or(50));

    let mut orchestrator = Orchestrator::start(config, catalog, tenant.ports(store)).await?;
    if let Some(seed) = args.get_one::<u64>("seed") {
        orchestrator = orchestrator.with_selector(WorkSelector::with_seed(*seed));
    }
    info!(campaign_id = %orchestrator.campaign_id(), "Simulation started");
    let report = orchestrator.run().await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    let leftovers = tenant.resources_for(&report.campaign.id.to_string());
    if !leftovers.is_empty() {
        bail!("{} resources survived cleanup", leftovers.len());
    }
    Ok(report.campaign.status == CampaignStatus::Completed)
}

fn print_report(report: &CampaignReport) {
    println!("Campaign {}", report.campaign.id);
    println!("  Status: {:?}", report.campaign.status);
    println!("  Phase:  {}", report.campaign.phase);
    if let Some(failure) = &report.failure {
        println!("  Failure: {failure}");
    }
    println!();
    println!("Work items:");
    for item in &report.work_items {
        println!(
            "  {:<20} workload={:<10} events={:<3} {}",
            item.work_item,
            item.workload.map_or_else(|| "-".to_string(), |s| format!("{s:?}")),
            item.events,
            item.error.as_deref().unwrap_or(""),
        );
    }
    if let Some(cleanup) = &report.cleanup {
        println!();
        println!("Cleanup:");
        println!("  Expected deleted:  {}", cleanup.expected_deleted);
        println!("  Actually deleted:  {}", cleanup.actually_deleted);
        println!("  Forced deletions:  {}", cleanup.forced_deletions);
        println!("  Identities deleted: {:?}", cleanup.identities_deleted);
        for failure in &cleanup.deletion_failures {
            println!("  FAILED {} ({}): {}", failure.resource_id, failure.resource_type, failure.error);
        }
    }
}

async fn status(args: &clap::ArgMatches) -> Result<()> {
    let Some(dir) = args.get_one::<PathBuf>("store-dir") else {
        bail!("--store-dir is required");
    };
    let store = open_store(Some(dir)).await?;
    let campaigns = match args.get_one::<CampaignId>("campaign") {
        Some(id) => vec![*id],
        None => store.list_campaigns().await?,
    };
    // Only the store is read; the tenant stands in for ports that stay idle
    let tenant = Arc::new(SimulatedTenant::new(DEFAULT_TENANT, FaultPlan::healthy()));
    for id in campaigns {
        let orchestrator = Orchestrator::resume(id, Vec::new(), tenant.ports(store.clone())).await?;
        println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        match matches.subcommand() {
            Some(("simulate", args)) => {
                let completed = simulate(args).await?;
                std::process::exit(if completed { 0 } else { 1 });
            }
            Some(("status", args)) => status(args).await,
            _ => {
                cli().print_help()?;
                Ok(())
            }
        }
    })
}
