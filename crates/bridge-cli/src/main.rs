use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bridge_engine::{
    maybe_build_scheduler, AutoApprove, BridgeConfig, ConfirmGate, DenyAll, JobRegistry,
    NoopNotifier, Notifier, SendGridNotifier, StdinConfirm, SyncDriver, SyncMode,
};
use bridge_remote::{HttpRemoteStore, PageFetcher, RemoteStoreConfig};
use bridge_source::MySqlSourceRepository;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bridge-cli")]
#[command(about = "One-way record sync between a relational source and a remote record store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one job (or all jobs) against the remote store.
    Sync {
        /// Job id from the registry; all jobs when omitted.
        #[arg(long)]
        job: Option<String>,
        /// Fetch every source row instead of only unsynced ones.
        #[arg(long)]
        full: bool,
        /// Approve the mutation batch without prompting.
        #[arg(long)]
        yes: bool,
        /// Diff and report only, never mutate.
        #[arg(long)]
        dry_run: bool,
    },
    /// Establish cross-database relation links, skipping pairs already in
    /// the local ledger.
    Link {
        /// Relation id from the registry; all relations when omitted.
        #[arg(long)]
        relation: Option<String>,
    },
    /// Report remote pages sharing one identity key.
    CheckDuplicates {
        #[arg(long)]
        job: String,
    },
    /// Run incremental syncs periodically until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_driver(
    config: &BridgeConfig,
    confirm: Arc<dyn ConfirmGate>,
) -> Result<SyncDriver> {
    let store = HttpRemoteStore::new(RemoteStoreConfig {
        base_url: config.remote_base_url.clone(),
        token: config.remote_token.clone(),
        api_version: config.remote_api_version.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        backoff: Default::default(),
    })?;
    let source = MySqlSourceRepository::connect(&config.database_url).await?;
    let fetcher = PageFetcher {
        page_size: config.page_size,
        page_delay: Duration::from_millis(config.page_delay_ms),
    };

    let notifier: Arc<dyn Notifier> = match &config.notifier {
        Some(notifier_config) => Arc::new(SendGridNotifier::new(notifier_config.clone())?),
        None => Arc::new(NoopNotifier),
    };

    Ok(SyncDriver::new(Arc::new(store), Arc::new(source), fetcher)
        .with_confirm(confirm)
        .with_notifier(notifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = BridgeConfig::from_env();
    let registry = JobRegistry::load(&config.jobs_file)?;

    match cli.command {
        Commands::Sync { job, full, yes, dry_run } => {
            let confirm: Arc<dyn ConfirmGate> = if yes || config.auto_approve {
                Arc::new(AutoApprove)
            } else {
                Arc::new(StdinConfirm)
            };
            let driver = build_driver(&config, confirm).await?;
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };

            let jobs: Vec<_> = match &job {
                Some(id) => vec![registry.job(id)?],
                None => registry.jobs.iter().collect(),
            };
            for job in jobs {
                let summary = driver
                    .run_sync(job, mode, dry_run)
                    .await
                    .with_context(|| format!("sync run aborted for job `{}`", job.job_id))?;
                println!("{}", summary.render());
            }
        }
        Commands::Link { relation } => {
            let driver = build_driver(&config, Arc::new(AutoApprove)).await?;
            let relations: Vec<_> = match &relation {
                Some(id) => vec![registry.relation(id)?],
                None => registry.relations.iter().collect(),
            };
            for spec in relations {
                let summary = driver
                    .run_link(spec)
                    .await
                    .with_context(|| format!("link run aborted for `{}`", spec.relation_id))?;
                println!("{}", summary.render());
            }
        }
        Commands::CheckDuplicates { job } => {
            let driver = build_driver(&config, Arc::new(DenyAll)).await?;
            let report = driver.run_duplicate_audit(registry.job(&job)?).await?;
            println!("{}", report.render());
        }
        Commands::Schedule => {
            // Scheduled runs are unattended; auto-approval has to be an
            // explicit config choice, otherwise every batch is skipped.
            let confirm: Arc<dyn ConfirmGate> = if config.auto_approve {
                Arc::new(AutoApprove)
            } else {
                Arc::new(DenyAll)
            };
            let driver = Arc::new(build_driver(&config, confirm).await?);
            let registry = Arc::new(registry);

            let Some(scheduler) = maybe_build_scheduler(driver, registry, &config).await? else {
                anyhow::bail!("scheduler is disabled; set BRIDGE_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
        }
    }

    Ok(())
}
