use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use permit_core::ScoredRecord;
use permit_sync::{
    build_scheduler, maybe_build_scheduler, top_leads, PipelineConfig, RunCoordinator,
    JobScheduler, RunSummary, SourceRegistry,
};
use permit_storage::StateStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "warn,permit_core=info,permit_storage=info,permit_collectors=info,permit_sync=info,permit_cli=info";

#[derive(Debug, Parser)]
#[command(name = "permit-cli")]
#[command(about = "Building permit lead ingestion and ranking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle (keeps running on the cron schedule when
    /// PERMIT_SCHEDULER_ENABLED is set).
    Sync,
    /// Run cycles on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Drop ledger entries first seen more than N days ago.
    Prune {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Rank permits archived within the last N days.
    Archive {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Show recent cycle log entries.
    Cycles {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List configured sources with their high-water marks.
    Sources,
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} new={} duplicates={} sources: {} succeeded, {} partial, {} failed ({} structural)",
        summary.run_id,
        summary.new_count(),
        summary.duplicate_count,
        summary.succeeded,
        summary.partial,
        summary.failed,
        summary.structural_failures
    );
    for source in &summary.sources {
        if let Some(err) = &source.error {
            println!("  {} {}: {}", source.source_id, err.kind, err.cause);
        }
    }
    if summary.cancelled {
        println!("  cycle interrupted; only committed records are listed");
    }
    print_leads(top_leads(&summary.new_records, 10));
}

fn print_leads(leads: &[ScoredRecord]) {
    for (rank, lead) in leads.iter().enumerate() {
        let r = &lead.record;
        println!(
            "{:>3}. {:>6.2}  {:<12} {:<16} {} [{}]",
            rank + 1,
            lead.score,
            r.source_id,
            r.permit_number,
            r.address,
            r.permit_type
        );
    }
}

async fn run_until_cancelled(coordinator: &RunCoordinator, mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    coordinator.cancellation_token().cancelled().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let coordinator = Arc::new(RunCoordinator::from_config(&config).await?);

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        info!("Ctrl-C received; cancelling");
        cancel.cancel();
    });

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = coordinator.run_cycle().await?;
            print_summary(&summary);
            if let Some(sched) = maybe_build_scheduler(coordinator.clone(), &config).await? {
                run_until_cancelled(&coordinator, sched).await?;
            }
        }
        Commands::Schedule => {
            let sched = build_scheduler(coordinator.clone(), &config.sync_crons).await?;
            run_until_cancelled(&coordinator, sched).await?;
        }
        Commands::Prune { days } => {
            let days = days.unwrap_or(config.retention_days);
            let pruned = coordinator.prune(days).await?;
            println!("pruned {pruned} ledger entries older than {days} days");
        }
        Commands::Archive { days, source, top } => {
            let ranked = coordinator
                .score_archive_window(days, source.as_deref())
                .await?;
            println!("{} archived permits in the last {days} days", ranked.len());
            print_leads(top_leads(&ranked, top));
        }
        Commands::Cycles { limit } => {
            for entry in coordinator.store().recent_cycles(limit).await? {
                println!(
                    "{}  {} -> {}  new={} duplicates={} errors={}",
                    entry.run_id,
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.finished_at.format("%H:%M:%S"),
                    entry.new_count,
                    entry.duplicate_count,
                    entry.errors.len()
                );
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            for source in &registry.sources {
                let mark = coordinator.store().high_water_mark(&source.source_id).await?;
                let newest = mark
                    .as_ref()
                    .and_then(|m| m.last_record_date)
                    .map_or_else(|| "-".to_string(), |d| d.to_string());
                let last_ok = mark
                    .as_ref()
                    .and_then(|m| m.last_success_at)
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                println!(
                    "{:<14} {:<10} {:<8} newest={} last_success={}  {}",
                    source.source_id,
                    source.kind.to_string(),
                    if registry.is_enabled(source, &config) { "enabled" } else { "disabled" },
                    newest,
                    last_ok,
                    source.display_name
                );
            }
        }
    }

    Ok(())
}
