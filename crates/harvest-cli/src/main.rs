use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_sync::{DatasetRegistry, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Harvest paginated tables into a warehouse and reconcile them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, stage and reconcile datasets (every enabled one by default).
    Run {
        #[arg(long = "dataset")]
        datasets: Vec<String>,
    },
    /// Re-run only the reconciliation step for one dataset.
    Reconcile { dataset: String },
    /// List configured datasets.
    Datasets,
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { datasets: Vec::new() }) {
        Commands::Run { datasets } => {
            let summary = harvest_sync::run_from_env(&datasets, cancel_on_ctrl_c()).await?;
            for report in &summary.datasets {
                println!(
                    "{}: {} fetched={} normalized={} duplicates_removed={} final_rows={}",
                    report.dataset_id,
                    report.status(),
                    report.rows_fetched,
                    report.rows_normalized,
                    report.duplicates_removed(),
                    report
                        .final_rows()
                        .map_or_else(|| "-".to_string(), |n| n.to_string()),
                );
            }
            println!(
                "run complete: run_id={} datasets={} aborted={} reports={}",
                summary.run_id,
                summary.datasets.len(),
                summary.aborted(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if summary.aborted() > 0 {
                std::process::exit(2);
            }
        }
        Commands::Reconcile { dataset } => {
            let config = SyncConfig::from_env();
            let registry = DatasetRegistry::load(&config.datasets_path).await?;
            let descriptor = registry
                .get(&dataset)
                .cloned()
                .with_context(|| format!("unknown dataset `{dataset}`"))?;
            let pipeline = SyncPipeline::from_config(config)
                .await?
                .with_cancellation(cancel_on_ctrl_c());
            let report = pipeline.reconcile_dataset(&descriptor).await?;
            info!(dataset = %dataset, final_rows = report.final_rows, "reconciled");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Datasets => {
            let config = SyncConfig::from_env();
            let registry = DatasetRegistry::load(&config.datasets_path).await?;
            for descriptor in &registry.datasets {
                println!(
                    "{}\t{}\t{}\t{} -> {}\tkey=[{}]",
                    descriptor.dataset_id,
                    if descriptor.enabled { "enabled" } else { "disabled" },
                    descriptor.source.label(),
                    descriptor.table,
                    descriptor.final_table(),
                    descriptor.dedupe_key.fields().join(", ")
                );
            }
        }
    }

    Ok(())
}
