use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ptdc_source::{bill_items_table_name, bill_table_name, STOCK_CATEGORY_TABLE, STOCK_PRODUCT_TABLE};
use ptdc_sync::{ConsolidateConfig, ReconcilePolicy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ptdc-cli")]
#[command(about = "PTDC inventory consolidation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract every planned period and replace the destination tables.
    Run(RunArgs),
    /// Print the resolved source plan without touching any database.
    Plan {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// YAML source plan; defaults to the built-in historical plan.
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Read sources from `<dir>/<database>.json` dumps instead of MySQL.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Also write Parquet snapshots and a run summary here.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    #[arg(long)]
    skip_destination: bool,
    #[arg(long)]
    reconcile_policy: Option<ReconcilePolicy>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = ConsolidateConfig::from_env()?;
            if args.plan.is_some() {
                config.plan_path = args.plan;
            }
            if args.fixtures.is_some() {
                config.fixtures_dir = args.fixtures;
            }
            if args.snapshot_dir.is_some() {
                config.snapshot_dir = args.snapshot_dir;
            }
            if let Some(policy) = args.reconcile_policy {
                config.reconcile_policy = policy;
            }
            config.skip_destination = args.skip_destination;

            let summary = ptdc_sync::run_consolidation(&config).await?;
            info!(run_id = %summary.run_id, "consolidation finished");
            println!(
                "consolidation complete: run_id={} databases={} periods={} bills={} bill_items={} stock_categories={} stock_products={} destinations=[{}]",
                summary.run_id,
                summary.databases,
                summary.periods,
                summary.bills,
                summary.bill_items,
                summary.stock_categories,
                summary.stock_products,
                summary.destinations.join(", ")
            );
        }
        Commands::Plan { plan } => {
            let config = ConsolidateConfig {
                plan_path: plan,
                ..ConsolidateConfig::default()
            };
            let plan = config.load_plan()?;
            for entry in &plan.databases {
                println!("{} (fiscal year 201{})", entry.database, entry.fiscal_year);
                for period in entry.opening_periods()?.into_iter().chain(entry.closing_periods()?) {
                    println!(
                        "  {period}: {} {}",
                        bill_table_name(period),
                        bill_items_table_name(period)
                    );
                }
                println!("  reference: {STOCK_CATEGORY_TABLE} {STOCK_PRODUCT_TABLE}");
            }
            println!("{} periods across {} databases", plan.period_count(), plan.databases.len());
        }
    }

    Ok(())
}
