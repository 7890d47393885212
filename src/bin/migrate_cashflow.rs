//! One-off migration: convert legacy cumulative cash-flow rows to
//! standalone values and generate the synthetic Q4 records.
//!
//! Rows collected before the raw-baseline columns existed still hold the
//! as-filed cumulative values in the canonical columns; this tool backfills
//! the baselines first, then runs the reconciliation passes over every
//! company (or one, with --stock-code).

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use krx_stocks::database::DatabaseManager;
use krx_stocks::models::Config;
use krx_stocks::reconcile::reconcile_company;

#[derive(Parser)]
#[command(
    name = "migrate-cashflow",
    about = "Convert cumulative cash-flow rows to standalone and generate Q4 records"
)]
struct Args {
    /// Report what would change without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Only this stock code (default: all registered companies)
    #[arg(long)]
    stock_code: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let db = DatabaseManager::connect(&config.database_path).await?;

    println!("cash-flow standalone migration ({})", if args.dry_run { "dry run" } else { "live" });

    if !args.dry_run {
        let backfilled = db.backfill_cumulative_baselines().await?;
        info!("cumulative baselines backfilled for {} rows", backfilled);
    }

    let companies = match &args.stock_code {
        Some(code) => {
            let company = db
                .get_company_by_stock_code(code)
                .await?
                .ok_or_else(|| anyhow!("unknown stock code: {}", code))?;
            vec![company]
        }
        None => db.get_companies().await?,
    };

    let total = companies.len();
    let mut converted = 0;
    let mut q4_generated = 0;
    let mut skipped = 0;

    for (idx, company) in companies.iter().enumerate() {
        println!(
            "[{}/{}] {} {}",
            idx + 1,
            total,
            company.stock_code,
            company.company_name
        );

        let stats = reconcile_company(&db, company, args.dry_run).await?;
        converted += stats.converted_quarters;
        q4_generated += stats.q4_synthesized;
        skipped += stats.skipped_years;
    }

    println!(
        "migration done: {} quarters converted, {} Q4 generated, {} years skipped",
        converted, q4_generated, skipped
    );
    if args.dry_run {
        println!("dry run: no changes were written");
    }

    Ok(())
}
