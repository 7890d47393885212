use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use krx_stocks::api::DartClient;
use krx_stocks::collector::run_batch;
use krx_stocks::database::DatabaseManager;
use krx_stocks::models::{CompanyRecord, Config};

#[derive(Parser)]
#[command(
    name = "krx-stocks",
    about = "Korean disclosure collection, reconciliation and valuation pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a company to track
    AddCompany {
        /// Ticker, e.g. 005930
        stock_code: String,
        /// DART corp code, e.g. 00126380
        corp_code: String,
        /// Issuer name as listed, e.g. 삼성전자
        company_name: String,
        #[arg(long)]
        industry: Option<String>,
    },

    /// Collect filings, reconcile periods and compute valuations
    Collect {
        /// Only this stock code (default: all registered companies)
        #[arg(long)]
        stock_code: Option<String>,
        /// Re-collect periods that are already stored
        #[arg(long)]
        force: bool,
    },

    /// Show fact-store counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = DatabaseManager::connect(&config.database_path).await?;

    match cli.command {
        Command::AddCompany {
            stock_code,
            corp_code,
            company_name,
            industry,
        } => {
            let mut dart = DartClient::new(&config.dart_api_key)?;
            match dart.get_company_info(&corp_code).await {
                Ok(Some(overview)) => {
                    info!("DART overview: {} ({})", overview.corp_name, overview.induty_code)
                }
                Ok(None) => warn!("corp code not found on DART: {}", corp_code),
                Err(e) => warn!("company overview lookup failed: {}", e),
            }

            let id = db
                .upsert_company(&stock_code, &corp_code, &company_name, industry.as_deref())
                .await?;
            info!("company registered: {} {} (id {})", stock_code, company_name, id);
        }

        Command::Collect { stock_code, force } => {
            let companies = select_companies(&db, stock_code.as_deref()).await?;
            let stats = run_batch(&db, &config, companies, force).await?;
            println!(
                "collected {}, skipped {}, failed {} | {} quarters converted, {} Q4 synthesized, {} years skipped | {} periods valued, {} metrics unresolved",
                stats.collection.collected,
                stats.collection.skipped,
                stats.collection.failed,
                stats.reconcile.converted_quarters,
                stats.reconcile.q4_synthesized,
                stats.reconcile.skipped_years,
                stats.valuation.updated_periods,
                stats.valuation.unresolved_metrics
            );
        }

        Command::Stats => {
            let stats = db.stats().await?;
            println!("companies:            {}", stats.companies);
            println!("statements:           {}", stats.statements);
            println!("  annual:             {}", stats.annual_statements);
            println!("  quarterly:          {}", stats.quarterly_statements);
            println!("  with valuations:    {}", stats.valued_statements);
        }
    }

    Ok(())
}

async fn select_companies(
    db: &DatabaseManager,
    stock_code: Option<&str>,
) -> Result<Vec<CompanyRecord>> {
    match stock_code {
        Some(code) => {
            let company = db
                .get_company_by_stock_code(code)
                .await?
                .ok_or_else(|| anyhow!("unknown stock code: {}", code))?;
            Ok(vec![company])
        }
        None => db.get_companies().await,
    }
}
