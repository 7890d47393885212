//! Financial data collection pipeline.
//!
//! Per company the pipeline is strictly sequential: every targeted period
//! is fetched and parsed before reconciliation runs, and valuation runs
//! last. Across companies the batch runner fans out over a bounded worker
//! pool; each company is owned by exactly one worker, which keeps the
//! read-modify-write reconciliation single-writer per company.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::api::{DartClient, KrxClient, PublicDataClient};
use crate::database::DatabaseManager;
use crate::models::{
    BatchStats, CollectionStats, CompanyRecord, Config, REPORT_TYPE_ANNUAL, REPORT_TYPE_QUARTERLY,
    ReconcileStats, ReportKind, ValuationStats,
};
use crate::parsing::{parse_statement, scrape_annual_financials};
use crate::reconcile::reconcile_company;
use crate::valuation::update_company_valuations;

/// Annual filings to request, counting back from the current year. The
/// most recent year or two may not have a filed annual report yet, so the
/// window is generous and only successful fetches are stored.
const ANNUAL_YEARS_BACK: i32 = 7;

/// Quarterly filings to collect, and how many quarters back to scan for
/// them (Q4 has no quarterly filing, so the scan window is wider).
const QUARTERLY_TARGET_COUNT: usize = 8;
const QUARTERLY_SCAN_LIMIT: usize = 15;

/// Courtesy delay between successive filing fetches for one company.
const INTER_FILING_DELAY: Duration = Duration::from_millis(300);

/// One period the collector plans to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionTarget {
    pub fiscal_year: i32,
    pub fiscal_quarter: i32,
    pub kind: ReportKind,
}

impl CollectionTarget {
    pub fn report_type(&self) -> &'static str {
        if self.kind == ReportKind::Annual {
            REPORT_TYPE_ANNUAL
        } else {
            REPORT_TYPE_QUARTERLY
        }
    }
}

/// Plan the periods to collect as of `today`: annual filings for recent
/// years plus the most recent standalone quarters (Q4 excluded, it only
/// exists via the annual filing).
pub fn collection_targets(today: NaiveDate) -> Vec<CollectionTarget> {
    let current_year = today.year();
    let current_quarter = ((today.month() - 1) / 3 + 1) as i32;

    let mut targets = Vec::new();

    for year in (current_year - ANNUAL_YEARS_BACK)..=current_year {
        targets.push(CollectionTarget {
            fiscal_year: year,
            fiscal_quarter: 4,
            kind: ReportKind::Annual,
        });
    }

    let mut year = current_year;
    let mut quarter = current_quarter;
    let mut collected = 0;
    for _ in 0..QUARTERLY_SCAN_LIMIT {
        quarter -= 1;
        if quarter == 0 {
            quarter = 4;
            year -= 1;
        }
        if quarter == 4 {
            continue;
        }

        if let Some(kind) = ReportKind::for_quarter(quarter as u32) {
            targets.push(CollectionTarget {
                fiscal_year: year,
                fiscal_quarter: quarter,
                kind,
            });
            collected += 1;
            if collected >= QUARTERLY_TARGET_COUNT {
                break;
            }
        }
    }

    targets
}

/// Collect all targeted filings for one company, upserting the parsed fact
/// sets. Periods already stored are skipped unless `force`. When the
/// structured source has no annual filing, the filing-document scrape
/// fallback is tried before giving up on the period.
pub async fn collect_company(
    db: &DatabaseManager,
    dart: &mut DartClient,
    company: &CompanyRecord,
    force: bool,
) -> Result<CollectionStats> {
    let existing: HashSet<(i32, i32, String)> = if force {
        HashSet::new()
    } else {
        db.existing_periods(company.id).await?
    };

    let today = Utc::now().date_naive();
    let mut stats = CollectionStats::default();
    let targets: Vec<CollectionTarget> = collection_targets(today)
        .into_iter()
        .filter(|t| {
            let key = (t.fiscal_year, t.fiscal_quarter, t.report_type().to_string());
            if existing.contains(&key) {
                stats.skipped += 1;
                false
            } else {
                true
            }
        })
        .collect();

    info!(
        "collection start: {} ({} targets, {} already present)",
        company.stock_code,
        targets.len(),
        stats.skipped
    );

    for target in targets {
        info!(
            "collecting {} {}/Q{} ({})",
            company.stock_code, target.fiscal_year, target.fiscal_quarter, target.kind
        );

        match dart
            .fetch_statement(&company.corp_code, target.fiscal_year, target.kind)
            .await
        {
            Ok(Some(rows)) => {
                let parsed = parse_statement(&rows);
                if parsed.facts.is_empty() {
                    warn!(
                        "no facts parsed: {} {}/Q{}",
                        company.stock_code, target.fiscal_year, target.fiscal_quarter
                    );
                    stats.failed += 1;
                } else {
                    db.upsert_statement(
                        company.id,
                        target.fiscal_year,
                        target.fiscal_quarter,
                        target.report_type(),
                        &parsed,
                    )
                    .await?;
                    stats.collected += 1;
                    info!(
                        "stored {} {}/Q{} ({} facts)",
                        company.stock_code,
                        target.fiscal_year,
                        target.fiscal_quarter,
                        parsed.facts.len()
                    );
                }
            }
            Ok(None) => {
                if target.kind == ReportKind::Annual {
                    match scrape_annual_financials(dart, &company.corp_code, target.fiscal_year)
                        .await
                    {
                        Ok(Some(parsed)) => {
                            db.upsert_statement(
                                company.id,
                                target.fiscal_year,
                                target.fiscal_quarter,
                                target.report_type(),
                                &parsed,
                            )
                            .await?;
                            stats.collected += 1;
                            info!(
                                "stored {} {} via document scrape ({} facts)",
                                company.stock_code,
                                target.fiscal_year,
                                parsed.facts.len()
                            );
                        }
                        Ok(None) => {
                            warn!(
                                "no data: {} {}/Q{}",
                                company.stock_code, target.fiscal_year, target.fiscal_quarter
                            );
                            stats.failed += 1;
                        }
                        Err(e) => {
                            error!(
                                "document scrape failed: {} {} - {}",
                                company.stock_code, target.fiscal_year, e
                            );
                            stats.failed += 1;
                        }
                    }
                } else {
                    warn!(
                        "no data: {} {}/Q{}",
                        company.stock_code, target.fiscal_year, target.fiscal_quarter
                    );
                    stats.failed += 1;
                }
            }
            Err(e) => {
                error!(
                    "collection failed: {} {}/Q{} - {}",
                    company.stock_code, target.fiscal_year, target.fiscal_quarter, e
                );
                stats.failed += 1;
            }
        }

        sleep(INTER_FILING_DELAY).await;
    }

    info!(
        "collection done: {} (collected {}, skipped {}, failed {})",
        company.stock_code, stats.collected, stats.skipped, stats.failed
    );
    Ok(stats)
}

/// Run the full pipeline for one company: collect, reconcile, valuate.
pub async fn run_company_pipeline(
    db: &DatabaseManager,
    config: &Config,
    company: &CompanyRecord,
    force: bool,
) -> Result<(CollectionStats, ReconcileStats, ValuationStats)> {
    let mut dart = DartClient::new(&config.dart_api_key)?;
    let mut public_data = PublicDataClient::new(&config.public_data_service_key)?;
    let mut krx = KrxClient::new()?;

    let collection = collect_company(db, &mut dart, company, force).await?;
    let reconcile = reconcile_company(db, company, false).await?;
    let valuation = update_company_valuations(db, &mut public_data, &mut krx, company).await?;

    Ok((collection, reconcile, valuation))
}

/// Run the pipeline over many companies with a bounded worker pool.
///
/// Companies are handed out from a shared queue, so no two workers ever
/// touch the same company. A failed company is counted and logged; it does
/// not abort the batch.
pub async fn run_batch(
    db: &DatabaseManager,
    config: &Config,
    companies: Vec<CompanyRecord>,
    force: bool,
) -> Result<BatchStats> {
    let total = companies.len();
    if total == 0 {
        warn!("no companies to process");
        return Ok(BatchStats::default());
    }

    let workers = config.collect_concurrency.clamp(1, total);
    info!("batch start: {} companies, {} workers", total, workers);

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>4}/{len:4} {msg}")
            .expect("valid progress template")
            .progress_chars("#>-"),
    );

    let queue = Arc::new(Mutex::new(companies));
    let stats = Arc::new(Mutex::new(BatchStats::default()));
    let progress = Arc::new(progress);

    let mut handles = Vec::new();
    for worker_id in 0..workers {
        let queue = Arc::clone(&queue);
        let stats = Arc::clone(&stats);
        let progress = Arc::clone(&progress);
        let db = db.clone();
        let config = config.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let company = {
                    let mut queue = queue.lock().expect("queue lock");
                    queue.pop()
                };
                let Some(company) = company else {
                    break;
                };

                progress.set_message(format!("{}", company.stock_code));

                match run_company_pipeline(&db, &config, &company, force).await {
                    Ok((collection, reconcile, valuation)) => {
                        let mut stats = stats.lock().expect("stats lock");
                        stats.absorb(collection, reconcile, valuation);
                    }
                    Err(e) => {
                        error!(
                            "worker {}: company {} failed: {}",
                            worker_id, company.stock_code, e
                        );
                        let mut stats = stats.lock().expect("stats lock");
                        stats.companies_failed += 1;
                    }
                }

                progress.inc(1);
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }

    progress.finish_with_message("batch done");

    let stats = *stats.lock().expect("stats lock");
    info!(
        "batch done: {} processed, {} failed; collected {}, skipped {}, failed {}; \
         {} quarters converted, {} Q4 synthesized; {} periods valued, {} metrics unresolved",
        stats.companies_processed,
        stats.companies_failed,
        stats.collection.collected,
        stats.collection.skipped,
        stats.collection.failed,
        stats.reconcile.converted_quarters,
        stats.reconcile.q4_synthesized,
        stats.valuation.updated_periods,
        stats.valuation.unresolved_metrics
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn targets_cover_recent_annuals_and_eight_quarters() {
        let today = NaiveDate::from_ymd_opt(2024, 8, 7).unwrap();
        let targets = collection_targets(today);

        let annuals: Vec<i32> = targets
            .iter()
            .filter(|t| t.kind == ReportKind::Annual)
            .map(|t| t.fiscal_year)
            .collect();
        assert_eq!(annuals, (2017..=2024).collect::<Vec<_>>());

        let quarters: Vec<(i32, i32)> = targets
            .iter()
            .filter(|t| t.kind != ReportKind::Annual)
            .map(|t| (t.fiscal_year, t.fiscal_quarter))
            .collect();
        assert_eq!(
            quarters,
            vec![
                (2024, 2),
                (2024, 1),
                (2023, 3),
                (2023, 2),
                (2023, 1),
                (2022, 3),
                (2022, 2),
                (2022, 1),
            ]
        );
    }

    #[test]
    fn quarterly_targets_never_include_q4() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let targets = collection_targets(today);

        assert!(
            targets
                .iter()
                .filter(|t| t.kind != ReportKind::Annual)
                .all(|t| t.fiscal_quarter != 4)
        );
    }

    #[test]
    fn report_kind_maps_to_report_type() {
        let annual = CollectionTarget {
            fiscal_year: 2023,
            fiscal_quarter: 4,
            kind: ReportKind::Annual,
        };
        let quarterly = CollectionTarget {
            fiscal_year: 2023,
            fiscal_quarter: 2,
            kind: ReportKind::HalfYear,
        };

        assert_eq!(annual.report_type(), REPORT_TYPE_ANNUAL);
        assert_eq!(quarterly.report_type(), REPORT_TYPE_QUARTERLY);
    }
}
