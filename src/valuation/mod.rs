//! Valuation metrics: PER and PBR per filing period, combining reconciled
//! facts with point-in-time market capitalization.
//!
//! Market cap is looked up as of the period's fiscal-quarter-end date
//! through a cascade of sources, and every unresolved metric is logged with
//! the specific missing precondition rather than silently left null.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::api::{KrxClient, MarketCapSource, PublicDataClient};
use crate::database::DatabaseManager;
use crate::models::{
    CompanyRecord, FinancialStatementRecord, REPORT_TYPE_QUARTERLY, ValuationSnapshot,
    ValuationStats,
};

/// Fiscal-quarter-end date: Mar 31 / Jun 30 / Sep 30 / Dec 31.
pub fn quarter_end_date(fiscal_year: i32, fiscal_quarter: i32) -> NaiveDate {
    let (month, day) = match fiscal_quarter {
        1 => (3, 31),
        2 => (6, 30),
        3 => (9, 30),
        _ => (12, 31),
    };
    NaiveDate::from_ymd_opt(fiscal_year, month, day).expect("valid calendar date")
}

/// PBR = market cap / total equity, defined only for positive equity.
pub fn compute_pbr(market_cap: i64, total_equity: i64) -> Option<f64> {
    if total_equity > 0 {
        Some(market_cap as f64 / total_equity as f64)
    } else {
        None
    }
}

/// PER on whole-year earnings. Negative net income yields a negative PER,
/// not null; only a zero denominator is unresolvable.
pub fn compute_annual_per(market_cap: i64, net_income: i64) -> Option<f64> {
    if net_income != 0 {
        Some(market_cap as f64 / net_income as f64)
    } else {
        None
    }
}

/// Annualize cumulative net income through a quarter:
/// cumulative × (4 / quarter). Single-quarter income is seasonally
/// distorted, so Q1–Q3 PER always annualizes the cumulative figure.
pub fn annualize_cumulative_income(cumulative: i64, quarter: i32) -> f64 {
    cumulative as f64 * 4.0 / quarter as f64
}

/// PER for an interim quarter from annualized cumulative earnings.
pub fn compute_quarter_per(market_cap: i64, annualized_income: f64) -> Option<f64> {
    if annualized_income != 0.0 {
        Some(market_cap as f64 / annualized_income)
    } else {
        None
    }
}

/// Market cap as of `date`, cascading across sources in priority order.
/// Each source handles holiday fallback internally; a source that errors
/// is logged and the cascade moves on.
pub async fn lookup_market_cap(
    sources: &mut [&mut dyn MarketCapSource],
    company: &CompanyRecord,
    date: NaiveDate,
) -> Option<i64> {
    for source in sources.iter_mut() {
        match source.market_cap_on(company, date).await {
            Ok(Some(market_cap)) => {
                debug!(
                    "market cap via {}: {} {} = {}",
                    source.source_name(),
                    company.stock_code,
                    date,
                    market_cap
                );
                return Some(market_cap);
            }
            Ok(None) => debug!(
                "{} has no market cap for {} {}",
                source.source_name(),
                company.stock_code,
                date
            ),
            Err(e) => warn!(
                "{} market cap lookup failed for {} {}: {}",
                source.source_name(),
                company.stock_code,
                date,
                e
            ),
        }
    }

    None
}

/// Compute the valuation snapshot for one period.
///
/// `annual_net_income` is the whole-year figure for the period's fiscal
/// year; `quarterly_net_incomes` maps (year, quarter) to standalone net
/// income and feeds the cumulative annualization for Q1–Q3.
fn compute_snapshot(
    company: &CompanyRecord,
    record: &FinancialStatementRecord,
    market_cap: Option<i64>,
    annual_net_income: Option<i64>,
    quarterly_net_incomes: &HashMap<(i32, i32), i64>,
) -> ValuationSnapshot {
    let period = format!(
        "{} {}/Q{} ({})",
        company.stock_code, record.fiscal_year, record.fiscal_quarter, record.report_type
    );

    let pbr = match (market_cap, record.total_equity) {
        (Some(mc), Some(equity)) => {
            let pbr = compute_pbr(mc, equity);
            if pbr.is_none() {
                warn!("{}: PBR unresolved (total equity not positive)", period);
            }
            pbr
        }
        (None, _) => {
            warn!("{}: PBR unresolved (no market cap)", period);
            None
        }
        (_, None) => {
            warn!("{}: PBR unresolved (no total equity)", period);
            None
        }
    };

    // When market cap itself is unavailable, fall back to an implied market
    // cap from the previously computed PBR and book equity.
    let effective_market_cap = market_cap.or_else(|| {
        let implied = record
            .pbr
            .zip(record.total_equity)
            .map(|(pbr, equity)| (pbr * equity as f64) as i64);
        if let Some(mc) = implied {
            debug!("{}: using implied market cap {}", period, mc);
        }
        implied
    });

    let whole_year_period =
        record.is_annual() || record.fiscal_quarter == 4;

    let per = match effective_market_cap {
        None => {
            warn!("{}: PER unresolved (no market cap)", period);
            None
        }
        Some(mc) if whole_year_period => match annual_net_income {
            Some(net_income) => {
                let per = compute_annual_per(mc, net_income);
                if per.is_none() {
                    warn!("{}: PER unresolved (net income is zero)", period);
                }
                per
            }
            None => {
                warn!("{}: PER unresolved (no annual net income)", period);
                None
            }
        },
        Some(mc) => {
            let quarter = record.fiscal_quarter;
            let mut cumulative = 0i64;
            let mut complete = true;
            for q in 1..=quarter {
                match quarterly_net_incomes.get(&(record.fiscal_year, q)) {
                    Some(value) => cumulative += value,
                    None => {
                        complete = false;
                        break;
                    }
                }
            }

            if !complete {
                warn!(
                    "{}: PER unresolved (net income missing for a prior quarter)",
                    period
                );
                None
            } else {
                let annualized = annualize_cumulative_income(cumulative, quarter);
                let per = compute_quarter_per(mc, annualized);
                if per.is_none() {
                    warn!("{}: PER unresolved (annualized net income is zero)", period);
                }
                per
            }
        }
    };

    ValuationSnapshot { per, pbr }
}

/// Recompute PER/PBR for every stored period of a company.
pub async fn update_company_valuations(
    db: &DatabaseManager,
    public_data: &mut PublicDataClient,
    krx: &mut KrxClient,
    company: &CompanyRecord,
) -> Result<ValuationStats> {
    let statements = db.all_statements(company.id).await?;

    let mut quarterly_net_incomes: HashMap<(i32, i32), i64> = HashMap::new();
    let mut annual_net_incomes: HashMap<i32, i64> = HashMap::new();
    for record in &statements {
        if record.report_type == REPORT_TYPE_QUARTERLY {
            if let Some(net_income) = record.net_income {
                quarterly_net_incomes.insert((record.fiscal_year, record.fiscal_quarter), net_income);
            }
        } else if let Some(net_income) = record.net_income {
            annual_net_incomes.insert(record.fiscal_year, net_income);
        }
    }

    let mut sources: [&mut dyn MarketCapSource; 2] = [public_data, krx];
    let mut stats = ValuationStats::default();

    for record in &statements {
        let end_date = quarter_end_date(record.fiscal_year, record.fiscal_quarter);
        let market_cap = lookup_market_cap(&mut sources, company, end_date).await;

        let snapshot = compute_snapshot(
            company,
            record,
            market_cap,
            annual_net_incomes.get(&record.fiscal_year).copied(),
            &quarterly_net_incomes,
        );

        if snapshot.per.is_some() || snapshot.pbr.is_some() {
            db.update_valuation(record.id, snapshot.per, snapshot.pbr)
                .await?;
            stats.updated_periods += 1;
        }
        if snapshot.per.is_none() {
            stats.unresolved_metrics += 1;
        }
        if snapshot.pbr.is_none() {
            stats.unresolved_metrics += 1;
        }
    }

    info!(
        "valuation update done: {} ({} periods updated, {} metrics unresolved)",
        company.stock_code, stats.updated_periods, stats.unresolved_metrics
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(
        fiscal_year: i32,
        fiscal_quarter: i32,
        report_type: &str,
        net_income: Option<i64>,
        total_equity: Option<i64>,
        pbr: Option<f64>,
    ) -> FinancialStatementRecord {
        FinancialStatementRecord {
            id: 1,
            company_id: 1,
            fiscal_year,
            fiscal_quarter,
            report_type: report_type.to_string(),
            revenue: None,
            operating_income: None,
            net_income,
            total_assets: None,
            total_liabilities: None,
            total_equity,
            current_assets: None,
            current_liabilities: None,
            inventories: None,
            operating_cash_flow: None,
            investing_cash_flow: None,
            financing_cash_flow: None,
            capex: None,
            ocf_cumulative: None,
            icf_cumulative: None,
            fcf_cumulative: None,
            capex_cumulative: None,
            cf_standalone: true,
            per: None,
            pbr,
            parse_metadata: None,
        }
    }

    fn company() -> CompanyRecord {
        CompanyRecord {
            id: 1,
            stock_code: "005930".to_string(),
            corp_code: "00126380".to_string(),
            company_name: "삼성전자".to_string(),
            industry: None,
        }
    }

    #[test]
    fn quarter_end_dates() {
        assert_eq!(
            quarter_end_date(2024, 1),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
        );
        assert_eq!(
            quarter_end_date(2024, 2),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
        );
        assert_eq!(
            quarter_end_date(2024, 3),
            NaiveDate::from_ymd_opt(2024, 9, 30).unwrap()
        );
        assert_eq!(
            quarter_end_date(2024, 4),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
        );
    }

    #[test]
    fn negative_net_income_yields_negative_per() {
        let rec = record(2023, 4, "annual", Some(-500_000_000), None, None);
        let snapshot = compute_snapshot(
            &company(),
            &rec,
            Some(10_000_000_000),
            Some(-500_000_000),
            &HashMap::new(),
        );

        assert_eq!(snapshot.per, Some(-20.0));
    }

    #[test]
    fn zero_net_income_leaves_per_unresolved() {
        let rec = record(2023, 4, "annual", Some(0), None, None);
        let snapshot =
            compute_snapshot(&company(), &rec, Some(10_000_000_000), Some(0), &HashMap::new());

        assert_eq!(snapshot.per, None);
    }

    #[test]
    fn interim_per_annualizes_cumulative_income() {
        let mut net_incomes = HashMap::new();
        net_incomes.insert((2023, 1), 200i64);
        net_incomes.insert((2023, 2), 300i64);

        let rec = record(2023, 2, "quarterly", Some(300), None, None);
        let snapshot = compute_snapshot(&company(), &rec, Some(4_000), None, &net_incomes);

        // cumulative 500 annualized by 4/2 = 1000; PER = 4000 / 1000.
        assert_eq!(snapshot.per, Some(4.0));
    }

    #[test]
    fn interim_per_requires_all_prior_quarters() {
        let mut net_incomes = HashMap::new();
        net_incomes.insert((2023, 3), 250i64); // Q1/Q2 missing

        let rec = record(2023, 3, "quarterly", Some(250), None, None);
        let snapshot = compute_snapshot(&company(), &rec, Some(4_000), None, &net_incomes);

        assert_eq!(snapshot.per, None);
    }

    #[test]
    fn pbr_requires_positive_equity() {
        let rec = record(2023, 4, "annual", Some(100), Some(2_000), None);
        let snapshot =
            compute_snapshot(&company(), &rec, Some(10_000), Some(100), &HashMap::new());
        assert_eq!(snapshot.pbr, Some(5.0));

        let rec = record(2023, 4, "annual", Some(100), Some(-2_000), None);
        let snapshot =
            compute_snapshot(&company(), &rec, Some(10_000), Some(100), &HashMap::new());
        assert_eq!(snapshot.pbr, None);
    }

    #[test]
    fn implied_market_cap_from_prior_pbr() {
        // No market cap available, but a previously computed PBR and book
        // equity imply one: 2.0 × 5,000 = 10,000.
        let rec = record(2023, 4, "annual", Some(500), Some(5_000), Some(2.0));
        let snapshot = compute_snapshot(&company(), &rec, None, Some(500), &HashMap::new());

        assert_eq!(snapshot.per, Some(20.0));
        // PBR itself stays unresolved: it needs a real market cap.
        assert_eq!(snapshot.pbr, None);
    }

    #[test]
    fn synthesized_q4_uses_whole_year_income() {
        // The Q4 quarterly record carries standalone Q4 income, but PER for
        // Q4 periods divides by the whole-year figure.
        let rec = record(2023, 4, "quarterly", Some(450), None, None);
        let snapshot =
            compute_snapshot(&company(), &rec, Some(24_000), Some(1_200), &HashMap::new());

        assert_eq!(snapshot.per, Some(20.0));
    }
}
