//! Period reconciliation: turns as-filed quarterly records into standalone
//! per-quarter facts.
//!
//! Quarterly filings report cash-flow figures cumulative from fiscal year
//! start, and no standalone Q4 filing exists. This engine owns both
//! corrections: cumulative→standalone conversion for Q2/Q3 cash-flow facts,
//! and Q4 synthesis from the annual filing. It is the only writer of
//! standalone-normalized cash-flow data.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::database::{DatabaseManager, Q4Facts};
use crate::models::{CompanyRecord, FinancialStatementRecord, ReconcileStats};

/// Per fiscal-year prerequisites for Q4 synthesis.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationState {
    pub fiscal_year: i32,
    pub has_q1: bool,
    pub has_q2: bool,
    pub has_q3: bool,
}

impl ReconciliationState {
    fn assess(fiscal_year: i32, quarters: &BTreeMap<i32, &FinancialStatementRecord>) -> Self {
        Self {
            fiscal_year,
            has_q1: quarters.contains_key(&1),
            has_q2: quarters.contains_key(&2),
            has_q3: quarters.contains_key(&3),
        }
    }

    pub fn q4_ready(&self) -> bool {
        self.has_q1 && self.has_q2 && self.has_q3
    }

    fn missing(&self) -> String {
        let mut missing = Vec::new();
        if !self.has_q1 {
            missing.push("Q1");
        }
        if !self.has_q2 {
            missing.push("Q2");
        }
        if !self.has_q3 {
            missing.push("Q3");
        }
        missing.join(", ")
    }
}

/// Run both reconciliation passes for one company.
pub async fn reconcile_company(
    db: &DatabaseManager,
    company: &CompanyRecord,
    dry_run: bool,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();

    stats.converted_quarters = convert_cumulative_cashflow(db, company, dry_run).await?;

    let (generated, skipped) = synthesize_q4(db, company, dry_run).await?;
    stats.q4_synthesized = generated;
    stats.skipped_years = skipped;

    info!(
        "reconciliation done: {} ({} quarters converted, {} Q4 synthesized, {} years skipped)",
        company.stock_code, stats.converted_quarters, stats.q4_synthesized, stats.skipped_years
    );
    Ok(stats)
}

/// Convert Q2/Q3 cash-flow facts from cumulative to standalone.
///
/// standalone(Qn) = cumulative(Qn) − cumulative(Qn−1), per fact, reading
/// baselines only from the immutable raw cumulative columns. Records
/// already flagged standalone are skipped, which makes reruns no-ops. A
/// missing previous-quarter record leaves the cumulative value in place
/// with a warning.
pub async fn convert_cumulative_cashflow(
    db: &DatabaseManager,
    company: &CompanyRecord,
    dry_run: bool,
) -> Result<usize> {
    let quarterly = db.quarterly_statements(company.id).await?;
    let mut by_year: BTreeMap<i32, BTreeMap<i32, &FinancialStatementRecord>> = BTreeMap::new();
    for record in &quarterly {
        by_year
            .entry(record.fiscal_year)
            .or_default()
            .insert(record.fiscal_quarter, record);
    }

    let mut converted = 0;

    for (year, quarters) in &by_year {
        for quarter in [2, 3] {
            let Some(current) = quarters.get(&quarter) else {
                continue;
            };
            if current.cf_standalone {
                continue;
            }
            let Some(previous) = quarters.get(&(quarter - 1)) else {
                warn!(
                    "{} {}/Q{}: Q{} baseline missing, keeping cumulative cash flow",
                    company.stock_code,
                    year,
                    quarter,
                    quarter - 1
                );
                continue;
            };

            let delta = |cur: Option<i64>, prev: Option<i64>| Some(cur? - prev?);
            let operating = delta(current.ocf_cumulative, previous.ocf_cumulative);
            let investing = delta(current.icf_cumulative, previous.icf_cumulative);
            let financing = delta(current.fcf_cumulative, previous.fcf_cumulative);
            let capex = delta(current.capex_cumulative, previous.capex_cumulative);

            debug!(
                "{} {}/Q{} standalone cash flow: ocf={:?} icf={:?} fcf={:?} capex={:?}",
                company.stock_code, year, quarter, operating, investing, financing, capex
            );

            if !dry_run {
                db.apply_standalone_cashflow(current.id, operating, investing, financing, capex)
                    .await?;
            }
            converted += 1;
        }
    }

    Ok(converted)
}

/// Synthesize the unreported standalone Q4 from the annual filing.
///
/// Income facts: annual − (Q1 + Q2 + Q3). Balance-sheet facts are
/// point-in-time and copied from the annual filing. Cash-flow facts:
/// annual (full-year cumulative) − Q3 cumulative. Requires the full Q1–Q3
/// set; otherwise the year is skipped with an explicit warning and nothing
/// partial is written.
pub async fn synthesize_q4(
    db: &DatabaseManager,
    company: &CompanyRecord,
    dry_run: bool,
) -> Result<(usize, usize)> {
    let annuals = db.annual_statements(company.id).await?;
    let quarterly = db.quarterly_statements(company.id).await?;

    let mut by_year: BTreeMap<i32, BTreeMap<i32, &FinancialStatementRecord>> = BTreeMap::new();
    for record in &quarterly {
        by_year
            .entry(record.fiscal_year)
            .or_default()
            .insert(record.fiscal_quarter, record);
    }

    let mut generated = 0;
    let mut skipped = 0;
    let empty = BTreeMap::new();

    for annual in &annuals {
        let year = annual.fiscal_year;
        let quarters = by_year.get(&year).unwrap_or(&empty);
        let state = ReconciliationState::assess(year, quarters);

        if !state.q4_ready() {
            warn!(
                "{} {}: missing {} - skipping Q4 synthesis",
                company.stock_code,
                year,
                state.missing()
            );
            skipped += 1;
            continue;
        }

        let q1 = quarters[&1];
        let q2 = quarters[&2];
        let q3 = quarters[&3];

        // Income facts are standalone per quarter already; absent quarter
        // values contribute zero to the through-Q3 sum.
        let income_q4 = |annual_value: Option<i64>, q1v: Option<i64>, q2v: Option<i64>, q3v: Option<i64>| {
            annual_value.map(|a| {
                a - q1v.unwrap_or(0) - q2v.unwrap_or(0) - q3v.unwrap_or(0)
            })
        };
        // Cash flow: full-year cumulative minus the Q3 raw cumulative.
        let cashflow_q4 =
            |annual_value: Option<i64>, q3_cumulative: Option<i64>| Some(annual_value? - q3_cumulative?);

        let facts = Q4Facts {
            revenue: income_q4(annual.revenue, q1.revenue, q2.revenue, q3.revenue),
            operating_income: income_q4(
                annual.operating_income,
                q1.operating_income,
                q2.operating_income,
                q3.operating_income,
            ),
            net_income: income_q4(annual.net_income, q1.net_income, q2.net_income, q3.net_income),
            total_assets: annual.total_assets,
            total_liabilities: annual.total_liabilities,
            total_equity: annual.total_equity,
            current_assets: annual.current_assets,
            current_liabilities: annual.current_liabilities,
            inventories: annual.inventories,
            operating_cash_flow: cashflow_q4(annual.operating_cash_flow, q3.ocf_cumulative),
            investing_cash_flow: cashflow_q4(annual.investing_cash_flow, q3.icf_cumulative),
            financing_cash_flow: cashflow_q4(annual.financing_cash_flow, q3.fcf_cumulative),
            capex: cashflow_q4(annual.capex, q3.capex_cumulative),
        };

        info!(
            "{} {}/Q4 synthesized: revenue={:?} net_income={:?} ocf={:?}",
            company.stock_code, year, facts.revenue, facts.net_income, facts.operating_cash_flow
        );

        if !dry_run {
            db.upsert_q4_statement(company.id, year, &facts).await?;
        }
        generated += 1;
    }

    Ok((generated, skipped))
}
