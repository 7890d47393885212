//! Persisted fact store on SQLite.
//!
//! One record per (company_id, fiscal_year, fiscal_quarter, report_type)
//! with all fact columns nullable; upserted on re-collection. Cash-flow
//! columns are doubled: the canonical columns hold standalone values once
//! converted, the `*_cumulative` columns preserve the raw as-filed values
//! that standalone conversion subtracts against.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use crate::models::{
    CompanyRecord, FinancialField, FinancialStatementRecord, ParsedFinancials,
    REPORT_TYPE_QUARTERLY,
};

const STATEMENT_COLUMNS: &str = "id, company_id, fiscal_year, fiscal_quarter, report_type, \
     revenue, operating_income, net_income, \
     total_assets, total_liabilities, total_equity, \
     current_assets, current_liabilities, inventories, \
     operating_cash_flow, investing_cash_flow, financing_cash_flow, capex, \
     ocf_cumulative, icf_cumulative, fcf_cumulative, capex_cumulative, \
     cf_standalone, per, pbr, parse_metadata";

#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub companies: i64,
    pub statements: i64,
    pub annual_statements: i64,
    pub quarterly_statements: i64,
    pub valued_statements: i64,
}

/// Standalone Q4 facts produced by reconciliation, written as one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Q4Facts {
    pub revenue: Option<i64>,
    pub operating_income: Option<i64>,
    pub net_income: Option<i64>,
    pub total_assets: Option<i64>,
    pub total_liabilities: Option<i64>,
    pub total_equity: Option<i64>,
    pub current_assets: Option<i64>,
    pub current_liabilities: Option<i64>,
    pub inventories: Option<i64>,
    pub operating_cash_flow: Option<i64>,
    pub investing_cash_flow: Option<i64>,
    pub financing_cash_flow: Option<i64>,
    pub capex: Option<i64>,
}

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn connect(database_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", database_path))
            .await
            .with_context(|| format!("failed to open database {}", database_path))?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stock_code TEXT NOT NULL UNIQUE,
                corp_code TEXT NOT NULL,
                company_name TEXT NOT NULL,
                industry TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS financial_statements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id),
                fiscal_year INTEGER NOT NULL,
                fiscal_quarter INTEGER NOT NULL,
                report_type TEXT NOT NULL,
                revenue INTEGER,
                operating_income INTEGER,
                net_income INTEGER,
                total_assets INTEGER,
                total_liabilities INTEGER,
                total_equity INTEGER,
                current_assets INTEGER,
                current_liabilities INTEGER,
                inventories INTEGER,
                operating_cash_flow INTEGER,
                investing_cash_flow INTEGER,
                financing_cash_flow INTEGER,
                capex INTEGER,
                ocf_cumulative INTEGER,
                icf_cumulative INTEGER,
                fcf_cumulative INTEGER,
                capex_cumulative INTEGER,
                cf_standalone INTEGER NOT NULL DEFAULT 0,
                per REAL,
                pbr REAL,
                parse_metadata TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(company_id, fiscal_year, fiscal_quarter, report_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_statements_company_year \
             ON financial_statements(company_id, fiscal_year)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_company(
        &self,
        stock_code: &str,
        corp_code: &str,
        company_name: &str,
        industry: Option<&str>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO companies (stock_code, corp_code, company_name, industry)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(stock_code) DO UPDATE SET
                corp_code = excluded.corp_code,
                company_name = excluded.company_name,
                industry = COALESCE(excluded.industry, companies.industry)
            "#,
        )
        .bind(stock_code)
        .bind(corp_code)
        .bind(company_name)
        .bind(industry)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM companies WHERE stock_code = ?1")
            .bind(stock_code)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get_companies(&self) -> Result<Vec<CompanyRecord>> {
        let companies = sqlx::query_as::<_, CompanyRecord>(
            "SELECT id, stock_code, corp_code, company_name, industry \
             FROM companies ORDER BY stock_code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(companies)
    }

    pub async fn get_company_by_stock_code(
        &self,
        stock_code: &str,
    ) -> Result<Option<CompanyRecord>> {
        let company = sqlx::query_as::<_, CompanyRecord>(
            "SELECT id, stock_code, corp_code, company_name, industry \
             FROM companies WHERE stock_code = ?1",
        )
        .bind(stock_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    /// Periods already stored for a company, keyed the way the collector
    /// plans targets.
    pub async fn existing_periods(
        &self,
        company_id: i64,
    ) -> Result<HashSet<(i32, i32, String)>> {
        let rows: Vec<(i32, i32, String)> = sqlx::query_as(
            "SELECT fiscal_year, fiscal_quarter, report_type \
             FROM financial_statements WHERE company_id = ?1",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Upsert one parsed filing period.
    ///
    /// Cash-flow facts land in both the canonical columns and the raw
    /// cumulative baseline columns; the standalone flag is reset so that
    /// reconciliation reconverts from the fresh baselines. Q1 and annual
    /// records need no conversion by definition.
    pub async fn upsert_statement(
        &self,
        company_id: i64,
        fiscal_year: i32,
        fiscal_quarter: i32,
        report_type: &str,
        parsed: &ParsedFinancials,
    ) -> Result<()> {
        let fact = |f: FinancialField| parsed.facts.get(&f).copied();
        let cf_standalone = fiscal_quarter == 1 || report_type != REPORT_TYPE_QUARTERLY;
        let metadata_json = serde_json::to_string(&parsed.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO financial_statements (
                company_id, fiscal_year, fiscal_quarter, report_type,
                revenue, operating_income, net_income,
                total_assets, total_liabilities, total_equity,
                current_assets, current_liabilities, inventories,
                operating_cash_flow, investing_cash_flow, financing_cash_flow, capex,
                ocf_cumulative, icf_cumulative, fcf_cumulative, capex_cumulative,
                cf_standalone, parse_metadata
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7,
                ?8, ?9, ?10,
                ?11, ?12, ?13,
                ?14, ?15, ?16, ?17,
                ?14, ?15, ?16, ?17,
                ?18, ?19
            )
            ON CONFLICT(company_id, fiscal_year, fiscal_quarter, report_type) DO UPDATE SET
                revenue = excluded.revenue,
                operating_income = excluded.operating_income,
                net_income = excluded.net_income,
                total_assets = excluded.total_assets,
                total_liabilities = excluded.total_liabilities,
                total_equity = excluded.total_equity,
                current_assets = excluded.current_assets,
                current_liabilities = excluded.current_liabilities,
                inventories = excluded.inventories,
                operating_cash_flow = excluded.operating_cash_flow,
                investing_cash_flow = excluded.investing_cash_flow,
                financing_cash_flow = excluded.financing_cash_flow,
                capex = excluded.capex,
                ocf_cumulative = excluded.ocf_cumulative,
                icf_cumulative = excluded.icf_cumulative,
                fcf_cumulative = excluded.fcf_cumulative,
                capex_cumulative = excluded.capex_cumulative,
                cf_standalone = excluded.cf_standalone,
                parse_metadata = excluded.parse_metadata
            "#,
        )
        .bind(company_id)
        .bind(fiscal_year)
        .bind(fiscal_quarter)
        .bind(report_type)
        .bind(fact(FinancialField::Revenue))
        .bind(fact(FinancialField::OperatingIncome))
        .bind(fact(FinancialField::NetIncome))
        .bind(fact(FinancialField::TotalAssets))
        .bind(fact(FinancialField::TotalLiabilities))
        .bind(fact(FinancialField::TotalEquity))
        .bind(fact(FinancialField::CurrentAssets))
        .bind(fact(FinancialField::CurrentLiabilities))
        .bind(fact(FinancialField::Inventories))
        .bind(fact(FinancialField::OperatingCashFlow))
        .bind(fact(FinancialField::InvestingCashFlow))
        .bind(fact(FinancialField::FinancingCashFlow))
        .bind(fact(FinancialField::Capex))
        .bind(cf_standalone)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn all_statements(&self, company_id: i64) -> Result<Vec<FinancialStatementRecord>> {
        let records = sqlx::query_as::<_, FinancialStatementRecord>(&format!(
            "SELECT {STATEMENT_COLUMNS} FROM financial_statements \
             WHERE company_id = ?1 \
             ORDER BY fiscal_year, fiscal_quarter, report_type"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn quarterly_statements(
        &self,
        company_id: i64,
    ) -> Result<Vec<FinancialStatementRecord>> {
        let records = sqlx::query_as::<_, FinancialStatementRecord>(&format!(
            "SELECT {STATEMENT_COLUMNS} FROM financial_statements \
             WHERE company_id = ?1 AND report_type = 'quarterly' \
             ORDER BY fiscal_year, fiscal_quarter"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn annual_statements(
        &self,
        company_id: i64,
    ) -> Result<Vec<FinancialStatementRecord>> {
        let records = sqlx::query_as::<_, FinancialStatementRecord>(&format!(
            "SELECT {STATEMENT_COLUMNS} FROM financial_statements \
             WHERE company_id = ?1 AND report_type = 'annual' \
             ORDER BY fiscal_year DESC"
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Write converted standalone cash-flow values for one record and flag
    /// it converted. `None` keeps the stored (cumulative) value: inferior
    /// but non-blocking when a baseline was missing.
    pub async fn apply_standalone_cashflow(
        &self,
        statement_id: i64,
        operating: Option<i64>,
        investing: Option<i64>,
        financing: Option<i64>,
        capex: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE financial_statements SET
                operating_cash_flow = COALESCE(?1, operating_cash_flow),
                investing_cash_flow = COALESCE(?2, investing_cash_flow),
                financing_cash_flow = COALESCE(?3, financing_cash_flow),
                capex = COALESCE(?4, capex),
                cf_standalone = 1
            WHERE id = ?5
            "#,
        )
        .bind(operating)
        .bind(investing)
        .bind(financing)
        .bind(capex)
        .bind(statement_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the synthesized standalone Q4 record. The record carries no
    /// raw cumulative baselines of its own and is standalone by
    /// construction.
    pub async fn upsert_q4_statement(
        &self,
        company_id: i64,
        fiscal_year: i32,
        facts: &Q4Facts,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO financial_statements (
                company_id, fiscal_year, fiscal_quarter, report_type,
                revenue, operating_income, net_income,
                total_assets, total_liabilities, total_equity,
                current_assets, current_liabilities, inventories,
                operating_cash_flow, investing_cash_flow, financing_cash_flow, capex,
                cf_standalone
            ) VALUES (?1, ?2, 4, 'quarterly', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1)
            ON CONFLICT(company_id, fiscal_year, fiscal_quarter, report_type) DO UPDATE SET
                revenue = excluded.revenue,
                operating_income = excluded.operating_income,
                net_income = excluded.net_income,
                total_assets = excluded.total_assets,
                total_liabilities = excluded.total_liabilities,
                total_equity = excluded.total_equity,
                current_assets = excluded.current_assets,
                current_liabilities = excluded.current_liabilities,
                inventories = excluded.inventories,
                operating_cash_flow = excluded.operating_cash_flow,
                investing_cash_flow = excluded.investing_cash_flow,
                financing_cash_flow = excluded.financing_cash_flow,
                capex = excluded.capex,
                ocf_cumulative = NULL,
                icf_cumulative = NULL,
                fcf_cumulative = NULL,
                capex_cumulative = NULL,
                cf_standalone = 1
            "#,
        )
        .bind(company_id)
        .bind(fiscal_year)
        .bind(facts.revenue)
        .bind(facts.operating_income)
        .bind(facts.net_income)
        .bind(facts.total_assets)
        .bind(facts.total_liabilities)
        .bind(facts.total_equity)
        .bind(facts.current_assets)
        .bind(facts.current_liabilities)
        .bind(facts.inventories)
        .bind(facts.operating_cash_flow)
        .bind(facts.investing_cash_flow)
        .bind(facts.financing_cash_flow)
        .bind(facts.capex)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite valuation metrics for one period. `None` keeps the
    /// previous value so that a transiently missing market-cap source does
    /// not erase an earlier good snapshot.
    pub async fn update_valuation(
        &self,
        statement_id: i64,
        per: Option<f64>,
        pbr: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE financial_statements SET \
                per = COALESCE(?1, per), pbr = COALESCE(?2, pbr) \
             WHERE id = ?3",
        )
        .bind(per)
        .bind(pbr)
        .bind(statement_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Backfill raw cumulative baselines for legacy rows collected before
    /// the baseline columns existed. Only touches unconverted quarterly
    /// rows, whose canonical values are still the as-filed cumulatives.
    pub async fn backfill_cumulative_baselines(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE financial_statements SET
                ocf_cumulative = COALESCE(ocf_cumulative, operating_cash_flow),
                icf_cumulative = COALESCE(icf_cumulative, investing_cash_flow),
                fcf_cumulative = COALESCE(fcf_cumulative, financing_cash_flow),
                capex_cumulative = COALESCE(capex_cumulative, capex)
            WHERE report_type = 'quarterly' AND cf_standalone = 0
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<DbStats> {
        let companies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM companies")
            .fetch_one(&self.pool)
            .await?;
        let statements: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM financial_statements")
            .fetch_one(&self.pool)
            .await?;
        let annual_statements: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM financial_statements WHERE report_type = 'annual'",
        )
        .fetch_one(&self.pool)
        .await?;
        let quarterly_statements: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM financial_statements WHERE report_type = 'quarterly'",
        )
        .fetch_one(&self.pool)
        .await?;
        let valued_statements: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM financial_statements \
             WHERE per IS NOT NULL OR pbr IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        info!(
            "database stats: {} companies, {} statements ({} annual, {} quarterly), {} valued",
            companies, statements, annual_statements, quarterly_statements, valued_statements
        );

        Ok(DbStats {
            companies,
            statements,
            annual_statements,
            quarterly_statements,
            valued_statements,
        })
    }
}
