use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Configuration for the application, loaded once at startup and passed by
/// reference into the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub dart_api_key: String,
    pub public_data_service_key: String,
    pub database_path: String,
    pub collect_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    ///
    /// Missing API credentials are a construction-time error, not a deferred
    /// first-call failure.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let dart_api_key = std::env::var("DART_API_KEY")
            .map_err(|_| anyhow!("DART_API_KEY environment variable is required"))?;
        let public_data_service_key = std::env::var("PUBLIC_DATA_SERVICE_KEY")
            .map_err(|_| anyhow!("PUBLIC_DATA_SERVICE_KEY environment variable is required"))?;

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "db/krx_stocks.db".to_string());
        let collect_concurrency = std::env::var("COLLECT_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            dart_api_key,
            public_data_service_key,
            database_path,
            collect_concurrency,
        })
    }
}

/// Canonical financial facts extracted from a filing.
///
/// Values are always integer won; a fact that cannot be resolved is absent,
/// never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialField {
    Revenue,
    OperatingIncome,
    NetIncome,
    TotalAssets,
    TotalLiabilities,
    TotalEquity,
    CurrentAssets,
    CurrentLiabilities,
    Inventories,
    OperatingCashFlow,
    InvestingCashFlow,
    FinancingCashFlow,
    Capex,
}

impl FinancialField {
    pub const ALL: [FinancialField; 13] = [
        FinancialField::Revenue,
        FinancialField::OperatingIncome,
        FinancialField::NetIncome,
        FinancialField::TotalAssets,
        FinancialField::TotalLiabilities,
        FinancialField::TotalEquity,
        FinancialField::CurrentAssets,
        FinancialField::CurrentLiabilities,
        FinancialField::Inventories,
        FinancialField::OperatingCashFlow,
        FinancialField::InvestingCashFlow,
        FinancialField::FinancingCashFlow,
        FinancialField::Capex,
    ];

    /// Column name in the persisted fact store.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinancialField::Revenue => "revenue",
            FinancialField::OperatingIncome => "operating_income",
            FinancialField::NetIncome => "net_income",
            FinancialField::TotalAssets => "total_assets",
            FinancialField::TotalLiabilities => "total_liabilities",
            FinancialField::TotalEquity => "total_equity",
            FinancialField::CurrentAssets => "current_assets",
            FinancialField::CurrentLiabilities => "current_liabilities",
            FinancialField::Inventories => "inventories",
            FinancialField::OperatingCashFlow => "operating_cash_flow",
            FinancialField::InvestingCashFlow => "investing_cash_flow",
            FinancialField::FinancingCashFlow => "financing_cash_flow",
            FinancialField::Capex => "capex",
        }
    }

    /// Income-statement facts are reported standalone per quarter.
    pub fn is_income_statement(&self) -> bool {
        matches!(
            self,
            FinancialField::Revenue | FinancialField::OperatingIncome | FinancialField::NetIncome
        )
    }

    /// Balance-sheet facts are point-in-time levels.
    pub fn is_balance_sheet(&self) -> bool {
        matches!(
            self,
            FinancialField::TotalAssets
                | FinancialField::TotalLiabilities
                | FinancialField::TotalEquity
                | FinancialField::CurrentAssets
                | FinancialField::CurrentLiabilities
                | FinancialField::Inventories
        )
    }

    /// Cash-flow facts are reported cumulative-from-fiscal-year-start and
    /// need standalone conversion.
    pub fn is_cash_flow(&self) -> bool {
        matches!(
            self,
            FinancialField::OperatingCashFlow
                | FinancialField::InvestingCashFlow
                | FinancialField::FinancingCashFlow
                | FinancialField::Capex
        )
    }
}

impl fmt::Display for FinancialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statement division codes used by DART: balance sheet, income statement,
/// comprehensive income statement, cash-flow statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementDiv {
    BS,
    IS,
    CIS,
    CF,
}

impl StatementDiv {
    pub fn code(&self) -> &'static str {
        match self {
            StatementDiv::BS => "BS",
            StatementDiv::IS => "IS",
            StatementDiv::CIS => "CIS",
            StatementDiv::CF => "CF",
        }
    }
}

/// One row of a DART financial statement response. Ephemeral: consumed
/// during parsing, never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStatementRow {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_nm: String,
    #[serde(default)]
    pub sj_div: String,
    #[serde(default)]
    pub thstrm_amount: String,
}

/// DART report kinds and their report codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Annual,
    Quarter1,
    HalfYear,
    Quarter3,
}

impl ReportKind {
    pub fn reprt_code(&self) -> &'static str {
        match self {
            ReportKind::Annual => "11011",
            ReportKind::Quarter1 => "11013",
            ReportKind::HalfYear => "11012",
            ReportKind::Quarter3 => "11014",
        }
    }

    pub fn for_quarter(quarter: u32) -> Option<Self> {
        match quarter {
            1 => Some(ReportKind::Quarter1),
            2 => Some(ReportKind::HalfYear),
            3 => Some(ReportKind::Quarter3),
            4 => Some(ReportKind::Annual),
            _ => None,
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::Annual => "annual",
            ReportKind::Quarter1 => "quarter1",
            ReportKind::HalfYear => "quarter2",
            ReportKind::Quarter3 => "quarter3",
        };
        f.write_str(name)
    }
}

/// Report type of a stored period.
pub const REPORT_TYPE_ANNUAL: &str = "annual";
pub const REPORT_TYPE_QUARTERLY: &str = "quarterly";

/// Resolved facts keyed by field; only successfully resolved facts appear.
pub type FactSet = BTreeMap<FinancialField, i64>;

/// Monetary unit a scraped table turned out to be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyUnit {
    Won,
    ThousandWon,
    MillionWon,
}

impl MoneyUnit {
    pub fn multiplier(&self) -> i64 {
        match self {
            MoneyUnit::Won => 1,
            MoneyUnit::ThousandWon => 1_000,
            MoneyUnit::MillionWon => 1_000_000,
        }
    }
}

/// How the unit for a scraped value was determined: read from the document
/// (`detected`) or guessed from the amount's magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub unit: MoneyUnit,
    pub detected: bool,
}

/// Where a fact set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    DartApi,
    DocumentScrape,
}

/// Parse provenance stored alongside the facts for downstream trust
/// decisions and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseMetadata {
    pub source: ParseSource,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<FinancialField, UnitInfo>,
}

impl ParseMetadata {
    pub fn dart_api() -> Self {
        Self {
            source: ParseSource::DartApi,
            units: BTreeMap::new(),
        }
    }

    pub fn document_scrape(units: BTreeMap<FinancialField, UnitInfo>) -> Self {
        Self {
            source: ParseSource::DocumentScrape,
            units,
        }
    }
}

/// Output of one filing parse: the fact set plus its provenance.
#[derive(Debug, Clone)]
pub struct ParsedFinancials {
    pub facts: FactSet,
    pub metadata: ParseMetadata,
}

/// A company tracked by the collector.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CompanyRecord {
    pub id: i64,
    pub stock_code: String,
    pub corp_code: String,
    pub company_name: String,
    pub industry: Option<String>,
}

/// One persisted filing period, unique on
/// (company_id, fiscal_year, fiscal_quarter, report_type).
///
/// Cash-flow columns hold the canonical (standalone once converted) values;
/// the `*_cumulative` columns preserve the raw as-filed cumulative values so
/// that standalone conversion stays idempotent against reruns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FinancialStatementRecord {
    pub id: i64,
    pub company_id: i64,
    pub fiscal_year: i32,
    pub fiscal_quarter: i32,
    pub report_type: String,
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
    pub ocf_cumulative: Option<i64>,
    pub icf_cumulative: Option<i64>,
    pub fcf_cumulative: Option<i64>,
    pub capex_cumulative: Option<i64>,
    pub cf_standalone: bool,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub parse_metadata: Option<String>,
}

impl FinancialStatementRecord {
    pub fn is_annual(&self) -> bool {
        self.report_type == REPORT_TYPE_ANNUAL
    }

    pub fn fact(&self, field: FinancialField) -> Option<i64> {
        match field {
            FinancialField::Revenue => self.revenue,
            FinancialField::OperatingIncome => self.operating_income,
            FinancialField::NetIncome => self.net_income,
            FinancialField::TotalAssets => self.total_assets,
            FinancialField::TotalLiabilities => self.total_liabilities,
            FinancialField::TotalEquity => self.total_equity,
            FinancialField::CurrentAssets => self.current_assets,
            FinancialField::CurrentLiabilities => self.current_liabilities,
            FinancialField::Inventories => self.inventories,
            FinancialField::OperatingCashFlow => self.operating_cash_flow,
            FinancialField::InvestingCashFlow => self.investing_cash_flow,
            FinancialField::FinancingCashFlow => self.financing_cash_flow,
            FinancialField::Capex => self.capex,
        }
    }

    /// Raw cumulative baseline for a cash-flow field, as originally filed.
    pub fn cumulative(&self, field: FinancialField) -> Option<i64> {
        match field {
            FinancialField::OperatingCashFlow => self.ocf_cumulative,
            FinancialField::InvestingCashFlow => self.icf_cumulative,
            FinancialField::FinancingCashFlow => self.fcf_cumulative,
            FinancialField::Capex => self.capex_cumulative,
            _ => None,
        }
    }
}

/// One disclosure list entry from the DART filing search.
#[derive(Debug, Clone, Deserialize)]
pub struct DisclosureEntry {
    #[serde(default)]
    pub corp_code: String,
    #[serde(default)]
    pub report_nm: String,
    #[serde(default)]
    pub rcept_no: String,
    #[serde(default)]
    pub rcept_dt: String,
}

/// Company overview from DART.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanyInfo {
    #[serde(default)]
    pub corp_name: String,
    #[serde(default)]
    pub stock_code: String,
    #[serde(default)]
    pub ceo_nm: String,
    #[serde(default)]
    pub induty_code: String,
    #[serde(default)]
    pub hm_url: String,
}

/// Point-in-time market capitalization answer. `actual_date` differs from
/// `date` when the requested date was a market holiday and a prior trading
/// day answered instead.
#[derive(Debug, Clone, Copy)]
pub struct MarketCapQuote {
    pub date: NaiveDate,
    pub actual_date: NaiveDate,
    pub market_cap: i64,
    pub close_price: i64,
    pub listed_shares: i64,
}

/// One daily OHLCV row from the market data source.
#[derive(Debug, Clone, Copy)]
pub struct DailyQuote {
    pub date: NaiveDate,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
}

/// One daily market-cap row from the market data source.
#[derive(Debug, Clone, Copy)]
pub struct MarketCapRow {
    pub date: NaiveDate,
    pub close_price: i64,
    pub market_cap: i64,
    pub volume: i64,
    pub trade_value: i64,
    pub shares_outstanding: i64,
}

/// One daily fundamentals row (exchange-computed trailing metrics).
#[derive(Debug, Clone, Copy)]
pub struct FundamentalRow {
    pub date: NaiveDate,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub eps: Option<f64>,
    pub bps: Option<f64>,
    pub dividend_yield: Option<f64>,
}

/// Derived valuation metrics for one period; always recomputable, never a
/// primary source of truth.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValuationSnapshot {
    pub per: Option<f64>,
    pub pbr: Option<f64>,
}

/// Per-company collection outcome counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub collected: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Per-company reconciliation outcome counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileStats {
    pub converted_quarters: usize,
    pub q4_synthesized: usize,
    pub skipped_years: usize,
}

/// Per-company valuation outcome counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValuationStats {
    pub updated_periods: usize,
    pub unresolved_metrics: usize,
}

/// Aggregated outcome of a batch run over many companies.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub companies_processed: usize,
    pub companies_failed: usize,
    pub collection: CollectionStats,
    pub reconcile: ReconcileStats,
    pub valuation: ValuationStats,
}

impl BatchStats {
    pub fn absorb(
        &mut self,
        collection: CollectionStats,
        reconcile: ReconcileStats,
        valuation: ValuationStats,
    ) {
        self.companies_processed += 1;
        self.collection.collected += collection.collected;
        self.collection.skipped += collection.skipped;
        self.collection.failed += collection.failed;
        self.reconcile.converted_quarters += reconcile.converted_quarters;
        self.reconcile.q4_synthesized += reconcile.q4_synthesized;
        self.reconcile.skipped_years += reconcile.skipped_years;
        self.valuation.updated_periods += valuation.updated_periods;
        self.valuation.unresolved_metrics += valuation.unresolved_metrics;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_field_belongs_to_exactly_one_statement_class() {
        for field in FinancialField::ALL {
            let classes = [
                field.is_income_statement(),
                field.is_balance_sheet(),
                field.is_cash_flow(),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "field {} is misclassified",
                field
            );
        }
    }

    #[test]
    fn report_kinds_map_to_dart_report_codes() {
        assert_eq!(ReportKind::Annual.reprt_code(), "11011");
        assert_eq!(ReportKind::Quarter1.reprt_code(), "11013");
        assert_eq!(ReportKind::HalfYear.reprt_code(), "11012");
        assert_eq!(ReportKind::Quarter3.reprt_code(), "11014");
        assert_eq!(ReportKind::for_quarter(4), Some(ReportKind::Annual));
        assert_eq!(ReportKind::for_quarter(5), None);
    }

    #[test]
    fn parse_metadata_round_trips_through_json() {
        let mut units = BTreeMap::new();
        units.insert(
            FinancialField::TotalAssets,
            UnitInfo {
                unit: MoneyUnit::MillionWon,
                detected: false,
            },
        );
        let metadata = ParseMetadata::document_scrape(units);

        let json = serde_json::to_string(&metadata).unwrap();
        let restored: ParseMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.source, ParseSource::DocumentScrape);
        let info = restored.units[&FinancialField::TotalAssets];
        assert_eq!(info.unit, MoneyUnit::MillionWon);
        assert!(!info.detected);
    }
}
