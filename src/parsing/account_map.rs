//! Tag resolution table: priority-ordered extraction strategies per
//! canonical financial fact.
//!
//! XBRL account tags are stable across companies and quarters, so tag-based
//! strategies rank above free-text label matching. Multiple strategies per
//! fact absorb industry variation (manufacturing vs. financial-sector
//! revenue) and reporting-standard drift (standard net income tag vs.
//! pre-tax vs. non-standard label). The table is static configuration: new
//! facts or strategies are added here without touching the evaluator.

use crate::models::{FinancialField, StatementDiv};

/// Sentinel tag DART uses for rows without a standard account code.
pub const NON_STANDARD_TAG: &str = "-표준계정코드 미사용-";

const INCOME_DIVS: &[StatementDiv] = &[StatementDiv::IS, StatementDiv::CIS];
const BALANCE_DIVS: &[StatementDiv] = &[StatementDiv::BS];
const CASH_FLOW_DIVS: &[StatementDiv] = &[StatementDiv::CF];

#[derive(Debug, Clone, Copy)]
pub enum StrategyMethod {
    /// First parseable amount among rows carrying this exact tag.
    SingleTag { account_id: &'static str },
    /// Sum of the first parseable amount per tag; partial sums are fine.
    SumTags { account_ids: &'static [&'static str] },
    /// Match free-text labels on non-standard rows. `take_last` picks the
    /// deepest-nested match (issuers list a hierarchy of income lines and
    /// the last one is the bottom-line figure); `absolute` normalizes sign
    /// conventions that vary by issuer.
    LabelMatch {
        keywords: &'static [&'static str],
        take_last: bool,
        absolute: bool,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TagStrategy {
    pub method: StrategyMethod,
    pub divs: &'static [StatementDiv],
    pub priority: u8,
    pub description: &'static str,
}

/// Financial-sector revenue surrogate: fee income plus interest income.
pub const FINANCIAL_SECTOR_REVENUE: TagStrategy = TagStrategy {
    method: StrategyMethod::SumTags {
        account_ids: &[
            "ifrs-full_FeeAndCommissionIncome",
            "ifrs-full_RevenueFromInterest",
        ],
    },
    divs: INCOME_DIVS,
    priority: 2,
    description: "financial-sector revenue (fee + interest income)",
};

/// Financial-sector operating-income surrogate: net operating income label.
pub const FINANCIAL_SECTOR_OPERATING_INCOME: TagStrategy = TagStrategy {
    method: StrategyMethod::LabelMatch {
        keywords: &["순영업손익"],
        take_last: false,
        absolute: false,
    },
    divs: INCOME_DIVS,
    priority: 2,
    description: "financial-sector net operating income label",
};

/// The resolution table. Strategies are listed in priority order; the first
/// one that yields a value wins.
pub static ACCOUNT_MAP: &[(FinancialField, &[TagStrategy])] = &[
    (
        FinancialField::Revenue,
        &[
            TagStrategy {
                method: StrategyMethod::SingleTag {
                    account_id: "ifrs-full_Revenue",
                },
                divs: INCOME_DIVS,
                priority: 1,
                description: "standard revenue tag",
            },
            FINANCIAL_SECTOR_REVENUE,
        ],
    ),
    (
        FinancialField::OperatingIncome,
        &[
            TagStrategy {
                method: StrategyMethod::SingleTag {
                    account_id: "dart_OperatingIncomeLoss",
                },
                divs: INCOME_DIVS,
                priority: 1,
                description: "standard operating income tag",
            },
            FINANCIAL_SECTOR_OPERATING_INCOME,
        ],
    ),
    (
        FinancialField::NetIncome,
        &[
            TagStrategy {
                method: StrategyMethod::SingleTag {
                    account_id: "ifrs-full_ProfitLoss",
                },
                divs: INCOME_DIVS,
                priority: 1,
                description: "standard net income tag",
            },
            TagStrategy {
                method: StrategyMethod::SingleTag {
                    account_id: "ifrs-full_ProfitLossBeforeTax",
                },
                divs: INCOME_DIVS,
                priority: 2,
                description: "pre-tax income fallback",
            },
            TagStrategy {
                method: StrategyMethod::LabelMatch {
                    keywords: &["분기순이익", "당기순이익", "반기순이익"],
                    take_last: true,
                    absolute: false,
                },
                divs: INCOME_DIVS,
                priority: 3,
                description: "non-standard net income label",
            },
        ],
    ),
    (
        FinancialField::TotalAssets,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_Assets",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "total assets",
        }],
    ),
    (
        FinancialField::TotalLiabilities,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_Liabilities",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "total liabilities",
        }],
    ),
    (
        FinancialField::TotalEquity,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_Equity",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "total equity",
        }],
    ),
    (
        FinancialField::CurrentAssets,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_CurrentAssets",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "current assets",
        }],
    ),
    (
        FinancialField::CurrentLiabilities,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_CurrentLiabilities",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "current liabilities",
        }],
    ),
    (
        FinancialField::Inventories,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_Inventories",
            },
            divs: BALANCE_DIVS,
            priority: 1,
            description: "inventories",
        }],
    ),
    (
        FinancialField::OperatingCashFlow,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_CashFlowsFromUsedInOperatingActivities",
            },
            divs: CASH_FLOW_DIVS,
            priority: 1,
            description: "operating cash flow",
        }],
    ),
    (
        FinancialField::InvestingCashFlow,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_CashFlowsFromUsedInInvestingActivities",
            },
            divs: CASH_FLOW_DIVS,
            priority: 1,
            description: "investing cash flow",
        }],
    ),
    (
        FinancialField::FinancingCashFlow,
        &[TagStrategy {
            method: StrategyMethod::SingleTag {
                account_id: "ifrs-full_CashFlowsFromUsedInFinancingActivities",
            },
            divs: CASH_FLOW_DIVS,
            priority: 1,
            description: "financing cash flow",
        }],
    ),
    (
        FinancialField::Capex,
        &[
            TagStrategy {
                method: StrategyMethod::SingleTag {
                    account_id:
                        "ifrs-full_PurchaseOfPropertyPlantAndEquipmentClassifiedAsInvestingActivities",
                },
                divs: CASH_FLOW_DIVS,
                priority: 1,
                description: "standard capex tag",
            },
            TagStrategy {
                method: StrategyMethod::SumTags {
                    account_ids: &[
                        "dart_PurchaseOfLand",
                        "dart_PurchaseOfMachinery",
                        "dart_PurchaseOfStructure",
                        "dart_PurchaseOfVehicles",
                        "dart_PurchaseOfOtherPropertyPlantAndEquipment",
                        "dart_PurchaseOfConstructionInProgress",
                        "dart_PurchaseOfBuildings",
                    ],
                },
                divs: CASH_FLOW_DIVS,
                priority: 2,
                description: "itemized property/plant/equipment purchases",
            },
            TagStrategy {
                method: StrategyMethod::LabelMatch {
                    keywords: &["유형자산 취득", "유형자산의 취득"],
                    take_last: false,
                    absolute: true,
                },
                divs: CASH_FLOW_DIVS,
                priority: 3,
                description: "non-standard capex label",
            },
        ],
    ),
];
