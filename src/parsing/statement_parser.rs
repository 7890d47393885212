//! Statement parser: runs the tag resolution table over a filing's raw rows
//! and produces the canonical fact set.

use tracing::debug;

use crate::models::{FactSet, FinancialField, ParseMetadata, ParsedFinancials, RawStatementRow};
use crate::parsing::account_map::{
    ACCOUNT_MAP, FINANCIAL_SECTOR_OPERATING_INCOME, FINANCIAL_SECTOR_REVENUE, NON_STANDARD_TAG,
    StrategyMethod, TagStrategy,
};

/// Parse a DART amount string into integer won.
///
/// Never panics: empty strings, dash placeholders and unparsable text all
/// resolve to `None`, not zero. Parenthesized amounts are negative.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();

    if cleaned.is_empty() || matches!(cleaned.as_str(), "-" | "N/A" | "―" | "－") {
        return None;
    }

    if cleaned.starts_with('(') && cleaned.ends_with(')') {
        let digits: String = cleaned.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        return digits.parse::<i64>().ok().map(|v| -v);
    }

    if let Ok(value) = cleaned.parse::<i64>() {
        return Some(value);
    }

    // DART occasionally serializes amounts as float text ("1234.0").
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value as i64),
        _ => None,
    }
}

fn div_matches(strategy: &TagStrategy, row: &RawStatementRow) -> bool {
    strategy.divs.iter().any(|d| d.code() == row.sj_div)
}

/// Evaluate one extraction strategy against a filing's rows.
pub fn evaluate_strategy(rows: &[RawStatementRow], strategy: &TagStrategy) -> Option<i64> {
    match strategy.method {
        StrategyMethod::SingleTag { account_id } => rows
            .iter()
            .filter(|r| r.account_id == account_id && div_matches(strategy, r))
            .find_map(|r| parse_amount(&r.thstrm_amount)),

        StrategyMethod::SumTags { account_ids } => {
            let mut total = 0i64;
            let mut found_any = false;
            for account_id in account_ids {
                let value = rows
                    .iter()
                    .filter(|r| r.account_id == *account_id && div_matches(strategy, r))
                    .find_map(|r| parse_amount(&r.thstrm_amount));
                if let Some(value) = value {
                    total += value;
                    found_any = true;
                }
            }
            found_any.then_some(total)
        }

        StrategyMethod::LabelMatch {
            keywords,
            take_last,
            absolute,
        } => {
            let mut candidates = rows.iter().filter_map(|r| {
                if r.account_id != NON_STANDARD_TAG || !div_matches(strategy, r) {
                    return None;
                }
                let label = r.account_nm.trim();
                if !keywords.iter().any(|kw| label.contains(kw)) {
                    return None;
                }
                parse_amount(&r.thstrm_amount)
            });

            let value = if take_last {
                candidates.last()
            } else {
                candidates.next()
            };
            value.map(|v| if absolute { v.abs() } else { v })
        }
    }
}

/// Parse a full filing into the canonical fact set.
///
/// Strategies per fact are tried in priority order and the first success
/// wins; later strategies are never consulted once one resolves. After the
/// primary table, a financial-sector pass fills any remaining revenue /
/// operating income gaps without overwriting resolved facts.
pub fn parse_statement(rows: &[RawStatementRow]) -> ParsedFinancials {
    let mut facts = FactSet::new();

    for (field, strategies) in ACCOUNT_MAP {
        for strategy in *strategies {
            if let Some(value) = evaluate_strategy(rows, strategy) {
                debug!(
                    "{} resolved to {} (priority {}: {})",
                    field, value, strategy.priority, strategy.description
                );
                facts.insert(*field, value);
                break;
            }
        }
    }

    apply_financial_sector_pass(rows, &mut facts);

    ParsedFinancials {
        facts,
        metadata: ParseMetadata::dart_api(),
    }
}

/// Gap-filling pass for financial-sector issuers, whose filings lack the
/// manufacturing revenue and operating-income tags. Only fills absent
/// facts.
fn apply_financial_sector_pass(rows: &[RawStatementRow], facts: &mut FactSet) {
    if !facts.contains_key(&FinancialField::Revenue) {
        if let Some(value) = evaluate_strategy(rows, &FINANCIAL_SECTOR_REVENUE) {
            debug!("revenue filled by financial-sector pass: {}", value);
            facts.insert(FinancialField::Revenue, value);
        }
    }

    if !facts.contains_key(&FinancialField::OperatingIncome) {
        if let Some(value) = evaluate_strategy(rows, &FINANCIAL_SECTOR_OPERATING_INCOME) {
            debug!("operating income filled by financial-sector pass: {}", value);
            facts.insert(FinancialField::OperatingIncome, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(account_id: &str, account_nm: &str, sj_div: &str, amount: &str) -> RawStatementRow {
        RawStatementRow {
            account_id: account_id.to_string(),
            account_nm: account_nm.to_string(),
            sj_div: sj_div.to_string(),
            thstrm_amount: amount.to_string(),
        }
    }

    #[test]
    fn parse_amount_handles_separators_and_placeholders() {
        assert_eq!(parse_amount("1,234,567"), Some(1_234_567));
        assert_eq!(parse_amount(" 1234 "), Some(1234));
        assert_eq!(parse_amount("-500"), Some(-500));
        assert_eq!(parse_amount("1234.0"), Some(1234));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount("N/A"), None);
        assert_eq!(parse_amount("―"), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn parse_amount_treats_parentheses_as_negative() {
        assert_eq!(parse_amount("(123,456)"), Some(-123_456));
        assert_eq!(parse_amount("()"), None);
    }

    #[test]
    fn standard_tag_wins_over_label_match() {
        // Deliberately conflicting dataset: both the standard tag and a
        // label-matching non-standard row exist for net income.
        let rows = vec![
            row(NON_STANDARD_TAG, "당기순이익", "IS", "999"),
            row("ifrs-full_ProfitLoss", "당기순이익", "IS", "1,000"),
        ];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::NetIncome), Some(&1_000));
    }

    #[test]
    fn sum_of_tags_tolerates_missing_subtags() {
        // Only fee income present; revenue must resolve to it, not to absent.
        let rows = vec![row(
            "ifrs-full_FeeAndCommissionIncome",
            "수수료수익",
            "IS",
            "700",
        )];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::Revenue), Some(&700));
    }

    #[test]
    fn sum_of_tags_adds_all_found_subtags() {
        let rows = vec![
            row("ifrs-full_FeeAndCommissionIncome", "수수료수익", "IS", "700"),
            row("ifrs-full_RevenueFromInterest", "이자수익", "CIS", "300"),
        ];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::Revenue), Some(&1_000));
    }

    #[test]
    fn net_income_label_match_takes_last_row() {
        // Two label matches at different hierarchy depths: the later row is
        // the deeper (true bottom-line) figure.
        let rows = vec![
            row(NON_STANDARD_TAG, "법인세비용차감전 당기순이익", "IS", "800"),
            row(NON_STANDARD_TAG, "당기순이익(지배기업소유주지분)", "IS", "650"),
        ];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::NetIncome), Some(&650));
    }

    #[test]
    fn capex_label_match_is_absolute_valued() {
        let rows = vec![row(NON_STANDARD_TAG, "유형자산의 취득", "CF", "(4,200)")];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::Capex), Some(&4_200));
    }

    #[test]
    fn capex_standard_tag_keeps_filed_sign() {
        let rows = vec![row(
            "ifrs-full_PurchaseOfPropertyPlantAndEquipmentClassifiedAsInvestingActivities",
            "유형자산의 취득",
            "CF",
            "(4,200)",
        )];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::Capex), Some(&-4_200));
    }

    #[test]
    fn division_filter_excludes_other_statements() {
        // A balance-sheet row must not satisfy an income-statement strategy.
        let rows = vec![row("ifrs-full_Revenue", "매출액", "BS", "123")];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::Revenue), None);
    }

    #[test]
    fn unparsable_amounts_are_absent_not_zero() {
        let rows = vec![
            row("ifrs-full_Revenue", "매출액", "IS", "-"),
            row("ifrs-full_Assets", "자산총계", "BS", "garbage"),
        ];

        let parsed = parse_statement(&rows);
        assert!(parsed.facts.is_empty());
    }

    #[test]
    fn unparsable_first_row_falls_through_to_next_row() {
        let rows = vec![
            row("ifrs-full_Assets", "자산총계", "BS", "-"),
            row("ifrs-full_Assets", "자산총계", "BS", "5,000"),
        ];

        let parsed = parse_statement(&rows);
        assert_eq!(parsed.facts.get(&FinancialField::TotalAssets), Some(&5_000));
    }

    #[test]
    fn financial_sector_pass_fills_gaps_only() {
        let rows = vec![
            row("ifrs-full_Revenue", "영업수익", "IS", "10,000"),
            row("ifrs-full_FeeAndCommissionIncome", "수수료수익", "IS", "700"),
            row(NON_STANDARD_TAG, "순영업손익", "IS", "450"),
        ];

        let parsed = parse_statement(&rows);
        // Standard revenue already resolved; the pass must not overwrite it.
        assert_eq!(parsed.facts.get(&FinancialField::Revenue), Some(&10_000));
        // Operating income had no standard tag; the pass fills it.
        assert_eq!(
            parsed.facts.get(&FinancialField::OperatingIncome),
            Some(&450)
        );
    }

    #[test]
    fn parsing_is_idempotent() {
        let rows = vec![
            row("ifrs-full_Revenue", "매출액", "IS", "10,000"),
            row("ifrs-full_ProfitLoss", "당기순이익", "IS", "1,200"),
            row("ifrs-full_Assets", "자산총계", "BS", "50,000"),
            row(
                "ifrs-full_CashFlowsFromUsedInOperatingActivities",
                "영업활동현금흐름",
                "CF",
                "3,000",
            ),
        ];

        let first = parse_statement(&rows);
        let second = parse_statement(&rows);
        assert_eq!(first.facts, second.facts);
    }
}
