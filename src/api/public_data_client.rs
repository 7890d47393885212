//! Public data portal client for point-in-time market capitalization.
//!
//! The stock price endpoint filters by issuer name, so name resolution is a
//! precondition of every lookup. Quarter-ends falling on market holidays
//! fall back to the nearest prior trading day, walking back a bounded
//! number of days. Historical answers are immutable and memoized per
//! client instance.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiError, MarketCapSource, RateLimiter};
use crate::models::{CompanyRecord, MarketCapQuote};
use crate::parsing::parse_amount;

const DEFAULT_BASE_URL: &str =
    "http://apis.data.go.kr/1160100/service/GetStockSecuritiesInfoService";

/// Maximum calendar days to walk back past a holiday.
const HOLIDAY_LOOKBACK_DAYS: i64 = 5;

pub struct PublicDataClient {
    service_key: String,
    base_url: String,
    http: Client,
    rate_limiter: RateLimiter,
    cache: HashMap<(String, NaiveDate), Option<(i64, i64, i64)>>,
}

impl PublicDataClient {
    /// Create a client. A missing service key fails here, at construction.
    pub fn new(service_key: &str) -> Result<Self> {
        Self::with_base_url(service_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(service_key: &str, base_url: &str) -> Result<Self> {
        if service_key.trim().is_empty() {
            return Err(anyhow!("public data service key is not configured"));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");

        Ok(Self {
            service_key: service_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            rate_limiter: RateLimiter::new(Duration::from_millis(200)),
            cache: HashMap::new(),
        })
    }

    /// Market cap as of `date`, falling back to the nearest prior trading
    /// day. `actual_date` in the answer records which day actually traded.
    pub async fn get_market_cap(
        &mut self,
        stock_code: &str,
        issuer_name: &str,
        date: NaiveDate,
    ) -> Result<Option<MarketCapQuote>> {
        if issuer_name.trim().is_empty() {
            warn!("issuer name unresolved for {}, cannot query market cap", stock_code);
            return Ok(None);
        }

        for days_back in 0..=HOLIDAY_LOOKBACK_DAYS {
            let probe_date = date - chrono::Duration::days(days_back);
            let data = self
                .fetch_market_data(stock_code, issuer_name, probe_date)
                .await?;

            if let Some((market_cap, close_price, listed_shares)) = data {
                if days_back > 0 {
                    info!(
                        "holiday fallback: {} {} -> {} ({} days back)",
                        stock_code, date, probe_date, days_back
                    );
                }
                return Ok(Some(MarketCapQuote {
                    date,
                    actual_date: probe_date,
                    market_cap,
                    close_price,
                    listed_shares,
                }));
            }
        }

        warn!(
            "market cap not found: {} {} (no trading day within {} days)",
            stock_code, date, HOLIDAY_LOOKBACK_DAYS
        );
        Ok(None)
    }

    async fn fetch_market_data(
        &mut self,
        stock_code: &str,
        issuer_name: &str,
        date: NaiveDate,
    ) -> Result<Option<(i64, i64, i64)>, ApiError> {
        let cache_key = (stock_code.to_string(), date);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(*cached);
        }

        self.rate_limiter.wait_if_needed().await;

        let url = format!("{}/getStockPriceInfo", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("serviceKey", self.service_key.as_str()),
                ("numOfRows", "1"),
                ("pageNo", "1"),
                ("resultType", "json"),
                ("basDt", &date.format("%Y%m%d").to_string()),
                ("itmsNm", issuer_name),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        let data = extract_market_data(&body);
        debug!("public data {} {}: {:?}", stock_code, date, data);
        self.cache.insert(cache_key, data);
        Ok(data)
    }
}

#[async_trait::async_trait]
impl MarketCapSource for PublicDataClient {
    fn source_name(&self) -> &'static str {
        "public data portal"
    }

    async fn market_cap_on(
        &mut self,
        company: &CompanyRecord,
        date: NaiveDate,
    ) -> Result<Option<i64>> {
        let quote = self
            .get_market_cap(&company.stock_code, &company.company_name, date)
            .await?;
        Ok(quote.map(|q| q.market_cap))
    }
}

/// Pull (market_cap, close_price, listed_shares) out of the portal's
/// response envelope. `item` may be an array, a single object, or absent.
fn extract_market_data(body: &Value) -> Option<(i64, i64, i64)> {
    let items = &body["response"]["body"]["items"];
    let item = match &items["item"] {
        Value::Array(entries) => entries.first()?,
        entry @ Value::Object(_) => entry,
        _ => return None,
    };

    let market_cap = numeric_field(item, "mrktTotAmt")?;
    let close_price = numeric_field(item, "clpr").unwrap_or(0);
    let listed_shares = numeric_field(item, "lstgStCnt").unwrap_or(0);
    Some((market_cap, close_price, listed_shares))
}

fn numeric_field(item: &Value, key: &str) -> Option<i64> {
    match &item[key] {
        Value::String(s) => parse_amount(s),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
