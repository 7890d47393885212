//! Exchange market-data client: OHLCV, market cap and fundamentals.
//!
//! The data endpoint sits behind an anti-bot gate keyed on a session cookie
//! from the exchange homepage. The session is owned by this client
//! instance: a 403 response refreshes the cookie and retries the request
//! once. No global state is involved.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiError, MarketCapSource, RateLimiter};
use crate::models::{CompanyRecord, DailyQuote, FundamentalRow, MarketCapRow};
use crate::parsing::parse_amount;

const DEFAULT_DATA_URL: &str = "http://data.krx.co.kr/comm/bldAttendant/getJsonData.cmd";
const DEFAULT_HOME_URL: &str = "https://www.krx.co.kr/";

const BLD_STOCK_FINDER: &str = "dbms/comm/finder/finder_stkisu";
const BLD_DAILY_PRICES: &str = "dbms/MDC/STAT/standard/MDCSTAT01701";
const BLD_FUNDAMENTALS: &str = "dbms/MDC/STAT/standard/MDCSTAT03502";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct KrxClient {
    http: Client,
    data_url: String,
    home_url: String,
    rate_limiter: RateLimiter,
    isin_cache: HashMap<String, String>,
}

impl KrxClient {
    pub fn new() -> Result<Self> {
        Self::with_urls(DEFAULT_DATA_URL, DEFAULT_HOME_URL)
    }

    pub fn with_urls(data_url: &str, home_url: &str) -> Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Ok(Self {
            http,
            data_url: data_url.to_string(),
            home_url: home_url.to_string(),
            rate_limiter: RateLimiter::new(Duration::from_millis(300)),
            isin_cache: HashMap::new(),
        })
    }

    /// Visit the exchange homepage so the cookie jar picks up a fresh
    /// session cookie.
    async fn refresh_session(&self) -> Result<(), ApiError> {
        self.http.get(&self.home_url).send().await?;
        info!("exchange session refreshed");
        Ok(())
    }

    /// POST a board query. On 403 the session cookie is refreshed and the
    /// request retried exactly once.
    async fn post_board(&mut self, params: &[(&str, String)]) -> Result<Value, ApiError> {
        self.rate_limiter.wait_if_needed().await;

        let response = self.http.post(&self.data_url).form(params).send().await?;
        let response = if response.status() == StatusCode::FORBIDDEN {
            warn!("exchange returned 403, refreshing session and retrying once");
            self.refresh_session().await?;
            self.http.post(&self.data_url).form(params).send().await?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }

        response.json().await.map_err(ApiError::Transient)
    }

    /// Resolve a short ticker to the full instrument code the board
    /// queries require. Resolutions are cached per instance.
    async fn resolve_isin(&mut self, stock_code: &str) -> Result<Option<String>> {
        if let Some(isin) = self.isin_cache.get(stock_code) {
            return Ok(Some(isin.clone()));
        }

        let params = [
            ("bld", BLD_STOCK_FINDER.to_string()),
            ("mktsel", "ALL".to_string()),
            ("searchText", stock_code.to_string()),
        ];
        let body = self.post_board(&params).await?;

        let Some(entries) = body["block1"].as_array() else {
            warn!("instrument finder returned no block for {}", stock_code);
            return Ok(None);
        };

        for entry in entries {
            if entry["short_code"].as_str() == Some(stock_code) {
                if let Some(full_code) = entry["full_code"].as_str() {
                    self.isin_cache
                        .insert(stock_code.to_string(), full_code.to_string());
                    return Ok(Some(full_code.to_string()));
                }
            }
        }

        warn!("instrument not found on exchange: {}", stock_code);
        Ok(None)
    }

    async fn daily_rows(
        &mut self,
        bld: &str,
        stock_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Value>> {
        let Some(isin) = self.resolve_isin(stock_code).await? else {
            return Ok(Vec::new());
        };

        let params = [
            ("bld", bld.to_string()),
            ("isuCd", isin),
            ("strtDd", from.format("%Y%m%d").to_string()),
            ("endDd", to.format("%Y%m%d").to_string()),
            ("adjStkPrc", "1".to_string()),
        ];
        let body = self.post_board(&params).await?;

        Ok(body["output"].as_array().cloned().unwrap_or_default())
    }

    /// Daily OHLCV for a date range.
    pub async fn get_ohlcv(
        &mut self,
        stock_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyQuote>> {
        let rows = self.daily_rows(BLD_DAILY_PRICES, stock_code, from, to).await?;

        let mut quotes: Vec<DailyQuote> = rows
            .iter()
            .filter_map(|row| {
                Some(DailyQuote {
                    date: row_date(row)?,
                    open: int_field(row, "TDD_OPNPRC")?,
                    high: int_field(row, "TDD_HGPRC")?,
                    low: int_field(row, "TDD_LWPRC")?,
                    close: int_field(row, "TDD_CLSPRC")?,
                    volume: int_field(row, "ACC_TRDVOL").unwrap_or(0),
                })
            })
            .collect();
        quotes.sort_by_key(|q| q.date);

        debug!("OHLCV {}: {} days", stock_code, quotes.len());
        Ok(quotes)
    }

    /// Daily market cap and listed shares for a date range.
    pub async fn get_market_cap_range(
        &mut self,
        stock_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MarketCapRow>> {
        let rows = self.daily_rows(BLD_DAILY_PRICES, stock_code, from, to).await?;

        let mut caps: Vec<MarketCapRow> = rows
            .iter()
            .filter_map(|row| {
                Some(MarketCapRow {
                    date: row_date(row)?,
                    close_price: int_field(row, "TDD_CLSPRC").unwrap_or(0),
                    market_cap: int_field(row, "MKTCAP")?,
                    volume: int_field(row, "ACC_TRDVOL").unwrap_or(0),
                    trade_value: int_field(row, "ACC_TRDVAL").unwrap_or(0),
                    shares_outstanding: int_field(row, "LIST_SHRS").unwrap_or(0),
                })
            })
            .collect();
        caps.sort_by_key(|c| c.date);

        debug!("market cap {}: {} days", stock_code, caps.len());
        Ok(caps)
    }

    /// Daily exchange-computed fundamentals (PER/PBR/EPS/BPS/dividend
    /// yield) for a date range.
    pub async fn get_fundamentals(
        &mut self,
        stock_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FundamentalRow>> {
        let rows = self.daily_rows(BLD_FUNDAMENTALS, stock_code, from, to).await?;

        let mut fundamentals: Vec<FundamentalRow> = rows
            .iter()
            .filter_map(|row| {
                Some(FundamentalRow {
                    date: row_date(row)?,
                    per: float_field(row, "PER"),
                    pbr: float_field(row, "PBR"),
                    eps: float_field(row, "EPS"),
                    bps: float_field(row, "BPS"),
                    dividend_yield: float_field(row, "DVD_YLD"),
                })
            })
            .collect();
        fundamentals.sort_by_key(|f| f.date);

        Ok(fundamentals)
    }

    /// The latest market-cap row at or before `date`, walking back a
    /// bounded number of calendar days past holidays.
    pub async fn market_cap_on_or_before(
        &mut self,
        stock_code: &str,
        date: NaiveDate,
        max_back_days: i64,
    ) -> Result<Option<MarketCapRow>> {
        let from = date - chrono::Duration::days(max_back_days);
        let rows = self.get_market_cap_range(stock_code, from, date).await?;

        Ok(rows.into_iter().filter(|r| r.date <= date).last())
    }
}

/// Calendar days walked back past holidays when answering point-in-time
/// market cap queries through the [`MarketCapSource`] seam.
const POINT_IN_TIME_LOOKBACK_DAYS: i64 = 7;

#[async_trait::async_trait]
impl MarketCapSource for KrxClient {
    fn source_name(&self) -> &'static str {
        "exchange market data"
    }

    async fn market_cap_on(
        &mut self,
        company: &CompanyRecord,
        date: NaiveDate,
    ) -> Result<Option<i64>> {
        let row = self
            .market_cap_on_or_before(&company.stock_code, date, POINT_IN_TIME_LOOKBACK_DAYS)
            .await?;
        Ok(row.map(|r| r.market_cap))
    }
}

fn row_date(row: &Value) -> Option<NaiveDate> {
    let raw = row["TRD_DD"].as_str()?;
    NaiveDate::parse_from_str(raw, "%Y/%m/%d").ok()
}

fn int_field(row: &Value, key: &str) -> Option<i64> {
    match &row[key] {
        Value::String(s) => parse_amount(s),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn float_field(row: &Value, key: &str) -> Option<f64> {
    match &row[key] {
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',').collect();
            let trimmed = cleaned.trim();
            if trimmed.is_empty() || trimmed == "-" {
                None
            } else {
                trimmed.parse().ok()
            }
        }
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn finder_body() -> Value {
        json!({
            "block1": [
                { "full_code": "KR7005930003", "short_code": "005930", "codeName": "삼성전자" }
            ]
        })
    }

    fn daily_body() -> Value {
        json!({
            "output": [
                {
                    "TRD_DD": "2024/06/27",
                    "TDD_OPNPRC": "80,000",
                    "TDD_HGPRC": "81,900",
                    "TDD_LWPRC": "79,800",
                    "TDD_CLSPRC": "81,300",
                    "ACC_TRDVOL": "12,345,678",
                    "ACC_TRDVAL": "999,999",
                    "MKTCAP": "485,000,000,000,000",
                    "LIST_SHRS": "5,969,782,550"
                },
                {
                    "TRD_DD": "2024/06/28",
                    "TDD_OPNPRC": "81,300",
                    "TDD_HGPRC": "82,000",
                    "TDD_LWPRC": "81,000",
                    "TDD_CLSPRC": "81,500",
                    "ACC_TRDVOL": "10,000,000",
                    "ACC_TRDVAL": "888,888",
                    "MKTCAP": "486,000,000,000,000",
                    "LIST_SHRS": "5,969,782,550"
                }
            ]
        })
    }

    #[tokio::test]
    async fn market_cap_walks_back_to_last_trading_day() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("finder_stkisu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(finder_body()))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("MDCSTAT01701"))
            .respond_with(ResponseTemplate::new(200).set_body_json(daily_body()))
            .mount(&server)
            .await;

        let mut client = KrxClient::with_urls(
            &format!("{}/getJsonData.cmd", server.uri()),
            &server.uri(),
        )
        .unwrap();

        // June 30 is a Sunday; the last row on or before it wins.
        let date = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let row = client
            .market_cap_on_or_before("005930", date, 7)
            .await
            .unwrap()
            .expect("market cap row");

        assert_eq!(row.date, NaiveDate::from_ymd_opt(2024, 6, 28).unwrap());
        assert_eq!(row.market_cap, 486_000_000_000_000);
        assert_eq!(row.close_price, 81_500);
    }

    #[tokio::test]
    async fn forbidden_response_refreshes_session_and_retries() {
        let server = MockServer::start().await;

        // Homepage visit for the session cookie.
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(finder_body()))
            .mount(&server)
            .await;

        let mut client = KrxClient::with_urls(
            &format!("{}/getJsonData.cmd", server.uri()),
            &server.uri(),
        )
        .unwrap();

        let isin = client.resolve_isin("005930").await.unwrap();
        assert_eq!(isin.as_deref(), Some("KR7005930003"));
    }

    #[tokio::test]
    async fn fundamentals_rows_tolerate_dash_placeholders() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("finder_stkisu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(finder_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("MDCSTAT03502"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": [
                    {
                        "TRD_DD": "2024/06/28",
                        "PER": "12.34",
                        "PBR": "1.20",
                        "EPS": "6,605",
                        "BPS": "57,930",
                        "DVD_YLD": "-"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let mut client = KrxClient::with_urls(
            &format!("{}/getJsonData.cmd", server.uri()),
            &server.uri(),
        )
        .unwrap();

        let from = NaiveDate::from_ymd_opt(2024, 6, 28).unwrap();
        let rows = client.get_fundamentals("005930", from, from).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].per, Some(12.34));
        assert_eq!(rows[0].eps, Some(6_605.0));
        assert_eq!(rows[0].dividend_yield, None);
    }

    #[tokio::test]
    async fn ohlcv_rows_are_parsed_and_sorted() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("finder_stkisu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(finder_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getJsonData.cmd"))
            .and(body_string_contains("MDCSTAT01701"))
            .respond_with(ResponseTemplate::new(200).set_body_json(daily_body()))
            .mount(&server)
            .await;

        let mut client = KrxClient::with_urls(
            &format!("{}/getJsonData.cmd", server.uri()),
            &server.uri(),
        )
        .unwrap();

        let from = NaiveDate::from_ymd_opt(2024, 6, 24).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 6, 28).unwrap();
        let quotes = client.get_ohlcv("005930", from, to).await.unwrap();

        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].close, 81_300);
        assert_eq!(quotes[1].close, 81_500);
        assert!(quotes[0].date < quotes[1].date);
    }
}
