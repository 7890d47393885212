use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api::{ApiError, RateLimiter};
use crate::models::{CompanyInfo, DisclosureEntry, RawStatementRow, ReportKind};

const DEFAULT_BASE_URL: &str = "https://opendart.fss.or.kr/api";
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const PAGE_COUNT: u32 = 100;

// DART OpenAPI status codes: success, and "no data found".
const STATUS_OK: &str = "000";
const STATUS_NO_DATA: &str = "013";

#[derive(Debug, Deserialize)]
struct FnlttResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    list: Vec<RawStatementRow>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    page_no: u32,
    #[serde(default)]
    total_page: u32,
    #[serde(default)]
    list: Vec<DisclosureEntry>,
}

#[derive(Debug, Deserialize)]
struct CompanyResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(flatten)]
    info: CompanyInfo,
}

/// DART OpenAPI client: financial statements, disclosure search, filing
/// documents and company overviews.
pub struct DartClient {
    api_key: String,
    base_url: String,
    http: Client,
    rate_limiter: RateLimiter,
}

impl DartClient {
    /// Create a client. An empty API key is a configuration error and is
    /// rejected here rather than on first call.
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("DART API key is not configured"));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            rate_limiter: RateLimiter::new(Duration::from_millis(300)),
        })
    }

    /// Fetch the full financial statement dataset for one filing.
    ///
    /// Tries the consolidated statement (CFS) first and fails over to the
    /// individual statement (OFS) once. A missing filing is `Ok(None)` and
    /// is not retried; transient failures are retried up to a bounded count.
    pub async fn fetch_statement(
        &mut self,
        corp_code: &str,
        year: i32,
        kind: ReportKind,
    ) -> Result<Option<Vec<RawStatementRow>>> {
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            info!(
                "fetching statement: corp_code={} year={} report={} (attempt {}/{})",
                corp_code, year, kind, attempt, MAX_RETRIES
            );

            match self.fetch_statement_attempt(corp_code, year, kind).await {
                Ok(Some(rows)) => {
                    info!("statement fetched: {} rows", rows.len());
                    return Ok(Some(rows));
                }
                Ok(None) => {
                    warn!(
                        "no statement data: corp_code={} year={} report={}",
                        corp_code, year, kind
                    );
                    return Ok(None);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "statement fetch attempt {}/{} failed: {}",
                        attempt, MAX_RETRIES, e
                    );
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        sleep(RETRY_DELAY).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow!(
            "statement fetch failed after {} attempts: {}",
            MAX_RETRIES,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn fetch_statement_attempt(
        &mut self,
        corp_code: &str,
        year: i32,
        kind: ReportKind,
    ) -> Result<Option<Vec<RawStatementRow>>, ApiError> {
        if let Some(rows) = self
            .fetch_statement_once(corp_code, year, kind, "CFS")
            .await?
        {
            return Ok(Some(rows));
        }

        debug!(
            "no consolidated statement for {} {}, trying individual (OFS)",
            corp_code, year
        );
        self.fetch_statement_once(corp_code, year, kind, "OFS").await
    }

    async fn fetch_statement_once(
        &mut self,
        corp_code: &str,
        year: i32,
        kind: ReportKind,
        fs_div: &str,
    ) -> Result<Option<Vec<RawStatementRow>>, ApiError> {
        self.rate_limiter.wait_if_needed().await;

        let url = format!("{}/fnlttSinglAcntAll.json", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("corp_code", corp_code),
                ("bsns_year", &year.to_string()),
                ("reprt_code", kind.reprt_code()),
                ("fs_div", fs_div),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }

        let body: FnlttResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        match body.status.as_str() {
            STATUS_OK => {
                if body.list.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(body.list))
                }
            }
            STATUS_NO_DATA => Ok(None),
            code => Err(ApiError::Upstream {
                code: code.to_string(),
                message: body.message,
            }),
        }
    }

    /// Search the disclosure list for filings of a given kind in a date
    /// window. Pages through the full result set with a courtesy delay
    /// between pages.
    pub async fn fetch_disclosure_list(
        &mut self,
        corp_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        kind: Option<&str>,
        final_only: bool,
    ) -> Result<Vec<DisclosureEntry>> {
        let mut entries = Vec::new();
        let mut page_no = 1u32;

        loop {
            self.rate_limiter.wait_if_needed().await;

            let url = format!("{}/list.json", self.base_url);
            let mut query = vec![
                ("crtfc_key", self.api_key.clone()),
                ("corp_code", corp_code.to_string()),
                ("bgn_de", start.format("%Y%m%d").to_string()),
                ("end_de", end.format("%Y%m%d").to_string()),
                (
                    "last_reprt_at",
                    if final_only { "Y" } else { "N" }.to_string(),
                ),
                ("page_no", page_no.to_string()),
                ("page_count", PAGE_COUNT.to_string()),
            ];
            if let Some(kind) = kind {
                query.push(("pblntf_ty", kind.to_string()));
            }

            let response = self.http.get(&url).query(&query).send().await?;
            if !response.status().is_success() {
                return Err(ApiError::Status(response.status()).into());
            }

            let body: ListResponse = response
                .json()
                .await
                .map_err(|e| ApiError::Parse(e.to_string()))?;

            match body.status.as_str() {
                STATUS_OK => {
                    entries.extend(body.list);
                    if body.page_no >= body.total_page {
                        break;
                    }
                    page_no = body.page_no + 1;
                }
                STATUS_NO_DATA => break,
                code => {
                    return Err(ApiError::Upstream {
                        code: code.to_string(),
                        message: body.message,
                    }
                    .into());
                }
            }
        }

        info!(
            "disclosure search: corp_code={} {}~{} -> {} entries",
            corp_code, start, end, entries.len()
        );
        Ok(entries)
    }

    /// Fetch a filing document by accession number, returning the raw
    /// document tree text.
    pub async fn fetch_document(&mut self, rcept_no: &str) -> Result<String> {
        self.rate_limiter.wait_if_needed().await;

        let url = format!("{}/document.xml", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("rcept_no", rcept_no),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()).into());
        }

        let body = response.text().await?;
        debug!("document fetched: rcept_no={} ({} bytes)", rcept_no, body.len());
        Ok(body)
    }

    /// Fetch the company overview for a corp code.
    pub async fn get_company_info(&mut self, corp_code: &str) -> Result<Option<CompanyInfo>> {
        self.rate_limiter.wait_if_needed().await;

        let url = format!("{}/company.json", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("corp_code", corp_code),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()).into());
        }

        let body: CompanyResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        match body.status.as_str() {
            STATUS_OK => Ok(Some(body.info)),
            STATUS_NO_DATA => Ok(None),
            code => Err(ApiError::Upstream {
                code: code.to_string(),
                message: body.message,
            }
            .into()),
        }
    }
}
