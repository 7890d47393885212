use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveDate;
use tokio::time::sleep;

use crate::models::CompanyRecord;

pub mod dart_client;
pub mod krx_client;
pub mod public_data_client;

pub use dart_client::DartClient;
pub use krx_client::KrxClient;
pub use public_data_client::PublicDataClient;

/// Common seam for point-in-time market capitalization sources. The
/// valuation calculator cascades across implementations in priority order.
#[async_trait::async_trait]
pub trait MarketCapSource: Send {
    fn source_name(&self) -> &'static str;

    /// Market cap in won as of `date` (or the nearest prior trading day),
    /// `None` when this source has no answer.
    async fn market_cap_on(
        &mut self,
        company: &CompanyRecord,
        date: NaiveDate,
    ) -> Result<Option<i64>>;
}

/// Error taxonomy at the upstream-client seam.
///
/// Only `Transient` failures are worth retrying; everything else either
/// needs operator attention or is already final. Structural absence (a
/// filing that does not exist) is not an error at all: clients model it as
/// `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("upstream error {code}: {message}")]
    Upstream { code: String, message: String },

    #[error("malformed response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transient(_) => true,
            ApiError::Status(status) => status.is_server_error(),
            _ => false,
        }
    }
}

/// Minimum-interval rate limiter shared by the upstream clients so batch
/// loops stay polite with paginated requests.
pub struct RateLimiter {
    last_request: Instant,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Instant::now() - min_interval,
            min_interval,
        }
    }

    pub async fn wait_if_needed(&mut self) {
        let elapsed = self.last_request.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        self.last_request = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_spaces_out_requests() {
        let mut limiter = RateLimiter::new(Duration::from_millis(50));

        let start = Instant::now();
        limiter.wait_if_needed().await; // first call passes immediately
        limiter.wait_if_needed().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
