//! HTTP fetch with per-attempt timeout and linear backoff.
//!
//! # Retry Strategy
//!
//! - Network error or timeout → retry
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Any other non-success status (e.g. 404) → fail immediately
//! - Backoff after attempt `n` is `n × backoff_step` (2s, 4s, ... by default)
//!
//! The last error is returned once attempts are exhausted. Callers are
//! always a per-source or per-item scope, so a failed fetch never aborts a
//! whole run.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CrawlConfig;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

impl FetchError {
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            // a malformed URL will not fix itself
            FetchError::Network { source, .. } => !source.is_builder(),
            FetchError::Status { status, .. } => is_retriable_status(*status),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub fn is_retriable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Timeout and retry tunables for one fetch.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl FetchPolicy {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts.max(1),
            backoff_step: Duration::from_millis(config.backoff_step_ms),
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// A successfully fetched response body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: Option<String>,
    pub final_url: String,
    pub body: String,
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<FetchedPage, FetchError> {
    let request = async {
        let network = |source| FetchError::Network {
            url: url.to_string(),
            source,
        };
        let response = client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(network)?;
        Ok(FetchedPage {
            status: status.as_u16(),
            content_type,
            final_url,
            body,
        })
    };

    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// GET `url`, retrying transient failures per `policy`.
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    url: &str,
    policy: &FetchPolicy,
) -> Result<FetchedPage, FetchError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetch_once(client, url, policy.timeout).await {
            Ok(page) => {
                debug!(url, attempt, status = page.status, "fetched");
                return Ok(page);
            }
            Err(e) if e.is_retriable() && attempt < max_attempts => {
                let delay = policy.backoff_after(attempt);
                warn!(url, attempt, error = %e, delay_ms = delay.as_millis() as u64, "fetch failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_statuses() {
        assert!(is_retriable_status(429));
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(503));
        assert!(!is_retriable_status(404));
        assert!(!is_retriable_status(401));
        assert!(!is_retriable_status(200));
    }

    #[test]
    fn test_error_classification() {
        let not_found = FetchError::Status {
            url: "https://example.gov/x".into(),
            status: 404,
        };
        assert!(!not_found.is_retriable());
        assert_eq!(not_found.status(), Some(404));

        let timeout = FetchError::Timeout {
            url: "https://example.gov/x".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retriable());
        assert_eq!(timeout.status(), None);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = FetchPolicy {
            timeout: Duration::from_secs(20),
            max_attempts: 3,
            backoff_step: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
    }
}
