//! Blocklist retrieval over HTTP.
//!
//! Fetches a wildcard-hostname list (one domain per line, `#` comments)
//! for the initial load and the periodic refresh job.

use std::time::Duration;

use anyhow::{ensure, Context as _, Result};
use reqwest::Client;
use tracing::info;

/// Generous deadline for fetching multi-megabyte lists.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

const USER_AGENT: &str = concat!("sinkhole downloader/", env!("CARGO_PKG_VERSION"));

/// HTTP source for the blocklist refresher.
pub struct BlocklistDownloader {
    client: Client,
    url: String,
}

impl BlocklistDownloader {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build blocklist HTTP client")?;
        Ok(Self { client, url: url.into() })
    }

    /// Download and parse the blocklist.
    pub async fn fetch(&self) -> Result<Vec<String>> {
        info!(url = %self.url, "retrieving blocklist");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("failed to fetch from {}", self.url))?;
        ensure!(
            response.status().is_success(),
            "error response from {}: {}",
            self.url,
            response.status()
        );

        if let Some(last_modified) = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
        {
            info!(last_modified, "remote last modified");
        }

        let body = response
            .text()
            .await
            .context("error reading response body")?;
        let items = parse_wildcard_list(&body);
        info!(count = items.len(), "blocklist loaded");
        Ok(items)
    }
}

/// Parse a wildcard-hostname blocklist: one domain per line, blank lines
/// and `#` comments skipped.
pub fn parse_wildcard_list(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            Some(line.to_owned())
        })
        .collect()
}
