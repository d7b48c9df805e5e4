//! Latest-quote snapshot from the market data API.

use async_trait::async_trait;
use serde::Deserialize;

use super::LemonApiConfig;
use crate::application::ports::{QuoteSeeder, SeedError};
use crate::domain::instrument::Isin;
use crate::domain::quote::Quote;
use crate::infrastructure::ably::QuotePayload;
use crate::infrastructure::config::ApiKey;

#[derive(Debug, Deserialize)]
struct LatestQuotesResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// [`QuoteSeeder`] backed by `GET {market_data_url}/quotes/latest`.
///
/// Requests integer prices and epoch timestamps so entries share the stream
/// payload format.
#[derive(Clone)]
pub struct LatestQuotesClient {
    http: reqwest::Client,
    api_key: ApiKey,
    url: String,
}

impl std::fmt::Debug for LatestQuotesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestQuotesClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl LatestQuotesClient {
    /// Create a client with its own HTTP connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &LemonApiConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::with_http(config.http_client()?, config))
    }

    /// Create a client sharing `http`.
    #[must_use]
    pub fn with_http(http: reqwest::Client, config: &LemonApiConfig) -> Self {
        Self {
            http,
            api_key: config.api_key.clone(),
            url: format!(
                "{}/quotes/latest",
                config.market_data_url.trim_end_matches('/')
            ),
        }
    }
}

#[async_trait]
impl QuoteSeeder for LatestQuotesClient {
    async fn latest_quotes(&self, instruments: &[Isin]) -> Result<Vec<Quote>, SeedError> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }

        let isins = instruments
            .iter()
            .map(Isin::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .http
            .get(&self.url)
            .bearer_auth(self.api_key.expose())
            .query(&[
                ("isin", isins.as_str()),
                ("epoch", "true"),
                ("decimals", "false"),
            ])
            .send()
            .await
            .map_err(|e| SeedError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SeedError::Request(format!("HTTP {status}: {body}")));
        }

        let body: LatestQuotesResponse = response
            .json()
            .await
            .map_err(|e| SeedError::MalformedResponse(e.to_string()))?;

        let quotes = body
            .results
            .iter()
            .filter_map(|entry| {
                match QuotePayload::from_data(entry).and_then(QuotePayload::into_quote) {
                    Ok(quote) => Some(quote),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping latest quote entry");
                        None
                    }
                }
            })
            .collect();
        Ok(quotes)
    }
}
