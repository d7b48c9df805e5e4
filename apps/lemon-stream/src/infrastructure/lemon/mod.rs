//! lemon.markets HTTP Adapters
//!
//! - `auth`: API key → streaming credentials ([`CredentialClient`])
//! - `quotes`: latest-quote snapshot used to seed the store ([`LatestQuotesClient`])

pub mod auth;
pub mod quotes;

use std::time::Duration;

pub use auth::CredentialClient;
pub use quotes::LatestQuotesClient;

use crate::infrastructure::config::{ApiKey, DEFAULT_AUTH_URL, DEFAULT_MARKET_DATA_URL};

/// Settings shared by the HTTP adapters.
#[derive(Debug, Clone)]
pub struct LemonApiConfig {
    /// API key sent as bearer token.
    pub api_key: ApiKey,
    /// Credentials endpoint.
    pub auth_url: String,
    /// Market data API base.
    pub market_data_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl LemonApiConfig {
    /// Production endpoints for `api_key`.
    #[must_use]
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key,
            auth_url: DEFAULT_AUTH_URL.to_string(),
            market_data_url: DEFAULT_MARKET_DATA_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// HTTP client with the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("lemon-stream/", env!("CARGO_PKG_VERSION")))
            .build()
    }
}
