//! Streaming credentials from the lemon.markets realtime auth endpoint.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::StatusCode;
use serde::Deserialize;

use super::LemonApiConfig;
use crate::application::ports::{CredentialFetchError, CredentialSource};
use crate::domain::credentials::Credentials;
use crate::infrastructure::config::ApiKey;
use crate::infrastructure::metrics;

/// Longest error body kept in [`CredentialFetchError::Http`].
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Deserialize)]
struct AuthResponse {
    user_id: String,
    token: String,
    /// Epoch milliseconds.
    expires_at: i64,
}

impl AuthResponse {
    fn into_credentials(self) -> Result<Credentials, CredentialFetchError> {
        if self.user_id.is_empty() || self.token.is_empty() {
            return Err(CredentialFetchError::MalformedResponse(
                "empty user_id or token".to_string(),
            ));
        }
        let expires_at = DateTime::from_timestamp_millis(self.expires_at).ok_or_else(|| {
            CredentialFetchError::MalformedResponse(format!(
                "expires_at out of range: {}",
                self.expires_at
            ))
        })?;

        Ok(Credentials::new(
            self.user_id.clone(),
            self.user_id,
            self.token,
            expires_at,
        ))
    }
}

/// [`CredentialSource`] backed by `POST {auth_url}`.
///
/// Every call performs one request; nothing is cached or retried.
#[derive(Clone)]
pub struct CredentialClient {
    http: reqwest::Client,
    api_key: ApiKey,
    auth_url: String,
}

impl std::fmt::Debug for CredentialClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialClient")
            .field("auth_url", &self.auth_url)
            .finish_non_exhaustive()
    }
}

impl CredentialClient {
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
            auth_url: config.auth_url.clone(),
        }
    }

    async fn request(&self) -> Result<Credentials, CredentialFetchError> {
        let response = self
            .http
            .post(&self.auth_url)
            .bearer_auth(self.api_key.expose())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(CredentialFetchError::InvalidApiKey {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(CredentialFetchError::Http {
                status: status.as_u16(),
                message: truncate(&body, MAX_ERROR_BODY),
            });
        }

        serde_json::from_str::<AuthResponse>(&body)
            .map_err(|e| CredentialFetchError::MalformedResponse(e.to_string()))?
            .into_credentials()
    }
}

#[async_trait]
impl CredentialSource for CredentialClient {
    async fn fetch_credentials(&self) -> Result<Credentials, CredentialFetchError> {
        let result = self.request().await;
        metrics::record_credential_fetch(result.is_ok());

        match &result {
            Ok(credentials) => tracing::debug!(
                client_id = credentials.client_id(),
                expires_at = %credentials.expires_at(),
                "Received streaming credentials"
            ),
            Err(e) => tracing::debug!(error = %e, "Credential request failed"),
        }
        result
    }
}

fn transport_error(err: reqwest::Error) -> CredentialFetchError {
    if err.is_timeout() {
        CredentialFetchError::Timeout
    } else {
        CredentialFetchError::Network(err.to_string())
    }
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}
