//! Port Interfaces
//!
//! Defines the interfaces (ports) the orchestrator drives, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them;
//! tests substitute in-memory fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialSource`: exchanges the API key for streaming credentials
//! - `StreamConnector` / `StreamConnection`: the broker connection lifecycle
//! - `QuoteSeeder`: latest-quote snapshot used to seed the store

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::credentials::Credentials;
use crate::domain::instrument::Isin;
use crate::domain::quote::Quote;

// =============================================================================
// Errors
// =============================================================================

/// Failure to obtain streaming credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialFetchError {
    /// The API key was rejected (HTTP 401/403).
    #[error("API key rejected by auth endpoint (HTTP {status})")]
    InvalidApiKey {
        /// HTTP status code.
        status: u16,
    },

    /// Auth endpoint answered with another non-success status.
    #[error("auth endpoint returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Request never produced a response.
    #[error("network error while fetching credentials: {0}")]
    Network(String),

    /// Request timed out.
    #[error("timed out fetching credentials")]
    Timeout,

    /// Response body could not be decoded.
    #[error("malformed credentials response: {0}")]
    MalformedResponse(String),

    /// Freshly issued credentials are already inside the refresh margin.
    #[error("issued credentials expire at {expires_at}, inside the refresh margin")]
    ExpiresTooSoon {
        /// Expiry of the rejected credentials (RFC 3339).
        expires_at: String,
    },
}

impl CredentialFetchError {
    /// Whether the failure is caused by the API key itself.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self, Self::InvalidApiKey { .. })
    }
}

/// Failure of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Transport-level failure (DNS, TCP, TLS, WebSocket).
    #[error("transport error: {0}")]
    Transport(String),

    /// Broker refused the connection or the channel.
    #[error("broker rejected request ({code}): {message}")]
    Rejected {
        /// Broker error code.
        code: i64,
        /// Broker error message.
        message: String,
    },

    /// Handshake step did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// No traffic within the keep-alive window.
    #[error("heartbeat timeout: no traffic for {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    /// Frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Operation not valid in the current state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        /// Required state.
        expected: StreamState,
        /// Current state.
        actual: StreamState,
    },

    /// Connection closed by the broker or the network.
    #[error("connection closed: {0}")]
    Closed(String),
}

/// Failure of the optional latest-quote snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeedError {
    /// Request failed or returned a non-success status.
    #[error("latest quotes request failed: {0}")]
    Request(String),

    /// Response body could not be decoded.
    #[error("malformed latest quotes response: {0}")]
    MalformedResponse(String),
}

// =============================================================================
// Stream State & Events
// =============================================================================

/// Lifecycle state of one broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Broker accepted the credentials.
    Connected,
    /// Attaching the data channel / publishing the instrument list.
    Subscribing,
    /// Instrument list published.
    Subscribed,
    /// Quotes are being forwarded to the sink.
    Streaming,
}

impl StreamState {
    /// Name used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
            Self::Streaming => "streaming",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item delivered on the message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A decoded quote, in transport order.
    Quote(Quote),
    /// The connection terminated; no further events follow.
    Disconnected(ConnectionError),
}

// =============================================================================
// Ports
// =============================================================================

/// Exchanges the configured API key for streaming credentials.
///
/// Every call performs a fresh request; implementations must not cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch a new set of credentials.
    async fn fetch_credentials(&self) -> Result<Credentials, CredentialFetchError>;
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect and authenticate with `credentials`.
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn StreamConnection>, ConnectionError>;
}

/// One authenticated broker connection.
///
/// The lifecycle is `connect → subscribe → on_message → close`. A connection
/// is never resumed: once it has reported [`StreamEvent::Disconnected`] the
/// caller must open a new one with fresh credentials.
#[async_trait]
pub trait StreamConnection: Send {
    /// Current lifecycle state.
    fn state(&self) -> StreamState;

    /// Publish the instrument set on the per-client subscription channel.
    async fn subscribe(
        &mut self,
        client_id: &str,
        instruments: &[Isin],
    ) -> Result<(), ConnectionError>;

    /// Start forwarding quotes into `sink` for the rest of the connection.
    fn on_message(&mut self, sink: mpsc::Sender<StreamEvent>) -> Result<(), ConnectionError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Fetches a snapshot of the latest quotes.
#[async_trait]
pub trait QuoteSeeder: Send + Sync {
    /// Latest known quote for each of `instruments` that has one.
    async fn latest_quotes(&self, instruments: &[Isin]) -> Result<Vec<Quote>, SeedError>;
}
