//! Streaming Credentials
//!
//! Credentials are issued by the auth endpoint and authorise exactly one
//! broker connection until `expires_at`. They are never mutated: a refresh
//! produces a new value that supersedes the old one.
//!
//! Refreshing is scheduled, not reactive. The session refreshes once the
//! wall clock crosses `expires_at - margin`, see [`RefreshSchedule`].

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Credentials for one streaming connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    client_id: String,
    username: String,
    password: String,
    expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            expires_at,
        }
    }

    /// Broker client id; also names the per-client data channel.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Broker username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Broker password (the issued access token).
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Instant after which the broker stops delivering data.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// Refresh Schedule
// =============================================================================

/// When to replace credentials ahead of their expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    margin: Duration,
}

impl RefreshSchedule {
    /// Refresh `margin` before expiry.
    #[must_use]
    pub const fn new(margin: Duration) -> Self {
        Self { margin }
    }

    /// Wall-clock instant at which `credentials` should be replaced.
    #[must_use]
    pub fn refresh_at(&self, credentials: &Credentials) -> DateTime<Utc> {
        let margin = chrono::Duration::from_std(self.margin).unwrap_or(chrono::Duration::MAX);
        credentials
            .expires_at()
            .checked_sub_signed(margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `credentials` are already inside the margin at `now`.
    #[must_use]
    pub fn is_due(&self, credentials: &Credentials, now: DateTime<Utc>) -> bool {
        now >= self.refresh_at(credentials)
    }

    /// Time left until the refresh deadline; zero once it has passed.
    #[must_use]
    pub fn time_until_refresh(&self, credentials: &Credentials, now: DateTime<Utc>) -> Duration {
        (self.refresh_at(credentials) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
