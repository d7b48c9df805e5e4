//! Stream Orchestrator
//!
//! Owns the whole client lifecycle:
//!
//! ```text
//! fetch credentials ─► connect ─► subscribe ─► seed ─► receive loop
//!        ▲                                               │
//!        └──── refresh (expires_at - margin) ◄───────────┤
//!        └──── reconnect (disconnect, bounded backoff) ◄─┘
//! ```
//!
//! The loop is a biased `tokio::select!` over cancellation, the refresh
//! deadline and the session's event channel, in that priority. It is the only
//! writer of the [`QuoteStore`].
//!
//! Refresh is make-before-break: the replacement connection is subscribed
//! before the old one is closed, and quotes still buffered on the old channel
//! are applied before the new channel is read.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::renderer::ConsoleRenderer;
use crate::application::ports::{
    ConnectionError, CredentialFetchError, CredentialSource, QuoteSeeder, StreamConnection,
    StreamConnector, StreamEvent, StreamState,
};
use crate::domain::credentials::{Credentials, RefreshSchedule};
use crate::domain::instrument::Isin;
use crate::domain::quote::{Quote, QuoteStore};
use crate::infrastructure::metrics;

/// Default capacity of the transport → orchestrator channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Instruments to subscribe to, in display order.
    pub instruments: Vec<Isin>,
    /// How long before expiry credentials are replaced.
    pub refresh_margin: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Seed the store from the latest-quote snapshot after connecting.
    pub seed_latest: bool,
    /// Capacity of the event channel.
    pub channel_capacity: usize,
}

impl OrchestratorConfig {
    /// Settings for `instruments` with defaults for everything else.
    #[must_use]
    pub fn new(instruments: Vec<Isin>) -> Self {
        Self {
            instruments,
            refresh_margin: Duration::from_secs(3600),
            reconnect: ReconnectConfig::default(),
            seed_latest: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Counters reported when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Quotes written to the store.
    pub quotes_applied: u64,
    /// Quotes for instruments outside the tracked set.
    pub quotes_ignored: u64,
    /// Completed credential refreshes.
    pub refreshes: u32,
    /// Reconnect attempts made.
    pub reconnects: u32,
    /// Quotes taken from the latest-quote snapshot.
    pub seeded: usize,
}

/// Fatal orchestrator failure.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Credentials could not be obtained.
    #[error(transparent)]
    Credentials(#[from] CredentialFetchError),

    /// The stream could not be (re)established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Writing to the console failed.
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

/// One authenticated, subscribed connection and its event channel.
struct Session {
    credentials: Credentials,
    connection: Box<dyn StreamConnection>,
    events: mpsc::Receiver<StreamEvent>,
}

enum Step {
    Cancelled,
    RefreshDue,
    Event(Option<StreamEvent>),
}

/// Drives credentials, connection and rendering for one run.
pub struct Orchestrator<W> {
    credential_source: Arc<dyn CredentialSource>,
    connector: Arc<dyn StreamConnector>,
    seeder: Option<Arc<dyn QuoteSeeder>>,
    store: QuoteStore,
    renderer: ConsoleRenderer<W>,
    schedule: RefreshSchedule,
    reconnect: ReconnectPolicy,
    seed_latest: bool,
    channel_capacity: usize,
    summary: RunSummary,
}

impl<W: Write> Orchestrator<W> {
    /// Create an orchestrator; nothing is contacted until [`Self::run`].
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        credential_source: Arc<dyn CredentialSource>,
        connector: Arc<dyn StreamConnector>,
        renderer: ConsoleRenderer<W>,
    ) -> Self {
        Self {
            credential_source,
            connector,
            seeder: None,
            store: QuoteStore::new(config.instruments),
            renderer,
            schedule: RefreshSchedule::new(config.refresh_margin),
            reconnect: ReconnectPolicy::new(config.reconnect),
            seed_latest: config.seed_latest,
            channel_capacity: config.channel_capacity.max(1),
            summary: RunSummary::default(),
        }
    }

    /// Seed the store from `seeder` after each (re)connect.
    #[must_use]
    pub fn with_seeder(mut self, seeder: Arc<dyn QuoteSeeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Current quote store.
    pub const fn store(&self) -> &QuoteStore {
        &self.store
    }

    /// Consume the orchestrator, returning its renderer.
    pub fn into_renderer(self) -> ConsoleRenderer<W> {
        self.renderer
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Credentials`] if the initial fetch fails, or a
    ///   refresh fails or yields credentials already inside the margin
    /// - [`OrchestratorError::Connection`] if the stream drops and no
    ///   reconnect attempt is left
    /// - [`OrchestratorError::Output`] if rendering fails
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, OrchestratorError> {
        let Some(mut session) = self.start(&cancel).await? else {
            return self.finish();
        };

        loop {
            match self.next_step(&mut session, &cancel).await {
                Step::Cancelled => {
                    tracing::info!("Shutdown requested, closing stream");
                    self.close_session(session).await;
                    return self.finish();
                }
                Step::RefreshDue => {
                    if let Err(e) = self.refresh(&mut session).await {
                        self.close_session(session).await;
                        return Err(e);
                    }
                }
                Step::Event(Some(StreamEvent::Quote(quote))) => {
                    if let Err(e) = self.apply(quote) {
                        self.close_session(session).await;
                        return Err(e);
                    }
                }
                Step::Event(other) => {
                    let cause = match other {
                        Some(StreamEvent::Disconnected(e)) => e,
                        _ => ConnectionError::Closed("event channel closed".to_string()),
                    };
                    tracing::warn!(error = %cause, "Stream disconnected");
                    self.close_session(session).await;

                    match self.recover(cause, &cancel).await? {
                        Some(next) => session = next,
                        None => return self.finish(),
                    }
                }
            }
        }
    }

    async fn start(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>, OrchestratorError> {
        let credentials = self.fetch_credentials().await?;

        match self.open_session(credentials).await {
            Ok(session) => {
                self.session_ready().await?;
                Ok(Some(session))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Initial connection failed");
                self.recover(e, cancel).await
            }
        }
    }

    async fn next_step(&self, session: &mut Session, cancel: &CancellationToken) -> Step {
        if cancel.is_cancelled() {
            return Step::Cancelled;
        }

        let now = Utc::now();
        if self.schedule.is_due(&session.credentials, now) {
            return Step::RefreshDue;
        }
        let wait = self.schedule.time_until_refresh(&session.credentials, now);

        tokio::select! {
            biased;
            () = cancel.cancelled() => Step::Cancelled,
            () = tokio::time::sleep(wait) => Step::RefreshDue,
            event = session.events.recv() => Step::Event(event),
        }
    }

    async fn fetch_credentials(&self) -> Result<Credentials, CredentialFetchError> {
        let credentials = self.credential_source.fetch_credentials().await?;
        let tz = self.renderer.timezone();
        tracing::info!(
            client_id = credentials.client_id(),
            expires_at = %credentials.expires_at().with_timezone(&tz),
            refresh_at = %self.schedule.refresh_at(&credentials).with_timezone(&tz),
            "Streaming credentials issued"
        );
        Ok(credentials)
    }

    async fn open_session(&self, credentials: Credentials) -> Result<Session, ConnectionError> {
        let mut connection = self.connector.connect(&credentials).await?;

        if let Err(e) = connection
            .subscribe(credentials.client_id(), self.store.instruments())
            .await
        {
            if let Err(close_err) = connection.close().await {
                tracing::debug!(error = %close_err, "Close after failed subscribe");
            }
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        connection.on_message(tx)?;
        metrics::set_stream_state(connection.state());

        tracing::info!(
            client_id = credentials.client_id(),
            instruments = self.store.instruments().len(),
            "Subscribed to live quotes"
        );

        Ok(Session {
            credentials,
            connection,
            events: rx,
        })
    }

    async fn session_ready(&mut self) -> Result<(), OrchestratorError> {
        self.reconnect.reset();
        if self.seed_latest {
            self.seed().await?;
        }
        Ok(())
    }

    async fn seed(&mut self) -> Result<(), OrchestratorError> {
        let Some(seeder) = self.seeder.clone() else {
            return Ok(());
        };

        match seeder.latest_quotes(self.store.instruments()).await {
            Ok(quotes) => {
                let count = quotes.len();
                for quote in quotes {
                    self.apply(quote)?;
                }
                self.summary.seeded += count;
                metrics::record_seeded(count);
                tracing::info!(count, "Seeded quotes from latest snapshot");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Latest quotes unavailable, waiting for live updates");
            }
        }
        Ok(())
    }

    async fn refresh(&mut self, session: &mut Session) -> Result<(), OrchestratorError> {
        tracing::info!(
            expires_at = %session.credentials.expires_at(),
            "Refreshing streaming credentials"
        );

        let credentials = self.fetch_credentials().await?;
        if self.schedule.is_due(&credentials, Utc::now()) {
            return Err(CredentialFetchError::ExpiresTooSoon {
                expires_at: credentials.expires_at().to_rfc3339(),
            }
            .into());
        }

        let fresh = self.open_session(credentials).await?;
        let old = std::mem::replace(session, fresh);
        self.retire(old).await?;

        self.summary.refreshes += 1;
        metrics::record_refresh();
        tracing::info!(
            expires_at = %session.credentials.expires_at(),
            "Credentials refreshed"
        );
        Ok(())
    }

    /// Close a superseded session and apply whatever it had already delivered.
    async fn retire(&mut self, mut old: Session) -> Result<(), OrchestratorError> {
        if let Err(e) = old.connection.close().await {
            tracing::debug!(error = %e, "Error closing superseded connection");
        }

        let mut drained = 0usize;
        while let Ok(event) = old.events.try_recv() {
            if let StreamEvent::Quote(quote) = event {
                self.apply(quote)?;
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::debug!(drained, "Applied quotes buffered on superseded connection");
        }
        Ok(())
    }

    async fn recover(
        &mut self,
        cause: ConnectionError,
        cancel: &CancellationToken,
    ) -> Result<Option<Session>, OrchestratorError> {
        let mut last = OrchestratorError::from(cause);

        loop {
            let Some(delay) = self.reconnect.next_delay() else {
                return Err(last);
            };
            self.summary.reconnects += 1;
            metrics::record_reconnect();
            tracing::info!(
                attempt = self.reconnect.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(delay) => {}
            }

            match self.fresh_session().await {
                Ok(session) => {
                    self.session_ready().await?;
                    return Ok(Some(session));
                }
                Err(OrchestratorError::Credentials(e)) if e.is_auth_error() => {
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt failed");
                    last = e;
                }
            }
        }
    }

    async fn fresh_session(&self) -> Result<Session, OrchestratorError> {
        let credentials = self.fetch_credentials().await?;
        Ok(self.open_session(credentials).await?)
    }

    fn apply(&mut self, quote: Quote) -> Result<(), OrchestratorError> {
        let isin = quote.isin.clone();
        let outcome = self.store.apply_quote(quote);
        metrics::record_quote(outcome.is_applied());

        if !outcome.is_applied() {
            self.summary.quotes_ignored += 1;
            tracing::debug!(isin = %isin, "Ignoring quote for untracked instrument");
            return Ok(());
        }

        self.summary.quotes_applied += 1;
        if let Some(latest) = self.store.get(&isin) {
            self.renderer.emit(&self.store, latest)?;
        }
        Ok(())
    }

    async fn close_session(&mut self, mut session: Session) {
        if let Err(e) = session.connection.close().await {
            tracing::warn!(error = %e, "Error closing stream connection");
        }
        metrics::set_stream_state(StreamState::Disconnected);
    }

    fn finish(&mut self) -> Result<RunSummary, OrchestratorError> {
        self.renderer.finish()?;
        tracing::info!(
            quotes_applied = self.summary.quotes_applied,
            quotes_ignored = self.summary.quotes_ignored,
            refreshes = self.summary.refreshes,
            reconnects = self.summary.reconnects,
            "Stream stopped"
        );
        Ok(self.summary.clone())
    }
}
