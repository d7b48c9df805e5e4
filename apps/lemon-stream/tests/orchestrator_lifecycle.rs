//! Orchestrator Lifecycle Integration Tests
//!
//! Drives the orchestrator with in-memory credential, connection and console
//! fakes that record every step into a shared journal.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lemon_stream::{
    ConnectionError, ConsoleRenderer, CredentialFetchError, CredentialSource, Credentials,
    DisplayMode, Isin, Orchestrator, OrchestratorConfig, OrchestratorError, Quote, ReconnectConfig,
    StreamConnection, StreamConnector, StreamEvent, StreamState,
};

type Journal = Arc<Mutex<Vec<String>>>;

fn isin(s: &str) -> Isin {
    Isin::parse(s).unwrap()
}

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap()
}

fn quote(isin_str: &str, mic: &str, ask: i64, bid: i64, at: DateTime<Utc>) -> Quote {
    Quote::new(
        isin(isin_str),
        mic,
        Decimal::new(ask, 2),
        Decimal::new(bid, 2),
        at,
    )
}

fn credentials(client_id: &str, expires_in: chrono::Duration) -> Credentials {
    Credentials::new(client_id, client_id, "secret", Utc::now() + expires_in)
}

// =============================================================================
// Fakes
// =============================================================================

struct ScriptedCredentials {
    responses: Mutex<VecDeque<Result<Credentials, CredentialFetchError>>>,
    journal: Journal,
}

impl ScriptedCredentials {
    fn new(
        responses: impl IntoIterator<Item = Result<Credentials, CredentialFetchError>>,
        journal: &Journal,
    ) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            journal: Arc::clone(journal),
        })
    }
}

#[async_trait]
impl CredentialSource for ScriptedCredentials {
    async fn fetch_credentials(&self) -> Result<Credentials, CredentialFetchError> {
        let next = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or(Err(CredentialFetchError::Timeout));
        self.journal.lock().push("fetch".to_string());
        next
    }
}

/// Events a fake connection delivers once its sink is registered.
struct Script {
    events: Vec<StreamEvent>,
}

impl Script {
    fn quotes(quotes: impl IntoIterator<Item = Quote>) -> Self {
        Self {
            events: quotes.into_iter().map(StreamEvent::Quote).collect(),
        }
    }

    fn then_disconnect(mut self) -> Self {
        self.events.push(StreamEvent::Disconnected(ConnectionError::Closed(
            "server went away".to_string(),
        )));
        self
    }
}

struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    journal: Journal,
}

impl ScriptedConnector {
    fn new(scripts: impl IntoIterator<Item = Script>, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            journal: Arc::clone(journal),
        })
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn StreamConnection>, ConnectionError> {
        let client_id = credentials.client_id().to_string();
        self.journal.lock().push(format!("connect {client_id}"));
        let Some(script) = self.scripts.lock().pop_front() else {
            return Err(ConnectionError::Transport("no more scripted connections".to_string()));
        };
        Ok(Box::new(FakeConnection {
            client_id,
            script,
            state: StreamState::Connected,
            sink: None,
            journal: Arc::clone(&self.journal),
        }))
    }
}

struct FakeConnection {
    client_id: String,
    script: Script,
    state: StreamState,
    sink: Option<mpsc::Sender<StreamEvent>>,
    journal: Journal,
}

#[async_trait]
impl StreamConnection for FakeConnection {
    fn state(&self) -> StreamState {
        self.state
    }

    async fn subscribe(
        &mut self,
        client_id: &str,
        instruments: &[Isin],
    ) -> Result<(), ConnectionError> {
        let list: Vec<&str> = instruments.iter().map(Isin::as_str).collect();
        self.journal
            .lock()
            .push(format!("subscribe {client_id} {}", list.join(",")));
        self.state = StreamState::Subscribed;
        Ok(())
    }

    fn on_message(&mut self, sink: mpsc::Sender<StreamEvent>) -> Result<(), ConnectionError> {
        for event in self.script.events.drain(..) {
            sink.try_send(event)
                .map_err(|e| ConnectionError::Closed(e.to_string()))?;
        }
        self.sink = Some(sink);
        self.state = StreamState::Streaming;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.journal.lock().push(format!("close {}", self.client_id));
        self.sink = None;
        self.state = StreamState::Disconnected;
        Ok(())
    }
}

/// Console writer recording each flushed status line; cancels after `limit`.
struct JournalWriter {
    pending: Vec<u8>,
    flushes: usize,
    limit: usize,
    cancel: CancellationToken,
    journal: Journal,
}

impl JournalWriter {
    fn new(limit: usize, cancel: &CancellationToken, journal: &Journal) -> Self {
        Self {
            pending: Vec::new(),
            flushes: 0,
            limit,
            cancel: cancel.clone(),
            journal: Arc::clone(journal),
        }
    }
}

impl Write for JournalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let line = String::from_utf8_lossy(&self.pending)
            .trim_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        if line.is_empty() {
            return Ok(());
        }

        self.journal.lock().push(format!("render {line}"));
        self.flushes += 1;
        if self.flushes >= self.limit {
            self.cancel.cancel();
        }
        Ok(())
    }
}

fn orchestrator(
    config: OrchestratorConfig,
    credentials: Arc<ScriptedCredentials>,
    connector: Arc<ScriptedConnector>,
    writer: JournalWriter,
) -> Orchestrator<JournalWriter> {
    Orchestrator::new(
        config,
        credentials,
        connector,
        ConsoleRenderer::new(DisplayMode::Status, writer),
    )
}

fn base_config(instruments: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        seed_latest: false,
        ..OrchestratorConfig::new(instruments.iter().map(|s| isin(s)).collect())
    }
}

async fn run_with_deadline(
    orchestrator: &mut Orchestrator<JournalWriter>,
    cancel: CancellationToken,
) -> Result<lemon_stream::RunSummary, OrchestratorError> {
    tokio::time::timeout(Duration::from_secs(5), orchestrator.run(cancel))
        .await
        .expect("orchestrator should stop")
}

fn position(journal: &[String], prefix: &str) -> usize {
    journal
        .iter()
        .position(|entry| entry.starts_with(prefix))
        .unwrap_or_else(|| panic!("no journal entry starting with '{prefix}': {journal:?}"))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn quote_is_rendered_then_superseded() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();
    let first = quote("US0378331005", "XMUN", 14556, 14538, t1());
    let later = quote(
        "US0378331005",
        "XMUN",
        14560,
        14540,
        t1() + chrono::Duration::seconds(1),
    );

    let mut orchestrator = orchestrator(
        base_config(&["US0378331005"]),
        ScriptedCredentials::new(
            [Ok(credentials("usr_1", chrono::Duration::hours(24)))],
            &journal,
        ),
        ScriptedConnector::new([Script::quotes([first, later.clone()])], &journal),
        JournalWriter::new(2, &cancel, &journal),
    );

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();

    assert_eq!(summary.quotes_applied, 2);
    assert_eq!(orchestrator.store().get(&isin("US0378331005")), Some(&later));

    let journal = journal.lock().clone();
    let renders: Vec<&String> = journal.iter().filter(|e| e.starts_with("render")).collect();
    assert_eq!(
        renders[0],
        "render US0378331005 (exc=XMUN, ask=145.5600, bid=145.3800, date=2023-01-01T10:00:00.000Z)"
    );
    assert_eq!(
        renders[1],
        "render US0378331005 (exc=XMUN, ask=145.6000, bid=145.4000, date=2023-01-01T10:00:01.000Z)"
    );
    assert!(journal.contains(&"subscribe usr_1 US0378331005".to_string()));
    assert_eq!(journal.last().unwrap(), "close usr_1");
}

#[tokio::test]
async fn credentials_inside_margin_refresh_before_first_render() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let config = OrchestratorConfig {
        refresh_margin: Duration::from_secs(120),
        ..base_config(&["US0378331005"])
    };
    let mut orchestrator = orchestrator(
        config,
        ScriptedCredentials::new(
            [
                Ok(credentials("usr_old", chrono::Duration::seconds(60))),
                Ok(credentials("usr_new", chrono::Duration::hours(1))),
            ],
            &journal,
        ),
        ScriptedConnector::new(
            [
                Script::quotes([quote("US0378331005", "XMUN", 14556, 14538, t1())]),
                Script::quotes([quote("US0378331005", "XETR", 14557, 14539, t1())]),
            ],
            &journal,
        ),
        JournalWriter::new(2, &cancel, &journal),
    );

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();
    assert_eq!(summary.refreshes, 1);

    let journal = journal.lock().clone();
    let new_connect = position(&journal, "connect usr_new");
    let old_close = position(&journal, "close usr_old");
    let first_render = position(&journal, "render");

    assert!(position(&journal, "connect usr_old") < new_connect);
    assert!(new_connect < old_close, "make before break: {journal:?}");
    assert!(old_close < first_render, "refresh before render: {journal:?}");
    assert!(journal[first_render].contains("exc=XMUN"));
    assert!(journal.iter().any(|e| e.contains("exc=XETR")));
}

#[tokio::test]
async fn refresh_fires_when_deadline_is_reached() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    // Deadline is expiry minus margin, half a second after start.
    let config = OrchestratorConfig {
        refresh_margin: Duration::from_secs(1),
        ..base_config(&["US0378331005"])
    };
    let mut orchestrator = orchestrator(
        config,
        ScriptedCredentials::new(
            [
                Ok(credentials("usr_old", chrono::Duration::milliseconds(1500))),
                Ok(credentials("usr_new", chrono::Duration::hours(1))),
            ],
            &journal,
        ),
        ScriptedConnector::new(
            [
                Script::quotes([quote("US0378331005", "XMUN", 14556, 14538, t1())]),
                Script::quotes([quote("US0378331005", "XETR", 14557, 14539, t1())]),
            ],
            &journal,
        ),
        JournalWriter::new(2, &cancel, &journal),
    );

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();
    assert_eq!(summary.refreshes, 1);
    assert_eq!(summary.quotes_applied, 2);

    let journal = journal.lock().clone();
    let old_render = position(&journal, "render US0378331005 (exc=XMUN");
    let new_connect = position(&journal, "connect usr_new");
    let old_close = position(&journal, "close usr_old");
    let new_render = position(&journal, "render US0378331005 (exc=XETR");

    assert!(old_render < new_connect, "old session serves until the deadline: {journal:?}");
    assert!(new_connect < old_close, "make before break: {journal:?}");
    assert!(old_close < new_render, "{journal:?}");
    assert_eq!(
        journal.iter().filter(|e| *e == "fetch").count(),
        2,
        "{journal:?}"
    );
    assert_eq!(journal.last().unwrap(), "close usr_new");
}

#[tokio::test]
async fn rejected_api_key_never_connects() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let mut orchestrator = orchestrator(
        base_config(&["US0378331005"]),
        ScriptedCredentials::new(
            [Err(CredentialFetchError::InvalidApiKey { status: 401 })],
            &journal,
        ),
        ScriptedConnector::new([Script::quotes([])], &journal),
        JournalWriter::new(1, &cancel, &journal),
    );

    let err = run_with_deadline(&mut orchestrator, cancel).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Credentials(CredentialFetchError::InvalidApiKey { status: 401 })
    ));
    assert_eq!(*journal.lock(), vec!["fetch".to_string()]);
}

#[tokio::test]
async fn cancellation_closes_the_stream_cleanly() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let mut orchestrator = orchestrator(
        base_config(&["US0378331005", "DE0007164600"]),
        ScriptedCredentials::new(
            [Ok(credentials("usr_1", chrono::Duration::hours(24)))],
            &journal,
        ),
        ScriptedConnector::new([Script::quotes([])], &journal),
        JournalWriter::new(usize::MAX, &cancel, &journal),
    );

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();
    assert_eq!(summary.quotes_applied, 0);
    assert_eq!(
        *journal.lock(),
        vec![
            "fetch".to_string(),
            "connect usr_1".to_string(),
            "subscribe usr_1 US0378331005,DE0007164600".to_string(),
            "close usr_1".to_string(),
        ]
    );
}

#[tokio::test]
async fn disconnect_without_reconnect_is_fatal() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let mut orchestrator = orchestrator(
        base_config(&["US0378331005"]),
        ScriptedCredentials::new(
            [Ok(credentials("usr_1", chrono::Duration::hours(24)))],
            &journal,
        ),
        ScriptedConnector::new([Script::quotes([]).then_disconnect()], &journal),
        JournalWriter::new(usize::MAX, &cancel, &journal),
    );

    let err = run_with_deadline(&mut orchestrator, cancel).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Connection(ConnectionError::Closed(_))));
}

#[tokio::test]
async fn reconnect_uses_fresh_credentials() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let config = OrchestratorConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: 2,
            ..ReconnectConfig::default()
        },
        ..base_config(&["US0378331005"])
    };
    let mut orchestrator = orchestrator(
        config,
        ScriptedCredentials::new(
            [
                Ok(credentials("usr_a", chrono::Duration::hours(24))),
                Ok(credentials("usr_b", chrono::Duration::hours(24))),
            ],
            &journal,
        ),
        ScriptedConnector::new(
            [
                Script::quotes([quote("US0378331005", "XMUN", 100, 99, t1())]).then_disconnect(),
                Script::quotes([quote("US0378331005", "XMUN", 101, 100, t1())]),
            ],
            &journal,
        ),
        JournalWriter::new(2, &cancel, &journal),
    );

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();
    assert_eq!(summary.reconnects, 1);
    assert_eq!(summary.quotes_applied, 2);

    let journal = journal.lock().clone();
    assert_eq!(journal.iter().filter(|e| *e == "fetch").count(), 2);
    assert!(position(&journal, "close usr_a") < position(&journal, "connect usr_b"));
}

#[tokio::test]
async fn untracked_instruments_are_not_rendered() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();

    let mut orchestrator = orchestrator(
        base_config(&["US0378331005"]),
        ScriptedCredentials::new(
            [Ok(credentials("usr_1", chrono::Duration::hours(24)))],
            &journal,
        ),
        ScriptedConnector::new(
            [Script::quotes([
                quote("DE0007164600", "XETR", 12050, 12040, t1()),
                quote("US0378331005", "XMUN", 14556, 14538, t1()),
            ])],
            &journal,
        ),
        JournalWriter::new(1, &cancel, &journal),
    );

    let summary = run_with_deadline(&mut orchestrator, cancel).await.unwrap();
    assert_eq!(summary.quotes_ignored, 1);
    assert_eq!(summary.quotes_applied, 1);
    assert!(orchestrator.store().get(&isin("DE0007164600")).is_none());
}
