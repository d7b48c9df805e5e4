//! Live Stream WebSocket Client
//!
//! Implements [`StreamConnector`] / [`StreamConnection`] over the Ably
//! realtime WebSocket protocol.
//!
//! # Stream URL
//!
//! `wss://realtime.ably.io?client_id=<user_id>&access_token=<token>&format=json&heartbeats=false&v=1.2`
//!
//! # Lifecycle
//!
//! `connect` waits for CONNECTED, `subscribe` attaches the per-client channel
//! and publishes the instrument list, `on_message` hands the socket to a pump
//! task that forwards quotes to the consumer, `close` detaches and closes.
//! Quotes that arrive while subscribing are buffered and delivered first.
//! `close` is honoured even while the consumer has stopped reading.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, FrameCodec, WireFormat, quotes_from};
use super::handshake::{Handshake, Progress};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::ProtocolMessage;
use crate::application::ports::{
    ConnectionError, StreamConnection, StreamConnector, StreamEvent, StreamState,
};
use crate::domain::credentials::Credentials;
use crate::domain::instrument::Isin;
use crate::domain::quote::Quote;
use crate::infrastructure::metrics;

/// Production realtime endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://realtime.ably.io";

/// Realtime protocol version sent as `v`.
pub const PROTOCOL_VERSION: &str = "1.2";

/// How long `close` waits for the broker to finish the close handshake.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamClientConfig {
    /// Realtime endpoint without query.
    pub url: String,
    /// Frame encoding.
    pub format: WireFormat,
    /// Ask the broker for protocol-level HEARTBEAT messages.
    pub broker_heartbeats: bool,
    /// Bound on the WebSocket handshake plus CONNECTED.
    pub connect_timeout: Duration,
    /// Bound on ATTACH → ATTACHED.
    pub subscribe_timeout: Duration,
    /// Ping interval and idle timeout while streaming.
    pub heartbeat: HeartbeatConfig,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            format: WireFormat::default(),
            broker_heartbeats: false,
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl StreamClientConfig {
    /// Connection URL carrying `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] if `url` is not a valid URL.
    pub fn connect_url(&self, credentials: &Credentials) -> Result<reqwest::Url, ConnectionError> {
        reqwest::Url::parse_with_params(
            &self.url,
            &[
                ("client_id", credentials.client_id()),
                ("access_token", credentials.password()),
                ("format", self.format.as_str()),
                (
                    "heartbeats",
                    if self.broker_heartbeats { "true" } else { "false" },
                ),
                ("v", PROTOCOL_VERSION),
            ],
        )
        .map_err(|e| ConnectionError::Transport(format!("invalid stream URL {}: {e}", self.url)))
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens [`AblyConnection`]s.
#[derive(Debug, Clone)]
pub struct AblyConnector {
    config: StreamClientConfig,
}

impl AblyConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new(config: StreamClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamConnector for AblyConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn StreamConnection>, ConnectionError> {
        let connection = AblyConnection::connect(self.config.clone(), credentials).await?;
        Ok(Box::new(connection))
    }
}

// =============================================================================
// Connection
// =============================================================================

enum PumpCommand {
    Close,
}

/// Result of handing one event to the consumer.
enum Delivery {
    Sent,
    CloseRequested,
    ConsumerGone,
}

struct Pump {
    commands: mpsc::Sender<PumpCommand>,
    handle: JoinHandle<()>,
}

/// One realtime connection.
pub struct AblyConnection {
    config: StreamClientConfig,
    codec: FrameCodec,
    handshake: Handshake,
    socket: Option<WsStream>,
    pending: VecDeque<Quote>,
    msg_serial: u64,
    pump: Option<Pump>,
}

impl std::fmt::Debug for AblyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AblyConnection")
            .field("url", &self.config.url)
            .field("state", &self.handshake.state())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl AblyConnection {
    /// Open the WebSocket and wait for CONNECTED.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Transport`] if the socket cannot be opened
    /// - [`ConnectionError::Rejected`] if the broker refuses the credentials
    /// - [`ConnectionError::Timeout`] if CONNECTED does not arrive in time
    pub async fn connect(
        config: StreamClientConfig,
        credentials: &Credentials,
    ) -> Result<Self, ConnectionError> {
        let url = config.connect_url(credentials)?;
        let mut handshake = Handshake::new();
        handshake.on_transport_opening();
        metrics::set_stream_state(handshake.state());

        tracing::info!(
            url = %config.url,
            format = %config.format,
            client_id = credentials.client_id(),
            "Connecting to live stream"
        );

        let connect_timeout = config.connect_timeout;
        let mut connection = Self {
            codec: FrameCodec::new(config.format),
            config,
            handshake,
            socket: None,
            pending: VecDeque::new(),
            msg_serial: 0,
            pump: None,
        };

        tokio::time::timeout(connect_timeout, connection.open(url.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout("CONNECTED"))??;

        metrics::set_stream_state(connection.handshake.state());
        Ok(connection)
    }

    async fn open(&mut self, url: &str) -> Result<(), ConnectionError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        self.socket = Some(socket);

        loop {
            let msg = self.read_protocol_message().await?;
            match self.handshake.on_message(msg)? {
                Progress::Connected { connection_id } => {
                    tracing::info!(connection_id = ?connection_id, "Live stream connected");
                    return Ok(());
                }
                Progress::Data(msg) => self.buffer(&msg),
                Progress::Attached | Progress::Idle => {}
            }
        }
    }

    async fn await_attached(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = self.read_protocol_message().await?;
            match self.handshake.on_message(msg)? {
                Progress::Attached => return Ok(()),
                Progress::Data(msg) => self.buffer(&msg),
                Progress::Connected { .. } | Progress::Idle => {}
            }
        }
    }

    fn buffer(&mut self, msg: &ProtocolMessage) {
        for result in quotes_from(msg) {
            match result {
                Ok(quote) => self.pending.push_back(quote),
                Err(e) => {
                    metrics::record_decode_error();
                    tracing::warn!(error = %e, "Skipping undecodable quote");
                }
            }
        }
    }

    /// Next protocol message before the pump owns the socket.
    async fn read_protocol_message(&mut self) -> Result<ProtocolMessage, ConnectionError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ConnectionError::Closed("socket not available".to_string()))?;

        loop {
            let decoded = match socket.next().await {
                Some(Ok(Message::Text(text))) => self.codec.decode_text(&text),
                Some(Ok(Message::Binary(data))) => self.codec.decode_binary(&data),
                Some(Ok(Message::Close(frame))) => {
                    return Err(ConnectionError::Closed(close_reason(frame.as_ref())));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
                None => return Err(ConnectionError::Closed("stream ended".to_string())),
            };

            metrics::record_frame_received();
            match decoded {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    metrics::record_decode_error();
                    tracing::warn!(error = %e, "Skipping undecodable frame");
                }
            }
        }
    }

    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), ConnectionError> {
        let frame = self.codec.encode(msg).map_err(codec_error)?;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ConnectionError::Closed("socket not available".to_string()))?;
        socket
            .send(frame)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

#[async_trait]
impl StreamConnection for AblyConnection {
    fn state(&self) -> StreamState {
        match &self.pump {
            Some(pump) if pump.handle.is_finished() => StreamState::Disconnected,
            _ => self.handshake.state(),
        }
    }

    async fn subscribe(
        &mut self,
        client_id: &str,
        instruments: &[Isin],
    ) -> Result<(), ConnectionError> {
        let attach = self.handshake.begin_attach(client_id)?;
        metrics::set_stream_state(self.handshake.state());
        tracing::info!(channel = client_id, "Attaching to channel");
        self.send(&attach).await?;

        tokio::time::timeout(self.config.subscribe_timeout, self.await_attached())
            .await
            .map_err(|_| ConnectionError::Timeout("ATTACHED"))??;

        let channel = format!("{client_id}.subscriptions");
        let publish = ProtocolMessage::subscription(&channel, self.msg_serial, instruments);
        self.msg_serial += 1;
        self.send(&publish).await?;
        self.handshake.on_subscription_sent()?;
        metrics::set_stream_state(self.handshake.state());

        tracing::info!(
            channel = %channel,
            instruments = instruments.len(),
            buffered = self.pending.len(),
            "Instrument subscription published"
        );
        Ok(())
    }

    fn on_message(&mut self, sink: mpsc::Sender<StreamEvent>) -> Result<(), ConnectionError> {
        self.handshake.on_streaming()?;
        let socket = self
            .socket
            .take()
            .ok_or_else(|| ConnectionError::Closed("socket not available".to_string()))?;

        let (write, read) = socket.split();
        let (commands, command_rx) = mpsc::channel(1);
        let pump = PumpTask {
            codec: self.codec,
            handshake: self.handshake.clone(),
            heartbeat: self.config.heartbeat.clone(),
            write,
            read,
            sink,
            commands: command_rx,
        };
        let pending = std::mem::take(&mut self.pending);
        let handle = tokio::spawn(pump.run(pending));

        self.pump = Some(Pump { commands, handle });
        metrics::set_stream_state(StreamState::Streaming);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let result = if let Some(pump) = self.pump.take() {
            let _ = pump.commands.send(PumpCommand::Close).await;
            let mut handle = pump.handle;
            if tokio::time::timeout(CLOSE_GRACE * 2, &mut handle).await.is_err() {
                handle.abort();
                tracing::debug!("Stream pump did not stop in time, aborted");
            }
            Ok(())
        } else if let Some(socket) = self.socket.take() {
            let (mut write, mut read) = socket.split();
            let channel = self.handshake.channel().map(str::to_string);
            graceful_close(&self.codec, channel.as_deref(), &mut write, &mut read).await
        } else {
            Ok(())
        };

        self.handshake.on_closed();
        metrics::set_stream_state(StreamState::Disconnected);
        result
    }
}

// =============================================================================
// Pump
// =============================================================================

struct PumpTask {
    codec: FrameCodec,
    handshake: Handshake,
    heartbeat: HeartbeatConfig,
    write: WsWrite,
    read: WsRead,
    sink: mpsc::Sender<StreamEvent>,
    commands: mpsc::Receiver<PumpCommand>,
}

impl PumpTask {
    async fn run(mut self, pending: VecDeque<Quote>) {
        for quote in pending {
            match self.deliver(StreamEvent::Quote(quote)).await {
                Delivery::Sent => {}
                Delivery::CloseRequested => {
                    self.close_gracefully().await;
                    return;
                }
                Delivery::ConsumerGone => return,
            }
        }

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = CancellationToken::new();
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat.clone(),
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let outcome = self.pump(&heartbeat_state, &mut heartbeat_rx).await;
        heartbeat_cancel.cancel();

        match outcome {
            Ok(()) => self.close_gracefully().await,
            Err(e) => {
                tracing::warn!(error = %e, "Live stream terminated");
                let _ = self.deliver(StreamEvent::Disconnected(e)).await;
            }
        }
    }

    /// Send `event`, giving up if a close is requested while the consumer
    /// is not reading.
    async fn deliver(&mut self, event: StreamEvent) -> Delivery {
        tokio::select! {
            biased;
            command = self.commands.recv() => match command {
                Some(PumpCommand::Close) | None => Delivery::CloseRequested,
            },
            sent = self.sink.send(event) => {
                if sent.is_ok() { Delivery::Sent } else { Delivery::ConsumerGone }
            }
        }
    }

    async fn close_gracefully(&mut self) {
        let channel = self.handshake.channel().map(str::to_string);
        if let Err(e) =
            graceful_close(&self.codec, channel.as_deref(), &mut self.write, &mut self.read).await
        {
            tracing::debug!(error = %e, "Close handshake incomplete");
        }
    }

    /// `Ok` when a local close was requested, `Err` when the connection died.
    async fn pump(
        &mut self,
        heartbeat_state: &HeartbeatState,
        heartbeat_rx: &mut mpsc::Receiver<HeartbeatEvent>,
    ) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(PumpCommand::Close) | None => return Ok(()),
                    }
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            self.write
                                .send(Message::Ping(Vec::new().into()))
                                .await
                                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
                        }
                        Some(HeartbeatEvent::Timeout(idle)) => {
                            return Err(ConnectionError::HeartbeatTimeout(idle));
                        }
                        None => {
                            tracing::debug!("Keep-alive channel closed");
                        }
                    }
                }
                frame = self.read.next() => {
                    heartbeat_state.record_activity();
                    let decoded = match frame {
                        Some(Ok(Message::Text(text))) => self.codec.decode_text(&text),
                        Some(Ok(Message::Binary(data))) => self.codec.decode_binary(&data),
                        Some(Ok(Message::Ping(data))) => {
                            self.write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| ConnectionError::Transport(e.to_string()))?;
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(ConnectionError::Closed(close_reason(frame.as_ref())));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
                        None => return Err(ConnectionError::Closed("stream ended".to_string())),
                    };

                    metrics::record_frame_received();
                    match decoded {
                        Ok(msg) => {
                            if self.dispatch(msg).await?.is_break() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            metrics::record_decode_error();
                            tracing::warn!(error = %e, "Skipping undecodable frame");
                        }
                    }
                }
            }
        }
    }

    /// `Break` when a local close was requested mid-delivery.
    async fn dispatch(
        &mut self,
        msg: ProtocolMessage,
    ) -> Result<ControlFlow<()>, ConnectionError> {
        let Progress::Data(msg) = self.handshake.on_message(msg)? else {
            return Ok(ControlFlow::Continue(()));
        };

        for result in quotes_from(&msg) {
            match result {
                Ok(quote) => match self.deliver(StreamEvent::Quote(quote)).await {
                    Delivery::Sent => {}
                    Delivery::CloseRequested => return Ok(ControlFlow::Break(())),
                    Delivery::ConsumerGone => {
                        return Err(ConnectionError::Closed("consumer dropped".to_string()));
                    }
                },
                Err(e) => {
                    metrics::record_decode_error();
                    tracing::warn!(error = %e, "Skipping undecodable quote");
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// DETACH, CLOSE, then the WebSocket close frame; waits briefly for the end.
async fn graceful_close(
    codec: &FrameCodec,
    channel: Option<&str>,
    write: &mut WsWrite,
    read: &mut WsRead,
) -> Result<(), ConnectionError> {
    let mut frames = Vec::with_capacity(2);
    if let Some(channel) = channel {
        frames.push(ProtocolMessage::detach(channel));
    }
    frames.push(ProtocolMessage::close());

    for msg in &frames {
        let frame = codec.encode(msg).map_err(codec_error)?;
        write
            .send(frame)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    }
    write
        .send(Message::Close(None))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;

    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = read.next().await {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!("Broker did not finish close handshake in time");
    }
    tracing::info!("Live stream closed");
    Ok(())
}

fn close_reason(
    frame: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame>,
) -> String {
    frame.map_or_else(
        || "server closed the connection".to_string(),
        |f| format!("server closed the connection ({}): {}", f.code, f.reason),
    )
}

fn codec_error(e: CodecError) -> ConnectionError {
    ConnectionError::Codec(e.to_string())
}
