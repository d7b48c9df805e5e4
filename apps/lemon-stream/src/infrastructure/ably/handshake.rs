//! Connection Handshake
//!
//! Tracks the broker side of the connection lifecycle and classifies each
//! inbound protocol message:
//!
//! ```text
//! Disconnected ─► Connecting ─CONNECTED─► Connected ─ATTACH─► Subscribing
//!     ─ATTACHED + publish─► Subscribed ─on_message─► Streaming
//! ```
//!
//! ERROR, DISCONNECTED, CLOSED and DETACHED for the data channel end the
//! connection; the caller never tries to resume it.

use super::messages::{Action, ProtocolMessage};
use crate::application::ports::{ConnectionError, StreamState};

/// What an inbound message means for the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Nothing for the caller to act on (HEARTBEAT, ACK, ...).
    Idle,
    /// Broker accepted the credentials.
    Connected {
        /// Broker-assigned connection id.
        connection_id: Option<String>,
    },
    /// Data channel attached.
    Attached,
    /// Data frame to decode.
    Data(ProtocolMessage),
}

/// Handshake state machine for one connection.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    channel: Option<String>,
    state: StreamState,
}

impl Handshake {
    /// Handshake for a fresh transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Data channel name, once attaching has started.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Transport is being opened.
    pub const fn on_transport_opening(&mut self) {
        self.state = StreamState::Connecting;
    }

    /// Build the ATTACH request for `channel` and move to `Subscribing`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidState`] unless connected.
    pub fn begin_attach(&mut self, channel: &str) -> Result<ProtocolMessage, ConnectionError> {
        self.require(StreamState::Connected)?;
        self.state = StreamState::Subscribing;
        self.channel = Some(channel.to_string());
        Ok(ProtocolMessage::attach(channel))
    }

    /// Subscription list sent.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidState`] unless subscribing.
    pub fn on_subscription_sent(&mut self) -> Result<(), ConnectionError> {
        self.require(StreamState::Subscribing)?;
        self.state = StreamState::Subscribed;
        Ok(())
    }

    /// Quotes are now forwarded to the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidState`] unless subscribed.
    pub fn on_streaming(&mut self) -> Result<(), ConnectionError> {
        self.require(StreamState::Subscribed)?;
        self.state = StreamState::Streaming;
        Ok(())
    }

    /// Connection is gone.
    pub const fn on_closed(&mut self) {
        self.state = StreamState::Disconnected;
    }

    /// Classify an inbound message, failing on terminal ones.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Rejected`] for ERROR, and for DISCONNECTED or
    ///   CLOSED before CONNECTED
    /// - [`ConnectionError::Closed`] for DISCONNECTED, CLOSED or DETACHED of
    ///   the data channel afterwards
    pub fn on_message(&mut self, msg: ProtocolMessage) -> Result<Progress, ConnectionError> {
        let Some(action) = msg.action() else {
            tracing::trace!(action = msg.action, "Ignoring unknown protocol action");
            return Ok(Progress::Idle);
        };

        match action {
            Action::Connected => {
                if self.state == StreamState::Connecting {
                    self.state = StreamState::Connected;
                }
                Ok(Progress::Connected {
                    connection_id: msg.connection_id,
                })
            }
            Action::Error => {
                let (code, message) = msg.error_parts();
                self.state = StreamState::Disconnected;
                Err(ConnectionError::Rejected { code, message })
            }
            Action::Disconnected | Action::Closed => {
                let (code, message) = msg.error_parts();
                let before_connect = matches!(
                    self.state,
                    StreamState::Disconnected | StreamState::Connecting
                );
                self.state = StreamState::Disconnected;
                if before_connect {
                    Err(ConnectionError::Rejected { code, message })
                } else {
                    Err(ConnectionError::Closed(format!(
                        "{} ({code}): {message}",
                        action.as_str()
                    )))
                }
            }
            Action::Attached if self.owns(&msg) => Ok(Progress::Attached),
            Action::Detached if self.owns(&msg) => {
                let (code, message) = msg.error_parts();
                self.state = StreamState::Disconnected;
                Err(ConnectionError::Closed(format!(
                    "channel detached ({code}): {message}"
                )))
            }
            Action::Message => Ok(Progress::Data(msg)),
            Action::Nack => {
                let (code, message) = msg.error_parts();
                tracing::warn!(code, message = %message, "Broker rejected publish");
                Ok(Progress::Idle)
            }
            _ => {
                tracing::trace!(action = %action, "Ignoring protocol message");
                Ok(Progress::Idle)
            }
        }
    }

    fn owns(&self, msg: &ProtocolMessage) -> bool {
        self.channel.as_deref().is_some_and(|c| msg.is_for(c))
    }

    fn require(&self, expected: StreamState) -> Result<(), ConnectionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConnectionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}
