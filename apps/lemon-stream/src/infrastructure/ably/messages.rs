//! Ably Realtime Protocol Messages
//!
//! Wire types for the Ably realtime protocol as used by the lemon.markets
//! live stream. Every frame carries one [`ProtocolMessage`]; the `action`
//! field says what it is.
//!
//! # Flow
//!
//! ```text
//! client                               broker
//!   │  (WebSocket open, credentials in query)  │
//!   │ ◄──────────────────── CONNECTED (4) ──── │
//!   │ ── ATTACH (10) channel=<user_id> ──────► │
//!   │ ◄──────────────────── ATTACHED (11) ──── │
//!   │ ── MESSAGE (15) <user_id>.subscriptions ► │
//!   │ ◄──────────── MESSAGE (15) quotes ────── │
//!   │ ── DETACH (12) / CLOSE (7) ────────────► │
//! ```
//!
//! # Quote Payload
//!
//! ```json
//! {"isin":"US0378331005","mic":"XMUN","a":1455600,"b":1453800,"t":1672567200123}
//! ```
//!
//! Prices are integer ten-thousandths, `t` is epoch milliseconds. The payload
//! arrives either as an object or as a JSON-encoded string.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::instrument::Isin;
use crate::domain::quote::Quote;

/// Name of the message carrying the instrument list.
pub const SUBSCRIPTION_MESSAGE_NAME: &str = "isins";

/// Number of decimal places in wire prices.
pub const PRICE_SCALE: u32 = 4;

// =============================================================================
// Actions
// =============================================================================

/// Protocol message action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Keep-alive from the broker.
    Heartbeat = 0,
    /// Publish acknowledged.
    Ack = 1,
    /// Publish rejected.
    Nack = 2,
    /// Connect request.
    Connect = 3,
    /// Connection established.
    Connected = 4,
    /// Disconnect request.
    Disconnect = 5,
    /// Connection lost; may be resumed by a new connection.
    Disconnected = 6,
    /// Graceful close request.
    Close = 7,
    /// Connection closed.
    Closed = 8,
    /// Connection or channel error.
    Error = 9,
    /// Attach to a channel.
    Attach = 10,
    /// Channel attached.
    Attached = 11,
    /// Detach from a channel.
    Detach = 12,
    /// Channel detached.
    Detached = 13,
    /// Presence update.
    Presence = 14,
    /// Data message.
    Message = 15,
    /// Presence sync.
    Sync = 16,
    /// Re-authentication.
    Auth = 17,
}

impl Action {
    /// Map a wire code to an action.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Heartbeat,
            1 => Self::Ack,
            2 => Self::Nack,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Disconnect,
            6 => Self::Disconnected,
            7 => Self::Close,
            8 => Self::Closed,
            9 => Self::Error,
            10 => Self::Attach,
            11 => Self::Attached,
            12 => Self::Detach,
            13 => Self::Detached,
            14 => Self::Presence,
            15 => Self::Message,
            16 => Self::Sync,
            17 => Self::Auth,
            _ => return None,
        })
    }

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Upper-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Disconnect => "DISCONNECT",
            Self::Disconnected => "DISCONNECTED",
            Self::Close => "CLOSE",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
            Self::Attach => "ATTACH",
            Self::Attached => "ATTACHED",
            Self::Detach => "DETACH",
            Self::Detached => "DETACHED",
            Self::Presence => "PRESENCE",
            Self::Message => "MESSAGE",
            Self::Sync => "SYNC",
            Self::Auth => "AUTH",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Protocol Message
// =============================================================================

/// Error details attached to ERROR, DISCONNECTED and some channel messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Ably error code (e.g. 40142 token expired).
    #[serde(default)]
    pub code: i64,

    /// HTTP-equivalent status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Human readable description.
    #[serde(default)]
    pub message: String,
}

/// One message inside a MESSAGE frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Payload encoding hint (e.g. `json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// One realtime protocol frame.
///
/// Unknown fields are ignored; only what the client needs is modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// Raw action code, see [`Action`].
    pub action: u8,

    /// Channel name for channel-scoped actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Connection id assigned on CONNECTED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Publish serial for MESSAGE / ACK / NACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<u64>,

    /// Error details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Data messages of a MESSAGE frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<DataMessage>>,
}

impl ProtocolMessage {
    fn bare(action: Action) -> Self {
        Self {
            action: action.code(),
            channel: None,
            connection_id: None,
            msg_serial: None,
            error: None,
            messages: None,
        }
    }

    fn on_channel(action: Action, channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::bare(action)
        }
    }

    /// ATTACH `channel`.
    #[must_use]
    pub fn attach(channel: &str) -> Self {
        Self::on_channel(Action::Attach, channel)
    }

    /// DETACH `channel`.
    #[must_use]
    pub fn detach(channel: &str) -> Self {
        Self::on_channel(Action::Detach, channel)
    }

    /// CLOSE the connection.
    #[must_use]
    pub fn close() -> Self {
        Self::bare(Action::Close)
    }

    /// Publish the comma-separated instrument list to `channel`.
    #[must_use]
    pub fn subscription(channel: &str, msg_serial: u64, instruments: &[Isin]) -> Self {
        let list = instruments
            .iter()
            .map(Isin::as_str)
            .collect::<Vec<_>>()
            .join(",");

        Self {
            msg_serial: Some(msg_serial),
            messages: Some(vec![DataMessage {
                name: Some(SUBSCRIPTION_MESSAGE_NAME.to_string()),
                data: Some(serde_json::Value::String(list)),
                encoding: None,
            }]),
            ..Self::on_channel(Action::Message, channel)
        }
    }

    /// Decoded action, `None` for codes this client does not know.
    #[must_use]
    pub const fn action(&self) -> Option<Action> {
        Action::from_code(self.action)
    }

    /// Whether this frame has `action`.
    #[must_use]
    pub fn is(&self, action: Action) -> bool {
        self.action == action.code()
    }

    /// Whether this frame is scoped to `channel`.
    #[must_use]
    pub fn is_for(&self, channel: &str) -> bool {
        self.channel.as_deref() == Some(channel)
    }

    /// Error code and message, defaulting when the broker sent none.
    #[must_use]
    pub fn error_parts(&self) -> (i64, String) {
        self.error.as_ref().map_or_else(
            || (0, format!("{} without error details", self.action_name())),
            |e| (e.code, e.message.clone()),
        )
    }

    /// Action name for logs, including unknown codes.
    #[must_use]
    pub fn action_name(&self) -> String {
        self.action()
            .map_or_else(|| format!("ACTION({})", self.action), |a| a.as_str().to_string())
    }
}

// =============================================================================
// Quote Payload
// =============================================================================

/// Quote as published by lemon.markets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotePayload {
    /// Instrument identifier.
    pub isin: String,
    /// Exchange MIC.
    pub mic: String,
    /// Ask in ten-thousandths.
    pub a: i64,
    /// Bid in ten-thousandths.
    pub b: i64,
    /// Epoch milliseconds.
    pub t: i64,
}

/// Why a payload could not become a [`Quote`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Payload did not match the quote schema.
    #[error("invalid quote payload: {0}")]
    Schema(String),

    /// ISIN failed validation.
    #[error("invalid ISIN in quote: {0}")]
    Isin(String),

    /// Timestamp out of range.
    #[error("quote timestamp out of range: {0}")]
    Timestamp(i64),
}

impl QuotePayload {
    /// Parse a payload from a message `data` value.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Schema`] if `data` is neither a quote object nor
    /// a string holding one.
    pub fn from_data(data: &serde_json::Value) -> Result<Self, PayloadError> {
        match data {
            serde_json::Value::String(text) => {
                serde_json::from_str(text).map_err(|e| PayloadError::Schema(e.to_string()))
            }
            other => {
                Self::deserialize(other).map_err(|e| PayloadError::Schema(e.to_string()))
            }
        }
    }

    /// Convert wire units to a domain quote.
    ///
    /// # Errors
    ///
    /// Returns an error if the ISIN is invalid or the timestamp is out of range.
    pub fn into_quote(self) -> Result<Quote, PayloadError> {
        let isin = Isin::parse(&self.isin).map_err(|e| PayloadError::Isin(e.to_string()))?;
        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp_millis(self.t).ok_or(PayloadError::Timestamp(self.t))?;

        Ok(Quote::new(
            isin,
            self.mic,
            Decimal::new(self.a, PRICE_SCALE),
            Decimal::new(self.b, PRICE_SCALE),
            timestamp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_codes_round_trip() {
        for code in 0..=17 {
            let action = Action::from_code(code).unwrap();
            assert_eq!(action.code(), code);
        }
        assert!(Action::from_code(18).is_none());
        assert_eq!(Action::Attached.to_string(), "ATTACHED");
    }

    #[test]
    fn subscription_message_shape() {
        let instruments = vec![
            Isin::parse("US0378331005").unwrap(),
            Isin::parse("DE0007164600").unwrap(),
        ];
        let msg = ProtocolMessage::subscription("user_1.subscriptions", 0, &instruments);

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "action": 15,
                "channel": "user_1.subscriptions",
                "msgSerial": 0,
                "messages": [{"name": "isins", "data": "US0378331005,DE0007164600"}]
            })
        );
    }

    #[test]
    fn attach_omits_empty_fields() {
        let value = serde_json::to_value(ProtocolMessage::attach("user_1")).unwrap();
        assert_eq!(value, json!({"action": 10, "channel": "user_1"}));
    }

    #[test]
    fn decodes_connected_with_unknown_fields() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "action": 4,
            "connectionId": "abc",
            "connectionDetails": {"clientId": "user_1", "maxMessageSize": 65536}
        }))
        .unwrap();

        assert_eq!(msg.action(), Some(Action::Connected));
        assert_eq!(msg.connection_id.as_deref(), Some("abc"));
    }

    #[test]
    fn error_parts_from_error_frame() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "action": 9,
            "error": {"code": 40142, "statusCode": 401, "message": "Token expired"}
        }))
        .unwrap();

        assert_eq!(msg.error_parts(), (40142, "Token expired".to_string()));
    }

    #[test]
    fn quote_payload_from_object_and_string() {
        let object = json!({"isin": "US0378331005", "mic": "XMUN", "a": 1_455_600, "b": 1_453_800, "t": 1_672_567_200_123_i64});
        let string = serde_json::Value::String(object.to_string());

        let from_object = QuotePayload::from_data(&object).unwrap();
        let from_string = QuotePayload::from_data(&string).unwrap();
        assert_eq!(from_object, from_string);

        let quote = from_object.into_quote().unwrap();
        assert_eq!(quote.exchange, "XMUN");
        assert_eq!(quote.ask, Decimal::new(14556, 2));
        assert_eq!(quote.bid, Decimal::new(14538, 2));
        assert_eq!(quote.timestamp.timestamp_millis(), 1_672_567_200_123);
    }

    #[test]
    fn quote_payload_rejects_bad_isin() {
        let payload = QuotePayload {
            isin: "US0378331006".to_string(),
            mic: "XMUN".to_string(),
            a: 1,
            b: 1,
            t: 0,
        };
        assert!(matches!(payload.into_quote(), Err(PayloadError::Isin(_))));
    }

    #[test]
    fn quote_payload_rejects_wrong_shape() {
        let err = QuotePayload::from_data(&json!({"isin": "US0378331005"})).unwrap_err();
        assert!(matches!(err, PayloadError::Schema(_)));
    }
}
