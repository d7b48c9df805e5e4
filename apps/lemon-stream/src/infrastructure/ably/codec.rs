//! Stream Codec Module
//!
//! Encodes and decodes realtime protocol frames in the two formats the
//! broker offers:
//!
//! - **JSON**: one protocol message per text frame
//! - **`MessagePack`**: one protocol message per binary frame, field names
//!   kept as map keys
//!
//! The format is chosen on connect (`format=` query parameter) and fixed for
//! the lifetime of the connection.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use super::messages::{Action, PayloadError, ProtocolMessage, QuotePayload};
use crate::domain::quote::Quote;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// `MessagePack` decoding failed.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame type does not match the negotiated format.
    #[error("unexpected {frame} frame for {format} format")]
    UnexpectedFrame {
        /// Received frame kind.
        frame: &'static str,
        /// Negotiated format.
        format: WireFormat,
    },
}

/// Wire format negotiated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// `MessagePack` binary frames.
    MsgPack,
}

impl WireFormat {
    /// Value of the `format` query parameter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol frame codec for one wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec {
    format: WireFormat,
}

impl FrameCodec {
    /// Create a codec for `format`.
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Negotiated format.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a protocol message into a WebSocket frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Message, CodecError> {
        match self.format {
            WireFormat::Json => Ok(Message::Text(serde_json::to_string(msg)?.into())),
            WireFormat::MsgPack => Ok(Message::Binary(rmp_serde::to_vec_named(msg)?.into())),
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid protocol message or the
    /// format is `MessagePack`.
    pub fn decode_text(&self, text: &str) -> Result<ProtocolMessage, CodecError> {
        match self.format {
            WireFormat::Json => Ok(serde_json::from_str(text)?),
            WireFormat::MsgPack => Err(CodecError::UnexpectedFrame {
                frame: "text",
                format: self.format,
            }),
        }
    }

    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a valid protocol message or the
    /// format is JSON.
    pub fn decode_binary(&self, data: &[u8]) -> Result<ProtocolMessage, CodecError> {
        match self.format {
            WireFormat::MsgPack => Ok(rmp_serde::from_slice(data)?),
            WireFormat::Json => Err(CodecError::UnexpectedFrame {
                frame: "binary",
                format: self.format,
            }),
        }
    }
}

/// Extract quotes from a MESSAGE frame, in order.
///
/// Entries without data yield nothing; malformed entries yield an error in
/// their position so the caller can log and skip them.
#[must_use]
pub fn quotes_from(msg: &ProtocolMessage) -> Vec<Result<Quote, PayloadError>> {
    if !msg.is(Action::Message) {
        return Vec::new();
    }

    msg.messages
        .iter()
        .flatten()
        .filter_map(|m| m.data.as_ref())
        .map(|data| QuotePayload::from_data(data).and_then(QuotePayload::into_quote))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::Isin;
    use serde_json::json;

    fn quote_frame() -> ProtocolMessage {
        serde_json::from_value(json!({
            "action": 15,
            "channel": "user_1",
            "messages": [
                {"name": "quote", "data": {"isin": "US0378331005", "mic": "XMUN", "a": 1_455_600, "b": 1_453_800, "t": 1_000}},
                {"name": "quote", "data": "{\"isin\":\"DE0007164600\",\"mic\":\"XETR\",\"a\":1205000,\"b\":1204000,\"t\":2000}"},
                {"name": "quote", "data": {"isin": "bogus"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn json_text_frame_round_trip() {
        let codec = FrameCodec::new(WireFormat::Json);
        let msg = ProtocolMessage::attach("user_1");

        let Message::Text(text) = codec.encode(&msg).unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(codec.decode_text(&text).unwrap(), msg);
    }

    #[test]
    fn msgpack_binary_frame_round_trip() {
        let codec = FrameCodec::new(WireFormat::MsgPack);
        let msg = ProtocolMessage::subscription(
            "user_1.subscriptions",
            0,
            &[Isin::parse("US0378331005").unwrap()],
        );

        let Message::Binary(bytes) = codec.encode(&msg).unwrap() else {
            panic!("expected binary frame");
        };
        assert_eq!(codec.decode_binary(&bytes).unwrap(), msg);
    }

    #[test]
    fn frame_kind_must_match_format() {
        let json = FrameCodec::new(WireFormat::Json);
        assert!(matches!(
            json.decode_binary(&[0x80]),
            Err(CodecError::UnexpectedFrame { frame: "binary", .. })
        ));

        let msgpack = FrameCodec::new(WireFormat::MsgPack);
        assert!(matches!(
            msgpack.decode_text("{}"),
            Err(CodecError::UnexpectedFrame { frame: "text", .. })
        ));
    }

    #[test]
    fn quotes_keep_frame_order() {
        let results = quotes_from(&quote_frame());
        assert_eq!(results.len(), 3);

        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert_eq!(first.isin.as_str(), "US0378331005");
        assert_eq!(second.isin.as_str(), "DE0007164600");
        assert!(results[2].is_err());
    }

    #[test]
    fn msgpack_quote_payload_decodes() {
        let codec = FrameCodec::new(WireFormat::MsgPack);
        let bytes = rmp_serde::to_vec_named(&quote_frame()).unwrap();

        let msg = codec.decode_binary(&bytes).unwrap();
        let quotes: Vec<_> = quotes_from(&msg).into_iter().filter_map(Result::ok).collect();
        assert_eq!(quotes.len(), 2);
    }

    #[test]
    fn non_message_frames_have_no_quotes() {
        assert!(quotes_from(&ProtocolMessage::close()).is_empty());
    }

    #[test]
    fn wire_format_names() {
        assert_eq!(WireFormat::MsgPack.as_str(), "msgpack");
        let format: WireFormat = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(format, WireFormat::MsgPack);
    }
}
