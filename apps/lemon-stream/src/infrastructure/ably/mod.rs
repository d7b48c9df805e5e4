//! Ably Realtime Adapter
//!
//! WebSocket client for the lemon.markets live stream, which is delivered
//! through the Ably realtime broker:
//!
//! - `messages`: protocol frames and the quote payload
//! - `codec`: JSON text / `MessagePack` binary framing
//! - `handshake`: CONNECTED → ATTACHED state machine
//! - `heartbeat`: ping and idle detection
//! - `client`: [`AblyConnector`] / [`AblyConnection`]

pub mod client;
pub mod codec;
pub mod handshake;
pub mod heartbeat;
pub mod messages;

pub use client::{AblyConnection, AblyConnector, DEFAULT_STREAM_URL, StreamClientConfig};
pub use codec::{CodecError, FrameCodec, WireFormat};
pub use heartbeat::HeartbeatConfig;
pub use messages::{Action, ProtocolMessage, QuotePayload};
