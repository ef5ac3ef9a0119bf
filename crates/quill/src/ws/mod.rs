//! WebSocket <https://datatracker.ietf.org/doc/html/rfc6455>
//!
//! No extension is ever negotiated, so the reserved bits must always be
//! zero.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod frame;
pub use frame::{Opcode, WsFrame};

mod handshake;
pub use handshake::*;

mod session;
pub use session::*;

/// Limits for WebSocket connections
#[derive(Debug, Clone)]
pub struct WsConf {
    /// Largest message accepted, across all of its fragments. Past that the
    /// connection is closed with 1009.
    pub max_message_size: usize,

    /// Outgoing messages are split into frames of at most this many
    /// payload bytes
    pub max_outbound_frame: usize,

    /// How long a connection may stay silent before we ping it. If it's
    /// still silent after another interval, it is closed.
    pub ping_interval: Duration,
}

impl Default for WsConf {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            max_outbound_frame: 64 * 1024,
            ping_interval: Duration::from_secs(40),
        }
    }
}

/// Close status codes, cf. RFC 6455 section 7.4.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    Unsupported = 1003,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    InternalError = 1011,
}

impl CloseCode {
    pub fn repr(self) -> u16 {
        self as u16
    }

    /// Whether a peer may put `code` in a close frame. 1005, 1006 and 1015
    /// are reserved for local use, 1004 is reserved.
    pub fn is_valid_on_wire(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WsError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),

    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload of {len} bytes, at most 125 allowed")]
    ControlFrameTooLarge { len: u64 },

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    MessageInProgress,

    #[error("message of {size} bytes exceeds the {max} bytes we allow")]
    MessageTooBig { size: u64, max: usize },

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("close frame with a 1-byte payload")]
    ClosePayloadTooShort,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
}

impl WsError {
    /// The code of the close frame we send before dropping the connection
    pub fn close_code(&self) -> CloseCode {
        match self {
            WsError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            WsError::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// A complete (reassembled) data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

pub(crate) enum Command {
    Send(Message),
    Close(CloseCode, String),
}

/// Returned by [WsSender] once the connection is gone
#[derive(Debug, thiserror::Error)]
#[error("websocket connection is closed")]
pub struct WsClosed;

/// A handle to send messages on a WebSocket connection. It can be cloned
/// and kept around, e.g. to push messages from another task. Sending never
/// waits: messages are queued until the connection gets to them.
#[derive(Clone)]
pub struct WsSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl WsSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsClosed> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WsClosed> {
        self.send(Message::Binary(data.into()))
    }

    pub fn send(&self, msg: Message) -> Result<(), WsClosed> {
        self.tx.send(Command::Send(msg)).map_err(|_| WsClosed)
    }

    /// Starts the closing handshake
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), WsClosed> {
        self.tx
            .send(Command::Close(code, reason.into()))
            .map_err(|_| WsClosed)
    }
}

/// What the application does with a WebSocket connection. Every callback
/// defaults to doing nothing.
#[allow(async_fn_in_trait)] // we never require Send
pub trait WebSocketHandler {
    /// Called once the handshake response is written
    async fn on_open(&mut self, _ws: &WsSender) {}

    async fn on_message(&mut self, _ws: &WsSender, _msg: Message) {}

    /// Called once, when the connection is done for whatever reason. `code`
    /// is what the peer sent, if it sent a close frame with one.
    async fn on_close(&mut self, _code: Option<u16>, _reason: &str) {}
}
