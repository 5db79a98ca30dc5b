//! Error types for the WebSocket engine
//!
//! Every failure maps onto one of five [`ErrorKind`]s. Protocol-level kinds
//! carry the close code the connection sends before it gives up.

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upgrade exchange failed; the connection never opened
    Handshake,
    /// Peer violated RFC 6455; fatal to the connection
    Protocol,
    /// Frame or reassembled message exceeds the configured limit
    MessageTooLarge,
    /// Underlying read/write failure or EOF
    Transport,
    /// Caller misuse, reported synchronously and never sent on the wire
    Usage,
}

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Transport reached EOF
    ConnectionClosed,
    /// Upgrade handshake failed
    Handshake(HandshakeError),
    /// Protocol violation
    Protocol(&'static str),
    /// Opcode outside the six defined by RFC 6455
    InvalidOpcode(u8),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Close frame carried a code that may not appear on the wire
    InvalidCloseCode(u16),
    /// Frame or message exceeds the configured maximum
    MessageTooLarge {
        /// Size announced by the peer (or accumulated so far)
        size: u64,
        /// Configured limit
        max: usize,
    },
    /// Outgoing payload cannot be framed (control frame > 125 bytes, or >= 2^63)
    FrameTooLarge(u64),
    /// Operation not allowed in the current connection state
    InvalidState(&'static str),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ConnectionClosed => ErrorKind::Transport,
            Error::Handshake(_) => ErrorKind::Handshake,
            Error::Protocol(_)
            | Error::InvalidOpcode(_)
            | Error::InvalidUtf8
            | Error::InvalidCloseCode(_) => ErrorKind::Protocol,
            Error::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Error::FrameTooLarge(_) | Error::InvalidState(_) => ErrorKind::Usage,
        }
    }

    /// Close code to send to the peer when this error terminates a connection.
    ///
    /// `None` means no Close frame goes on the wire.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(_) | Error::InvalidOpcode(_) | Error::InvalidCloseCode(_) => {
                Some(CloseReason::PROTOCOL_ERROR)
            }
            Error::InvalidUtf8 => Some(CloseReason::INVALID_PAYLOAD),
            Error::MessageTooLarge { .. } => Some(CloseReason::TOO_BIG),
            _ => None,
        }
    }
}

/// Reasons the HTTP upgrade exchange can fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request or response head could not be parsed
    InvalidHttp(&'static str),
    /// Head exceeded the header size limit
    TooLarge,
    /// A required header is absent or has the wrong value
    MissingHeader(&'static str),
    /// `Sec-WebSocket-Key` is not base64 of 16 bytes
    InvalidKey,
    /// `Sec-WebSocket-Version` other than 13
    UnsupportedVersion(String),
    /// Server answered with something other than 101
    NotSwitchingProtocols(u16),
    /// `Sec-WebSocket-Accept` does not match the key we sent
    AcceptMismatch {
        /// Value derived from our key
        expected: String,
        /// Value the server sent
        actual: String,
    },
    /// Server selected a subprotocol the client never offered
    UnexpectedProtocol(String),
}

impl HandshakeError {
    /// HTTP status a server answers with when rejecting for this reason
    pub fn status(&self) -> u16 {
        match self {
            HandshakeError::UnsupportedVersion(_) => 426,
            HandshakeError::TooLarge => 431,
            _ => 400,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidHttp(msg) => write!(f, "invalid HTTP: {}", msg),
            HandshakeError::TooLarge => write!(f, "handshake head too large"),
            HandshakeError::MissingHeader(name) => write!(f, "missing or invalid {}", name),
            HandshakeError::InvalidKey => write!(f, "invalid Sec-WebSocket-Key"),
            HandshakeError::UnsupportedVersion(v) => {
                write!(f, "unsupported WebSocket version: {}", v)
            }
            HandshakeError::NotSwitchingProtocols(status) => {
                write!(f, "expected 101 Switching Protocols, got {}", status)
            }
            HandshakeError::AcceptMismatch { expected, actual } => write!(
                f,
                "Sec-WebSocket-Accept mismatch: expected {}, got {}",
                expected, actual
            ),
            HandshakeError::UnexpectedProtocol(p) => {
                write!(f, "server selected unrequested subprotocol {:?}", p)
            }
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (local only)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (local only)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Longest reason that still fits a control frame next to the code
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear in a Close frame
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Parse a Close frame payload.
    ///
    /// An empty payload carries no code. One byte or a non UTF-8 reason is
    /// rejected first; then a code outside the sendable ranges.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("close payload of one byte")),
            _ => {
                let reason =
                    simdutf8::basic::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !Self::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                Ok(Some(Self::new(code, reason)))
            }
        }
    }

    /// Encode as a Close frame payload (code big-endian, then reason)
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code);
        payload.put_slice(self.reason.as_bytes());
        payload.freeze()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Handshake(e) => write!(f, "Handshake failed: {}", e),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::InvalidOpcode(op) => write!(f, "Invalid opcode: 0x{:X}", op),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text payload"),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            Error::FrameTooLarge(len) => write!(f, "Frame too large: {} bytes", len),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        Error::Handshake(e)
    }
}
