//! # Sockudo-Wire: RFC 6455 WebSocket protocol engine
//!
//! The wire-level core of a WebSocket endpoint, usable from either side of
//! the connection and independent of any I/O runtime.
//!
//! ## Layers
//!
//! - **Frame codec** ([`frame`]): encode and incrementally decode frames,
//!   with every length tier and strict header validation
//! - **Masking** ([`mask`]): self-inverse XOR transform and key generation
//! - **Handshake** ([`handshake`]): HTTP/1.1 upgrade negotiation for clients
//!   and servers, including subprotocol selection
//! - **Connection** ([`connection`]): sans-IO state machine covering
//!   fragmentation, control frames and the close handshake
//! - **Stream** (`stream`, `tokio-runtime` feature): async driver over any
//!   `AsyncRead + AsyncWrite` transport
//!
//! ## Example
//!
//! ```
//! use sockudo_wire::{Config, Connection, Event, Role};
//!
//! let mut conn = Connection::accepted(Role::Server, Config::default());
//! conn.send_text("hello").unwrap();
//! let wire = conn.take_outgoing();
//! assert_eq!(&wire[..2], &[0x81, 0x05]);
//!
//! for event in conn.feed(&[]) {
//!     if let Event::Message(msg) = event {
//!         println!("{:?}", msg);
//!     }
//! }
//! ```

use std::time::Duration;

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod utf8;

#[cfg(feature = "tokio-runtime")]
pub mod stream;

pub use connection::{Closure, Connection, ConnectionState, Event, Handler};
pub use error::{CloseReason, Error, ErrorKind, HandshakeError, Result};
pub use frame::{Frame, FrameParser, OpCode};
pub use handshake::{ClientHandshake, HandshakeResult, ServerHandshake};
pub use protocol::{Message, Role};

#[cfg(feature = "tokio-runtime")]
pub use stream::WebSocketStream;

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Default write buffer capacity (16KB)
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default frame and message size limit (16MB)
pub const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encoded in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encoded in the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_wire::Config;
///
/// let config = Config::builder()
///     .max_payload_length(1024 * 1024)
///     .close_timeout(Duration::from_secs(2))
///     .protocols(["chat.v2", "chat.v1"])
///     .build();
/// assert_eq!(config.max_frame_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum reassembled message size (default: 16MB)
    pub max_message_size: usize,
    /// Maximum single frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Initial write buffer capacity (default: 16KB)
    pub write_buffer_size: usize,
    /// How long a locally initiated close waits for the peer (default: 5s)
    pub close_timeout: Duration,
    /// Reject text messages that are not valid UTF-8 (default: true)
    pub validate_utf8: bool,
    /// Split outgoing messages into frames of at most this many bytes
    /// (default: None, one frame per message)
    pub fragment_size: Option<usize>,
    /// Subprotocols: offered in order by a client, supported by a server
    pub protocols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_SIZE,
            max_frame_size: DEFAULT_MAX_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            close_timeout: Duration::from_secs(5),
            validate_utf8: true,
            fragment_size: None,
            protocols: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set both the message and frame size limit
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set initial write buffer capacity
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the close handshake deadline
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Enable or disable UTF-8 validation of text messages
    pub fn validate_utf8(mut self, enabled: bool) -> Self {
        self.config.validate_utf8 = enabled;
        self
    }

    /// Fragment outgoing messages larger than `size` bytes
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.fragment_size = Some(size);
        self
    }

    /// Set subprotocols, in preference order
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Closure, Connection, ConnectionState, Event, Handler};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::{Message, Role};
    #[cfg(feature = "tokio-runtime")]
    pub use crate::stream::WebSocketStream;
}
