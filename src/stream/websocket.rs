//! WebSocket stream implementation
//!
//! Drives a [`Connection`] over an async transport: bytes read from the
//! transport are fed in, queued output is written back after every step.

use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::Config;
use crate::connection::{Closure, Connection, Event};
use crate::error::{Error, Result};
use crate::handshake::HandshakeResult;
use crate::protocol::{Message, Role};

/// A WebSocket stream over an async transport
///
/// # Example
///
/// ```ignore
/// use sockudo_wire::{Config, WebSocketStream};
///
/// async fn handle(socket: TcpStream) -> sockudo_wire::Result<()> {
///     let mut ws = WebSocketStream::accept(socket, Config::default()).await?;
///     while let Some(msg) = ws.recv().await? {
///         ws.send(&msg).await?;
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct WebSocketStream<S> {
    inner: S,
    conn: Connection,
    read_buf: BytesMut,
    pending: std::collections::VecDeque<Event>,
    handshake: Option<HandshakeResult>,
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport and an existing connection state machine
    pub fn from_connection(inner: S, conn: Connection) -> Self {
        Self {
            inner,
            conn,
            read_buf: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
            pending: Default::default(),
            handshake: None,
        }
    }

    /// Create a stream over an already-upgraded transport
    pub fn from_raw(inner: S, role: Role, config: Config) -> Self {
        Self::from_connection(inner, Connection::accepted(role, config))
    }

    /// Perform the client handshake over `inner`
    pub async fn connect(inner: S, config: Config, host: &str, path: &str) -> Result<Self> {
        let conn = Connection::client(config, host, path);
        let mut ws = Self::from_connection(inner, conn);
        ws.handshake().await?;
        Ok(ws)
    }

    /// Perform the server handshake over `inner`.
    ///
    /// A malformed request is answered with a 400 (or 426) response before
    /// the error is returned.
    pub async fn accept(inner: S, config: Config) -> Result<Self> {
        let mut ws = Self::from_connection(inner, Connection::server(config));
        ws.handshake().await?;
        Ok(ws)
    }

    async fn handshake(&mut self) -> Result<()> {
        self.flush().await?;
        loop {
            match self.next_event().await? {
                Some(Event::Open(result)) => {
                    debug!(path = %result.path, protocol = ?result.protocol, "websocket established");
                    self.handshake = Some(result);
                    return Ok(());
                }
                Some(Event::Error(e)) => return Err(e),
                Some(_) => {}
                None => return Err(Error::ConnectionClosed),
            }
        }
    }

    /// Path and subprotocol negotiated during the handshake
    pub fn handshake_result(&self) -> Option<&HandshakeResult> {
        self.handshake.as_ref()
    }

    /// Negotiated subprotocol
    pub fn protocol(&self) -> Option<&str> {
        self.handshake.as_ref()?.protocol.as_deref()
    }

    /// The underlying state machine
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the WebSocket stream and return the underlying stream
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Check if connection is closed
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed() && self.pending.is_empty()
    }

    /// Receive the next event.
    ///
    /// Returns `None` once `Event::Closed` has been delivered.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.conn.is_closed() {
                return Ok(None);
            }
            self.read_more().await?;
        }
    }

    /// Receive the next data message.
    ///
    /// Control frames are handled internally. Returns `Ok(None)` when the
    /// connection closes and `Err` with the error that failed it.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        while let Some(event) = self.next_event().await? {
            match event {
                Event::Message(msg) => return Ok(Some(msg)),
                Event::Error(e) => {
                    self.pending.clear();
                    return Err(e);
                }
                other => trace!(event = ?other, "event consumed by recv"),
            }
        }
        Ok(None)
    }

    /// Read once from the transport, or fire the close deadline
    async fn read_more(&mut self) -> Result<()> {
        self.read_buf.clear();
        let read = match self.conn.close_deadline() {
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(at, self.inner.read_buf(&mut self.read_buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        // deadline passed on the runtime clock
                        self.pending.extend(self.conn.poll_timeout(deadline.max(Instant::now())));
                        return Ok(());
                    }
                }
            }
            None => self.inner.read_buf(&mut self.read_buf).await,
        };

        let events = match read {
            Ok(0) => self.conn.transport_closed(),
            Ok(n) => {
                trace!(bytes = n, "read from transport");
                self.conn.feed(&self.read_buf)
            }
            Err(e) => self.conn.transport_error(e),
        };
        self.pending.extend(events);
        self.flush().await
    }

    /// Write every queued byte to the transport
    pub async fn flush(&mut self) -> Result<()> {
        if !self.conn.has_outgoing() {
            return Ok(());
        }
        let data = self.conn.take_outgoing();
        let written = async {
            self.inner.write_all(&data).await?;
            self.inner.flush().await
        }
        .await;

        if let Err(e) = written {
            let mut failure = Error::ConnectionClosed;
            for event in self.conn.transport_error(e) {
                match event {
                    Event::Error(err) => failure = err,
                    other => self.pending.push_back(other),
                }
            }
            return Err(failure);
        }
        Ok(())
    }

    /// Send a message
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.conn.send(msg)?;
        self.flush().await
    }

    /// Send a text message
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.conn.send_text(text)?;
        self.flush().await
    }

    /// Send a binary message
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.conn.send_binary(data)?;
        self.flush().await
    }

    /// Send a ping
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.conn.ping(payload)?;
        self.flush().await
    }

    /// Close the connection and wait for the close handshake.
    ///
    /// Messages arriving before the peer's Close are discarded. Resolves
    /// once the peer answers, the transport ends, or the close timeout
    /// passes.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<Closure> {
        self.conn.close(code, reason)?;
        self.flush().await?;

        while let Some(event) = self.next_event().await? {
            if let Event::Closed(closure) = event {
                return Ok(closure);
            }
        }
        self.conn.closure().cloned().ok_or(Error::ConnectionClosed)
    }
}
