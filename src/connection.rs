//! WebSocket connection state machine
//!
//! `Connection` is sans-IO: the caller pushes transport bytes in with
//! [`Connection::feed`] and pulls bytes to write out with
//! [`Connection::take_outgoing`]. It handles:
//! - The upgrade handshake (client or server side)
//! - Message fragmentation and reassembly
//! - Control frames (automatic pong, close echo)
//! - The close handshake, including a deadline for unresponsive peers
//!
//! Lifecycle: `Connecting -> Open -> Closing -> Closed`, never backwards.
//! Every fatal condition is reported exactly once as [`Event::Error`],
//! followed by [`Event::Closed`].

use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameParser, OpCode, encode_frame};
use crate::handshake::{ClientHandshake, HandshakeResult, ServerHandshake, build_rejection};
use crate::mask::generate_mask;
use crate::protocol::{Message, Role};
use crate::utf8::{Utf8Stream, validate_utf8};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade handshake in progress
    Connecting,
    /// Normal operation
    Open,
    /// Close frame sent, waiting for the peer's
    Closing,
    /// Terminal
    Closed,
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    /// Both Close frames were exchanged
    pub clean: bool,
    /// Close code exchanged, or 1006 when the connection ended without one
    pub code: Option<u16>,
    /// Close reason exchanged, if any
    pub reason: Option<String>,
}

impl Closure {
    fn abnormal() -> Self {
        Self {
            clean: false,
            code: Some(CloseReason::ABNORMAL),
            reason: None,
        }
    }
}

/// Something the application should know about
#[derive(Debug)]
pub enum Event {
    /// Handshake completed; frames may now flow
    Open(HandshakeResult),
    /// A complete data message
    Message(Message),
    /// Peer pinged us; the pong is already queued
    Ping(Bytes),
    /// Peer answered a ping (liveness signal)
    Pong(Bytes),
    /// Peer sent a Close frame
    Close(Option<CloseReason>),
    /// Fatal error; reported once, followed by `Closed`
    Error(Error),
    /// Connection reached `Closed`
    Closed(Closure),
}

impl Event {
    /// Route this event to the matching [`Handler`] callback
    pub fn dispatch<H: Handler + ?Sized>(self, handler: &mut H) {
        match self {
            Event::Open(result) => handler.on_open(&result),
            Event::Message(msg) => handler.on_message(msg.opcode(), msg.into_bytes()),
            Event::Ping(payload) => handler.on_control(OpCode::Ping, &payload),
            Event::Pong(payload) => handler.on_control(OpCode::Pong, &payload),
            Event::Close(reason) => {
                let payload = reason.map(|r| r.encode()).unwrap_or_default();
                handler.on_control(OpCode::Close, &payload)
            }
            Event::Error(err) => handler.on_error(&err),
            Event::Closed(closure) => handler.on_closed(&closure),
        }
    }
}

/// Callback interface for applications that prefer it over matching on [`Event`]
pub trait Handler {
    /// Called once per fully reassembled data message
    fn on_message(&mut self, opcode: OpCode, payload: Bytes);

    /// Called for received Ping, Pong and Close frames
    fn on_control(&mut self, _opcode: OpCode, _payload: &Bytes) {}

    /// Called when the handshake completes
    fn on_open(&mut self, _result: &HandshakeResult) {}

    /// Called once with the error that terminated the connection
    fn on_error(&mut self, _error: &Error) {}

    /// Called when the connection reaches `Closed`
    fn on_closed(&mut self, _closure: &Closure) {}
}

#[derive(Debug, Default)]
enum Pending {
    #[default]
    Done,
    Client(ClientHandshake),
    Server(ServerHandshake),
}

/// One WebSocket connection
///
/// Owns its read, write and reassembly buffers; shares nothing with other
/// connections. Drive it from one thread or task at a time.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    config: Config,
    handshake: Pending,
    parser: FrameParser,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Fragment buffer for message reassembly
    fragment_buf: BytesMut,
    /// Opcode of current fragmented message
    fragment_opcode: Option<OpCode>,
    utf8: Utf8Stream,
    close_sent: bool,
    close_code: Option<u16>,
    close_reason: Option<String>,
    close_deadline: Option<Instant>,
    closure: Option<Closure>,
}

impl Connection {
    fn with_state(role: Role, state: ConnectionState, handshake: Pending, config: Config) -> Self {
        Self {
            role,
            state,
            handshake,
            parser: FrameParser::new(config.max_frame_size),
            read_buf: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
            fragment_buf: BytesMut::new(),
            fragment_opcode: None,
            utf8: Utf8Stream::new(),
            close_sent: false,
            close_code: None,
            close_reason: None,
            close_deadline: None,
            closure: None,
            config,
        }
    }

    /// Start a client connection; the upgrade request is queued for sending
    pub fn client(config: Config, host: &str, path: &str) -> Self {
        let protocols: Vec<&str> = config.protocols.iter().map(String::as_str).collect();
        let handshake = ClientHandshake::new(host, path, &protocols);
        Self::with_client_handshake(config, handshake)
    }

    /// Start a client connection around a prepared handshake, such as one
    /// built with [`ClientHandshake::with_key`]
    pub fn with_client_handshake(config: Config, handshake: ClientHandshake) -> Self {
        let request = handshake.request().clone();

        let mut conn = Self::with_state(
            Role::Client,
            ConnectionState::Connecting,
            Pending::Client(handshake),
            config,
        );
        conn.write_buf.extend_from_slice(&request);
        conn
    }

    /// Start a server connection waiting for an upgrade request
    pub fn server(config: Config) -> Self {
        let handshake = ServerHandshake::new(&config.protocols);
        Self::with_state(
            Role::Server,
            ConnectionState::Connecting,
            Pending::Server(handshake),
            config,
        )
    }

    /// Wrap a transport whose upgrade was already negotiated elsewhere
    pub fn accepted(role: Role, config: Config) -> Self {
        Self::with_state(role, ConnectionState::Open, Pending::Done, config)
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is open for data
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Check if connection is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Close code of whichever side sent Close first
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Close reason of whichever side sent Close first
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Final outcome, once `Closed`
    pub fn closure(&self) -> Option<&Closure> {
        self.closure.as_ref()
    }

    /// Deadline after which an unanswered close is forced
    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_deadline
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process bytes received from the transport.
    ///
    /// Never blocks. Partial frames are kept until the rest arrives; bytes
    /// fed after `Closed` are discarded.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.state == ConnectionState::Closed {
            return events;
        }

        self.read_buf.extend_from_slice(data);

        if self.state == ConnectionState::Connecting {
            self.advance_handshake(&mut events);
        }

        if matches!(self.state, ConnectionState::Open | ConnectionState::Closing) {
            self.process_frames(&mut events);
        }

        events
    }

    /// Like [`feed`](Self::feed), delivering events to a [`Handler`]
    pub fn feed_with<H: Handler + ?Sized>(&mut self, data: &[u8], handler: &mut H) {
        for event in self.feed(data) {
            event.dispatch(handler);
        }
    }

    fn advance_handshake(&mut self, events: &mut Vec<Event>) {
        let outcome = match std::mem::take(&mut self.handshake) {
            Pending::Client(hs) => match hs.finish(&self.read_buf) {
                Ok(Some((result, consumed))) => Ok(Some((result, consumed, None))),
                Ok(None) => {
                    self.handshake = Pending::Client(hs);
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            Pending::Server(hs) => match hs.accept(&self.read_buf) {
                Ok(Some(accept)) => Ok(Some((accept.result, accept.consumed, Some(accept.response)))),
                Ok(None) => {
                    self.handshake = Pending::Server(hs);
                    Ok(None)
                }
                Err(e) => {
                    if let Error::Handshake(ref reason) = e {
                        self.write_buf.extend_from_slice(&build_rejection(reason));
                    }
                    Err(e)
                }
            },
            Pending::Done => Ok(None),
        };

        match outcome {
            Ok(Some((result, consumed, response))) => {
                self.read_buf.advance(consumed);
                if let Some(response) = response {
                    self.write_buf.extend_from_slice(&response);
                }
                self.state = ConnectionState::Open;
                debug!(role = ?self.role, path = %result.path, "connection open");
                events.push(Event::Open(result));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(role = ?self.role, error = %e, "handshake failed");
                self.read_buf.clear();
                self.finish(Closure::abnormal(), Some(e), events);
            }
        }
    }

    fn process_frames(&mut self, events: &mut Vec<Event>) {
        while !self.read_buf.is_empty() && self.state != ConnectionState::Closed {
            let frame = match self.parser.parse(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e, events);
                    break;
                }
            };

            trace!(
                opcode = ?frame.header.opcode,
                fin = frame.header.fin,
                len = frame.payload.len(),
                "frame received"
            );

            if let Err(e) = self.handle_frame(frame, events) {
                self.fail(e, events);
                break;
            }
        }
    }

    /// Handle a single parsed frame
    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        if frame.header.masked != self.role.expects_masked() {
            return Err(Error::Protocol(if frame.header.masked {
                "server frames must not be masked"
            } else {
                "client frames must be masked"
            }));
        }

        match frame.header.opcode {
            OpCode::Text | OpCode::Binary => self.handle_data(frame, events),
            OpCode::Continuation => self.handle_continuation(frame, events),
            OpCode::Ping => {
                if self.state == ConnectionState::Open {
                    self.queue_frame(OpCode::Pong, &frame.payload, true)?;
                }
                events.push(Event::Ping(frame.payload));
                Ok(())
            }
            OpCode::Pong => {
                events.push(Event::Pong(frame.payload));
                Ok(())
            }
            OpCode::Close => self.handle_close(frame, events),
        }
    }

    /// Handle an initial text or binary frame
    fn handle_data(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        if self.fragment_opcode.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }
        self.check_message_size(frame.payload.len())?;

        let opcode = frame.header.opcode;
        if frame.header.fin {
            let msg = self.complete_message(opcode, frame.payload)?;
            events.push(Event::Message(msg));
            return Ok(());
        }

        // Start of fragmented message
        self.fragment_opcode = Some(opcode);
        self.fragment_buf.clear();
        self.fragment_buf.extend_from_slice(&frame.payload);
        self.utf8.reset();
        self.check_partial_utf8(opcode)
    }

    /// Handle continuation frame
    fn handle_continuation(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let opcode = self
            .fragment_opcode
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        self.check_message_size(self.fragment_buf.len() + frame.payload.len())?;
        self.fragment_buf.extend_from_slice(&frame.payload);

        if !frame.header.fin {
            return self.check_partial_utf8(opcode);
        }

        self.fragment_opcode = None;
        if opcode == OpCode::Text && self.config.validate_utf8 && !self.utf8.finish(&self.fragment_buf) {
            return Err(Error::InvalidUtf8);
        }
        let data = self.fragment_buf.split().freeze();
        let msg = match opcode {
            OpCode::Text => Message::Text(data),
            _ => Message::Binary(data),
        };
        events.push(Event::Message(msg));
        Ok(())
    }

    fn check_message_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: size as u64,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn check_partial_utf8(&mut self, opcode: OpCode) -> Result<()> {
        if opcode == OpCode::Text && self.config.validate_utf8 && !self.utf8.feed(&self.fragment_buf) {
            return Err(Error::InvalidUtf8);
        }
        Ok(())
    }

    fn complete_message(&self, opcode: OpCode, payload: Bytes) -> Result<Message> {
        match opcode {
            OpCode::Text => {
                if self.config.validate_utf8 && !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Message::Text(payload))
            }
            _ => Ok(Message::Binary(payload)),
        }
    }

    /// Handle close frame
    fn handle_close(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let reason = match CloseReason::parse(&frame.payload) {
            Err(Error::InvalidCloseCode(code)) => {
                // parse already vetted the reason's UTF-8
                let text = simdutf8::basic::from_utf8(&frame.payload[2..])
                    .map_err(|_| Error::InvalidUtf8)?;
                warn!(code, "peer sent a close code that may not be used; echoing 1000");
                Some(CloseReason::new(CloseReason::NORMAL, text))
            }
            other => other?,
        };

        self.read_buf.clear();
        events.push(Event::Close(reason.clone()));

        if self.close_sent {
            // Peer acknowledged our close
            debug!(role = ?self.role, "close handshake complete");
            let closure = Closure {
                clean: true,
                code: self.close_code,
                reason: self.close_reason.clone(),
            };
            self.finish(closure, None, events);
            return Ok(());
        }

        // Peer initiated: record their code and echo it back
        self.state = ConnectionState::Closing;
        self.close_code = reason.as_ref().map(|r| r.code);
        self.close_reason = reason.as_ref().map(|r| r.reason.clone());

        let echo = reason.as_ref().map_or(CloseReason::NORMAL, |r| r.code);
        self.queue_frame(OpCode::Close, &echo.to_be_bytes(), true)?;
        self.close_sent = true;

        debug!(role = ?self.role, code = echo, "peer closed, echo queued");
        let closure = Closure {
            clean: true,
            code: self.close_code,
            reason: self.close_reason.clone(),
        };
        self.finish(closure, None, events);
        Ok(())
    }

    /// Fail the connection: queue a Close with the error's code and stop
    fn fail(&mut self, err: Error, events: &mut Vec<Event>) {
        warn!(role = ?self.role, error = %err, "failing connection");

        // Only the first Close frame counts; a later error cannot replace its code
        if !self.close_sent {
            if let Some(code) = err.close_code() {
                let text = err.to_string();
                let reason = truncate_reason(&text);
                let payload = CloseReason::new(code, reason).encode();
                if self.queue_frame(OpCode::Close, &payload, true).is_ok() {
                    self.close_sent = true;
                    self.close_code = Some(code);
                    self.close_reason = Some(reason.to_string());
                }
            }
        }

        self.read_buf.clear();
        self.fragment_buf.clear();
        self.fragment_opcode = None;

        let closure = Closure {
            clean: false,
            code: self.close_code.or(Some(CloseReason::ABNORMAL)),
            reason: self.close_reason.clone(),
        };
        self.finish(closure, Some(err), events);
    }

    fn finish(&mut self, closure: Closure, err: Option<Error>, events: &mut Vec<Event>) {
        self.state = ConnectionState::Closed;
        self.close_deadline = None;
        if let Some(err) = err {
            events.push(Event::Error(err));
        }
        self.closure = Some(closure.clone());
        events.push(Event::Closed(closure));
    }

    // ========================================================================
    // Transport notifications
    // ========================================================================

    /// The transport reached EOF.
    ///
    /// Unless the close handshake already finished, this is an abnormal
    /// closure (1006, never sent on the wire).
    pub fn transport_closed(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        if self.state != ConnectionState::Closed {
            debug!(role = ?self.role, state = ?self.state, "transport closed before close handshake");
            self.finish(Closure::abnormal(), None, &mut events);
        }
        events
    }

    /// The transport failed; the error is surfaced as-is
    pub fn transport_error(&mut self, err: std::io::Error) -> Vec<Event> {
        let mut events = Vec::new();
        if self.state != ConnectionState::Closed {
            warn!(role = ?self.role, error = %err, "transport error");
            self.finish(Closure::abnormal(), Some(Error::Io(err)), &mut events);
        }
        events
    }

    /// Force `Closed` if a close we initiated has gone unanswered past its deadline
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Event> {
        let deadline = self.close_deadline?;
        if self.state != ConnectionState::Closing || now < deadline {
            return None;
        }

        warn!(role = ?self.role, "peer did not answer close in time");
        let mut events = Vec::new();
        let closure = Closure {
            clean: false,
            code: self.close_code,
            reason: self.close_reason.clone(),
        };
        self.finish(closure, None, &mut events);
        events.pop()
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Connecting => Err(Error::InvalidState("handshake not complete")),
            ConnectionState::Closing => Err(Error::InvalidState("close handshake in progress")),
            ConnectionState::Closed => Err(Error::InvalidState("connection closed")),
        }
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let mask = self.role.masks_outgoing().then(generate_mask);
        encode_frame(&mut self.write_buf, opcode, payload, fin, mask)
    }

    /// Queue a data message, fragmenting it if `fragment_size` is configured
    fn queue_message(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;

        match self.config.fragment_size {
            Some(size) if size > 0 && payload.len() > size => {
                let count = payload.len().div_ceil(size);
                for (i, chunk) in payload.chunks(size).enumerate() {
                    let op = if i == 0 { opcode } else { OpCode::Continuation };
                    self.queue_frame(op, chunk, i + 1 == count)?;
                }
                Ok(())
            }
            _ => self.queue_frame(opcode, payload, true),
        }
    }

    /// Queue a text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.queue_message(OpCode::Text, text.as_bytes())
    }

    /// Queue a binary message
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.queue_message(OpCode::Binary, data)
    }

    /// Queue a message
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        self.queue_message(msg.opcode(), msg.as_bytes())
    }

    /// Queue a ping (payload at most 125 bytes)
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.queue_frame(OpCode::Ping, payload, true)
    }

    /// Queue an unsolicited pong (heartbeat)
    pub fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.queue_frame(OpCode::Pong, payload, true)
    }

    /// Start the close handshake.
    ///
    /// Moves to `Closing` and arms the close deadline; see
    /// [`poll_timeout`](Self::poll_timeout).
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.ensure_open()?;
        if !CloseReason::is_valid_code(code) {
            return Err(Error::InvalidState("close code may not be sent"));
        }
        if reason.len() > CloseReason::MAX_REASON_LEN {
            return Err(Error::FrameTooLarge((reason.len() + 2) as u64));
        }

        let payload = CloseReason::new(code, reason).encode();
        self.queue_frame(OpCode::Close, &payload, true)?;

        self.close_sent = true;
        self.close_code = Some(code);
        self.close_reason = Some(reason.to_string());
        self.state = ConnectionState::Closing;
        self.close_deadline = Some(Instant::now() + self.config.close_timeout);
        debug!(role = ?self.role, code, "close initiated");
        Ok(())
    }

    /// Check whether bytes are waiting to be written
    #[inline]
    pub fn has_outgoing(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Take every byte queued for the transport
    pub fn take_outgoing(&mut self) -> Bytes {
        self.write_buf.split().freeze()
    }
}

/// Cut a reason to fit a control frame, on a char boundary
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= CloseReason::MAX_REASON_LEN {
        return reason;
    }
    let mut end = CloseReason::MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Frames as a client would put them on the wire
    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(generate_mask())).unwrap();
        buf
    }

    fn server() -> Connection {
        Connection::accepted(Role::Server, Config::default())
    }

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut parser = FrameParser::new(1 << 20);
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = parser.parse(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn messages(events: &[Event]) -> Vec<&Message> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_frame_message() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Text, b"hello", true));
        assert_eq!(messages(&events), vec![&Message::text("hello")]);
        assert!(!conn.has_outgoing());
    }

    #[test]
    fn test_fragment_reassembly() {
        let mut conn = server();
        let mut wire = client_frame(OpCode::Text, b"Hel", false);
        wire.extend_from_slice(&client_frame(OpCode::Continuation, b"lo ", false));

        assert!(messages(&conn.feed(&wire)).is_empty());

        let events = conn.feed(&client_frame(OpCode::Continuation, b"World", true));
        assert_eq!(messages(&events), vec![&Message::text("Hello World")]);
        assert!(conn.is_open());
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Continuation, b"x", true));

        assert!(messages(&events).is_empty());
        assert!(matches!(events[0], Event::Error(Error::Protocol(_))));
        assert!(matches!(
            &events[1],
            Event::Closed(Closure { clean: false, code: Some(1002), .. })
        ));
        assert!(conn.is_closed());

        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.opcode, OpCode::Close);
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1002);
    }

    #[test]
    fn test_interleaved_data_message_rejected() {
        let mut conn = server();
        let mut wire = client_frame(OpCode::Text, b"a", false);
        wire.extend_from_slice(&client_frame(OpCode::Binary, b"b", true));
        let events = conn.feed(&wire);
        assert!(matches!(events[0], Event::Error(Error::Protocol("expected continuation frame"))));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_ping_during_fragmentation() {
        let mut conn = server();
        let mut wire = client_frame(OpCode::Text, b"A", false);
        wire.extend_from_slice(&client_frame(OpCode::Ping, b"x", true));
        wire.extend_from_slice(&client_frame(OpCode::Continuation, b"B", true));

        let events = conn.feed(&wire);
        assert!(matches!(&events[0], Event::Ping(p) if p.as_ref() == b"x"));
        assert_eq!(messages(&events), vec![&Message::text("AB")]);

        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.opcode, OpCode::Pong);
        assert_eq!(sent[0].payload.as_ref(), b"x");
        assert!(!sent[0].header.masked);
    }

    #[test]
    fn test_server_rejects_unmasked() {
        let mut conn = server();
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hi", true, None).unwrap();
        let events = conn.feed(&buf);
        assert!(matches!(events[0], Event::Error(Error::Protocol("client frames must be masked"))));
    }

    #[test]
    fn test_client_rejects_masked() {
        let mut conn = Connection::accepted(Role::Client, Config::default());
        let events = conn.feed(&client_frame(OpCode::Text, b"hi", true));
        assert!(matches!(events[0], Event::Error(Error::Protocol(_))));
    }

    #[test]
    fn test_client_masks_outgoing() {
        let mut conn = Connection::accepted(Role::Client, Config::default());
        conn.send_text("Hi").unwrap();
        let sent = decode_all(&conn.take_outgoing());
        assert!(sent[0].header.masked);
        assert_eq!(sent[0].payload.as_ref(), b"Hi");
    }

    #[test]
    fn test_invalid_utf8_closes_1007() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Text, &[0xFF, 0xFE], true));
        assert!(matches!(events[0], Event::Error(Error::InvalidUtf8)));
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1007);
    }

    #[test]
    fn test_invalid_utf8_in_fragment_fails_early() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Text, &[b'o', 0xC0, 0x80], false));
        assert!(matches!(events[0], Event::Error(Error::InvalidUtf8)));
    }

    #[test]
    fn test_utf8_validation_can_be_disabled() {
        let config = Config::builder().validate_utf8(false).build();
        let mut conn = Connection::accepted(Role::Server, config);
        let events = conn.feed(&client_frame(OpCode::Text, &[0xFF], true));
        assert_eq!(messages(&events).len(), 1);
        assert_eq!(messages(&events)[0].as_text(), None);
    }

    #[test]
    fn test_reassembly_limit() {
        let config = Config::builder().max_message_size(8).build();
        let mut conn = Connection::accepted(Role::Server, config);
        let mut wire = client_frame(OpCode::Binary, &[0; 5], false);
        wire.extend_from_slice(&client_frame(OpCode::Continuation, &[0; 5], true));

        let events = conn.feed(&wire);
        assert!(matches!(events[0], Event::Error(Error::MessageTooLarge { size: 10, max: 8 })));
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1009);
    }

    #[test]
    fn test_frame_limit() {
        let config = Config::builder().max_frame_size(4).build();
        let mut conn = Connection::accepted(Role::Server, config);
        let events = conn.feed(&client_frame(OpCode::Binary, &[0; 5], true));
        assert!(matches!(events[0], Event::Error(Error::MessageTooLarge { .. })));
    }

    #[test]
    fn test_peer_initiated_close_is_echoed() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Close, &CloseReason::new(1001, "bye").encode(), true));

        assert!(matches!(&events[0], Event::Close(Some(r)) if r.code == 1001 && r.reason == "bye"));
        assert!(matches!(&events[1], Event::Closed(Closure { clean: true, code: Some(1001), .. })));
        assert_eq!(conn.close_code(), Some(1001));
        assert_eq!(conn.close_reason(), Some("bye"));

        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1001);
    }

    #[test]
    fn test_close_with_invalid_code_echoes_1000() {
        let mut conn = server();
        conn.feed(&client_frame(OpCode::Close, &1005u16.to_be_bytes(), true));
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1000);
    }

    #[test]
    fn test_invalid_close_code_records_echoed_code() {
        let mut conn = server();
        let mut payload = 1005u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"gone");
        let events = conn.feed(&client_frame(OpCode::Close, &payload, true));

        assert!(matches!(&events[0], Event::Close(Some(r)) if r.code == 1000 && r.reason == "gone"));
        assert!(matches!(&events[1], Event::Closed(Closure { clean: true, code: Some(1000), .. })));
        assert_eq!(conn.close_code(), Some(1000));
    }

    #[test]
    fn test_invalid_close_code_with_bad_reason_fails_1007() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Close, &[0x03, 0xED, 0xFF, 0xFE], true));

        assert!(matches!(events[0], Event::Error(Error::InvalidUtf8)));
        assert!(matches!(
            &events[1],
            Event::Closed(Closure { clean: false, code: Some(1007), .. })
        ));
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1007);
    }

    #[test]
    fn test_empty_close_echoes_1000() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Close, b"", true));
        assert!(matches!(&events[0], Event::Close(None)));
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap().code, 1000);
    }

    #[test]
    fn test_one_byte_close_is_protocol_error() {
        let mut conn = server();
        let events = conn.feed(&client_frame(OpCode::Close, &[0x03], true));
        assert!(matches!(events[0], Event::Error(Error::Protocol(_))));
    }

    #[test]
    fn test_locally_initiated_close() {
        let mut conn = server();
        conn.close(1000, "done").unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.close_deadline().is_some());
        let sent = decode_all(&conn.take_outgoing());
        assert_eq!(sent[0].parse_close().unwrap().unwrap(), CloseReason::new(1000, "done"));

        let events = conn.feed(&client_frame(OpCode::Close, &1000u16.to_be_bytes(), true));
        assert!(matches!(
            events.last(),
            Some(Event::Closed(Closure { clean: true, code: Some(1000), .. }))
        ));
        assert!(!conn.has_outgoing());
    }

    #[test]
    fn test_data_still_delivered_while_closing() {
        let mut conn = server();
        conn.close(1000, "").unwrap();
        conn.take_outgoing();

        let events = conn.feed(&client_frame(OpCode::Text, b"late", true));
        assert_eq!(messages(&events), vec![&Message::text("late")]);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_protocol_error_while_closing_keeps_sent_code() {
        let mut conn = server();
        conn.close(1000, "bye").unwrap();
        conn.take_outgoing();

        let events = conn.feed(&client_frame(OpCode::Continuation, b"x", true));
        assert!(matches!(events[0], Event::Error(Error::Protocol(_))));
        match &events[1] {
            Event::Closed(closure) => {
                assert!(!closure.clean);
                assert_eq!(closure.code, Some(1000));
                assert_eq!(closure.reason.as_deref(), Some("bye"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(conn.close_code(), Some(1000));
        // Our Close already went out; no second one
        assert!(!conn.has_outgoing());
    }

    #[test]
    fn test_idempotent_close() {
        let mut conn = server();
        conn.close(1000, "").unwrap();
        conn.feed(&client_frame(OpCode::Close, &1000u16.to_be_bytes(), true));
        conn.take_outgoing();
        assert!(conn.is_closed());

        assert!(matches!(conn.close(1000, ""), Err(Error::InvalidState(_))));
        assert!(matches!(conn.send_text("again"), Err(Error::InvalidState(_))));
        assert!(!conn.has_outgoing());
    }

    #[test]
    fn test_close_timeout() {
        let config = Config::builder().close_timeout(Duration::from_secs(5)).build();
        let mut conn = Connection::accepted(Role::Server, config);
        conn.close(1000, "").unwrap();

        assert!(conn.poll_timeout(Instant::now()).is_none());
        let later = Instant::now() + Duration::from_secs(6);
        let event = conn.poll_timeout(later);
        assert!(matches!(event, Some(Event::Closed(Closure { clean: false, .. }))));
        assert!(conn.is_closed());
        assert!(conn.poll_timeout(later).is_none());
    }

    #[test]
    fn test_close_argument_checks() {
        let mut conn = server();
        assert!(matches!(conn.close(1006, ""), Err(Error::InvalidState(_))));
        assert!(matches!(conn.close(1000, &"r".repeat(124)), Err(Error::FrameTooLarge(126))));
        assert!(conn.is_open());
        assert!(matches!(conn.ping(&[0; 126]), Err(Error::FrameTooLarge(126))));
        assert!(!conn.has_outgoing());
    }

    #[test]
    fn test_transport_eof_is_abnormal() {
        let mut conn = server();
        let events = conn.transport_closed();
        assert!(matches!(
            &events[0],
            Event::Closed(Closure { clean: false, code: Some(1006), .. })
        ));
        assert!(conn.transport_closed().is_empty());
    }

    #[test]
    fn test_transport_error_surfaced() {
        let mut conn = server();
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let events = conn.transport_error(err);
        assert!(matches!(events[0], Event::Error(Error::Io(_))));
        assert!(matches!(events[1], Event::Closed(_)));
    }

    #[test]
    fn test_broken_pipe_surfaced_as_io() {
        let mut conn = server();
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let events = conn.transport_error(err);
        assert!(matches!(
            &events[0],
            Event::Error(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
        assert!(matches!(
            &events[1],
            Event::Closed(Closure { clean: false, code: Some(1006), .. })
        ));
    }

    #[test]
    fn test_outgoing_fragmentation() {
        let config = Config::builder().fragment_size(4).build();
        let mut conn = Connection::accepted(Role::Server, config);
        conn.send_text("abcdefghij").unwrap();

        let sent = decode_all(&conn.take_outgoing());
        let shape: Vec<(OpCode, bool, usize)> = sent
            .iter()
            .map(|f| (f.header.opcode, f.header.fin, f.payload.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (OpCode::Text, false, 4),
                (OpCode::Continuation, false, 4),
                (OpCode::Continuation, true, 2),
            ]
        );
    }

    #[test]
    fn test_frames_split_across_feeds() {
        let mut conn = server();
        let wire = client_frame(OpCode::Binary, &[7u8; 300], true);
        let (a, b) = wire.split_at(5);
        assert!(conn.feed(a).is_empty());
        let events = conn.feed(b);
        assert_eq!(messages(&events)[0].as_bytes(), &[7u8; 300][..]);
    }

    #[test]
    fn test_handler_dispatch() {
        #[derive(Default)]
        struct Recorder {
            messages: Vec<(OpCode, Bytes)>,
            controls: Vec<OpCode>,
            closed: Option<Closure>,
        }

        impl Handler for Recorder {
            fn on_message(&mut self, opcode: OpCode, payload: Bytes) {
                self.messages.push((opcode, payload));
            }
            fn on_control(&mut self, opcode: OpCode, _payload: &Bytes) {
                self.controls.push(opcode);
            }
            fn on_closed(&mut self, closure: &Closure) {
                self.closed = Some(closure.clone());
            }
        }

        let mut conn = server();
        let mut recorder = Recorder::default();
        let mut wire = client_frame(OpCode::Binary, b"\x01\x02", true);
        wire.extend_from_slice(&client_frame(OpCode::Pong, b"hb", true));
        wire.extend_from_slice(&client_frame(OpCode::Close, &1000u16.to_be_bytes(), true));
        conn.feed_with(&wire, &mut recorder);

        assert_eq!(recorder.messages, vec![(OpCode::Binary, Bytes::from_static(b"\x01\x02"))]);
        assert_eq!(recorder.controls, vec![OpCode::Pong, OpCode::Close]);
        assert!(recorder.closed.unwrap().clean);
    }

    #[test]
    fn test_connection_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Connection>();
    }

    #[test]
    fn test_truncate_reason() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= CloseReason::MAX_REASON_LEN);
        assert!(long.starts_with(cut));
    }
}
