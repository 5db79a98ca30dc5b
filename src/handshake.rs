//! WebSocket handshake implementation
//!
//! This module handles the HTTP/1.1 upgrade exchange (RFC 6455 section 4)
//! without touching a socket:
//! - Client: build the upgrade request, validate the 101 response
//! - Server: validate the upgrade request, build the 101 (or rejection) response
//! - Accept key: Base64(SHA-1(key + GUID))

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::WS_GUID;
use crate::error::{HandshakeError, Result};
use crate::mask::generate_nonce;

/// Maximum HTTP header size (8KB should be enough for any reasonable request)
const MAX_HEADER_SIZE: usize = 8192;

/// Maximum number of header lines accepted in a request or response
const MAX_HEADERS: usize = 32;

/// WebSocket handshake request (server-side)
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// The request path
    pub path: &'a str,
    /// The Host header
    pub host: Option<&'a str>,
    /// The Sec-WebSocket-Key header
    pub key: &'a str,
    /// The Sec-WebSocket-Version header
    pub version: &'a str,
    /// Subprotocols offered, in client preference order
    pub protocols: Vec<&'a str>,
    /// The Origin header (optional)
    pub origin: Option<&'a str>,
}

/// WebSocket handshake response (client-side parsing)
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<&'a str>,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<&'a str>,
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// The request path
    pub path: String,
    /// Negotiated subprotocol
    pub protocol: Option<String>,
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}

/// Generate a random WebSocket key (client-side)
pub fn generate_key() -> String {
    STANDARD.encode(generate_nonce())
}

/// Iterate the comma-separated tokens of a header value
fn tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn has_token(value: &str, token: &str) -> bool {
    tokens(value).any(|t| t.eq_ignore_ascii_case(token))
}

fn header_str<'a>(header: &httparse::Header<'a>) -> std::result::Result<&'a str, HandshakeError> {
    std::str::from_utf8(header.value).map_err(|_| HandshakeError::InvalidHttp("invalid header value"))
}

/// Parse a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// while the head is incomplete.
pub fn parse_request(
    buf: &[u8],
) -> std::result::Result<Option<(HandshakeRequest<'_>, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) if len > MAX_HEADER_SIZE => {
            return Err(HandshakeError::TooLarge);
        }
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEADER_SIZE => {
            return Err(HandshakeError::TooLarge);
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(HandshakeError::InvalidHttp("failed to parse HTTP request")),
    };

    if req.method != Some("GET") {
        return Err(HandshakeError::InvalidHttp("method must be GET"));
    }
    if req.version != Some(1) {
        return Err(HandshakeError::InvalidHttp("HTTP/1.1 required"));
    }

    let mut key = None;
    let mut version = None;
    let mut host = None;
    let mut origin = None;
    let mut protocols = Vec::new();
    let mut upgrade = false;
    let mut connection_upgrade = false;

    for header in req.headers.iter() {
        let value = header_str(header)?;
        let name = header.name;

        if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim());
        } else if name.eq_ignore_ascii_case("sec-websocket-version") {
            version = Some(value.trim());
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocols.extend(tokens(value));
        } else if name.eq_ignore_ascii_case("host") {
            host = Some(value);
        } else if name.eq_ignore_ascii_case("origin") {
            origin = Some(value);
        } else if name.eq_ignore_ascii_case("upgrade") {
            upgrade |= has_token(value, "websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= has_token(value, "upgrade");
        }
    }

    if !upgrade {
        return Err(HandshakeError::MissingHeader("Upgrade: websocket"));
    }
    if !connection_upgrade {
        return Err(HandshakeError::MissingHeader("Connection: Upgrade"));
    }
    let version = version.ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }
    let key = key.ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(Some((
        HandshakeRequest {
            path: req.path.unwrap_or("/"),
            host,
            key,
            version,
            protocols,
            origin,
        },
        len,
    )))
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the response a server sends when it refuses an upgrade
pub fn build_rejection(err: &HandshakeError) -> Bytes {
    let status = err.status();
    let phrase = match status {
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        _ => "Bad Request",
    };

    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(format!("HTTP/1.1 {} {}\r\n", status, phrase).as_bytes());
    if status == 426 {
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    }
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Length: 0\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a WebSocket upgrade request (client-side)
pub fn build_request(host: &str, path: &str, key: &str, protocols: &[&str]) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if !protocols.is_empty() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocols.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Parse a WebSocket upgrade response (client-side)
///
/// Requires status 101 with `Upgrade: websocket` and `Connection: Upgrade`.
/// The accept value is returned for the caller to compare.
pub fn parse_response(
    buf: &[u8],
) -> std::result::Result<Option<(HandshakeResponse<'_>, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) if len > MAX_HEADER_SIZE => {
            return Err(HandshakeError::TooLarge);
        }
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEADER_SIZE => {
            return Err(HandshakeError::TooLarge);
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(HandshakeError::InvalidHttp("failed to parse HTTP response")),
    };

    let status = res.code.unwrap_or(0);
    if status != 101 {
        return Err(HandshakeError::NotSwitchingProtocols(status));
    }

    let mut accept = None;
    let mut protocol = None;
    let mut upgrade = false;
    let mut connection_upgrade = false;

    for header in res.headers.iter() {
        let value = header_str(header)?;
        let name = header.name;

        if name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept = Some(value.trim());
        } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
            protocol = Some(value.trim());
        } else if name.eq_ignore_ascii_case("upgrade") {
            upgrade |= has_token(value, "websocket");
        } else if name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= has_token(value, "upgrade");
        }
    }

    if !upgrade {
        return Err(HandshakeError::MissingHeader("Upgrade: websocket"));
    }
    if !connection_upgrade {
        return Err(HandshakeError::MissingHeader("Connection: Upgrade"));
    }

    Ok(Some((
        HandshakeResponse {
            status,
            accept,
            protocol,
        },
        len,
    )))
}

/// Client half of the upgrade exchange
///
/// Holds the generated key and the accept value the server must echo.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    path: String,
    key: String,
    expected_accept: String,
    protocols: Vec<String>,
    request: Bytes,
}

impl ClientHandshake {
    /// Generate a key and build the upgrade request
    pub fn new(host: &str, path: &str, protocols: &[&str]) -> Self {
        Self::with_key(host, path, protocols, generate_key())
    }

    /// Build the upgrade request around a caller-supplied key
    pub fn with_key(host: &str, path: &str, protocols: &[&str], key: String) -> Self {
        let request = build_request(host, path, &key, protocols);
        Self {
            path: path.to_string(),
            expected_accept: generate_accept_key(&key),
            key,
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            request,
        }
    }

    /// Bytes to write to the transport
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// The `Sec-WebSocket-Key` sent
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `Sec-WebSocket-Accept` the server must answer with
    pub fn expected_accept(&self) -> &str {
        &self.expected_accept
    }

    /// Validate the server's response.
    ///
    /// Returns the result and the number of bytes consumed; any bytes after
    /// that belong to the frame stream.
    pub fn finish(&self, buf: &[u8]) -> Result<Option<(HandshakeResult, usize)>> {
        let Some((res, consumed)) = parse_response(buf)? else {
            return Ok(None);
        };

        let accept = res
            .accept
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        if !validate_accept_key(&self.key, accept) {
            return Err(HandshakeError::AcceptMismatch {
                expected: self.expected_accept.clone(),
                actual: accept.to_string(),
            }
            .into());
        }

        if let Some(proto) = res.protocol {
            if !self.protocols.iter().any(|p| p == proto) {
                return Err(HandshakeError::UnexpectedProtocol(proto.to_string()).into());
            }
        }

        debug!(path = %self.path, protocol = ?res.protocol, "client handshake complete");
        Ok(Some((
            HandshakeResult {
                path: self.path.clone(),
                protocol: res.protocol.map(String::from),
            },
            consumed,
        )))
    }
}

/// Outcome of a server accepting an upgrade request
#[derive(Debug, Clone)]
pub struct ServerAccept {
    /// The 101 response to write to the transport
    pub response: Bytes,
    /// Path and negotiated subprotocol
    pub result: HandshakeResult,
    /// Bytes of the request head; anything after is frame data
    pub consumed: usize,
}

/// Server half of the upgrade exchange
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    protocols: Vec<String>,
}

impl ServerHandshake {
    /// Create a server handshake supporting the given subprotocols
    pub fn new(protocols: &[String]) -> Self {
        Self {
            protocols: protocols.to_vec(),
        }
    }

    /// Pick the first client-offered subprotocol this server supports
    pub fn select_protocol<'a>(&self, offered: &[&'a str]) -> Option<&'a str> {
        offered
            .iter()
            .copied()
            .find(|o| self.protocols.iter().any(|p| p == o))
    }

    /// Validate an upgrade request and build the 101 response.
    ///
    /// On error the caller should send [`build_rejection`] and drop the
    /// transport.
    pub fn accept(&self, buf: &[u8]) -> Result<Option<ServerAccept>> {
        let Some((req, consumed)) = parse_request(buf)? else {
            return Ok(None);
        };

        let protocol = self.select_protocol(&req.protocols);
        let accept_key = generate_accept_key(req.key);
        let response = build_response(&accept_key, protocol);

        debug!(
            path = req.path,
            host = ?req.host,
            origin = ?req.origin,
            protocol = ?protocol,
            "server accepted upgrade"
        );
        Ok(Some(ServerAccept {
            response,
            result: HandshakeResult {
                path: req.path.to_string(),
                protocol: protocol.map(String::from),
            },
            consumed,
        }))
    }
}
