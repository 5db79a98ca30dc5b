//! Async WebSocket stream implementation
//!
//! `WebSocketStream` owns a transport and a [`Connection`](crate::Connection)
//! and exposes async `recv`/`send`/`close` over them.
//!
//! ```ignore
//! let stream = TcpStream::connect("127.0.0.1:9001").await?;
//! let mut ws = WebSocketStream::connect(stream, Config::default(), "127.0.0.1", "/").await?;
//!
//! ws.send_text("Hello").await?;
//! while let Some(msg) = ws.recv().await? {
//!     println!("Received: {:?}", msg);
//! }
//! ```

mod websocket;

pub use websocket::*;
