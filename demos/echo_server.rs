//! Echo server over plain TCP
//!
//! Every accepted connection is tracked in an application-owned registry;
//! the library itself keeps no global connection table.
//!
//! Run with: cargo run --example echo_server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use sockudo_wire::error::Result;
use sockudo_wire::{CloseReason, Config, WebSocketStream};

type Registry = Arc<Mutex<HashMap<u64, SocketAddr>>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let addr = SocketAddr::from(([127, 0, 0, 1], 9001));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "echo server listening");

    let config = Config::builder()
        .max_payload_length(1024 * 1024)
        .close_timeout(Duration::from_secs(3))
        .protocols(["echo"])
        .build();
    let registry: Registry = Arc::default();
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let config = config.clone();
        let registry = registry.clone();

        tokio::spawn(async move {
            registry.lock().await.insert(id, peer);
            if let Err(e) = handle_connection(stream, config).await {
                warn!(id, %peer, error = %e, "connection failed");
            }
            let remaining = {
                let mut registry = registry.lock().await;
                registry.remove(&id);
                registry.len()
            };
            info!(id, %peer, remaining, "connection finished");
        });
    }
}

async fn handle_connection(stream: TcpStream, config: Config) -> Result<()> {
    let mut ws = WebSocketStream::accept(stream, config).await?;
    info!(protocol = ?ws.protocol(), "upgraded");

    while let Some(msg) = ws.recv().await? {
        if msg.as_text() == Some("bye") {
            ws.close(CloseReason::NORMAL, "goodbye").await?;
            break;
        }
        ws.send(&msg).await?;
    }

    Ok(())
}
