//! WebSocket relay server implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::messages::RoutingHeader;
use crate::registry::ClientRegistry;

/// Relay server state
pub struct RelayServer {
    clients: Arc<ClientRegistry>,
    next_connection: AtomicU64,
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(ClientRegistry::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let clients = self.clients.clone();
            let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, clients, connection).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Number of registered clients (for monitoring)
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a single connection (health check or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    clients: Arc<ClientRegistry>,
    connection: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // WebSocket upgrades are GETs too, so match the health path exactly
    let mut peek_buf = [0u8; 11];
    let n = stream.peek(&mut peek_buf).await?;
    if &peek_buf[..n] == b"GET /health" {
        return handle_health_request(&mut stream, clients.len()).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    debug!("New connection {} from {}", connection, peer_addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut registered: Option<String> = None;

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        handle_frame(&text, connection, &tx, &clients, &mut registered);
    }

    if let Some(id) = registered {
        if clients.unregister(&id, connection) {
            info!("Client {} unregistered", id);
        }
    }

    drop(tx);
    let _ = writer.await;
    debug!("Connection {} closed", connection);
    Ok(())
}

/// Route one text frame
fn handle_frame(
    text: &str,
    connection: u64,
    tx: &mpsc::UnboundedSender<Message>,
    clients: &ClientRegistry,
    registered: &mut Option<String>,
) {
    let header = match RoutingHeader::from_json(text) {
        Ok(header) => header,
        Err(e) => {
            warn!("Dropping malformed frame on connection {}: {}", connection, e);
            return;
        }
    };

    if header.kind == "register" {
        match header.id {
            Some(id) => {
                if clients.register(&id, connection, tx.clone()) {
                    info!("Client {} re-registered", id);
                } else {
                    info!("Client {} registered", id);
                }
                *registered = Some(id);
            }
            None => warn!("Register without id on connection {}", connection),
        }
        return;
    }

    let Some(from) = registered.as_deref() else {
        debug!("Ignoring {} from unregistered connection {}", header.kind, connection);
        return;
    };

    match header.to {
        Some(to) => {
            if clients.forward(&to, text) {
                debug!("Relayed {} from {} to {}", header.kind, from, to);
            } else {
                info!("Client {} not found, dropping {} from {}", to, header.kind, from);
            }
        }
        None => debug!("Ignoring {} without target from {}", header.kind, from),
    }
}

/// Answer a plain HTTP health check
async fn handle_health_request(
    stream: &mut TcpStream,
    client_count: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let body = format!(r#"{{"status":"healthy","clients":{}}}"#, client_count);
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
