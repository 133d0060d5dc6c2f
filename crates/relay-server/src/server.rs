//! WebSocket relay server implementation
//!
//! Routes (relative to the configured prefix):
//! - `/create` (WebSocket): become the host of a new session
//! - `/join/{code}` (WebSocket): join an existing session
//! - `/health`, `/stats` (plain HTTP): JSON counters for monitoring
//!
//! Each accepted socket gets a reader task that turns incoming messages into
//! [`HubEvent`]s and a writer task that drains the connection's outbound
//! queue. Neither touches session state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use relay_core::{Config, SessionConfig};

use crate::connection::{Connection, Outbound, WsConnection};
use crate::error::ServerError;
use crate::hub::{Hub, HubEvent, HubHandle, HubSender, HubStats};
use crate::registry::SessionRegistry;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// How long a connection the server closed may take to acknowledge
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for a complete request line before routing
const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between peeks while a request line is still arriving
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// A WebSocket route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Create,
    Join(String),
}

impl Route {
    /// Match a request path against the routes under `prefix`
    pub fn parse(prefix: &str, path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let rest = path.strip_prefix(prefix)?;

        if rest == "/create" {
            return Some(Route::Create);
        }

        rest.strip_prefix("/join/")
            .filter(|code| !code.is_empty() && !code.contains('/'))
            .map(|code| Route::Join(code.to_string()))
    }
}

/// Relay server
pub struct RelayServer {
    config: Config,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind the listener and start serving in the background
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;

        let addr = SocketAddr::new(self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let session: SessionConfig = self.config.session.clone();
        let registry = SessionRegistry::new(session.clone())?;
        let hub = Hub::spawn(registry, session.sweep_interval());

        let context = Arc::new(Context {
            prefix: self.config.server.route_prefix.clone(),
            events: hub.sender(),
            stats: hub.stats(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, context, shutdown_rx));

        info!("Relay server listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            hub,
            shutdown,
            accept_task,
        })
    }
}

/// Handle for a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: HubHandle,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session count (for monitoring)
    pub fn session_count(&self) -> usize {
        self.hub.stats().sessions()
    }

    /// Connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.hub.stats().connections()
    }

    /// Stop accepting, close every session, and wait for the hub to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.accept_task.await;
        self.hub.stop().await;
        info!("Relay server stopped");
    }
}

/// State shared by every connection task
struct Context {
    prefix: String,
    events: HubSender,
    stats: Arc<HubStats>,
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<Context>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, context).await {
                            debug!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
        }
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<Context>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the request line to serve monitoring endpoints without an upgrade
    let mut peek_buf = [0u8; 256];
    let n = peek_request_line(&stream, &mut peek_buf).await?;
    if let Some(path) = request_path(&peek_buf[..n]) {
        if let Some(endpoint) = path.strip_prefix(context.prefix.as_str()) {
            if endpoint == "/health" || endpoint == "/stats" {
                info!("{} GET {}", peer_addr, path);
                return handle_http_request(&mut stream, &context.stats).await;
            }
        }
    }

    let mut route = None;
    let mut requested = String::new();
    let callback = |request: &Request, response: Response| {
        requested = request.uri().path().to_string();
        match Route::parse(&context.prefix, request.uri().path()) {
            Some(r) => {
                route = Some(r);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some("not found".into()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            info!("{} GET {} rejected: {}", peer_addr, requested, e);
            return Ok(());
        }
    };
    let route = match route {
        Some(route) => route,
        None => return Ok(()),
    };
    info!("{} GET {} upgraded", peer_addr, requested);

    let (connection, outbound) = WsConnection::new(peer_addr);
    let (ws_sender, ws_receiver) = ws_stream.split();
    tokio::spawn(writer_loop(ws_sender, outbound));

    let event = match route {
        Route::Create => HubEvent::Create {
            connection: connection.clone(),
        },
        Route::Join(code) => HubEvent::Join {
            code,
            connection: connection.clone(),
        },
    };
    if !context.events.send(event) {
        connection.close(relay_core::CloseCode::GoingAway);
        return Ok(());
    }

    reader_loop(ws_receiver, &connection, &context.events).await;

    connection.mark_closed();
    context.events.send(HubEvent::Closed {
        connection: connection.id(),
    });
    debug!("Connection closed: {} ({})", connection.id(), peer_addr);
    Ok(())
}

/// Forward incoming messages to the hub until the socket closes
///
/// Once the server has closed the connection the peer gets [`CLOSE_GRACE`]
/// to acknowledge; after that the socket is dropped regardless.
async fn reader_loop(mut ws_receiver: WsSource, connection: &WsConnection, events: &HubSender) {
    let id = connection.id();
    let mut close_deadline = None;

    loop {
        let next = if connection.is_open() {
            tokio::select! {
                message = ws_receiver.next() => message,
                _ = connection.closed() => continue,
            }
        } else {
            let deadline = *close_deadline.get_or_insert_with(|| Instant::now() + CLOSE_GRACE);
            match timeout_at(deadline, ws_receiver.next()).await {
                Ok(message) => message,
                Err(_) => {
                    debug!("{}: close not acknowledged within {:?}", id, CLOSE_GRACE);
                    break;
                }
            }
        };

        let event = match next {
            None => break,
            Some(Ok(Message::Binary(data))) => HubEvent::Frame {
                connection: id,
                frame: Bytes::from(data),
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                HubEvent::Keepalive { connection: id }
            }
            Some(Ok(Message::Text(text))) => {
                debug!("{}: dropping {} byte text message", id, text.len());
                HubEvent::Keepalive { connection: id }
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(e)) => {
                events.send(HubEvent::Error {
                    connection: id,
                    error: e.to_string(),
                });
                break;
            }
        };

        if !events.send(event) {
            break;
        }
    }
}

/// Write queued frames until the connection is closed or dropped
async fn writer_loop(mut ws_sender: WsSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Frame(frame) => {
                if ws_sender.send(Message::Binary(Vec::from(frame))).await.is_err() {
                    break;
                }
            }
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code.as_u16()),
                    reason: "".into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

/// Peek until the request line is complete, the buffer is full, the peer
/// stops sending, or [`REQUEST_LINE_TIMEOUT`] passes
///
/// Returns the number of bytes available in `buf`.
async fn peek_request_line(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let deadline = Instant::now() + REQUEST_LINE_TIMEOUT;
    loop {
        let n = stream.peek(buf).await?;
        let complete = buf[..n].iter().any(|&b| b == b'\n');
        if n == 0 || n == buf.len() || complete || Instant::now() >= deadline {
            return Ok(n);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Extract the path from an HTTP request line
fn request_path(head: &[u8]) -> Option<&str> {
    let line_end = head.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;
    Some(target.split('?').next().unwrap_or(target))
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    stats: &HubStats,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request_path(request.as_bytes()).unwrap_or("/");

    let (status, body) = if path.ends_with("/health") {
        (
            "200 OK",
            json!({
                "status": "healthy",
                "sessions": stats.sessions(),
                "connections": stats.connections(),
            }),
        )
    } else if path.ends_with("/stats") {
        (
            "200 OK",
            json!({
                "sessions": stats.sessions(),
                "connections": stats.connections(),
                "sweeps": stats.sweeps(),
            }),
        )
    } else {
        ("404 Not Found", json!({ "error": "not found" }))
    };
    let body = body.to_string();

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
