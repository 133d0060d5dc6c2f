//! Participant connections
//!
//! Relays only ever see a [`Connection`]: something that can take a frame,
//! be closed with a code, and report whether it is still open. The WebSocket
//! implementation hands frames to a writer task over an unbounded channel, so
//! sends never block the event loop and never fail from the caller's view.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use relay_core::CloseCode;

/// Process-unique handle for one transport connection
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One participant's full-duplex message channel
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queue a binary frame (fire-and-forget)
    fn send(&self, frame: Bytes);

    /// Close the connection with `code`
    fn close(&self, code: CloseCode);

    /// Whether the connection can still carry frames
    fn is_open(&self) -> bool;
}

/// Commands consumed by a WebSocket writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Bytes),
    Close(CloseCode),
}

/// WebSocket-backed connection
pub struct WsConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    closing: Notify,
}

impl WsConnection {
    /// Create a connection and the receiver its writer task drains
    pub fn new(peer_addr: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            peer_addr,
            outbound,
            open: AtomicBool::new(true),
            closing: Notify::new(),
        });
        (connection, rx)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Record that the remote side has gone away
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Resolves once the server has closed this connection
    pub async fn closed(&self) {
        if self.is_open() {
            self.closing.notified().await;
        }
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Bytes) {
        if !self.is_open() {
            trace!("{} closed, dropping {} byte frame", self.id, frame.len());
            return;
        }
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    fn close(&self, code: CloseCode) {
        // Only the first close reaches the writer.
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close(code));
            self.closing.notify_one();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// In-memory connection that records everything sent to it
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use parking_lot::Mutex;
    use relay_core::{decode, Direction, RelayMessage};

    pub struct MockConnection {
        id: ConnectionId,
        frames: Mutex<Vec<Bytes>>,
        close_code: Mutex<Option<CloseCode>>,
        open: AtomicBool,
    }

    impl MockConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::next(),
                frames: Mutex::new(Vec::new()),
                close_code: Mutex::new(None),
                open: AtomicBool::new(true),
            })
        }

        /// Drain recorded frames
        pub fn take_frames(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.frames.lock())
        }

        /// Drain recorded frames, decoded as seen by the receiver
        pub fn take_messages(&self, direction: Direction) -> Vec<RelayMessage> {
            self.take_frames()
                .iter()
                .map(|frame| decode(frame, direction))
                .collect()
        }

        pub fn close_code(&self) -> Option<CloseCode> {
            *self.close_code.lock()
        }

        /// Simulate the remote side hanging up
        pub fn hang_up(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    impl Connection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn send(&self, frame: Bytes) {
            if self.is_open() {
                self.frames.lock().push(frame);
            }
        }

        fn close(&self, code: CloseCode) {
            if self.open.swap(false, Ordering::SeqCst) {
                *self.close_code.lock() = Some(code);
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}
