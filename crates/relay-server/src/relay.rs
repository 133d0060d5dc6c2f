//! Per-session multiplexing
//!
//! A [`Relay`] owns one host connection (always peer 1) and the clients that
//! joined through its code. Clients join in two steps that arrive as separate
//! events: [`Relay::join`] queues the connection and asks the host for an id,
//! and the host's later ID response finalizes the oldest or newest queued
//! connection depending on [`JoinOrder`]. Until then a client can receive
//! nothing and anything it sends is dropped.
//!
//! Once [`RelayState::Closed`] the relay never reopens; the registry evicts it
//! on the next sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use relay_core::protocol::{decode, encode, rewrite_peer_id, Direction, RelayMessage};
use relay_core::{CloseCode, JoinOrder, PeerId};

use crate::connection::{Connection, ConnectionId};
use crate::error::JoinError;

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Closed,
}

/// One live session
pub struct Relay {
    /// Session code
    code: String,

    /// Idle time after which the session is closed
    ttl: Duration,

    /// Which pending connection an ID response finalizes
    join_order: JoinOrder,

    state: RelayState,

    /// Last inbound frame or keepalive from anyone in the session
    last_activity: Instant,

    /// Joined participants; the host is peers[1]
    peers: HashMap<PeerId, Arc<dyn Connection>>,

    /// Reverse index of `peers`
    members: HashMap<ConnectionId, PeerId>,

    /// Connections waiting for the host to hand out an id
    pending: VecDeque<Arc<dyn Connection>>,

    /// Set when the host's close event arrives
    host_gone: bool,
}

impl Relay {
    /// Create a relay and tell the host its code
    pub fn new(
        code: String,
        host: Arc<dyn Connection>,
        ttl: Duration,
        join_order: JoinOrder,
    ) -> Self {
        let mut relay = Self {
            code,
            ttl,
            join_order,
            state: RelayState::Open,
            last_activity: Instant::now(),
            peers: HashMap::new(),
            members: HashMap::new(),
            pending: VecDeque::new(),
            host_gone: false,
        };

        relay.members.insert(host.id(), PeerId::HOST);
        relay.peers.insert(PeerId::HOST, host);
        relay.send_to_host(&RelayMessage::Code {
            code: relay.code.clone(),
        });

        info!("Relay {} created", relay.code);
        relay
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == RelayState::Open
    }

    /// Joined participants, host included
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Connections still waiting for an id
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Id of a joined connection
    pub fn peer_id_of(&self, connection: ConnectionId) -> Option<PeerId> {
        self.members.get(&connection).copied()
    }

    /// Whether the host connection is still usable
    pub fn host_connected(&self) -> bool {
        !self.host_gone
            && self
                .peers
                .get(&PeerId::HOST)
                .map(|host| host.is_open())
                .unwrap_or(false)
    }

    /// Queue a client and ask the host for an id
    pub fn join(&mut self, connection: Arc<dyn Connection>) -> Result<(), JoinError> {
        if !self.is_open() {
            return Err(JoinError::Closed(self.code.clone()));
        }

        debug!("Relay {}: {} waiting for an id", self.code, connection.id());
        self.pending.push_back(connection);
        self.send_to_host(&RelayMessage::RequestId);
        Ok(())
    }

    /// Refresh the idle timer
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether `connection` is a joined peer or still waiting for an id
    pub fn is_participant(&self, connection: ConnectionId) -> bool {
        self.members.contains_key(&connection) || self.pending.iter().any(|c| c.id() == connection)
    }

    /// Handle a binary frame from `connection`
    ///
    /// Returns the connection a host kick removed, so the caller can stop
    /// routing its traffic here.
    pub fn handle_frame(
        &mut self,
        connection: ConnectionId,
        frame: Bytes,
    ) -> Option<ConnectionId> {
        if !self.is_open() {
            debug!("Relay {} closed, ignoring frame from {}", self.code, connection);
            return None;
        }

        let from = match self.members.get(&connection) {
            Some(id) => *id,
            None => {
                if self.is_participant(connection) {
                    self.touch();
                }
                debug!(
                    "Relay {}: dropping frame from {} (no id assigned)",
                    self.code, connection
                );
                return None;
            }
        };
        self.touch();

        match decode(&frame, Direction::inbound(from.is_host())) {
            RelayMessage::Data { id, payload, .. } => {
                // Release the payload view so the buffer can be rewritten in place.
                drop(payload);
                self.forward(from, id, frame);
            }
            RelayMessage::SendId { id } => self.assign_id(id),
            RelayMessage::Disconnect { id, .. } => return self.kick(id),
            RelayMessage::Undefined { direction } => {
                debug!(
                    "Relay {}: discarding malformed {} byte frame from peer {} ({:?})",
                    self.code,
                    frame.len(),
                    from,
                    direction
                );
            }
            other => {
                warn!(
                    "Relay {}: unexpected {:?} from peer {}",
                    self.code,
                    other.message_type(),
                    from
                );
            }
        }
        None
    }

    /// Handle a transport-level keepalive
    pub fn handle_keepalive(&mut self, connection: ConnectionId) {
        if self.is_open() && self.is_participant(connection) {
            self.touch();
            debug!("Relay {}: keepalive from {}", self.code, connection);
        }
    }

    /// Transport errors are only logged; the close event that follows does the teardown
    pub fn handle_error(&mut self, connection: ConnectionId, error: &str) {
        match self.members.get(&connection) {
            Some(id) => debug!("Relay {}: transport error on peer {}: {}", self.code, id, error),
            None => debug!("Relay {}: transport error on {}: {}", self.code, connection, error),
        }
    }

    /// Handle a connection's close event
    pub fn handle_close(&mut self, connection: ConnectionId) {
        match self.members.get(&connection).copied() {
            Some(id) if id.is_host() => {
                info!("Host of relay {} disconnected", self.code);
                self.host_gone = true;
            }
            Some(id) => {
                self.members.remove(&connection);
                self.peers.remove(&id);
                info!("Peer {} left relay {}", id, self.code);
                if self.is_open() {
                    self.send_to_host(&RelayMessage::Disconnect {
                        direction: Direction::RelayToHost,
                        id,
                    });
                }
            }
            None => {
                let before = self.pending.len();
                self.pending.retain(|c| c.id() != connection);
                if self.pending.len() != before {
                    debug!("Relay {}: {} left before receiving an id", self.code, connection);
                }
            }
        }
    }

    /// Close the relay if the host is gone or it has been idle for `ttl`
    ///
    /// Returns the state after the check.
    pub fn cleanup(&mut self, now: Instant) -> RelayState {
        if !self.is_open() {
            return self.state;
        }

        if !self.host_connected() {
            self.close(CloseCode::GoingAway);
        } else if self.is_idle(now) {
            info!("Relay {} idle for {:?}", self.code, self.ttl);
            self.close(CloseCode::IdleTimeout);
        }
        self.state
    }

    /// Whether no traffic was seen within `ttl` of `now`
    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.ttl
    }

    /// Force-close every participant and enter the terminal state
    pub fn close(&mut self, code: CloseCode) {
        if !self.is_open() {
            return;
        }
        self.state = RelayState::Closed;

        for (_, connection) in self.peers.drain() {
            connection.close(code);
        }
        for connection in self.pending.drain(..) {
            connection.close(code);
        }
        self.members.clear();

        info!("Relay {} closed with {}", self.code, code);
    }

    fn forward(&self, from: PeerId, to: PeerId, frame: Bytes) {
        let target = match self.peers.get(&to) {
            Some(target) => target,
            None => {
                debug!(
                    "Relay {}: peer {} sent data to unknown peer {}, dropping",
                    self.code, from, to
                );
                return;
            }
        };

        // Reuses the received buffer when nothing else holds it.
        let mut raw = Vec::from(frame);
        rewrite_peer_id(&mut raw, from);
        target.send(Bytes::from(raw));
    }

    fn assign_id(&mut self, id: PeerId) {
        if self.peers.contains_key(&id) {
            warn!("Relay {}: host assigned id {} which is already in use", self.code, id);
            return;
        }

        let connection = match self.next_pending() {
            Some(connection) => connection,
            None => {
                warn!("Relay {}: host sent id {} but no client is waiting", self.code, id);
                return;
            }
        };

        self.members.insert(connection.id(), id);
        self.peers.insert(id, connection.clone());

        send(&*connection, &RelayMessage::AssignId { id });
        send(
            &*connection,
            &RelayMessage::Connect {
                direction: Direction::RelayToClient,
                id: PeerId::HOST,
            },
        );
        self.send_to_host(&RelayMessage::Connect {
            direction: Direction::RelayToHost,
            id,
        });

        info!("Peer {} joined relay {}", id, self.code);
    }

    /// Pop the next live pending connection according to the join order
    fn next_pending(&mut self) -> Option<Arc<dyn Connection>> {
        loop {
            let connection = match self.join_order {
                JoinOrder::Lifo => self.pending.pop_back(),
                JoinOrder::Fifo => self.pending.pop_front(),
            }?;
            if connection.is_open() {
                return Some(connection);
            }
            debug!("Relay {}: skipping closed pending {}", self.code, connection.id());
        }
    }

    fn kick(&mut self, id: PeerId) -> Option<ConnectionId> {
        if id.is_host() {
            warn!("Relay {}: host asked to disconnect itself, ignoring", self.code);
            return None;
        }

        match self.peers.remove(&id) {
            Some(connection) => {
                self.members.remove(&connection.id());
                connection.close(CloseCode::GoingAway);
                info!("Host removed peer {} from relay {}", id, self.code);
                Some(connection.id())
            }
            None => {
                debug!("Relay {}: host asked to disconnect unknown peer {}", self.code, id);
                None
            }
        }
    }

    fn send_to_host(&self, message: &RelayMessage) {
        if let Some(host) = self.peers.get(&PeerId::HOST) {
            send(&**host, message);
        }
    }
}

fn send(connection: &dyn Connection, message: &RelayMessage) {
    match encode(message) {
        Ok(frame) => connection.send(frame),
        Err(e) => error!("Refusing to send invalid frame to {}: {}", connection.id(), e),
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("code", &self.code)
            .field("state", &self.state)
            .field("peers", &self.peers.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
