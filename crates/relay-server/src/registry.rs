//! Session registry
//!
//! Maps session codes to relays and connections to the session they belong
//! to, so transport events can be routed without the transport knowing
//! anything about sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use relay_core::codegen::{normalize_code, validate_code, CodeGenerator};
use relay_core::{CloseCode, CodeError, SessionConfig};

use crate::connection::{Connection, ConnectionId};
use crate::error::{JoinError, RegistryError};
use crate::relay::{Relay, RelayState};

/// All live sessions of one server
pub struct SessionRegistry {
    /// Relays by session code
    relays: HashMap<String, Relay>,

    /// Connection to session code
    routes: HashMap<ConnectionId, String>,

    generator: CodeGenerator,

    config: SessionConfig,

    last_sweep: Instant,

    /// Sweeps actually run
    sweeps: u64,
}

impl SessionRegistry {
    /// Create a registry with a freshly seeded code generator
    pub fn new(config: SessionConfig) -> Result<Self, CodeError> {
        let generator = CodeGenerator::new(config.code_length)?;
        Ok(Self::with_generator(config, generator))
    }

    /// Create a registry drawing codes from `generator`
    pub fn with_generator(config: SessionConfig, generator: CodeGenerator) -> Self {
        Self {
            relays: HashMap::new(),
            routes: HashMap::new(),
            generator,
            config,
            last_sweep: Instant::now(),
            sweeps: 0,
        }
    }

    /// Open a session for `host` and return its code
    pub fn create_session(&mut self, host: Arc<dyn Connection>) -> Result<String, RegistryError> {
        let code = self.allocate_code()?;
        let host_id = host.id();

        let relay = Relay::new(code.clone(), host, self.config.ttl(), self.config.join_order);
        self.relays.insert(code.clone(), relay);
        self.routes.insert(host_id, code.clone());

        info!("Session {} created by {}", code, host_id);
        Ok(code)
    }

    /// Queue `connection` to join the session named by `code`
    ///
    /// Returns the normalized code on success.
    pub fn join_session(
        &mut self,
        code: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<String, JoinError> {
        let code = normalize_code(code);
        if !validate_code(&code, self.config.code_length) {
            return Err(JoinError::InvalidCode(code));
        }

        let relay = match self.relays.get_mut(&code) {
            Some(relay) => relay,
            None => return Err(JoinError::NotFound(code)),
        };

        let connection_id = connection.id();
        relay.join(connection)?;
        self.routes.insert(connection_id, code.clone());

        debug!("{} queued to join session {}", connection_id, code);
        Ok(code)
    }

    /// Route a binary frame to its session
    ///
    /// A client the host kicks stops being routed right away, so whatever it
    /// sends while its close handshake drains never reaches the session.
    pub fn handle_frame(&mut self, connection: ConnectionId, frame: Bytes) {
        let kicked = match self.relay_for(connection) {
            Some(relay) => relay.handle_frame(connection, frame),
            None => {
                debug!("Frame from unrouted {}, dropping", connection);
                return;
            }
        };

        if let Some(kicked) = kicked {
            self.routes.remove(&kicked);
        }
    }

    /// Route a transport keepalive to its session
    pub fn handle_keepalive(&mut self, connection: ConnectionId) {
        if let Some(relay) = self.relay_for(connection) {
            relay.handle_keepalive(connection);
        }
    }

    /// Route a transport error to its session
    pub fn handle_error(&mut self, connection: ConnectionId, error: &str) {
        match self.relay_for(connection) {
            Some(relay) => relay.handle_error(connection, error),
            None => debug!("Transport error on unrouted {}: {}", connection, error),
        }
    }

    /// Route a close event and forget the connection
    ///
    /// A host leaving closes its session right away instead of waiting for
    /// the next sweep.
    pub fn handle_close(&mut self, connection: ConnectionId) {
        let code = match self.routes.remove(&connection) {
            Some(code) => code,
            None => return,
        };

        let closed = match self.relays.get_mut(&code) {
            Some(relay) => {
                relay.handle_close(connection);
                !relay.host_connected() && relay.cleanup(Instant::now()) == RelayState::Closed
            }
            None => false,
        };

        if closed {
            self.evict(&code);
        }
    }

    /// Sweep if the configured interval has passed since the last sweep
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweep as of `now` unless the previous sweep was less than one
    /// interval ago
    ///
    /// Returns the number of sessions evicted.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.config.sweep_interval() {
            return 0;
        }
        self.sweep_unthrottled(now)
    }

    /// Close idle or host-less sessions as of `now` and evict closed ones
    ///
    /// The periodic timer calls this directly; its ticks land about one
    /// interval apart and must not be skipped for arriving a little early.
    pub fn sweep_unthrottled(&mut self, now: Instant) -> usize {
        self.last_sweep = now;
        self.sweeps += 1;

        let closed: Vec<String> = self
            .relays
            .iter_mut()
            .filter_map(|(code, relay)| {
                (relay.cleanup(now) == RelayState::Closed).then(|| code.clone())
            })
            .collect();

        for code in &closed {
            self.evict(code);
        }

        if !closed.is_empty() {
            info!(
                "Sweep evicted {} session(s), {} remaining",
                closed.len(),
                self.relays.len()
            );
        }
        closed.len()
    }

    /// Close every session (server shutdown)
    pub fn close_all(&mut self) {
        for relay in self.relays.values_mut() {
            relay.close(CloseCode::GoingAway);
        }
        let count = self.relays.len();
        self.relays.clear();
        self.routes.clear();
        if count > 0 {
            info!("Closed {} session(s) on shutdown", count);
        }
    }

    /// Look up a session by (normalized) code
    pub fn get(&self, code: &str) -> Option<&Relay> {
        self.relays.get(code)
    }

    /// Number of tracked sessions, including closed ones awaiting eviction
    pub fn session_count(&self) -> usize {
        self.relays.len()
    }

    /// Number of connections routed to a session
    pub fn connection_count(&self) -> usize {
        self.routes.len()
    }

    /// Number of sweeps run so far
    pub fn sweep_count(&self) -> u64 {
        self.sweeps
    }

    fn relay_for(&mut self, connection: ConnectionId) -> Option<&mut Relay> {
        let code = self.routes.get(&connection)?;
        self.relays.get_mut(code)
    }

    /// Draw codes until one is not tracked
    fn allocate_code(&mut self) -> Result<String, RegistryError> {
        let space = self.generator.modulus();
        for _ in 0..space {
            let code = self.generator.generate();
            if !self.relays.contains_key(&code) {
                return Ok(code);
            }
            debug!("Session code {} in use, drawing another", code);
        }
        Err(RegistryError::CodeSpaceExhausted(space))
    }

    fn evict(&mut self, code: &str) {
        if self.relays.remove(code).is_some() {
            self.routes.retain(|_, routed| routed.as_str() != code);
            info!("Session {} evicted", code);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.relays.len())
            .field("connections", &self.routes.len())
            .finish()
    }
}
