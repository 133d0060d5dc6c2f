//! Event loop that owns the session registry
//!
//! Every transport task reports what happened as a [`HubEvent`]; one task
//! applies them to the [`SessionRegistry`] in arrival order and runs the
//! periodic sweep between events. Relay state is therefore only ever touched
//! from this task and needs no locking.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use relay_core::CloseCode;

use crate::connection::{Connection, ConnectionId};
use crate::registry::SessionRegistry;

/// Something that happened on a connection
pub enum HubEvent {
    /// New host connection
    Create { connection: Arc<dyn Connection> },
    /// New client connection asking for a session
    Join {
        code: String,
        connection: Arc<dyn Connection>,
    },
    /// Binary frame received
    Frame {
        connection: ConnectionId,
        frame: Bytes,
    },
    /// Ping, pong, or other non-frame traffic received
    Keepalive { connection: ConnectionId },
    /// Transport error (a `Closed` event follows)
    Error {
        connection: ConnectionId,
        error: String,
    },
    /// Connection closed
    Closed { connection: ConnectionId },
}

/// Counters published after every event, readable from any task
#[derive(Debug, Default)]
pub struct HubStats {
    sessions: AtomicUsize,
    connections: AtomicUsize,
    sweeps: AtomicU64,
}

impl HubStats {
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Expiry sweeps run since the hub started
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}

/// Cloneable sender for hub events
#[derive(Clone)]
pub struct HubSender {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl HubSender {
    /// Queue an event; returns false once the hub has stopped
    pub fn send(&self, event: HubEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Handle for a running hub
pub struct HubHandle {
    sender: HubSender,
    stats: Arc<HubStats>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HubHandle {
    pub fn sender(&self) -> HubSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> Arc<HubStats> {
        self.stats.clone()
    }

    /// Stop the loop, closing every session, and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Hub task ended abnormally: {}", e);
        }
    }
}

/// The registry plus its event queue
pub struct Hub {
    registry: SessionRegistry,
    events: mpsc::UnboundedReceiver<HubEvent>,
    stats: Arc<HubStats>,
    sweep_interval: Duration,
}

impl Hub {
    /// Start the event loop on the current runtime
    pub fn spawn(registry: SessionRegistry, sweep_interval: Duration) -> HubHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(HubStats::default());

        let hub = Hub {
            registry,
            events: rx,
            stats: stats.clone(),
            sweep_interval,
        };
        let task = tokio::spawn(hub.run(shutdown_rx));

        HubHandle {
            sender: HubSender { events: tx },
            stats,
            shutdown,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Hub started (sweep every {:?})", self.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.registry.sweep_unthrottled(Instant::now());
                }
            }
            self.publish_stats();
        }

        self.registry.close_all();
        self.publish_stats();
        info!("Hub stopped");
    }

    fn dispatch(&mut self, event: HubEvent) {
        match event {
            HubEvent::Create { connection } => {
                if let Err(e) = self.registry.create_session(connection.clone()) {
                    warn!("Rejecting host {}: {}", connection.id(), e);
                    connection.close(CloseCode::TryAgainLater);
                }
                self.registry.sweep();
            }
            HubEvent::Join { code, connection } => {
                if let Err(e) = self.registry.join_session(&code, connection.clone()) {
                    info!("Rejecting join from {}: {}", connection.id(), e);
                    connection.close(CloseCode::ProtocolError);
                }
                self.registry.sweep();
            }
            HubEvent::Frame { connection, frame } => {
                self.registry.handle_frame(connection, frame);
            }
            HubEvent::Keepalive { connection } => {
                self.registry.handle_keepalive(connection);
            }
            HubEvent::Error { connection, error } => {
                self.registry.handle_error(connection, &error);
            }
            HubEvent::Closed { connection } => {
                debug!("{} closed", connection);
                self.registry.handle_close(connection);
            }
        }
    }

    fn publish_stats(&self) {
        self.stats
            .sessions
            .store(self.registry.session_count(), Ordering::Relaxed);
        self.stats
            .connections
            .store(self.registry.connection_count(), Ordering::Relaxed);
        self.stats
            .sweeps
            .store(self.registry.sweep_count(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::MockConnection;
    use relay_core::SessionConfig;

    async fn settle() {
        // Let the hub drain everything queued so far.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn spawn_hub() -> HubHandle {
        let registry = SessionRegistry::new(SessionConfig::default()).unwrap();
        Hub::spawn(registry, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_create_and_join_through_events() {
        let hub = spawn_hub();
        let sender = hub.sender();

        let host = MockConnection::new();
        assert!(sender.send(HubEvent::Create {
            connection: host.clone()
        }));
        settle().await;

        let frames = host.take_frames();
        assert_eq!(frames.len(), 1);
        let code = String::from_utf8(frames[0][1..].to_vec()).unwrap();
        assert_eq!(hub.stats().sessions(), 1);

        let client = MockConnection::new();
        sender.send(HubEvent::Join {
            code,
            connection: client.clone(),
        });
        settle().await;
        assert_eq!(&host.take_frames()[0][..], &[4]);
        assert_eq!(hub.stats().connections(), 2);

        hub.stop().await;
        assert_eq!(host.close_code(), Some(CloseCode::GoingAway));
        assert_eq!(client.close_code(), Some(CloseCode::GoingAway));
    }

    #[tokio::test]
    async fn test_bad_join_is_closed_with_protocol_error() {
        let hub = spawn_hub();
        let client = MockConnection::new();
        hub.sender().send(HubEvent::Join {
            code: "12".into(),
            connection: client.clone(),
        });
        settle().await;

        assert_eq!(client.close_code(), Some(CloseCode::ProtocolError));
        assert!(client.take_frames().is_empty());
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_sweeps_on_every_tick() {
        let registry = SessionRegistry::new(SessionConfig::default()).unwrap();
        let hub = Hub::spawn(registry, Duration::from_millis(50));

        // The first tick fires immediately, then one per interval.
        tokio::time::sleep(Duration::from_millis(1020)).await;
        let sweeps = hub.stats().sweeps();
        assert!(sweeps >= 15, "only {} sweeps in about 20 intervals", sweeps);

        hub.stop().await;
    }

    #[tokio::test]
    async fn test_sender_fails_after_stop() {
        let hub = spawn_hub();
        let sender = hub.sender();
        hub.stop().await;
        assert!(!sender.send(HubEvent::Keepalive {
            connection: ConnectionId::next()
        }));
    }
}
