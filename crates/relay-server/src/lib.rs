//! Relay Server
//!
//! Rendezvous relay for one host and any number of clients that cannot reach
//! each other directly. Everyone connects to the relay over WebSocket and
//! exchanges opaque binary frames through a short session code.
//!
//! # Protocol
//!
//! 1. Host connects to `/create` and receives a CODE frame
//! 2. Client connects to `/join/{code}`; the host receives an ID request
//! 3. Host answers with an id; client learns its id and the host's, host
//!    learns the client's
//! 4. DATA frames are forwarded by peer id, with the id rewritten to the sender
//! 5. Either side closing, or the session idling out, ends membership
//!
//! # Architecture
//!
//! ```text
//!  socket tasks ──HubEvent──▶ Hub (single task) ──▶ SessionRegistry ──▶ Relay
//!       ▲                                                                 │
//!       └──────────────── Outbound (frames, close) ◀──────────────────────┘
//! ```

pub mod connection;
pub mod error;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod server;

pub use connection::{Connection, ConnectionId, WsConnection};
pub use error::{JoinError, RegistryError, ServerError};
pub use hub::{Hub, HubEvent, HubHandle};
pub use registry::SessionRegistry;
pub use relay::{Relay, RelayState};
pub use server::{RelayServer, Route, ServerHandle};
