//! Relay Core - Wire protocol, session codes, and shared configuration
//!
//! This crate contains the pieces of the relay that know nothing about
//! sockets: the binary frame codec, the session code generator, and the
//! configuration types. It has no dependency on the async runtime.

pub mod codegen;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use codegen::{normalize_code, validate_code, CodeGenerator};
pub use config::{Config, ConfigError, JoinOrder, ServerConfig, SessionConfig};
pub use error::*;
pub use protocol::{decode, encode, Direction, MessageType, RelayMessage};
pub use types::*;

/// Default letters per session code
pub const DEFAULT_CODE_LENGTH: usize = 4;

/// Default idle time before a session is closed
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Default minimum time between sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;
