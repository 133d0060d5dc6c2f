//! Error types for the relay server

use std::net::SocketAddr;

use thiserror::Error;

use relay_core::{CodeError, ConfigError};

/// Failures while allocating a new session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("all {0} session codes are in use")]
    CodeSpaceExhausted(u64),
}

/// Reasons a join request is turned away
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("malformed session code {0:?}")]
    InvalidCode(String),

    #[error("no session with code {0}")]
    NotFound(String),

    #[error("session {0} is closed")]
    Closed(String),
}

/// Server startup errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("code generator: {0}")]
    Code(#[from] CodeError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
