//! Error types for the relay protocol

use thiserror::Error;

use crate::protocol::{Direction, MessageType};

/// Protocol-level errors
///
/// Decoding never produces these; malformed input decodes to
/// [`RelayMessage::Undefined`](crate::protocol::RelayMessage::Undefined).
/// Encoding fails only when the caller builds a message the protocol cannot
/// express, which is a bug on the sending side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("cannot encode an undefined message ({0:?})")]
    EncodeUndefined(Direction),

    #[error("{message_type:?} is not valid in direction {direction:?}")]
    InvalidDirection {
        message_type: MessageType,
        direction: Direction,
    },
}

/// Session code generation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("code length must be between 1 and {max} (got {length})")]
    InvalidLength { length: usize, max: usize },

    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

impl From<getrandom::Error> for CodeError {
    fn from(e: getrandom::Error) -> Self {
        CodeError::Entropy(e.to_string())
    }
}
