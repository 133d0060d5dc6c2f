//! Core type definitions for the relay
//!
//! These types are shared by the wire codec and the session engine.

/// Identifies a participant within one session
///
/// Ids are assigned by the host; the value 1 is reserved for the host itself.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PeerId(pub i32);

impl PeerId {
    /// The host of every session
    pub const HOST: PeerId = PeerId(1);

    /// Whether this id names the host
    pub const fn is_host(self) -> bool {
        self.0 == Self::HOST.0
    }

    /// Big-endian wire representation
    pub const fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Parse from the big-endian wire representation
    pub const fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(i32::from_be_bytes(bytes))
    }
}

impl From<i32> for PeerId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WebSocket close codes used by the relay
///
/// Abrupt closure with one of these codes is the only failure signal a host or
/// client ever sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Host went away, or the host removed this client
    GoingAway = 1001,
    /// Join request carried a malformed, unknown, or closed session code
    ProtocolError = 1002,
    /// No session code could be allocated
    TryAgainLater = 1013,
    /// Session saw no traffic within its idle TTL (private-use range)
    IdleTimeout = 3008,
}

impl CloseCode {
    /// Numeric value sent in the close frame
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.as_u16(), self)
    }
}
