//! Wire protocol definitions
//!
//! Every frame starts with a one-byte type tag. Multi-byte integers are 4-byte
//! big-endian two's-complement. The same tag can carry a different payload
//! depending on who sends it, so a frame is only meaningful together with the
//! [`Direction`] it travelled in:
//!
//! | Type       | Tag | Directions                              | Payload                 |
//! |------------|-----|-----------------------------------------|-------------------------|
//! | DATA       | 0   | any                                     | peer id, opaque bytes   |
//! | CONNECT    | 1   | relay→host, relay→client                | peer id                 |
//! | DISCONNECT | 2   | host→relay, relay→host, relay→client    | peer id                 |
//! | CODE       | 3   | relay→host                              | UTF-8 session code      |
//! | ID         | 4   | relay→host (request, empty)             |                         |
//! |            |     | host→relay, relay→client (with id)      | peer id                 |
//!
//! The peer id of a DATA frame is a routing header: the destination on the
//! way in, the source on the way out. The relay rewrites it in place with
//! [`rewrite_peer_id`] so payload bytes are never copied into a new envelope.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::PeerId;

/// Length of the tag plus a peer id
pub const HEADER_LEN: usize = 5;

/// Frame type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Data = 0,
    Connect = 1,
    Disconnect = 2,
    Code = 3,
    Id = 4,
}

impl MessageType {
    /// Parse a tag byte
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Data),
            1 => Some(MessageType::Connect),
            2 => Some(MessageType::Disconnect),
            3 => Some(MessageType::Code),
            4 => Some(MessageType::Id),
            _ => None,
        }
    }

    /// Tag byte for this type
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Direction a frame travels relative to the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToRelay,
    RelayToHost,
    ClientToRelay,
    RelayToClient,
}

impl Direction {
    /// Direction of frames the relay receives from a participant
    pub const fn inbound(from_host: bool) -> Self {
        if from_host {
            Direction::HostToRelay
        } else {
            Direction::ClientToRelay
        }
    }
}

/// Whether a frame of `message_type` may travel in `direction`
pub const fn is_valid_pair(message_type: MessageType, direction: Direction) -> bool {
    match message_type {
        MessageType::Data => true,
        MessageType::Connect => matches!(
            direction,
            Direction::RelayToHost | Direction::RelayToClient
        ),
        MessageType::Disconnect => !matches!(direction, Direction::ClientToRelay),
        MessageType::Code => matches!(direction, Direction::RelayToHost),
        MessageType::Id => !matches!(direction, Direction::ClientToRelay),
    }
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// Anything that did not decode to a valid frame for its direction
    Undefined { direction: Direction },

    /// Opaque application data addressed to (inbound) or from (outbound) `id`
    Data {
        direction: Direction,
        id: PeerId,
        payload: Bytes,
    },

    /// Peer `id` is now reachable
    Connect { direction: Direction, id: PeerId },

    /// Kick request (host→relay) or notice that `id` left (relay→any)
    Disconnect { direction: Direction, id: PeerId },

    /// Session code assigned to a new host
    Code { code: String },

    /// Relay asks the host to allocate an id for a queued client
    RequestId,

    /// Host answers a [`RelayMessage::RequestId`]
    SendId { id: PeerId },

    /// Relay tells a newly joined client its own id
    AssignId { id: PeerId },
}

impl RelayMessage {
    /// Type of this frame, `None` for [`RelayMessage::Undefined`]
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            RelayMessage::Undefined { .. } => None,
            RelayMessage::Data { .. } => Some(MessageType::Data),
            RelayMessage::Connect { .. } => Some(MessageType::Connect),
            RelayMessage::Disconnect { .. } => Some(MessageType::Disconnect),
            RelayMessage::Code { .. } => Some(MessageType::Code),
            RelayMessage::RequestId | RelayMessage::SendId { .. } | RelayMessage::AssignId { .. } => {
                Some(MessageType::Id)
            }
        }
    }

    /// Direction this frame travels
    pub fn direction(&self) -> Direction {
        match self {
            RelayMessage::Undefined { direction }
            | RelayMessage::Data { direction, .. }
            | RelayMessage::Connect { direction, .. }
            | RelayMessage::Disconnect { direction, .. } => *direction,
            RelayMessage::Code { .. } | RelayMessage::RequestId => Direction::RelayToHost,
            RelayMessage::SendId { .. } => Direction::HostToRelay,
            RelayMessage::AssignId { .. } => Direction::RelayToClient,
        }
    }

    /// Whether this frame can be put on the wire
    pub fn is_valid(&self) -> bool {
        self.message_type()
            .map(|t| is_valid_pair(t, self.direction()))
            .unwrap_or(false)
    }
}

/// Serialize a frame
///
/// Fails only for messages the protocol cannot express: the undefined
/// sentinel, or a CONNECT/DISCONNECT built with a direction it may not travel.
pub fn encode(message: &RelayMessage) -> Result<Bytes, ProtocolError> {
    let message_type = match message.message_type() {
        Some(t) => t,
        None => return Err(ProtocolError::EncodeUndefined(message.direction())),
    };

    if !is_valid_pair(message_type, message.direction()) {
        return Err(ProtocolError::InvalidDirection {
            message_type,
            direction: message.direction(),
        });
    }

    let frame = match message {
        RelayMessage::Data { id, payload, .. } => {
            let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
            buf.put_u8(message_type.tag());
            buf.put_i32(id.0);
            buf.put_slice(payload);
            buf
        }
        RelayMessage::Connect { id, .. }
        | RelayMessage::Disconnect { id, .. }
        | RelayMessage::SendId { id }
        | RelayMessage::AssignId { id } => {
            let mut buf = BytesMut::with_capacity(HEADER_LEN);
            buf.put_u8(message_type.tag());
            buf.put_i32(id.0);
            buf
        }
        RelayMessage::Code { code } => {
            let mut buf = BytesMut::with_capacity(1 + code.len());
            buf.put_u8(message_type.tag());
            buf.put_slice(code.as_bytes());
            buf
        }
        RelayMessage::RequestId => {
            let mut buf = BytesMut::with_capacity(1);
            buf.put_u8(message_type.tag());
            buf
        }
        RelayMessage::Undefined { .. } => unreachable!("rejected above"),
    };

    Ok(frame.freeze())
}

/// Parse a frame received in `direction`
///
/// Never fails: empty input, unknown tags, frames that may not travel in
/// `direction`, wrong lengths and non-UTF-8 codes all yield
/// [`RelayMessage::Undefined`]. DATA payloads share the input buffer.
pub fn decode(frame: &Bytes, direction: Direction) -> RelayMessage {
    let undefined = RelayMessage::Undefined { direction };

    let (&tag, body) = match frame.split_first() {
        Some(split) => split,
        None => return undefined,
    };

    let message_type = match MessageType::from_tag(tag) {
        Some(t) if is_valid_pair(t, direction) => t,
        _ => return undefined,
    };

    match message_type {
        MessageType::Data => match leading_peer_id(body) {
            Some(id) => RelayMessage::Data {
                direction,
                id,
                payload: frame.slice(HEADER_LEN..),
            },
            None => undefined,
        },
        MessageType::Connect => match exact_peer_id(body) {
            Some(id) => RelayMessage::Connect { direction, id },
            None => undefined,
        },
        MessageType::Disconnect => match exact_peer_id(body) {
            Some(id) => RelayMessage::Disconnect { direction, id },
            None => undefined,
        },
        MessageType::Code => match std::str::from_utf8(body) {
            Ok(code) => RelayMessage::Code {
                code: code.to_string(),
            },
            Err(_) => undefined,
        },
        MessageType::Id => match direction {
            Direction::RelayToHost if body.is_empty() => RelayMessage::RequestId,
            Direction::HostToRelay => match exact_peer_id(body) {
                Some(id) => RelayMessage::SendId { id },
                None => undefined,
            },
            Direction::RelayToClient => match exact_peer_id(body) {
                Some(id) => RelayMessage::AssignId { id },
                None => undefined,
            },
            _ => undefined,
        },
    }
}

/// Overwrite the peer id of a DATA frame in place
///
/// Returns false (leaving the frame untouched) if the buffer is too short to
/// carry a peer id.
pub fn rewrite_peer_id(frame: &mut [u8], id: PeerId) -> bool {
    match frame.get_mut(1..HEADER_LEN) {
        Some(field) => {
            field.copy_from_slice(&id.to_be_bytes());
            true
        }
        None => false,
    }
}

fn leading_peer_id(body: &[u8]) -> Option<PeerId> {
    let bytes: [u8; 4] = body.get(..4)?.try_into().ok()?;
    Some(PeerId::from_be_bytes(bytes))
}

fn exact_peer_id(body: &[u8]) -> Option<PeerId> {
    if body.len() != 4 {
        return None;
    }
    leading_peer_id(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_DIRECTIONS: [Direction; 4] = [
        Direction::HostToRelay,
        Direction::RelayToHost,
        Direction::ClientToRelay,
        Direction::RelayToClient,
    ];

    fn frame(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn test_round_trip_valid_messages() {
        let mut messages = vec![
            RelayMessage::Code {
                code: "QXZA".into(),
            },
            RelayMessage::RequestId,
            RelayMessage::SendId { id: PeerId(7) },
            RelayMessage::AssignId { id: PeerId(-42) },
            RelayMessage::Connect {
                direction: Direction::RelayToHost,
                id: PeerId(7),
            },
            RelayMessage::Connect {
                direction: Direction::RelayToClient,
                id: PeerId::HOST,
            },
            RelayMessage::Disconnect {
                direction: Direction::HostToRelay,
                id: PeerId(7),
            },
            RelayMessage::Disconnect {
                direction: Direction::RelayToHost,
                id: PeerId(i32::MAX),
            },
            RelayMessage::Disconnect {
                direction: Direction::RelayToClient,
                id: PeerId(i32::MIN),
            },
        ];
        for direction in ALL_DIRECTIONS {
            messages.push(RelayMessage::Data {
                direction,
                id: PeerId(3),
                payload: Bytes::from_static(&[9, 9, 0, 255]),
            });
        }
        messages.push(RelayMessage::Data {
            direction: Direction::ClientToRelay,
            id: PeerId::HOST,
            payload: Bytes::new(),
        });

        for message in messages {
            let encoded = encode(&message).unwrap();
            assert_eq!(decode(&encoded, message.direction()), message);
        }
    }

    #[test]
    fn test_known_byte_layouts() {
        assert_eq!(&encode(&RelayMessage::RequestId).unwrap()[..], &[4]);
        assert_eq!(
            &encode(&RelayMessage::SendId { id: PeerId(7) }).unwrap()[..],
            &[4, 0, 0, 0, 7]
        );
        assert_eq!(
            &encode(&RelayMessage::Code {
                code: "ABCD".into()
            })
            .unwrap()[..],
            b"\x03ABCD"
        );
        assert_eq!(
            &encode(&RelayMessage::Data {
                direction: Direction::RelayToHost,
                id: PeerId(7),
                payload: Bytes::from_static(&[9, 9]),
            })
            .unwrap()[..],
            &[0, 0, 0, 0, 7, 9, 9]
        );
    }

    #[test]
    fn test_encode_undefined_fails() {
        let message = RelayMessage::Undefined {
            direction: Direction::HostToRelay,
        };
        assert_eq!(
            encode(&message),
            Err(ProtocolError::EncodeUndefined(Direction::HostToRelay))
        );
    }

    #[test]
    fn test_encode_invalid_direction_fails() {
        let message = RelayMessage::Connect {
            direction: Direction::ClientToRelay,
            id: PeerId(2),
        };
        assert!(matches!(
            encode(&message),
            Err(ProtocolError::InvalidDirection {
                message_type: MessageType::Connect,
                ..
            })
        ));
        assert!(!message.is_valid());
    }

    #[test]
    fn test_decode_empty_and_unknown_tags() {
        for direction in ALL_DIRECTIONS {
            assert_eq!(
                decode(&Bytes::new(), direction),
                RelayMessage::Undefined { direction }
            );
            for tag in 5..=255u8 {
                assert_eq!(
                    decode(&frame(&[tag, 0, 0, 0, 1]), direction),
                    RelayMessage::Undefined { direction }
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_invalid_pairs() {
        // Clients may only send DATA.
        for tag in 1..=4u8 {
            assert_eq!(
                decode(&frame(&[tag, 0, 0, 0, 1]), Direction::ClientToRelay),
                RelayMessage::Undefined {
                    direction: Direction::ClientToRelay
                }
            );
        }
        // The host never sends CONNECT or CODE.
        assert!(!decode(&frame(&[1, 0, 0, 0, 1]), Direction::HostToRelay).is_valid());
        assert!(!decode(&frame(b"\x03ABCD"), Direction::HostToRelay).is_valid());
        assert!(!decode(&frame(b"\x03ABCD"), Direction::RelayToClient).is_valid());
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let d = Direction::HostToRelay;
        assert!(!decode(&frame(&[0, 0, 0]), d).is_valid());
        assert!(!decode(&frame(&[2, 0, 0, 7]), d).is_valid());
        assert!(!decode(&frame(&[2, 0, 0, 0, 7, 1]), d).is_valid());
        assert!(!decode(&frame(&[4]), d).is_valid());
        assert!(!decode(&frame(&[4, 0, 0, 0, 7, 0]), d).is_valid());
        assert!(!decode(&frame(&[4, 0]), Direction::RelayToHost).is_valid());
    }

    #[test]
    fn test_decode_rejects_non_utf8_code() {
        let message = decode(&frame(&[3, 0xff, 0xfe]), Direction::RelayToHost);
        assert_eq!(
            message,
            RelayMessage::Undefined {
                direction: Direction::RelayToHost
            }
        );
    }

    #[test]
    fn test_decode_never_panics_on_arbitrary_input() {
        let mut state = 0x2545_f491_u32;
        for len in 0..64usize {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    (state % 7) as u8
                })
                .collect();
            for direction in ALL_DIRECTIONS {
                let message = decode(&Bytes::from(bytes.clone()), direction);
                assert_eq!(message.direction(), direction);
            }
        }
    }

    #[test]
    fn test_data_payload_is_zero_copy() {
        let input = frame(&[0, 0, 0, 0, 1, 9, 9]);
        match decode(&input, Direction::ClientToRelay) {
            RelayMessage::Data { payload, .. } => {
                assert_eq!(&payload[..], &[9, 9]);
                assert_eq!(payload.as_ptr(), input[HEADER_LEN..].as_ptr());
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_peer_id() {
        let mut raw = vec![0, 0, 0, 0, 1, 9, 9];
        assert!(rewrite_peer_id(&mut raw, PeerId(7)));
        assert_eq!(raw, vec![0, 0, 0, 0, 7, 9, 9]);

        let mut short = vec![0, 0, 0];
        assert!(!rewrite_peer_id(&mut short, PeerId(7)));
        assert_eq!(short, vec![0, 0, 0]);
    }
}
