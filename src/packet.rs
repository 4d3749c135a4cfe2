//! Control-packet envelope codec.
//!
//! Every mesh message body is `[kind: 1 byte][payload: N bytes]`. The
//! underlying transport delivers whole messages, so the payload length comes
//! from framing rather than a length prefix. This layer only discriminates
//! the kind tag; payload schemas belong to the transport loop.

use bytes::Bytes;

/// Maximum payload the mesh transport will carry in one message.
pub const MAX_PAYLOAD: usize = 1455;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    #[error("payload of {len} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversize { len: usize },
}

/// Packet kind discriminator. Further kinds are reserved for future
/// payload-bearing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Ping = 0,
    Pong = 1,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(tag: u8) -> Result<Self, PacketError> {
        match tag {
            0 => Ok(PacketKind::Ping),
            1 => Ok(PacketKind::Pong),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

/// An immutable control packet. Ownership moves to the transport on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Result<Self, PacketError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::Oversize { len: payload.len() });
        }
        Ok(Packet { kind, payload })
    }

    pub fn ping() -> Self {
        Packet {
            kind: PacketKind::Ping,
            payload: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Packet {
            kind: PacketKind::Pong,
            payload: Bytes::new(),
        }
    }

    /// Serialize into the wire envelope.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        buf.into()
    }

    /// Parse a received message body. Fails on an empty buffer or an
    /// unrecognized kind tag.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let (&tag, payload) = bytes.split_first().ok_or(PacketError::Empty)?;
        Ok(Packet {
            kind: PacketKind::try_from(tag)?,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
