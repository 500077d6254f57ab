//! Length-prefixed data frames.
//!
//! ```text
//! length  u32 BE   bytes after this field
//! kind    u8       1 handshake, 2 message, 3 ack, 4 nack
//! flags   u8       bit 0: ack requested
//! id      u64 BE   message id, echoed by ack/nack
//! body    length - 10 bytes
//! ```

use super::handshake::Handshake;
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (50MB), guards against memory exhaustion.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

pub const LENGTH_PREFIX_LEN: usize = 4;

/// kind + flags + id
pub const FRAME_HEADER_LEN: usize = 10;

pub const FLAG_ACK_REQUESTED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake,
    Message,
    Ack,
    Nack,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Handshake => 1,
            Self::Message => 2,
            Self::Ack => 3,
            Self::Nack => 4,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::Message),
            3 => Ok(Self::Ack),
            4 => Ok(Self::Nack),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Message => "message",
            Self::Ack => "ack",
            Self::Nack => "nack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub id: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn handshake(handshake: &Handshake) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: FrameKind::Handshake,
            flags: 0,
            id: 0,
            body: Bytes::from(handshake.to_json()?),
        })
    }

    pub fn message(id: u64, payload: Bytes, ack_requested: bool) -> Self {
        Self {
            kind: FrameKind::Message,
            flags: if ack_requested { FLAG_ACK_REQUESTED } else { 0 },
            id,
            body: payload,
        }
    }

    pub fn ack(id: u64) -> Self {
        Self::reply(FrameKind::Ack, id)
    }

    pub fn nack(id: u64) -> Self {
        Self::reply(FrameKind::Nack, id)
    }

    fn reply(kind: FrameKind, id: u64) -> Self {
        Self {
            kind,
            flags: 0,
            id,
            body: Bytes::new(),
        }
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Bytes following the length prefix on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }

    pub fn check_size(&self) -> Result<(), ProtocolError> {
        let size = self.wire_len();
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size,
                limit: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Parse the handshake carried by a handshake frame.
    pub fn to_handshake(&self) -> Result<Handshake, ProtocolError> {
        if self.kind != FrameKind::Handshake {
            return Err(ProtocolError::UnexpectedFrame {
                expected: FrameKind::Handshake.name(),
                got: self.kind.name(),
            });
        }
        Handshake::from_json(&self.body).ok_or(ProtocolError::InvalidHandshake)
    }

    /// Encode including the length prefix. The length must already have
    /// passed [`Frame::check_size`].
    pub fn encode(&self) -> Bytes {
        let len = self.wire_len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
        buf.put_u32(len as u32);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.flags);
        buf.put_u64(self.id);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode the bytes that followed the length prefix.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::TooLarge {
                size: buf.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        let kind = FrameKind::from_u8(buf.get_u8())?;
        let flags = buf.get_u8();
        let id = buf.get_u64();
        Ok(Self {
            kind,
            flags,
            id,
            body: buf,
        })
    }
}
