//! Heartbeat datagram codec.
//!
//! Wire format: `"CLHB"` magic, one version byte, then the bincode-encoded
//! [`HeartbeatPacket`] (fixed-width big-endian integers). A datagram never
//! exceeds the configured maximum packet size.

use crate::error::ProtocolError;
use crate::member::{Member, MemberId};
use bincode::Options;
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_MAGIC: &[u8; 4] = b"CLHB";

/// Increment when making breaking changes to the heartbeat layout.
pub const HEARTBEAT_VERSION: u8 = 1;

const HEADER_LEN: usize = HEARTBEAT_MAGIC.len() + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Alive,
    /// Sent once when a member leaves; receivers drop it immediately.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    pub command: Command,
    pub id: [u8; 16],
    pub host: String,
    pub port: u16,
    pub domain: Vec<u8>,
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub alive_ms: u64,
}

fn options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(limit as u64)
}

impl HeartbeatPacket {
    pub fn alive(member: &Member) -> Self {
        Self::with_command(Command::Alive, member)
    }

    pub fn shutdown(member: &Member) -> Self {
        Self::with_command(Command::Shutdown, member)
    }

    fn with_command(command: Command, member: &Member) -> Self {
        Self {
            command,
            id: *member.id.as_bytes(),
            host: member.host.clone(),
            port: member.port,
            domain: member.domain.clone(),
            payload: member.payload.clone(),
            sequence: member.sequence,
            alive_ms: member.alive_ms,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.command == Command::Shutdown
    }

    pub fn member_id(&self) -> MemberId {
        MemberId::from_bytes(self.id)
    }

    pub fn into_member(self) -> Member {
        Member {
            id: MemberId::from_bytes(self.id),
            host: self.host,
            port: self.port,
            alive_ms: self.alive_ms,
            sequence: self.sequence,
            domain: self.domain,
            payload: self.payload,
        }
    }

    /// Encode into one datagram of at most `max_size` bytes.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let body = options(usize::MAX).serialize(self)?;
        let size = HEADER_LEN + body.len();
        if size > max_size {
            return Err(ProtocolError::TooLarge {
                size,
                limit: max_size,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(HEARTBEAT_MAGIC);
        out.push(HEARTBEAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one datagram. Oversized, truncated, foreign or corrupt input
    /// is rejected.
    pub fn decode(data: &[u8], max_size: usize) -> Result<Self, ProtocolError> {
        if data.len() > max_size {
            return Err(ProtocolError::TooLarge {
                size: data.len(),
                limit: max_size,
            });
        }
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(data.len()));
        }
        if &data[..HEARTBEAT_MAGIC.len()] != HEARTBEAT_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let version = data[HEARTBEAT_MAGIC.len()];
        if version != HEARTBEAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        Ok(options(max_size).deserialize(&data[HEADER_LEN..])?)
    }
}
