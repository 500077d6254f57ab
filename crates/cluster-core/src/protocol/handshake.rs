//! Versioned handshake for data connections.
//!
//! The handshake is the first frame on every point-to-point connection. It
//! tells the receiver which member is talking so delivered payloads can be
//! attributed to their source.

use crate::error::ProtocolError;
use crate::member::{Member, MemberId};
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the data channel.
pub const PROTOCOL_VERSION: u32 = 1;

/// Versioned handshake message.
///
/// Wire format: `{"type":"handshake","version":1,"memberId":"...","host":"...","port":4000}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: u32,
    pub member_id: MemberId,
    /// Advertised host of the sending member
    pub host: String,
    /// Advertised data port of the sending member
    pub port: u16,
}

impl Handshake {
    pub fn new(member_id: MemberId, host: impl Into<String>, port: u16) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            member_id,
            host: host.into(),
            port,
        }
    }

    pub fn for_member(member: &Member) -> Self {
        Self::new(member.id, member.host.clone(), member.port)
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|_| ProtocolError::InvalidHandshake)
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;

        // Verify it's actually a handshake
        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }

    /// The sending member as far as the handshake describes it.
    pub fn into_member(self) -> Member {
        Member::new(self.member_id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_member_id() -> MemberId {
        "a1b2c3d4e5f67890a1b2c3d4e5f67890".parse().unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let hs = Handshake::new(test_member_id(), "10.0.0.1", 4000);
        let parsed = Handshake::from_json(&hs.to_json().unwrap()).unwrap();
        assert_eq!(hs, parsed);
    }

    #[test]
    fn test_wire_format() {
        let hs = Handshake::new(test_member_id(), "10.0.0.1", 4000);
        let json = String::from_utf8(hs.to_json().unwrap()).unwrap();

        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"memberId\":\"a1b2c3d4e5f67890a1b2c3d4e5f67890\""));
        assert!(json.contains("\"port\":4000"));
    }

    #[test]
    fn test_invalid_json() {
        assert!(Handshake::from_json(b"not json").is_none());
        assert!(Handshake::from_json(b"{}").is_none());
        assert!(Handshake::from_json(b"").is_none());
    }

    #[test]
    fn test_wrong_type() {
        let json = br#"{"type":"other","version":1,"memberId":"a1b2c3d4e5f67890a1b2c3d4e5f67890","host":"h","port":1}"#;
        assert!(Handshake::from_json(json).is_none());
    }

    #[test]
    fn test_different_version_warns() {
        let json = br#"{"type":"handshake","version":99,"memberId":"a1b2c3d4e5f67890a1b2c3d4e5f67890","host":"h","port":1}"#;
        let hs = Handshake::from_json(json).unwrap();
        assert!(hs.should_warn_version());
    }

    #[test]
    fn test_into_member() {
        let member = Handshake::new(test_member_id(), "10.0.0.1", 4000).into_member();
        assert_eq!(member.id, test_member_id());
        assert_eq!(member.address(), "10.0.0.1:4000");
    }
}
