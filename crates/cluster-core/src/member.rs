//! Member identity and attributes.
//!
//! A member is identified by its [`MemberId`], a 16-byte random token that
//! distinguishes restarts of the same host:port. The id is displayed as
//! 32 lowercase hex characters.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemberIdError {
    #[error("Invalid member ID format: expected 32 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Unique identifier of one member process.
///
/// # Examples
/// ```
/// use cluster_core::MemberId;
///
/// let id = MemberId::generate();
/// let parsed: MemberId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId([u8; 16]);

impl MemberId {
    /// Generate a new random member ID. Never returns the all-zero ID.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u128 = rand::rng().random();
            if id != 0 {
                return Self(id.to_be_bytes());
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", u128::from_be_bytes(self.0))
    }
}

impl FromStr for MemberId {
    type Err = MemberIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MemberIdError::InvalidFormat);
        }
        let id = u128::from_str_radix(s, 16)?;
        Ok(Self(id.to_be_bytes()))
    }
}

impl From<[u8; 16]> for MemberId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for MemberId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MemberId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A cluster node as seen through its heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: MemberId,
    /// Advertised host of the member's data channel.
    pub host: String,
    /// Advertised port of the member's data channel.
    pub port: u16,
    /// How long the member has been alive, as reported by itself.
    pub alive_ms: u64,
    /// Heartbeat counter, incremented by the member on every heartbeat.
    pub sequence: u64,
    /// Domain tag. Members only track peers with the same domain.
    pub domain: Vec<u8>,
    /// Opaque application payload carried on every heartbeat.
    pub payload: Vec<u8>,
}

impl Member {
    pub fn new(id: MemberId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            alive_ms: 0,
            sequence: 0,
            domain: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<Vec<u8>>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// `host:port` string suitable for `tokio::net::lookup_host`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address())
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hex() {
        let id = MemberId::from_bytes([0xab; 16]);
        assert_eq!(id.to_string(), "abababababababababababababababab");
    }

    #[test]
    fn test_display_zero_padded() {
        let mut bytes = [0u8; 16];
        bytes[15] = 0xff;
        assert_eq!(
            MemberId::from_bytes(bytes).to_string(),
            "000000000000000000000000000000ff"
        );
    }

    #[test]
    fn test_roundtrip() {
        let original = MemberId::generate();
        let parsed: MemberId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_parse_uppercase() {
        let lower: MemberId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        let upper: MemberId = "0123456789ABCDEF0123456789ABCDEF".parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_invalid_format() {
        assert!("".parse::<MemberId>().is_err());
        assert!("0123456789abcdef".parse::<MemberId>().is_err());
        assert!("0123456789abcdef0123456789abcdeg".parse::<MemberId>().is_err());
        assert!("+123456789abcdef0123456789abcdef".parse::<MemberId>().is_err());
    }

    #[test]
    fn test_generate_not_zero_and_distinct() {
        let a = MemberId::generate();
        let b = MemberId::generate();
        assert_ne!(a, b);
        assert_ne!(*a.as_bytes(), [0u8; 16]);
    }

    #[test]
    fn test_serde_as_string() {
        let id = MemberId::from_bytes([1; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01010101010101010101010101010101\"");
        let parsed: MemberId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_address_formats_ipv6() {
        let id = MemberId::generate();
        assert_eq!(Member::new(id, "10.0.0.1", 4000).address(), "10.0.0.1:4000");
        assert_eq!(Member::new(id, "::1", 4000).address(), "[::1]:4000");
    }
}
