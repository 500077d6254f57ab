//! Error types shared by the membership and transport layers.

use crate::member::{Member, MemberId};
use crate::sender_state::HealthState;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed heartbeat, frame or handshake.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Bad magic: not a heartbeat packet")]
    BadMagic,
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("Truncated packet: {0} bytes")]
    Truncated(usize),
    #[error("Packet too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("Malformed body: {0}")]
    Body(#[from] bincode::Error),
    #[error("Unknown frame kind: {0}")]
    UnknownFrameKind(u8),
    #[error("Invalid handshake")]
    InvalidHandshake,
    #[error("Unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },
    #[error("Reply for message {got} while waiting on {expected}")]
    MismatchedReply { expected: u64, got: u64 },
}

/// Failure delivering data to one or more peers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },
    #[error("No acknowledgement from {addr} within {timeout_ms}ms")]
    AckTimeout { addr: String, timeout_ms: u64 },
    #[error("Remote {addr} failed to process message {id}")]
    RemoteFailure { addr: String, id: u64 },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Not connected")]
    NotConnected,
    #[error("Gave up after {attempts} attempts (first: {first}; last: {last})")]
    Exhausted {
        attempts: u32,
        first: Box<TransportError>,
        last: Box<TransportError>,
    },
    #[error(transparent)]
    Partial(#[from] ChannelError),
}

impl TransportError {
    /// Whether a fresh connection might make this error go away.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectTimeout { .. }
                | Self::AckTimeout { .. }
                | Self::Protocol(_)
                | Self::NotConnected
        )
    }
}

/// One destination that could not be reached during a fan-out.
#[derive(Debug)]
pub struct FaultyMember {
    pub member: Member,
    pub cause: TransportError,
    /// Health of the peer after the failed attempt.
    pub state: HealthState,
}

/// Composite error of a multi-destination send.
///
/// Lists exactly the destinations that failed; everything else was delivered.
#[derive(Debug, Error)]
#[error("Delivery failed for {} member(s): {}", .faulty.len(), describe(.faulty))]
pub struct ChannelError {
    pub faulty: Vec<FaultyMember>,
}

impl ChannelError {
    pub fn new(faulty: Vec<FaultyMember>) -> Self {
        Self { faulty }
    }

    pub fn faulty_ids(&self) -> Vec<MemberId> {
        self.faulty.iter().map(|f| f.member.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.faulty.is_empty()
    }
}

fn describe(faulty: &[FaultyMember]) -> String {
    faulty
        .iter()
        .map(|f| format!("{} [{}]: {}", f.member, f.state, f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::NotConnected.is_retryable());
        assert!(
            TransportError::AckTimeout {
                addr: "a:1".into(),
                timeout_ms: 10
            }
            .is_retryable()
        );
        assert!(
            !TransportError::RemoteFailure {
                addr: "a:1".into(),
                id: 1
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_channel_error_names_faulty_members() {
        let member = Member::new(MemberId::from_bytes([7; 16]), "10.0.0.2", 4000);
        let err = ChannelError::new(vec![FaultyMember {
            member: member.clone(),
            cause: TransportError::NotConnected,
            state: HealthState::Suspect,
        }]);

        assert_eq!(err.faulty_ids(), vec![member.id]);
        let msg = err.to_string();
        assert!(msg.contains("1 member(s)"));
        assert!(msg.contains("10.0.0.2:4000"));
        assert!(msg.contains("suspect"));
    }
}
