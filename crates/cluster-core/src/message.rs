//! Outbound replication messages.

use crate::member::Member;
use bytes::Bytes;

/// Immutable payload plus delivery options, fanned out to every destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    /// Wait for an ack frame from each destination before reporting success.
    pub wait_for_ack: bool,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>, wait_for_ack: bool) -> Self {
        Self {
            payload: payload.into(),
            wait_for_ack,
        }
    }
}

/// A message waiting in the handoff queue with its destinations.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub destinations: Vec<Member>,
    pub message: OutboundMessage,
}
